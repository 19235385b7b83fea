//! Common imports.
//!
//! ```rust
//! use assistant_gate::prelude::*;
//! ```

pub use crate::budget::{BudgetMonitor, ServiceLevel, ServicePlan, UserTier};
pub use crate::capacity::{CapacityController, ConcurrencyLimit};
pub use crate::clock::{Clock, SystemClock};
pub use crate::config::GateConfig;
pub use crate::gateway::{Gateway, Reply, ServiceStatus};
pub use crate::provider::{AssistantProvider, ThreadId};
pub use crate::store::{MemoryStore, Store};
pub use crate::{Error, ErrorKind, Result};

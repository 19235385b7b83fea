//! Resizable concurrency limit.
//!
//! Growing adds permits immediately. Shrinking forgets idle permits and, when
//! too many are checked out, records the shortfall as debt that returning
//! permits pay off instead of going back to the pool.

use std::sync::{Arc, Mutex};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
struct LimitState {
    ceiling: u32,
    debt: u32,
}

#[derive(Debug)]
struct LimitInner {
    semaphore: Arc<Semaphore>,
    state: Mutex<LimitState>,
}

impl LimitInner {
    fn state(&self) -> std::sync::MutexGuard<'_, LimitState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencyLimit {
    inner: Arc<LimitInner>,
}

impl ConcurrencyLimit {
    pub fn new(ceiling: u32) -> Self {
        Self {
            inner: Arc::new(LimitInner {
                semaphore: Arc::new(Semaphore::new(ceiling as usize)),
                state: Mutex::new(LimitState { ceiling, debt: 0 }),
            }),
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.inner.state().ceiling
    }

    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    pub fn set_ceiling(&self, ceiling: u32) {
        let mut state = self.inner.state();
        if ceiling > state.ceiling {
            let grow = ceiling - state.ceiling;
            let repaid = grow.min(state.debt);
            state.debt -= repaid;
            self.inner.semaphore.add_permits((grow - repaid) as usize);
        } else if ceiling < state.ceiling {
            let shrink = state.ceiling - ceiling;
            let forgotten = self.inner.semaphore.forget_permits(shrink as usize) as u32;
            state.debt += shrink - forgotten;
        }
        state.ceiling = ceiling;
    }

    pub async fn acquire(&self) -> Result<ConcurrencyPermit, AcquireError> {
        let permit = self.inner.semaphore.clone().acquire_owned().await?;
        Ok(ConcurrencyPermit {
            permit: Some(permit),
            limit: self.inner.clone(),
        })
    }

    pub fn try_acquire(&self) -> Option<ConcurrencyPermit> {
        let permit = self.inner.semaphore.clone().try_acquire_owned().ok()?;
        Some(ConcurrencyPermit {
            permit: Some(permit),
            limit: self.inner.clone(),
        })
    }
}

#[derive(Debug)]
pub struct ConcurrencyPermit {
    permit: Option<OwnedSemaphorePermit>,
    limit: Arc<LimitInner>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        let mut state = self.limit.state();
        if let Some(permit) = self.permit.take() {
            if state.debt > 0 {
                state.debt -= 1;
                permit.forget();
            } else {
                drop(permit);
            }
        }
    }
}

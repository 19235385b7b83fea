//! Model pricing definitions for cost calculation.
//!
//! Prices are USD per million tokens and can be customized via environment
//! variables or programmatically. Default prices follow Anthropic's published
//! rates.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const TOKENS_PER_UNIT: Decimal = dec!(1_000_000);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_mtok: Decimal,
    pub output_per_mtok: Decimal,
}

impl ModelPricing {
    pub const fn new(input_per_mtok: Decimal, output_per_mtok: Decimal) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    pub fn calculate(&self, tokens_in: u64, tokens_out: u64) -> Decimal {
        let input = Decimal::from(tokens_in) * self.input_per_mtok;
        let output = Decimal::from(tokens_out) * self.output_per_mtok;
        (input + output) / TOKENS_PER_UNIT
    }
}

#[derive(Debug, Clone)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
    default: ModelPricing,
}

impl PricingTable {
    pub fn builder() -> PricingTableBuilder {
        PricingTableBuilder::new()
    }

    pub fn get(&self, model: &str) -> &ModelPricing {
        let normalized = Self::normalize_model_name(model);
        self.models.get(&normalized).unwrap_or(&self.default)
    }

    pub fn calculate(&self, model: &str, tokens_in: u64, tokens_out: u64) -> Decimal {
        self.get(model).calculate(tokens_in, tokens_out)
    }

    fn normalize_model_name(model: &str) -> String {
        let model = model.to_lowercase();
        if model.contains("opus") {
            "opus".to_string()
        } else if model.contains("sonnet") {
            "sonnet".to_string()
        } else if model.contains("haiku") {
            "haiku".to_string()
        } else {
            model
        }
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        global_pricing_table().clone()
    }
}

#[derive(Debug, Default)]
pub struct PricingTableBuilder {
    models: HashMap<String, ModelPricing>,
    default: Option<ModelPricing>,
}

impl PricingTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(mut self) -> Self {
        self.models
            .insert("opus".into(), ModelPricing::new(dec!(15), dec!(75)));
        self.models
            .insert("sonnet".into(), ModelPricing::new(dec!(3), dec!(15)));
        self.models
            .insert("haiku".into(), ModelPricing::new(dec!(0.80), dec!(4)));
        self
    }

    pub fn model(mut self, name: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(name.into(), pricing);
        self
    }

    pub fn default_pricing(mut self, pricing: ModelPricing) -> Self {
        self.default = Some(pricing);
        self
    }

    /// Defaults, then `GATE_PRICING_<FAMILY>_INPUT` / `_OUTPUT` overrides.
    pub fn from_env(self) -> Self {
        self.from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        self = self.with_defaults();

        for family in ["opus", "sonnet", "haiku"] {
            if let Some(pricing) = Self::parse_env_pricing(&family.to_uppercase(), &lookup) {
                self.models.insert(family.into(), pricing);
            }
        }

        self
    }

    fn parse_env_pricing(
        family: &str,
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Option<ModelPricing> {
        let input = Decimal::from_str(&lookup(&format!("GATE_PRICING_{}_INPUT", family))?).ok()?;
        let output =
            Decimal::from_str(&lookup(&format!("GATE_PRICING_{}_OUTPUT", family))?).ok()?;
        Some(ModelPricing::new(input, output))
    }

    pub fn build(self) -> PricingTable {
        let default = self
            .default
            .or_else(|| self.models.get("sonnet").copied())
            .unwrap_or(ModelPricing::new(dec!(3), dec!(15)));

        PricingTable {
            models: self.models,
            default,
        }
    }
}

static GLOBAL_PRICING: LazyLock<PricingTable> =
    LazyLock::new(|| PricingTableBuilder::new().from_env().build());

pub fn global_pricing_table() -> &'static PricingTable {
    &GLOBAL_PRICING
}

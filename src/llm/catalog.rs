//! Per-model pricing used for stage cost accounting.

use rustc_hash::FxHashMap;

use super::TokenUsage;

/// Input/output rates per 1K tokens, in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRates {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelRates {
    #[must_use]
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// Dollar cost of `usage` at these rates.
    #[must_use]
    pub fn cost_of(&self, usage: &TokenUsage) -> f64 {
        usage.input_tokens as f64 / 1000.0 * self.input_per_1k
            + usage.output_tokens as f64 / 1000.0 * self.output_per_1k
    }
}

/// Cost lookup injected at runner construction.
///
/// An unknown model yields `None` from [`rates`](Self::rates) and
/// [`cost`](Self::cost); callers surface that as an unknown-model stage
/// failure rather than pricing the call at zero.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    rates: FxHashMap<String, ModelRates>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelCatalog {
    /// The stock catalog of supported models.
    #[must_use]
    pub fn builtin() -> Self {
        let mut rates = FxHashMap::default();
        rates.insert("gpt-4o-mini".to_string(), ModelRates::new(0.000_15, 0.000_6));
        rates.insert("gpt-4o".to_string(), ModelRates::new(0.002_5, 0.01));
        rates.insert("gpt-4-turbo".to_string(), ModelRates::new(0.01, 0.03));
        rates.insert("gpt-4".to_string(), ModelRates::new(0.03, 0.06));
        rates.insert("gpt-3.5-turbo".to_string(), ModelRates::new(0.000_5, 0.001_5));
        Self { rates }
    }

    /// An empty catalog, for callers supplying their own price list.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rates: FxHashMap::default(),
        }
    }

    /// Add or override a model's rates.
    #[must_use]
    pub fn with_model(mut self, name: impl Into<String>, rates: ModelRates) -> Self {
        self.rates.insert(name.into(), rates);
        self
    }

    #[must_use]
    pub fn rates(&self, model: &str) -> Option<ModelRates> {
        self.rates.get(model).copied()
    }

    /// Dollar cost of `usage` under `model`, `None` for unknown models.
    #[must_use]
    pub fn cost(&self, model: &str, usage: &TokenUsage) -> Option<f64> {
        Some(self.rates(model)?.cost_of(usage))
    }
}

//! Confidence Engine: time decay and corroboration of stored confidence.
//!
//! Nothing here touches storage. Decay is evaluated lazily against the
//! instant a query asks about, so the same fact scores differently for
//! `as_of(2023)` and `as_of(2025)`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::config::ConfidenceConfig;
use crate::models::Fact;

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone)]
pub struct ConfidenceEngine {
    default_lambda: f64,
    lambdas: HashMap<String, f64>,
    reinforcement_step: f64,
    reinforcement_cap: f64,
}

impl From<&ConfidenceConfig> for ConfidenceEngine {
    fn from(config: &ConfidenceConfig) -> Self {
        Self {
            default_lambda: config.default_lambda,
            lambdas: config.lambdas.clone(),
            reinforcement_step: config.reinforcement_step,
            reinforcement_cap: config.reinforcement_cap,
        }
    }
}

impl Default for ConfidenceEngine {
    fn default() -> Self {
        Self::from(&ConfidenceConfig::default())
    }
}

impl ConfidenceEngine {
    /// Per-day decay rate for `predicate`.
    pub fn decay_rate(&self, predicate: &str) -> f64 {
        self.lambdas
            .get(predicate)
            .copied()
            .unwrap_or(self.default_lambda)
    }

    /// `confidence * exp(-lambda * age_days)`, with age measured from
    /// `valid_from` and clamped at zero.
    pub fn effective_confidence(&self, fact: &Fact, as_of: DateTime<Utc>) -> f64 {
        let age_seconds = (as_of - fact.valid_from).num_seconds().max(0) as f64;
        let age_days = age_seconds / SECONDS_PER_DAY;
        let decayed = fact.confidence * (-self.decay_rate(&fact.predicate) * age_days).exp();
        decayed.clamp(0.0, fact.confidence)
    }

    /// Bonus for `corroborations` earlier observations of the same triple.
    pub fn reinforcement(&self, corroborations: usize) -> f64 {
        (self.reinforcement_step * corroborations as f64).min(self.reinforcement_cap)
    }

    /// Decayed confidence plus the corroboration bonus, capped at 1.0. A
    /// fact that has decayed to nothing is not revived.
    pub fn reinforced_confidence(&self, fact: &Fact, corroborations: usize, as_of: DateTime<Utc>) -> f64 {
        let decayed = self.effective_confidence(fact, as_of);
        if decayed <= 0.0 {
            return 0.0;
        }
        (decayed + self.reinforcement(corroborations)).min(1.0)
    }
}

//! Token usage accounting for a single provider call

use serde::{Deserialize, Serialize};

use crate::domain::models::ModelData;

/// Usage reported by a provider, folded additively across stream chunks.
/// Token counts are floats: some providers report fractional equivalents for
/// media inputs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LLMUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_token_count: Option<f64>,
    /// Portion of the prompt served from the provider's prompt cache
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_token_count_cached: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_token_count: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_reasoning_token_count: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_cost_usd: Option<f64>,
}

fn fold(target: &mut Option<f64>, other: Option<f64>) {
    if let Some(v) = other {
        *target = Some(target.unwrap_or(0.0) + v);
    }
}

impl LLMUsage {
    /// Fold another usage report into this one. Counts are summed; absent
    /// fields on either side are preserved.
    pub fn apply(&mut self, other: &LLMUsage) {
        fold(&mut self.prompt_token_count, other.prompt_token_count);
        fold(
            &mut self.prompt_token_count_cached,
            other.prompt_token_count_cached,
        );
        fold(&mut self.prompt_cost_usd, other.prompt_cost_usd);
        fold(&mut self.completion_token_count, other.completion_token_count);
        fold(
            &mut self.completion_reasoning_token_count,
            other.completion_reasoning_token_count,
        );
        fold(&mut self.completion_cost_usd, other.completion_cost_usd);
    }

    /// Price the usage against a model's per-million-token rates. Cached
    /// prompt tokens are billed at the cached rate; reasoning tokens at the
    /// output rate.
    pub fn compute_cost(&mut self, model: &ModelData) {
        let cached = self.prompt_token_count_cached.unwrap_or(0.0);
        let fresh = (self.prompt_token_count.unwrap_or(0.0) - cached).max(0.0);
        self.prompt_cost_usd = Some(
            (fresh * model.input_cost_per_million
                + cached * model.cached_input_cost_per_million)
                / 1_000_000.0,
        );

        let completion = self.completion_token_count.unwrap_or(0.0)
            + self.completion_reasoning_token_count.unwrap_or(0.0);
        self.completion_cost_usd = Some(completion * model.output_cost_per_million / 1_000_000.0);
    }

    pub fn total_cost_usd(&self) -> Option<f64> {
        match (self.prompt_cost_usd, self.completion_cost_usd) {
            (None, None) => None,
            (p, c) => Some(p.unwrap_or(0.0) + c.unwrap_or(0.0)),
        }
    }
}

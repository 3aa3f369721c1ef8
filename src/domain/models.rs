//! Static model catalog: pricing, limits and fallback chains
//!
//! Pricing is $ per 1M tokens. The catalog is immutable after init; provider
//! adapters may adjust a copy through `Provider::sanitize_model_data`.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Upstream providers the gateway can dispatch to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Openai,
    Anthropic,
    Bedrock,
    Gemini,
    Groq,
    Xai,
    Mistral,
    Fireworks,
    Azure,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Openai => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Bedrock => "bedrock",
            ProviderId::Gemini => "gemini",
            ProviderId::Groq => "groq",
            ProviderId::Xai => "xai",
            ProviderId::Mistral => "mistral",
            ProviderId::Fireworks => "fireworks",
            ProviderId::Azure => "azure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(ProviderId::Openai),
            "anthropic" => Some(ProviderId::Anthropic),
            "bedrock" | "amazon_bedrock" => Some(ProviderId::Bedrock),
            "gemini" | "google" => Some(ProviderId::Gemini),
            "groq" => Some(ProviderId::Groq),
            "xai" => Some(ProviderId::Xai),
            "mistral" | "mistral_ai" => Some(ProviderId::Mistral),
            "fireworks" => Some(ProviderId::Fireworks),
            "azure" | "azure_openai" => Some(ProviderId::Azure),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-model pricing and capability data
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelData {
    pub id: String,
    pub display_name: String,
    /// Providers able to serve the model, in preference order
    pub providers: Vec<ProviderId>,
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
    pub cached_input_cost_per_million: f64,
    pub max_output_tokens: u32,
    pub context_window: u32,
    pub supports_tools: bool,
    pub supports_files: bool,
    /// Whether the model exposes a reasoning mode
    pub reasoning: bool,
    /// Models to try next when a recoverable error occurs and fallback is auto
    pub fallback: Vec<String>,
}

fn entry(
    id: &str,
    display_name: &str,
    providers: &[ProviderId],
    costs: (f64, f64, f64),
    max_output_tokens: u32,
    context_window: u32,
    reasoning: bool,
    fallback: &[&str],
) -> (String, ModelData) {
    (
        id.to_string(),
        ModelData {
            id: id.to_string(),
            display_name: display_name.to_string(),
            providers: providers.to_vec(),
            input_cost_per_million: costs.0,
            output_cost_per_million: costs.1,
            cached_input_cost_per_million: costs.2,
            max_output_tokens,
            context_window,
            supports_tools: true,
            supports_files: true,
            reasoning,
            fallback: fallback.iter().map(|s| s.to_string()).collect(),
        },
    )
}

static CATALOG: Lazy<HashMap<String, ModelData>> = Lazy::new(|| {
    use ProviderId::*;
    HashMap::from([
        entry(
            "gpt-4.1",
            "GPT-4.1",
            &[Openai, Azure],
            (2.0, 8.0, 0.5),
            32_768,
            1_047_576,
            false,
            &["gpt-4.1-mini", "claude-sonnet-4-5"],
        ),
        entry(
            "gpt-4.1-mini",
            "GPT-4.1 mini",
            &[Openai, Azure],
            (0.4, 1.6, 0.1),
            32_768,
            1_047_576,
            false,
            &["gemini-2.5-flash"],
        ),
        entry(
            "gpt-4o",
            "GPT-4o",
            &[Openai, Azure],
            (2.5, 10.0, 1.25),
            16_384,
            128_000,
            false,
            &["gpt-4.1"],
        ),
        entry(
            "o3",
            "o3",
            &[Openai],
            (2.0, 8.0, 0.5),
            100_000,
            200_000,
            true,
            &["claude-sonnet-4-5"],
        ),
        entry(
            "claude-opus-4-1",
            "Claude Opus 4.1",
            &[Anthropic, Bedrock],
            (15.0, 75.0, 1.5),
            32_000,
            200_000,
            true,
            &["claude-sonnet-4-5"],
        ),
        entry(
            "claude-sonnet-4-5",
            "Claude Sonnet 4.5",
            &[Anthropic, Bedrock],
            (3.0, 15.0, 0.3),
            64_000,
            200_000,
            true,
            &["gpt-4.1"],
        ),
        entry(
            "claude-haiku-4-5",
            "Claude Haiku 4.5",
            &[Anthropic, Bedrock],
            (1.0, 5.0, 0.1),
            64_000,
            200_000,
            false,
            &["gemini-2.5-flash"],
        ),
        entry(
            "gemini-2.5-pro",
            "Gemini 2.5 Pro",
            &[Gemini],
            (1.25, 10.0, 0.31),
            65_536,
            1_048_576,
            true,
            &["claude-sonnet-4-5"],
        ),
        entry(
            "gemini-2.5-flash",
            "Gemini 2.5 Flash",
            &[Gemini],
            (0.3, 2.5, 0.075),
            65_536,
            1_048_576,
            false,
            &["gpt-4.1-mini"],
        ),
        entry(
            "llama-3.3-70b",
            "Llama 3.3 70B",
            &[Groq, Fireworks],
            (0.59, 0.79, 0.0),
            32_768,
            131_072,
            false,
            &["gpt-4.1-mini"],
        ),
        entry(
            "grok-4",
            "Grok 4",
            &[Xai],
            (3.0, 15.0, 0.75),
            64_000,
            256_000,
            true,
            &["claude-sonnet-4-5"],
        ),
        entry(
            "mistral-large-latest",
            "Mistral Large",
            &[Mistral],
            (2.0, 6.0, 0.0),
            32_768,
            131_072,
            false,
            &["gpt-4.1"],
        ),
        entry(
            "deepseek-r1",
            "DeepSeek R1",
            &[Fireworks],
            (3.0, 8.0, 0.0),
            32_768,
            163_840,
            true,
            &["o3"],
        ),
        entry(
            "deepseek-v3",
            "DeepSeek V3",
            &[Fireworks],
            (0.9, 0.9, 0.0),
            16_384,
            131_072,
            false,
            &["llama-3.3-70b"],
        ),
    ])
});

/// Look up catalog data for a model id
pub fn model_data(model: &str) -> Option<ModelData> {
    CATALOG.get(model).cloned()
}

/// All known model ids, sorted
pub fn model_ids() -> Vec<String> {
    let mut ids: Vec<String> = CATALOG.keys().cloned().collect();
    ids.sort();
    ids
}

/// All catalog entries, sorted by id
pub fn all_models() -> Vec<ModelData> {
    let mut models: Vec<ModelData> = CATALOG.values().cloned().collect();
    models.sort_by(|a, b| a.id.cmp(&b.id));
    models
}

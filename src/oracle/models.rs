use serde::{Deserialize, Serialize};
use std::fmt;

/// Backing model tiers, from cheapest to the one every failure escalates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Local-class model for small, unstructured prompts (llama-3-70b)
    Local,
    /// Cheap hosted model for easy prompts of moderate size (gpt-3.5-turbo)
    Mid,
    /// Strong reasoning model, the fallback target of every other tier (gpt-4o)
    Strong,
    /// Largest context window for oversized prompts (gemini-pro)
    LargeContext,
}

/// Which HTTP API serves a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Gemini,
    Replicate,
}

impl Tier {
    pub fn id(&self) -> &'static str {
        match self {
            Tier::Local => "meta/meta-llama-3-70b-instruct",
            Tier::Mid => "gpt-3.5-turbo-0125",
            Tier::Strong => "gpt-4o",
            Tier::LargeContext => "gemini-pro",
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            Tier::Local => Provider::Replicate,
            Tier::Mid | Tier::Strong => Provider::OpenAi,
            Tier::LargeContext => Provider::Gemini,
        }
    }

    /// Tier to redispatch to when this one fails; `None` means the failure is final.
    pub fn fallback(&self) -> Option<Tier> {
        match self {
            Tier::Local | Tier::Mid | Tier::LargeContext => Some(Tier::Strong),
            Tier::Strong => None,
        }
    }

    /// Whether the provider can be asked for a JSON object response.
    pub fn supports_json_mode(&self) -> bool {
        matches!(self.provider(), Provider::OpenAi)
    }

    pub fn pricing(&self) -> Pricing {
        pricing_for_model(self.id())
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Pricing {
    const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn cost(&self, usage: &Usage) -> f64 {
        usage.prompt_tokens as f64 / 1_000_000.0 * self.input_per_million
            + usage.completion_tokens as f64 / 1_000_000.0 * self.output_per_million
    }
}

/// Rate used for any model missing from the price table.
pub const DEFAULT_PRICING: Pricing = Pricing::new(10.0, 30.0);

/// Look up the fixed per-model rates.
pub fn pricing_for_model(model_id: &str) -> Pricing {
    match model_id {
        "gpt-4o" => Pricing::new(5.0, 15.0),
        "gpt-4-turbo-preview" => Pricing::new(10.0, 30.0),
        "gpt-4" => Pricing::new(30.0, 60.0),
        "gpt-3.5-turbo-0125" => Pricing::new(0.5, 1.5),
        "meta/meta-llama-3-70b-instruct" => Pricing::new(0.65, 2.75),
        "gemini-pro" => Pricing::new(0.5, 1.5),
        _ => DEFAULT_PRICING,
    }
}

/// Token usage reported by a provider for one call.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

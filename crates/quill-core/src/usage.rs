use serde::{Deserialize, Serialize};

/// Token counters reported by the provider for one model turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    /// Prompt-side tokens: fresh input plus tokens written to the cache.
    pub fn prompt_tokens(&self) -> u64 {
        self.input_tokens + self.cache_write_tokens
    }

    /// Completion-side tokens: output plus tokens served from the cache.
    pub fn completion_tokens(&self) -> u64 {
        self.output_tokens + self.cache_read_tokens
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Per-million-token prices for a model, in USD.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    pub cache_write_per_mtok: f64,
}

impl ModelPricing {
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        let per_token = |tokens: u64, price: f64| tokens as f64 / 1_000_000.0 * price;
        per_token(usage.input_tokens, self.input_per_mtok)
            + per_token(usage.output_tokens, self.output_per_mtok)
            + per_token(usage.cache_read_tokens, self.cache_read_per_mtok)
            + per_token(usage.cache_write_tokens, self.cache_write_per_mtok)
    }
}

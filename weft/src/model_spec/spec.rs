//! Model specification: context/output limits, unit prices, and tokenizer family.

use serde::{Deserialize, Serialize};

/// One model catalog entry: token limits, per-unit prices (USD per token), and the
/// tokenizer family used to estimate token counts for this model (spec.md §4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Context (input) token limit.
    pub context_limit: u32,
    /// Output token limit.
    pub output_limit: u32,
    /// Optional cache read token limit (e.g., for models with prompt caching).
    #[serde(default)]
    pub cache_read: Option<u32>,
    /// Optional cache write token limit.
    #[serde(default)]
    pub cache_write: Option<u32>,
    /// USD price per input token.
    #[serde(default)]
    pub input_price: f64,
    /// USD price per output token.
    #[serde(default)]
    pub output_price: f64,
    /// USD price per cache-read token, if the model supports prompt caching.
    #[serde(default)]
    pub cache_read_price: Option<f64>,
    /// USD price per cache-write token, if the model supports prompt caching.
    #[serde(default)]
    pub cache_write_price: Option<f64>,
    /// USD price per reasoning token, for models that bill reasoning separately.
    #[serde(default)]
    pub reasoning_price: Option<f64>,
    /// Tokenizer family (e.g. `"cl100k"`, `"gpt2"`), used to pick a tokenizer in
    /// [`crate::registry::TokenRegistry`]. `None` falls back to the default tokenizer.
    #[serde(default)]
    pub family: Option<String>,
}

impl ModelSpec {
    /// Create a new `ModelSpec` with required limits; prices default to zero and family
    /// to the default tokenizer.
    pub fn new(context_limit: u32, output_limit: u32) -> Self {
        Self {
            context_limit,
            output_limit,
            cache_read: None,
            cache_write: None,
            input_price: 0.0,
            output_price: 0.0,
            cache_read_price: None,
            cache_write_price: None,
            reasoning_price: None,
            family: None,
        }
    }

    /// Set optional cache read limit.
    pub fn with_cache_read(mut self, limit: u32) -> Self {
        self.cache_read = Some(limit);
        self
    }

    /// Set optional cache write limit.
    pub fn with_cache_write(mut self, limit: u32) -> Self {
        self.cache_write = Some(limit);
        self
    }

    /// Set per-token input/output prices (USD).
    pub fn with_prices(mut self, input_price: f64, output_price: f64) -> Self {
        self.input_price = input_price;
        self.output_price = output_price;
        self
    }

    /// Set the tokenizer family.
    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }
}

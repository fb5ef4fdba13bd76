//! Per-token pricing and cost calculation.
//!
//! Prices are expressed in dollars per one million tokens, the unit every
//! metered provider publishes. Lookups resolve in three steps: an exact
//! `(provider, model)` entry, then a provider-wide wildcard entry, then the
//! table default. The local provider is always free.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tokens per price unit.
const TOKENS_PER_PRICE_UNIT: f64 = 1_000_000.0;

/// Rough characters-per-token ratio used when a provider reports nothing.
pub const CHARS_PER_TOKEN: usize = 4;

/// Model name that matches every model of a provider.
pub const WILDCARD_MODEL: &str = "*";

/// Input/output price pair in dollars per 1M tokens.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

impl ModelPrice {
    pub fn new(input_per_1m: f64, output_per_1m: f64) -> Self {
        Self {
            input_per_1m,
            output_per_1m,
        }
    }

    pub fn cost(&self, tokens_input: u32, tokens_output: u32) -> f64 {
        (tokens_input as f64 / TOKENS_PER_PRICE_UNIT) * self.input_per_1m
            + (tokens_output as f64 / TOKENS_PER_PRICE_UNIT) * self.output_per_1m
    }
}

/// A configured price entry. `model` may be [`WILDCARD_MODEL`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub provider: String,
    #[serde(default = "wildcard")]
    pub model: String,
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

fn wildcard() -> String {
    WILDCARD_MODEL.to_string()
}

/// Token usage as reported (or not) by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportedUsage {
    pub tokens_input: Option<u32>,
    pub tokens_output: Option<u32>,
    pub tokens_total: Option<u32>,
}

/// Token counts after filling in whatever the provider left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedUsage {
    pub tokens_input: u32,
    pub tokens_output: u32,
    pub tokens_total: u32,
    pub estimated: bool,
}

/// Estimate a token count from text length.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN) as u32
}

impl ReportedUsage {
    /// Fill in missing counts.
    ///
    /// Both sides known: taken as-is. Only a total: split evenly, with the
    /// odd token counted as output. Nothing: estimated from prompt and
    /// completion length.
    pub fn resolve(&self, prompt: &str, completion: &str) -> ResolvedUsage {
        match (self.tokens_input, self.tokens_output, self.tokens_total) {
            (Some(input), Some(output), _) => ResolvedUsage {
                tokens_input: input,
                tokens_output: output,
                tokens_total: input.saturating_add(output),
                estimated: false,
            },
            (_, _, Some(total)) => {
                let input = total / 2;
                ResolvedUsage {
                    tokens_input: input,
                    tokens_output: total - input,
                    tokens_total: total,
                    estimated: true,
                }
            }
            (Some(input), None, None) => {
                let output = estimate_tokens(completion);
                ResolvedUsage {
                    tokens_input: input,
                    tokens_output: output,
                    tokens_total: input.saturating_add(output),
                    estimated: true,
                }
            }
            (None, Some(output), None) => {
                let input = estimate_tokens(prompt);
                ResolvedUsage {
                    tokens_input: input,
                    tokens_output: output,
                    tokens_total: input.saturating_add(output),
                    estimated: true,
                }
            }
            (None, None, None) => {
                let input = estimate_tokens(prompt);
                let output = estimate_tokens(completion);
                ResolvedUsage {
                    tokens_input: input,
                    tokens_output: output,
                    tokens_total: input.saturating_add(output),
                    estimated: true,
                }
            }
        }
    }
}

/// Price lookup table.
#[derive(Debug, Clone)]
pub struct PricingTable {
    local_provider: String,
    default_price: ModelPrice,
    prices: HashMap<(String, String), ModelPrice>,
}

impl PricingTable {
    pub fn new(local_provider: impl Into<String>, default_price: ModelPrice) -> Self {
        Self {
            local_provider: local_provider.into(),
            default_price,
            prices: HashMap::new(),
        }
    }

    pub fn with_price(
        mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
        price: ModelPrice,
    ) -> Self {
        self.insert(provider, model, price);
        self
    }

    pub fn insert(&mut self, provider: impl Into<String>, model: impl Into<String>, price: ModelPrice) {
        self.prices.insert((provider.into(), model.into()), price);
    }

    pub fn extend(&mut self, entries: &[PriceEntry]) {
        for entry in entries {
            self.insert(
                entry.provider.clone(),
                entry.model.clone(),
                ModelPrice::new(entry.input_per_1m, entry.output_per_1m),
            );
        }
    }

    pub fn price_for(&self, provider: &str, model: &str) -> ModelPrice {
        if provider == self.local_provider {
            return ModelPrice::default();
        }
        self.prices
            .get(&(provider.to_string(), model.to_string()))
            .or_else(|| {
                self.prices
                    .get(&(provider.to_string(), WILDCARD_MODEL.to_string()))
            })
            .copied()
            .unwrap_or(self.default_price)
    }

    /// Cost in USD of a call with the given token counts.
    pub fn cost(&self, provider: &str, model: &str, tokens_input: u32, tokens_output: u32) -> f64 {
        if provider == self.local_provider {
            return 0.0;
        }
        self.price_for(provider, model).cost(tokens_input, tokens_output)
    }
}

//! Pricing resolution for Claude models
//!
//! A `PricingTable` maps model identifiers to per-million-token prices by
//! case-insensitive substring match, longest pattern first. A model no pattern
//! matches is priced with the single entry flagged `fallback`, and the lookup
//! says so: `PriceLookup::Fallback` carries the model that was attempted so the
//! run summary can list it.
//!
//! # Examples
//!
//! ```
//! use ccbackfill_core::models::TokenCounts;
//! use ccbackfill_core::pricing::PricingTable;
//!
//! let table = PricingTable::embedded();
//!
//! // Sonnet 4: 1M output tokens at $15/M
//! let lookup = table.resolve("claude-sonnet-4-20250514");
//! let tokens = TokenCounts { output: 1_000_000, ..Default::default() };
//! assert_eq!(lookup.entry().cost(&tokens), 15.0);
//! assert!(!lookup.is_fallback());
//!
//! // Unknown models are priced, never free
//! assert!(table.resolve("claude-5-ultra").is_fallback());
//! ```

pub mod embedded;

use crate::error::BackfillError;
use crate::models::{TokenCounts, TokenType};
use serde::{Deserialize, Serialize};

pub use embedded::{default_entries, EMBEDDED_PRICING};

/// Prices of one model family, all per million tokens (USD)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub family: String,
    /// Substrings matched case-insensitively against the model identifier
    pub patterns: Vec<String>,
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_write_per_million: f64,
    pub cache_read_per_million: f64,
    #[serde(default)]
    pub fallback: bool,
}

impl PricingEntry {
    /// Entry with cache prices derived from the input price (write 1.25x, read 0.1x)
    pub fn new(family: &str, patterns: &[&str], input: f64, output: f64) -> Self {
        Self {
            family: family.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            input_per_million: input,
            output_per_million: output,
            cache_write_per_million: input * 1.25,
            cache_read_per_million: input * 0.1,
            fallback: false,
        }
    }

    pub fn as_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    pub fn price_per_million(&self, token_type: TokenType) -> f64 {
        match token_type {
            TokenType::Input => self.input_per_million,
            TokenType::Output => self.output_per_million,
            TokenType::CacheRead => self.cache_read_per_million,
            TokenType::CacheCreation => self.cache_write_per_million,
        }
    }

    /// Cost in USD of the given token counts
    ///
    /// ```text
    /// cost = sum over types of (tokens / 1M) x price_per_million
    /// ```
    pub fn cost(&self, tokens: &TokenCounts) -> f64 {
        tokens
            .by_type()
            .iter()
            .map(|(token_type, count)| {
                (*count as f64 / 1_000_000.0) * self.price_per_million(*token_type)
            })
            .sum()
    }

    fn prices(&self) -> [f64; 4] {
        [
            self.input_per_million,
            self.output_per_million,
            self.cache_write_per_million,
            self.cache_read_per_million,
        ]
    }
}

/// Result of resolving a model against the table
#[derive(Debug, Clone, PartialEq)]
pub enum PriceLookup<'a> {
    Matched(&'a PricingEntry),
    Fallback {
        entry: &'a PricingEntry,
        attempted_model: String,
    },
}

impl<'a> PriceLookup<'a> {
    pub fn entry(&self) -> &'a PricingEntry {
        match self {
            PriceLookup::Matched(entry) => *entry,
            PriceLookup::Fallback { entry, .. } => *entry,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, PriceLookup::Fallback { .. })
    }
}

/// Validated pricing table
#[derive(Debug, Clone)]
pub struct PricingTable {
    entries: Vec<PricingEntry>,
    /// (lowercased pattern, entry index), longest pattern first
    matchers: Vec<(String, usize)>,
    fallback: usize,
}

impl PricingTable {
    /// Validate entries: exactly one fallback, finite non-negative prices, at least one pattern
    pub fn new(entries: Vec<PricingEntry>) -> Result<Self, BackfillError> {
        let fallbacks: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.fallback)
            .map(|(i, _)| i)
            .collect();
        let fallback = match fallbacks.as_slice() {
            [single] => *single,
            [] => {
                return Err(BackfillError::invalid_config(
                    "pricing table has no entry flagged as fallback",
                ))
            }
            _ => {
                let families: Vec<&str> =
                    fallbacks.iter().map(|i| entries[*i].family.as_str()).collect();
                return Err(BackfillError::invalid_config(format!(
                    "pricing table has {} fallback entries ({}), expected exactly one",
                    families.len(),
                    families.join(", ")
                )));
            }
        };

        let mut matchers = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            if entry.prices().iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err(BackfillError::invalid_config(format!(
                    "pricing entry '{}' has a negative or non-finite price",
                    entry.family
                )));
            }
            let patterns: Vec<String> = entry
                .patterns
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect();
            if patterns.is_empty() {
                return Err(BackfillError::invalid_config(format!(
                    "pricing entry '{}' has no match pattern",
                    entry.family
                )));
            }
            matchers.extend(patterns.into_iter().map(|p| (p, index)));
        }
        matchers.sort_by(|(a, ai), (b, bi)| b.len().cmp(&a.len()).then(a.cmp(b)).then(ai.cmp(bi)));

        Ok(Self {
            entries,
            matchers,
            fallback,
        })
    }

    /// Default table shipped with the binary
    pub fn embedded() -> Self {
        EMBEDDED_PRICING.clone()
    }

    pub fn resolve(&self, model: &str) -> PriceLookup<'_> {
        let needle = model.to_lowercase();
        match self
            .matchers
            .iter()
            .find(|(pattern, _)| needle.contains(pattern.as_str()))
        {
            Some((_, index)) => PriceLookup::Matched(&self.entries[*index]),
            None => PriceLookup::Fallback {
                entry: &self.entries[self.fallback],
                attempted_model: model.to_string(),
            },
        }
    }

    pub fn entries(&self) -> &[PricingEntry] {
        &self.entries
    }

    pub fn fallback_entry(&self) -> &PricingEntry {
        &self.entries[self.fallback]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_only(n: u64) -> TokenCounts {
        TokenCounts {
            output: n,
            ..Default::default()
        }
    }

    #[test]
    fn test_sonnet_output_cost() {
        let table = PricingTable::embedded();
        let lookup = table.resolve("claude-sonnet-4-20250514");
        assert_eq!(lookup.entry().family, "sonnet");
        assert_eq!(lookup.entry().cost(&output_only(1_000_000)), 15.0);
    }

    #[test]
    fn test_longest_pattern_wins() {
        let table = PricingTable::embedded();
        assert_eq!(table.resolve("claude-opus-4-5-20251101").entry().family, "opus-4-5");
        assert_eq!(table.resolve("claude-opus-4-1-20250805").entry().family, "opus");
        assert_eq!(table.resolve("CLAUDE-HAIKU-4-5").entry().family, "haiku-4-5");
        assert_eq!(table.resolve("claude-3-5-haiku-20241022").entry().family, "haiku");
    }

    #[test]
    fn test_unknown_model_uses_flagged_fallback() {
        let table = PricingTable::embedded();
        let lookup = table.resolve("claude-5-ultra");
        match &lookup {
            PriceLookup::Fallback {
                entry,
                attempted_model,
            } => {
                assert!(entry.fallback);
                assert_eq!(attempted_model, "claude-5-ultra");
            }
            other => panic!("expected fallback, got {:?}", other),
        }
        assert!(lookup.entry().cost(&output_only(1_000)) > 0.0);
    }

    #[test]
    fn test_cache_prices_follow_multipliers() {
        let entry = PricingEntry::new("x", &["x"], 4.0, 20.0);
        let tokens = TokenCounts {
            input: 1_000_000,
            output: 0,
            cache_read: 1_000_000,
            cache_creation: 1_000_000,
        };
        // 4 + 0.4 + 5
        assert!((entry.cost(&tokens) - 9.4).abs() < 1e-9);
    }

    #[test]
    fn test_table_requires_exactly_one_fallback() {
        let none = PricingTable::new(vec![PricingEntry::new("a", &["a"], 1.0, 1.0)]);
        assert!(matches!(none, Err(BackfillError::InvalidConfig { .. })));

        let two = PricingTable::new(vec![
            PricingEntry::new("a", &["a"], 1.0, 1.0).as_fallback(),
            PricingEntry::new("b", &["b"], 1.0, 1.0).as_fallback(),
        ]);
        let message = two.unwrap_err().to_string();
        assert!(message.contains("a, b"));
    }

    #[test]
    fn test_table_rejects_bad_entries() {
        let negative =
            PricingTable::new(vec![PricingEntry::new("a", &["a"], -1.0, 1.0).as_fallback()]);
        assert!(negative.is_err());

        let blank =
            PricingTable::new(vec![PricingEntry::new("a", &["  "], 1.0, 1.0).as_fallback()]);
        assert!(blank.is_err());
    }
}

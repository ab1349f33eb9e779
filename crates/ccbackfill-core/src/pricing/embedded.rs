//! Embedded Claude pricing table
//!
//! Source: https://www.anthropic.com/pricing#api
//!
//! Cache pricing follows Anthropic's standard multipliers:
//! - Cache write: 125% of input price (1.25x)
//! - Cache read: 10% of input price (0.1x)
//!
//! Opus 4.5/4.6 are priced well below legacy Opus 4.0/4.1, so the more specific
//! patterns must win over the bare `opus` family.

use super::{PricingEntry, PricingTable};
use once_cell::sync::Lazy;

/// Default entries, sonnet is the fallback for unrecognised models
pub fn default_entries() -> Vec<PricingEntry> {
    vec![
        // Claude Opus 4.5/4.6 - reduced pricing
        PricingEntry {
            family: "opus-4-5".to_string(),
            patterns: vec!["opus-4-5".to_string(), "opus-4-6".to_string()],
            input_per_million: 5.0,
            output_per_million: 25.0,
            cache_write_per_million: 6.25,
            cache_read_per_million: 0.5,
            fallback: false,
        },
        // Claude Opus 3/4.0/4.1 - legacy pricing
        PricingEntry {
            family: "opus".to_string(),
            patterns: vec!["opus".to_string()],
            input_per_million: 15.0,
            output_per_million: 75.0,
            cache_write_per_million: 18.75,
            cache_read_per_million: 1.5,
            fallback: false,
        },
        PricingEntry {
            family: "sonnet".to_string(),
            patterns: vec!["sonnet".to_string()],
            input_per_million: 3.0,
            output_per_million: 15.0,
            cache_write_per_million: 3.75,
            cache_read_per_million: 0.3,
            fallback: true,
        },
        // Claude Haiku 4.5
        PricingEntry {
            family: "haiku-4-5".to_string(),
            patterns: vec!["haiku-4-5".to_string()],
            input_per_million: 1.0,
            output_per_million: 5.0,
            cache_write_per_million: 1.25,
            cache_read_per_million: 0.1,
            fallback: false,
        },
        // Claude Haiku 3.5
        PricingEntry {
            family: "haiku".to_string(),
            patterns: vec!["haiku".to_string()],
            input_per_million: 0.8,
            output_per_million: 4.0,
            cache_write_per_million: 1.0,
            cache_read_per_million: 0.08,
            fallback: false,
        },
    ]
}

/// Validated default table
pub static EMBEDDED_PRICING: Lazy<PricingTable> = Lazy::new(|| {
    match PricingTable::new(default_entries()) {
        Ok(table) => table,
        Err(e) => unreachable!("embedded pricing table is invalid: {}", e),
    }
});

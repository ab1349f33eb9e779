//! Optional TOML configuration file
//!
//! Looked up at `<config_dir>/ccbackfill/config.toml` unless a path is given.
//! Every field is optional; command-line flags override what is set here.
//!
//! ```toml
//! sources = ["/home/me/.claude/projects", "/mnt/backup/.claude/projects"]
//! format = "openmetrics"
//!
//! [store]
//! tsdb_dir = "/var/lib/prometheus"
//! url = "http://localhost:9090"
//! reload_timeout_secs = 10
//!
//! [[pricing]]
//! family = "sonnet"
//! input_per_million = 3.0
//! output_per_million = 15.0
//! fallback = true
//! ```

use crate::emitter::SnapshotFormat;
use crate::error::BackfillError;
use crate::pricing::{PricingEntry, PricingTable};
use crate::store::StoreConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// `[store]` section
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub tsdb_dir: Option<PathBuf>,
    pub url: Option<String>,
    pub reload_timeout_secs: Option<u64>,
    /// argv template with `{snapshot}` and `{tsdb}` placeholders
    pub bulk_load_command: Option<Vec<String>>,
}

/// One `[[pricing]]` entry; cache prices default to 1.25x / 0.1x input
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingOverride {
    pub family: String,
    /// Defaults to the family name
    #[serde(default)]
    pub patterns: Vec<String>,
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default)]
    pub cache_write_per_million: Option<f64>,
    #[serde(default)]
    pub cache_read_per_million: Option<f64>,
    #[serde(default)]
    pub fallback: bool,
}

impl From<&PricingOverride> for PricingEntry {
    fn from(o: &PricingOverride) -> Self {
        let patterns = if o.patterns.is_empty() {
            vec![o.family.clone()]
        } else {
            o.patterns.clone()
        };
        PricingEntry {
            family: o.family.clone(),
            patterns,
            input_per_million: o.input_per_million,
            output_per_million: o.output_per_million,
            cache_write_per_million: o
                .cache_write_per_million
                .unwrap_or(o.input_per_million * 1.25),
            cache_read_per_million: o
                .cache_read_per_million
                .unwrap_or(o.input_per_million * 0.1),
            fallback: o.fallback,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackfillConfig {
    pub sources: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    pub format: Option<SnapshotFormat>,
    pub store: StoreSection,
    /// Replaces the embedded pricing table when non-empty
    pub pricing: Vec<PricingOverride>,
}

impl BackfillConfig {
    /// `<config_dir>/ccbackfill/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ccbackfill").join("config.toml"))
    }

    /// `~/.claude/projects`
    pub fn default_source() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".claude").join("projects"))
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, BackfillError> {
        toml::from_str(content).map_err(|source| BackfillError::ConfigParse {
            path: path.to_path_buf(),
            message: source.message().to_string(),
            source,
        })
    }

    /// Load an explicit config file; a missing file is an error
    pub fn load(path: &Path) -> Result<Self, BackfillError> {
        let content = std::fs::read_to_string(path).map_err(|source| BackfillError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content, path)?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Load `path` if given, else the default location when it exists, else defaults
    pub fn discover(path: Option<&Path>) -> Result<Self, BackfillError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(default) if default.is_file() => Self::load(&default),
            _ => Ok(Self::default()),
        }
    }

    pub fn pricing_table(&self) -> Result<PricingTable, BackfillError> {
        if self.pricing.is_empty() {
            return Ok(PricingTable::embedded());
        }
        PricingTable::new(self.pricing.iter().map(PricingEntry::from).collect())
    }

    /// Store settings for `tsdb_dir`, with config values applied over defaults
    pub fn store_config(&self, tsdb_dir: PathBuf) -> StoreConfig {
        let mut config = StoreConfig::new(tsdb_dir);
        if let Some(url) = &self.store.url {
            config = config.with_url(url.clone());
        }
        if let Some(secs) = self.store.reload_timeout_secs {
            config = config.with_reload_timeout(Duration::from_secs(secs));
        }
        if let Some(command) = &self.store.bulk_load_command {
            config = config.with_bulk_load_command(command.clone());
        }
        config
    }
}

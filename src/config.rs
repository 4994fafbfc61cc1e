// ⚙️ Engine Configuration
//
// Every field has a default, so an empty (or missing) file is a valid
// configuration. Environment:
// - RECORDS_AGGREGATES_CONFIG: path of a TOML file to load
// - RECORDS_AGGREGATES_DB: overrides database_path

use crate::idgen::DEFAULT_MAX_ATTEMPTS;
use crate::sequence::DocumentKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "RECORDS_AGGREGATES_CONFIG";
pub const DATABASE_ENV: &str = "RECORDS_AGGREGATES_DB";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_path: PathBuf,

    /// tracing EnvFilter directive used when RUST_LOG is unset
    pub log_filter: String,

    pub identifiers: IdentifierConfig,

    pub numbering: NumberingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_path: PathBuf::from("records.db"),
            log_filter: "info".to_string(),
            identifiers: IdentifierConfig::default(),
            numbering: NumberingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifierConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Ceiling on a single backoff sleep. The default stays above the last
    /// doubling the default attempt budget reaches.
    pub max_delay_ms: u64,
    /// Domain appended to inbound addresses
    pub address_domain: String,
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        IdentifierConfig {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: 25,
            max_delay_ms: 10_000,
            address_domain: "inbound.example.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumberingConfig {
    pub invoice_prefix: String,
    pub quote_prefix: String,
    /// Zero-padding width of the numeric part
    pub width: usize,
}

impl Default for NumberingConfig {
    fn default() -> Self {
        NumberingConfig {
            invoice_prefix: "INV".to_string(),
            quote_prefix: "Q".to_string(),
            width: 4,
        }
    }
}

impl NumberingConfig {
    pub fn prefix(&self, kind: DocumentKind) -> &str {
        match kind {
            DocumentKind::Invoice => &self.invoice_prefix,
            DocumentKind::Quote => &self.quote_prefix,
        }
    }

    /// "INV-0042"
    pub fn format(&self, kind: DocumentKind, sequence: i64) -> String {
        format!("{}-{:0width$}", self.prefix(kind), sequence, width = self.width)
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// File named by RECORDS_AGGREGATES_CONFIG (or defaults), then env overrides
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(db) = env::var_os(DATABASE_ENV) {
            config.database_path = PathBuf::from(db);
        }

        Ok(config)
    }
}

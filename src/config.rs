//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` (or the file named by `RECONCILER_CONFIG`) into
//! strongly-typed structs. Every section has defaults matching the
//! reference deployment, so a missing file is not an error. The database
//! URL is a secret and is referenced by env-var name, resolved at runtime.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::extract::{label_window, section_label};
use crate::types::{ReconcileError, Role, ValidRange};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const CONFIG_PATH_ENV: &str = "RECONCILER_CONFIG";

/// Upper bound for `run.lock_stale_secs` (one week).
pub const MAX_LOCK_STALE_SECS: u64 = 7 * 24 * 60 * 60;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub rate: RateConfig,
    pub status: StatusConfig,
    pub run: RunConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Name of the env var holding the database URL.
    pub url_env: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url_env: "RECONCILER_DATABASE_URL".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
    pub accept_language: String,
    /// Some official rate pages ship incomplete certificate chains.
    pub accept_invalid_certs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .to_string(),
            accept_language: "es-VE,es;q=0.9,en;q=0.8".to_string(),
            accept_invalid_certs: false,
        }
    }
}

/// Inclusive decimal bounds as written in TOML (`{ min = "100", max = "10000" }`).
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RangeConfig {
    #[serde(with = "rust_decimal::serde::str")]
    pub min: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub max: Decimal,
}

impl RangeConfig {
    pub fn to_range(&self) -> ValidRange {
        ValidRange::new(self.min, self.max)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateConfig {
    /// Snapshot stream the rate is stored under.
    pub scope: String,
    pub unit: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub tolerance: Decimal,
    pub valid_range: RangeConfig,
    /// Role that is notified when the rate changes.
    pub notify_role: String,
    /// Tried in order until one yields a valid value.
    pub sources: Vec<SourceConfig>,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            scope: "usd_ves".to_string(),
            unit: "Bs/USD".to_string(),
            tolerance: dec!(0.01),
            valid_range: RangeConfig {
                min: dec!(100),
                max: dec!(10000),
            },
            notify_role: "admin".to_string(),
            sources: vec![
                SourceConfig {
                    name: "BCV".to_string(),
                    url: "https://www.bcv.org.ve/".to_string(),
                    extractor: ExtractorConfig::SectionLabel {
                        section: "dolar".to_string(),
                        label: "USD".to_string(),
                        section_window: section_label::DEFAULT_SECTION_WINDOW,
                        label_window: section_label::DEFAULT_LABEL_WINDOW,
                        label_range: None,
                    },
                },
                SourceConfig {
                    name: "MonitorDolar".to_string(),
                    url: "https://monitordolarvenezuela.com/".to_string(),
                    extractor: ExtractorConfig::LabelWindow {
                        label: "BCV".to_string(),
                        window: label_window::DEFAULT_WINDOW,
                    },
                },
            ],
        }
    }
}

/// One source of the rate chain.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    pub extractor: ExtractorConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorConfig {
    SectionLabel {
        section: String,
        label: String,
        #[serde(default = "default_section_window")]
        section_window: usize,
        #[serde(default = "default_label_window")]
        label_window: usize,
        #[serde(default)]
        label_range: Option<RangeConfig>,
    },
    LabelWindow {
        label: String,
        #[serde(default = "default_window")]
        window: usize,
    },
}

fn default_section_window() -> usize {
    section_label::DEFAULT_SECTION_WINDOW
}

fn default_label_window() -> usize {
    section_label::DEFAULT_LABEL_WINDOW
}

fn default_window() -> usize {
    label_window::DEFAULT_WINDOW
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    /// Role whose members are swept.
    pub entity_role: String,
    pub workers: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            entity_role: "resident".to_string(),
            workers: 4,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunConfig {
    /// Refuse to start while another run of the same job holds the lock.
    pub single_flight: bool,
    pub lock_stale_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            single_flight: false,
            lock_stale_secs: 900,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `RECONCILER_CONFIG` or `config.toml`; fall back to defaults if absent.
    pub fn load_or_default() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        if Path::new(&path).exists() {
            Self::load(&path)
        } else {
            info!(path = %path, "No config file found, using defaults");
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Reject settings no run could succeed with.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        let range = &self.rate.valid_range;
        if range.min > range.max {
            return Err(ReconcileError::Config(format!(
                "rate.valid_range min {} exceeds max {}",
                range.min, range.max
            )));
        }
        if self.rate.tolerance.is_sign_negative() {
            return Err(ReconcileError::Config(format!(
                "rate.tolerance must be >= 0, got {}",
                self.rate.tolerance
            )));
        }
        if self.rate.sources.is_empty() {
            return Err(ReconcileError::Config("rate.sources must not be empty".into()));
        }
        if self.status.workers == 0 {
            return Err(ReconcileError::Config("status.workers must be >= 1".into()));
        }
        if self.run.lock_stale_secs == 0 || self.run.lock_stale_secs > MAX_LOCK_STALE_SECS {
            return Err(ReconcileError::Config(format!(
                "run.lock_stale_secs must be between 1 and {MAX_LOCK_STALE_SECS}, got {}",
                self.run.lock_stale_secs
            )));
        }
        if self.http.timeout_secs == 0 {
            return Err(ReconcileError::Config("http.timeout_secs must be >= 1".into()));
        }
        Ok(())
    }

    pub fn database_url(&self) -> Result<SecretString, ReconcileError> {
        Self::resolve_env(&self.database.url_env).map(SecretString::new)
    }

    pub fn notify_role(&self) -> Role {
        Role::new(&self.rate.notify_role)
    }

    pub fn entity_role(&self) -> Role {
        Role::new(&self.status.entity_role)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String, ReconcileError> {
        match std::env::var(env_name) {
            Ok(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(ReconcileError::Config(format!(
                "Environment variable not set: {env_name}"
            ))),
        }
    }
}

//! Process-wide configuration.
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables. Every field has a default so an empty file is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::HISTORY_CHARS;

/// Environment variable overriding `storage_root`.
pub const ENV_ROOT: &str = "SESSION_BROKER_ROOT";
/// Environment variable overriding `llm.model`.
pub const ENV_MODEL: &str = "SESSION_BROKER_MODEL";
/// Environment variable overriding `llm.base_url`.
pub const ENV_LLM_URL: &str = "SESSION_BROKER_LLM_URL";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Main broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Root directory for session state.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

fn default_storage_root() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("session-broker"))
        .unwrap_or_else(|| PathBuf::from(".session-broker"))
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            llm: LlmConfig::default(),
            summary: SummaryConfig::default(),
            run: RunConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

/// Text generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model identifier passed to the backend.
    pub model: String,
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    /// Name of the environment variable holding the API key, if any.
    pub api_key_env: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-oss-20b".to_string(),
            base_url: "http://localhost:1234/v1".to_string(),
            api_key_env: None,
            timeout_secs: 120,
        }
    }
}

impl LlmConfig {
    /// Resolve the API key from the configured environment variable.
    #[must_use]
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.is_empty())
    }
}

/// Background summarization settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// Whether the summary worker runs at all.
    pub enabled: bool,
    /// Maximum queued jobs before new jobs are dropped.
    pub queue_capacity: usize,
    /// Estimated token budget for one batched summarization call.
    pub batch_token_budget: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: 256,
            batch_token_budget: 4096,
        }
    }
}

/// Command execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Timeout applied when a run request does not specify one.
    pub default_timeout_secs: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 60.0,
        }
    }
}

/// Activity history settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Size cap for the history returned when opening a session.
    pub max_chars: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_chars: HISTORY_CHARS,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or contains invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    /// Returns error if the text is not valid configuration.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup(ENV_ROOT).filter(|v| !v.is_empty()) {
            self.storage_root = PathBuf::from(root);
        }
        if let Some(model) = lookup(ENV_MODEL).filter(|v| !v.is_empty()) {
            self.llm.model = model;
        }
        if let Some(url) = lookup(ENV_LLM_URL).filter(|v| !v.is_empty()) {
            self.llm.base_url = url;
        }
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns error describing the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.summary.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "summary.queue_capacity must be at least 1".to_string(),
            ));
        }
        if !(self.run.default_timeout_secs.is_finite() && self.run.default_timeout_secs > 0.0) {
            return Err(ConfigError::Invalid(
                "run.default_timeout_secs must be a positive number".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding live session records.
    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.storage_root.join("sessions")
    }

    /// Directory holding soft-deleted session records.
    #[must_use]
    pub fn deleted_dir(&self) -> PathBuf {
        self.storage_root.join("deleted")
    }
}

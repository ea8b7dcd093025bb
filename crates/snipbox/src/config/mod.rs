use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

pub use crate::config::language::{FileExtension, Language, RunConfig};
use crate::types::{RateLimitConfig, SandboxLimits, SessionConfig};

pub mod language;
mod loader;

pub use crate::config::loader::ENV_PREFIX;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../snipbox.example.toml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid characters in file extension")]
    InvalidFileExtChars,

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("language '{0}' not found in configuration")]
    LanguageNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for Snipbox
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Unix socket of the Docker daemon (local defaults if not specified).
    #[serde(default)]
    pub docker_socket: Option<PathBuf>,

    /// Limits applied uniformly to every sandbox.
    #[serde(default)]
    pub limits: SandboxLimits,

    /// Per-client admission throttle.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Worker pool used for streaming executions.
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Language profiles keyed by lower-cased language ID
    #[serde(default)]
    pub languages: HashMap<String, Language>,
}

impl Config {
    /// Create a new config with embedded default languages
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty config with no languages
    pub fn empty() -> Self {
        Self {
            docker_socket: None,
            limits: SandboxLimits::default(),
            rate_limit: RateLimitConfig::default(),
            sessions: SessionConfig::default(),
            languages: HashMap::new(),
        }
    }

    /// Get a language by ID, ignoring case
    pub fn get_language(&self, id: &str) -> Result<&Language, ConfigError> {
        let key = id.trim().to_lowercase();
        self.languages
            .get(&key)
            .ok_or(ConfigError::LanguageNotFound(key))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

//! Configuration loading for Snipbox
//!
//! Layers TOML sources and `SNIPBOX_`-prefixed environment variables using the
//! config crate. Nested keys are separated by `__`, so
//! `SNIPBOX_LIMITS__TIMEOUT_SECS=5` overrides `limits.timeout_secs`.

use std::collections::HashMap;
use std::path::Path;

use config::builder::DefaultState;
use config::{Config as ConfigBuilder, ConfigBuilder as Builder, Environment, File, FileFormat};

use crate::config::{Config, ConfigError, EXAMPLE_CONFIG};

/// Prefix of environment variables read by [`Config::load`]
pub const ENV_PREFIX: &str = "SNIPBOX";

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let builder = ConfigBuilder::builder().add_source(File::from(path.as_ref()));
        Self::finish(builder)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let builder =
            ConfigBuilder::builder().add_source(File::from_str(content, FileFormat::Toml));
        Self::finish(builder)
    }

    /// Load the deployment configuration
    ///
    /// Starts from the given file, or the embedded example when none is given,
    /// and applies environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, environment())
    }

    /// Like [`Config::load`], with environment variables taken from `vars`
    pub fn load_from_vars(
        path: Option<&Path>,
        vars: HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        Self::load_with_env(path, environment().source(Some(vars)))
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let builder = match path {
            Some(path) => ConfigBuilder::builder().add_source(File::from(path)),
            None => ConfigBuilder::builder()
                .add_source(File::from_str(EXAMPLE_CONFIG, FileFormat::Toml)),
        };
        Self::finish(builder.add_source(env))
    }

    fn finish(builder: Builder<DefaultState>) -> Result<Self, ConfigError> {
        let config: Config = builder.build()?.try_deserialize()?;
        let config = config.normalize_language_ids();
        config.validate()?;
        Ok(config)
    }

    /// Re-key the language registry by lower-cased ID
    fn normalize_language_ids(mut self) -> Self {
        self.languages = self
            .languages
            .into_iter()
            .map(|(id, language)| (id.to_lowercase(), language))
            .collect();
        self
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        for (id, lang) in &self.languages {
            if lang.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty name"
                )));
            }
            if lang.image.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty image"
                )));
            }
            if lang.extension.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty extension"
                )));
            }
            if lang.run.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty run command"
                )));
            }
            if let Some(var) = lang.run.env.iter().find(|var| !var.contains('=')) {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has malformed env entry '{var}'"
                )));
            }
        }

        let limits = &self.limits;
        if !(limits.timeout_secs.is_finite() && limits.timeout_secs > 0.0) {
            return Err(ConfigError::Invalid(
                "limits.timeout_secs must be positive".to_owned(),
            ));
        }
        if limits.memory_limit_mb == 0 {
            return Err(ConfigError::Invalid(
                "limits.memory_limit_mb must be positive".to_owned(),
            ));
        }
        if limits.cpu_quota <= 0 || limits.cpu_period <= 0 {
            return Err(ConfigError::Invalid(
                "limits.cpu_quota and limits.cpu_period must be positive".to_owned(),
            ));
        }
        if limits.max_processes <= 0 {
            return Err(ConfigError::Invalid(
                "limits.max_processes must be positive".to_owned(),
            ));
        }
        if limits.max_output_bytes == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_output_bytes must be positive".to_owned(),
            ));
        }
        if limits.run_as.is_empty() || limits.run_as == "root" || limits.run_as == "0" {
            return Err(ConfigError::Invalid(
                "limits.run_as must name an unprivileged user".to_owned(),
            ));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.max_requests and rate_limit.window_secs must be positive".to_owned(),
            ));
        }
        if self.sessions.workers == 0 {
            return Err(ConfigError::Invalid(
                "sessions.workers must be at least 1".to_owned(),
            ));
        }

        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

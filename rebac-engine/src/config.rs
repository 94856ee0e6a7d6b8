use crate::error::{RebacError, Result};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine tuning knobs.
///
/// Loaded in layers: built-in defaults, then an optional config file, then
/// `REBAC_`-prefixed environment variables (e.g. `REBAC_MAX_DEPTH=32`).
/// Nested keys are separated by `__`, so single underscores stay part of
/// the field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of hops a single check may take
    pub max_depth: u32,
    /// How many revisions behind head remain readable
    pub revision_retention: u64,
    pub check_cache_enabled: bool,
    /// Maximum number of cached check results
    pub check_cache_capacity: usize,
    /// Default deadline applied to checks that don't carry their own
    pub check_timeout_ms: Option<u64>,
    /// Upper bound on concurrently evaluated branches per node
    pub max_concurrent_expansions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 50,
            revision_retention: 1024,
            check_cache_enabled: true,
            check_cache_capacity: 10_000,
            check_timeout_ms: None,
            max_concurrent_expansions: 16,
        }
    }
}

impl EngineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix("REBAC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(invalid("max_depth must be greater than 0"));
        }
        if self.revision_retention == 0 {
            return Err(invalid("revision_retention must be greater than 0"));
        }
        if self.check_cache_capacity == 0 {
            return Err(invalid("check_cache_capacity must be greater than 0"));
        }
        if self.max_concurrent_expansions == 0 {
            return Err(invalid("max_concurrent_expansions must be greater than 0"));
        }
        if self.check_timeout_ms == Some(0) {
            return Err(invalid("check_timeout_ms must be greater than 0 when set"));
        }
        Ok(())
    }

    pub fn check_timeout(&self) -> Option<Duration> {
        self.check_timeout_ms.map(Duration::from_millis)
    }
}

fn invalid(message: &str) -> RebacError {
    RebacError::Config(ConfigError::Message(message.to_string()))
}

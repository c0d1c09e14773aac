//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - patternflow.toml (default configuration)
//! - patternflow.local.toml (git-ignored local overrides)
//! - Environment variables (PATTERNFLOW_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # patternflow.toml
//! [engine]
//! default_backend = "local_search"
//! coalesce_listener_events = true
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! PATTERNFLOW_ENGINE__DEFAULT_BACKEND=rete
//! PATTERNFLOW_LOGGING__LEVEL=trace
//! ```

use crate::planner::Backend;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Query engine behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Backend for queries that do not ask for one
    #[serde(default)]
    pub default_backend: Backend,

    /// Deliver integrity issues to error listeners (they are logged either way)
    #[serde(default = "default_true")]
    pub report_integrity_issues: bool,

    /// Deliver the net change per match over one update instead of every
    /// intermediate event
    #[serde(default = "default_true")]
    pub coalesce_listener_events: bool,

    /// Bound on rounds of listener-triggered follow-up writes per update
    #[serde(default = "default_max_deferred_rounds")]
    pub max_deferred_rounds: usize,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error) or a full
    /// `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: text or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_max_deferred_rounds() -> usize {
    1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("patternflow.toml"))
            .merge(Toml::file("patternflow.local.toml"))
            .merge(Env::prefixed("PATTERNFLOW_").split("__"))
            .extract()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PATTERNFLOW_").split("__"))
            .extract()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_backend: Backend::Rete,
            report_integrity_issues: true,
            coalesce_listener_events: true,
            max_deferred_rounds: default_max_deferred_rounds(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.default_backend, Backend::Rete);
        assert!(config.engine.report_integrity_issues);
        assert!(config.engine.coalesce_listener_events);
        assert_eq!(config.engine.max_deferred_rounds, 1024);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();

        assert!(toml_str.contains("[engine]"));
        assert!(toml_str.contains("default_backend = \"rete\""));
        assert!(toml_str.contains("[logging]"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            default_backend = "local_search"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.default_backend, Backend::LocalSearch);
        assert!(config.engine.coalesce_listener_events);
        assert_eq!(config.logging, LoggingConfig::default());
    }
}

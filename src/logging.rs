//! Tracing setup for embedding applications and tests.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the host. [`init_tracing`] is a convenience for hosts that do
//! not have their own.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber configured by `config`.
///
/// `PATTERNFLOW_LOG` takes precedence over `config.level`. Returns false if
/// a global subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let level = std::env::var("PATTERNFLOW_LOG")
        .ok()
        .unwrap_or_else(|| config.level.clone());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    let base = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true);

    let installed = if config.format.eq_ignore_ascii_case("json") {
        base.json().try_init().is_ok()
    } else {
        base.compact().try_init().is_ok()
    };
    if installed {
        tracing::debug!(level = %level, format = %config.format, "tracing_initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        let config = LoggingConfig::default();
        // the first call may lose to another test; a repeat always fails
        init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}

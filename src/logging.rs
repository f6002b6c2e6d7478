//! Tracing subscriber setup

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::GeneralConfig;

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence; otherwise the configured filter is used, and
/// failing that `debug` or `info` depending on `verbose`. Errors if a global
/// subscriber is already set.
pub fn init(config: &GeneralConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
}

fn default_directive(config: &GeneralConfig) -> String {
    match &config.log_filter {
        Some(directive) => directive.clone(),
        None if config.verbose => "debug".to_string(),
        None => "info".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        let mut config = GeneralConfig::default();
        assert_eq!(default_directive(&config), "info");

        config.verbose = true;
        assert_eq!(default_directive(&config), "debug");

        config.log_filter = Some("cardnet::network=trace".to_string());
        assert_eq!(default_directive(&config), "cardnet::network=trace");
    }

    #[test]
    fn test_second_init_fails() {
        let config = GeneralConfig::default();
        let _ = init(&config);
        assert!(init(&config).is_err());
    }
}

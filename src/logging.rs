//! # Structured Logging
//!
//! Environment-aware console logging using the tracing ecosystem. Containers collect
//! stdout, so there is no file appender: `pretty` for humans, `json` for log shippers.

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ServerConfig;

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global subscriber once. Later calls are no-ops.
pub fn init_tracing(config: &ServerConfig) {
    TRACING_INITIALIZED.get_or_init(|| {
        let level = log_level(config);
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

        let layer = if config.logging.format == "json" {
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(std::io::stdout().is_terminal())
                .boxed()
        };

        // Another subscriber may already be installed (tests, embedding binaries)
        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            environment = %config.environment,
            level = %level,
            format = %config.logging.format,
            pid = std::process::id(),
            "Structured logging initialized"
        );
    });
}

fn log_level(config: &ServerConfig) -> String {
    if let Some(level) = &config.logging.level {
        return level.clone();
    }
    default_level_for(&config.environment).to_string()
}

fn default_level_for(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(default_level_for("test"), "debug");
        assert_eq!(default_level_for("development"), "debug");
        assert_eq!(default_level_for("production"), "info");
        assert_eq!(default_level_for("unknown"), "debug");
    }

    #[test]
    fn test_configured_level_wins() {
        let mut config = ServerConfig::default();
        config.environment = "production".to_string();
        assert_eq!(log_level(&config), "info");

        config.logging.level = Some("warn,ingestion_server=debug".to_string());
        assert_eq!(log_level(&config), "warn,ingestion_server=debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = ServerConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}

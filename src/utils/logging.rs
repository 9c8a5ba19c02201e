//! Structured logging setup.
//!
//! Installs a `tracing_subscriber::fmt` subscriber driven by
//! [`LoggingConfig`]. `RUST_LOG` takes precedence over the configured level.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()))
}

/// Install the global subscriber.
///
/// Every failure, including a subscriber that is already installed, is
/// reported as `ConfigError`.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let problems = config.validate();
    if !problems.is_empty() {
        return Err(ProtocolError::ConfigError(problems.join("; ")));
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true);

    let installed = match (config.log_to_file, config.log_file_path.as_deref()) {
        (true, Some(path)) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ProtocolError::ConfigError(format!("Failed to open log file {path}: {e}"))
                })?;
            let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
            if config.json_format {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        _ if config.json_format => builder.json().try_init(),
        _ => builder.try_init(),
    };

    installed.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;
    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}

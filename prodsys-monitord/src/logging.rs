//! Logging setup for the monitoring daemon
//!
//! Console output is always enabled; when a log directory is configured a
//! daily-rotating file layer is added, optionally in JSON format for log
//! aggregation systems. Library code logs through the `log` facade and is
//! picked up by the tracing-log bridge installed at init.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_logging(log_dir: Option<&Path>, log_level: &str, json_logs: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)
                .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "prodsys-monitord.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Keep the background writer alive for the process lifetime
            std::mem::forget(guard);

            let registry = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer());

            if json_logs {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(non_blocking)
                            .with_ansi(false),
                    )
                    .init();
            } else {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(non_blocking)
                            .with_ansi(false),
                    )
                    .init();
            }
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

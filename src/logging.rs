//! Subscriber setup for hosts of the engine
//!
//! The engine itself only emits `tracing` events. A host application calls one
//! of these functions once at startup to route them to stderr and, optionally, to
//! a daily rolling log file.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from the given default.

use crate::error::{RegError, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info,regtree_rs=debug";

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install a stderr subscriber
///
/// Returns an error if a global subscriber is already installed.
pub fn init(default_filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| RegError::Config(format!("Failed to install log subscriber: {}", e)))
}

/// Install a stderr subscriber plus a daily rolling file in `dir`
///
/// Keep the returned guard alive; dropping it flushes and stops the file writer.
pub fn init_with_file(
    dir: impl AsRef<Path>,
    prefix: &str,
    default_filter: &str,
) -> Result<WorkerGuard> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let file_appender = tracing_appender::rolling::daily(dir, prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(fmt::layer().with_thread_names(true))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .try_init()
        .map_err(|e| RegError::Config(format!("Failed to install log subscriber: {}", e)))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // The first call may already have happened in another test of this binary
        let _ = init("warn");
        assert!(init("warn").is_err());
    }
}

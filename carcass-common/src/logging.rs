//! Logging initialization using tracing.
//!
//! Logs go to stderr, stdout is left to command output.

use anyhow::{anyhow, Result};
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Initialize the tracing subscriber with the specified log level.
///
/// `RUST_LOG` takes precedence over `level` when set.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_target(false),
        )
        .try_init()
        .map_err(|e| anyhow!("could not install log subscriber: {}", e))
}

/// Initialize logging with JSON output format.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_target(true),
        )
        .try_init()
        .map_err(|e| anyhow!("could not install log subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        assert!(init_logging("debug").is_ok());
        assert!(init_logging_json("debug").is_err());
    }
}

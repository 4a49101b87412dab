//! Structured Logger
//!
//! Wraps `tracing` to provide console output on stderr, an optional daily-rotated NDJSON
//! file, and environment-based level control.

use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Prefix of the rolled log files (`modhost.log.YYYY-MM-DD`).
const LOG_FILE_PREFIX: &str = "modhost.log";

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins over `level`. With `log_dir` set, a JSON file layer is
/// added next to the console layer; `json_console` switches the console to
/// JSON as well. Returns `false` if a global subscriber was already installed.
pub fn init_logger(log_dir: Option<&Path>, level: &str, json_console: bool) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = log_dir.map(|dir| {
        let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
        fmt::layer()
            .json()
            .with_writer(file_appender)
            .with_ansi(false)
    });

    let (json_layer, text_layer) = if json_console {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (
            None,
            Some(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_ansi(true),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_refused() {
        let dir = tempfile::TempDir::new().unwrap();
        let _ = init_logger(Some(dir.path()), "debug", false);
        assert!(!init_logger(None, "info", true), "only one global subscriber can win");
    }
}

use anyhow::{anyhow, Result};
use std::time::Instant;
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` wins over `level`; each
/// `verbosity` step raises the level once (info -> debug -> trace).
///
/// Logs go to stderr so stdout stays free for command output and the
/// JSON-lines API.
pub fn init_tracing(level: &str, verbosity: u8) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(raise_level(level, verbosity))
            .map_err(|e| anyhow!("invalid log level '{}': {}", level, e))?,
    };

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

fn raise_level(level: &str, verbosity: u8) -> &str {
    const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    let Some(current) = LEVELS.iter().position(|l| l.eq_ignore_ascii_case(level)) else {
        return level;
    };
    LEVELS[(current + verbosity as usize).min(LEVELS.len() - 1)]
}

/// Logs how long the enclosing scope took when dropped.
pub struct PerformanceTracker {
    start_time: Instant,
    operation_name: String,
}

impl PerformanceTracker {
    pub fn new(operation_name: &str) -> Self {
        Self {
            start_time: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }
}

impl Drop for PerformanceTracker {
    fn drop(&mut self) {
        let duration = self.start_time.elapsed();
        debug!(
            operation = %self.operation_name,
            duration_ms = %duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("info", 0, "info")]
    #[test_case("info", 1, "debug")]
    #[test_case("warn", 5, "trace")]
    #[test_case("furnace=debug", 1, "furnace=debug" ; "directive passes through")]
    fn verbosity_raises_level(level: &str, verbosity: u8, expected: &str) {
        assert_eq!(raise_level(level, verbosity), expected);
    }
}

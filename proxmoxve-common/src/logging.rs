//! Logging initialization using tracing.

use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info};
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format for the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable, one event per line
    #[default]
    Pretty,
    /// One JSON object per event, for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(anyhow::anyhow!("Unknown log format: {}", other)),
        }
    }
}

/// Initialize the tracing subscriber with the specified log level.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
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
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Initialize logging with JSON output format.
/// Suitable for production environments with log aggregation.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Measures a named operation against a target and logs its duration.
///
/// Dropping the value without calling [`TimedOperation::finish`] logs the
/// elapsed time at debug level, so abandoned operations still leave a trace.
pub struct TimedOperation {
    operation: &'static str,
    target: String,
    started: Instant,
    finished: bool,
}

impl TimedOperation {
    pub fn new(operation: &'static str, target: impl Into<String>) -> Self {
        Self {
            operation,
            target: target.into(),
            started: Instant::now(),
            finished: false,
        }
    }

    /// Time since the operation started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Log completion and return the elapsed time.
    pub fn finish(mut self) -> Duration {
        self.finished = true;
        let elapsed = self.elapsed();
        info!(
            operation = self.operation,
            target = %self.target,
            elapsed_ms = elapsed.as_millis() as u64,
            "Operation completed"
        );
        elapsed
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                operation = self.operation,
                target = %self.target,
                elapsed_ms = self.elapsed().as_millis() as u64,
                "Operation abandoned"
            );
        }
    }
}

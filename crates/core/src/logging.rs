//! Logging and tracing initialization for the latency harness binary.
//!
//! [`init_tracing`] configures structured logging with two console modes:
//! - **JSON mode** (`json = true`): machine-readable output with nanosecond
//!   timestamps, thread ids and targets.
//! - **Pretty mode** (`json = false`): human-readable output for
//!   interactive runs.
//!
//! An optional log file always receives JSON records, so a run can be
//! inspected on the console and post-processed from disk.
//!
//! The `RUST_LOG` environment variable takes precedence over the configured
//! level (e.g., `RUST_LOG=wslat_harness=debug,wslat_feed=trace`).
//!
//! Library crates never call this; they only emit `tracing` events.

use std::fmt;
use std::fs::File;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

/// Initialize the global tracing subscriber.
///
/// # Errors
///
/// Fails if the log file cannot be created or a global subscriber has
/// already been installed.
///
/// # Examples
///
/// ```
/// let cfg = wslat_core::config::LoggingConfig::default();
/// wslat_core::logging::init_tracing(&cfg).expect("first init succeeds");
/// ```
pub fn init_tracing(cfg: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .with_context(|| format!("invalid log level '{}'", cfg.level))?;

    let console: Box<dyn Layer<Registry> + Send + Sync> = if cfg.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_timer(NanosecondTimer)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_names(true)
            .boxed()
    };

    let file_layer = match &cfg.file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_timer(NanosecondTimer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(env_filter)
        .try_init()
        .context("global tracing subscriber already set")?;

    Ok(())
}

/// Custom timer that emits nanosecond-precision timestamps for JSON logs.
#[derive(Debug, Clone)]
struct NanosecondTimer;

impl tracing_subscriber::fmt::time::FormatTime for NanosecondTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let now = chrono::Utc::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.9fZ"))
    }
}

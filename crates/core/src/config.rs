//! Layered configuration for the latency harness.
//!
//! Configuration is loaded in layers with increasing priority:
//! 1. Compiled-in defaults (Binance USD-M futures endpoint, one connection,
//!    one minute window)
//! 2. TOML configuration file (if provided)
//! 3. Environment variable overrides (prefix `WSLAT_`, nested with `__`)
//!
//! Command-line flags are applied on top by the binary after loading.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::types::StrategyKind;

// ── Default value functions ────────────────────────────────────────────

/// Default feed endpoint: Binance USD-M futures raw stream.
fn default_ws_url() -> String {
    "wss://fstream.binance.com/ws".to_string()
}

/// Default stream channel: best bid/ask updates.
fn default_channel() -> String {
    "bookTicker".to_string()
}

/// Default logical connection count: 1.
fn default_connections() -> usize {
    1
}

/// Default measurement window: 60 s.
fn default_duration_secs() -> u64 {
    60
}

/// Default connect + handshake bound: 10 000 ms.
fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// Default stop-flag polling interval for blocking sockets: 100 ms.
fn default_stop_poll_interval_ms() -> u64 {
    100
}

/// Default time allowed for an orderly close before force-cancel: 1 000 ms.
fn default_close_grace_ms() -> u64 {
    1_000
}

/// Default bounded wait for thread exit: 5 000 ms.
fn default_join_timeout_ms() -> u64 {
    5_000
}

/// Default output directory.
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Default log level when `RUST_LOG` is unset.
fn default_log_level() -> String {
    "info".to_string()
}

// ── Configuration structs ──────────────────────────────────────────────

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Feed endpoint and stream selection.
    pub feed: FeedConfig,
    /// Strategy, connection count and measurement window.
    pub run: RunConfig,
    /// Connect, close and join bounds.
    #[serde(default)]
    pub teardown: TeardownConfig,
    /// Where per-connection series are written.
    #[serde(default)]
    pub output: OutputConfig,
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Feed endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// WebSocket URL of the raw stream endpoint.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Instrument ticker (e.g., `btcusdt`).
    pub ticker: String,
    /// Stream channel appended to the ticker (e.g., `bookTicker`).
    #[serde(default = "default_channel")]
    pub channel: String,
}

impl FeedConfig {
    /// Stream name subscribed to, e.g. `btcusdt@bookTicker`.
    pub fn stream_name(&self) -> String {
        format!("{}@{}", self.ticker.to_lowercase(), self.channel)
    }
}

/// Run parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Connection strategy to measure.
    pub strategy: StrategyKind,
    /// Number of logical connections / subscriptions.
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Measurement window in seconds.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
}

impl RunConfig {
    /// Measurement window as a [`Duration`].
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// Teardown and connect bounds, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TeardownConfig {
    /// Bound on TCP connect plus WebSocket upgrade.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Read timeout used by blocking sockets to observe the stop flag.
    #[serde(default = "default_stop_poll_interval_ms")]
    pub stop_poll_interval_ms: u64,
    /// Time an orderly close may take before units are force-cancelled.
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    /// Bounded wait for OS threads to exit after the stop signal.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl TeardownConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            stop_poll_interval_ms: default_stop_poll_interval_ms(),
            close_grace_ms: default_close_grace_ms(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

/// Output location for recorded series.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Root directory; each strategy writes to `<data_dir>/<LABEL>/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON to the console instead of pretty output.
    #[serde(default)]
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset (e.g., `info`, `wslat_harness=debug`).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional JSON log file, written in addition to the console.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: default_log_level(),
            file: None,
        }
    }
}

impl AppConfig {
    /// Load configuration using layered sources.
    ///
    /// 1. Compiled-in defaults.
    /// 2. TOML file at `config_path` (if `Some`).
    /// 3. Environment variable overrides with prefix `WSLAT_` and `__` as
    ///    the nesting separator (e.g., `WSLAT_RUN__CONNECTIONS=4`).
    ///
    /// The result is validated before it is returned.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut builder = Config::builder()
            // ── Layer 1: compiled-in defaults ───────────────────────
            .set_default("feed.ws_url", default_ws_url())?
            .set_default("feed.ticker", "btcusdt")?
            .set_default("feed.channel", default_channel())?
            .set_default("run.strategy", StrategyKind::ThreadPerSocket.as_str())?
            .set_default("run.connections", default_connections() as i64)?
            .set_default("run.duration_secs", default_duration_secs() as i64)?
            .set_default("teardown.connect_timeout_ms", default_connect_timeout_ms() as i64)?
            .set_default("teardown.stop_poll_interval_ms", default_stop_poll_interval_ms() as i64)?
            .set_default("teardown.close_grace_ms", default_close_grace_ms() as i64)?
            .set_default("teardown.join_timeout_ms", default_join_timeout_ms() as i64)?
            .set_default("output.data_dir", "data")?
            .set_default("logging.json", false)?
            .set_default("logging.level", default_log_level())?;

        // ── Layer 2: TOML file ─────────────────────────────────────
        if let Some(path) = config_path {
            let path_str = path
                .to_str()
                .context("config path is not valid UTF-8")?;
            builder = builder.add_source(File::with_name(path_str).required(true));
        }

        // ── Layer 3: env var overrides (WSLAT_ prefix) ────────────
        // The prefix separator must stay `_` while nesting uses `__`,
        // otherwise the prefix itself is matched as `wslat__`.
        builder = builder.add_source(
            Environment::with_prefix("WSLAT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: AppConfig = builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.run.connections == 0 {
            bail!("run.connections must be at least 1");
        }
        if self.run.duration_secs == 0 {
            bail!("run.duration_secs must be at least 1");
        }
        if self.feed.ticker.trim().is_empty() {
            bail!("feed.ticker must not be empty");
        }
        if !(self.feed.ws_url.starts_with("ws://") || self.feed.ws_url.starts_with("wss://")) {
            bail!("feed.ws_url must be a ws:// or wss:// URL, got {}", self.feed.ws_url);
        }
        if self.teardown.stop_poll_interval_ms == 0 {
            bail!("teardown.stop_poll_interval_ms must be non-zero");
        }
        Ok(())
    }
}

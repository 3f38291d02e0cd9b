//! Core types for the latency harness.
//!
//! Timestamps are plain `i64` epoch milliseconds because the delay metric is
//! the difference between the local wall clock and the feed's embedded event
//! time, and that difference may legitimately be negative.

pub mod clock;
pub mod connection;
pub mod sample;

// Re-export primary types for convenient access via `wslat_core::types::*`.
pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{Connection, ConnectionId, ConnectionStatus, StrategyKind};
pub use sample::Sample;

//! WebSocket market-data latency harness: connection strategies, run
//! orchestration and result export.

pub mod export;
pub mod harness;
pub mod observer;
pub mod result;
pub mod sink;
pub mod strategy;

pub use harness::{Harness, TeardownReport};
pub use observer::{Observer, RecordingObserver, TracingObserver};
pub use result::{ConnectionSeries, DelaySummary, RunResult};
pub use sink::{SampleSink, SinkSlot};
pub use strategy::{Strategy, StrategyContext, StrategySettings};

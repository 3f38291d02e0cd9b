//! Per-run output: one ordered sample series per logical connection.

use wslat_core::error::FeedError;
use wslat_core::types::{ConnectionId, Sample, StrategyKind};

use crate::sink::SinkSlot;

/// Samples recorded by one logical connection, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSeries {
    pub connection: ConnectionId,
    /// Stream the connection subscribed to.
    pub stream: String,
    pub samples: Vec<Sample>,
}

impl ConnectionSeries {
    pub fn update_ids(&self) -> Vec<u64> {
        self.samples.iter().map(|s| s.update_id).collect()
    }

    pub fn client_timestamps(&self) -> Vec<i64> {
        self.samples.iter().map(|s| s.client_timestamp).collect()
    }

    pub fn delays(&self) -> Vec<i64> {
        self.samples.iter().map(|s| s.delay).collect()
    }

    /// Delay statistics, `None` for an empty series.
    pub fn summary(&self) -> Option<DelaySummary> {
        DelaySummary::from_delays(self.delays())
    }
}

/// Distribution of delays in one series, milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelaySummary {
    pub count: usize,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub p50: i64,
    pub p99: i64,
}

impl DelaySummary {
    fn from_delays(mut delays: Vec<i64>) -> Option<Self> {
        if delays.is_empty() {
            return None;
        }
        delays.sort_unstable();
        let count = delays.len();
        let rank = |q: f64| delays[((count - 1) as f64 * q).round() as usize];
        let sum: i128 = delays.iter().map(|&d| d as i128).sum();
        Some(Self {
            count,
            min: delays[0],
            max: delays[count - 1],
            mean: sum as f64 / count as f64,
            p50: rank(0.50),
            p99: rank(0.99),
        })
    }
}

/// Everything one strategy run produced.
///
/// `series` holds exactly one entry per requested connection, in
/// connection-index order, including connections that never received data.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub kind: StrategyKind,
    pub series: Vec<ConnectionSeries>,
}

impl RunResult {
    /// Reclaim and drain every sink once all writers have stopped.
    pub(crate) fn collect(
        kind: StrategyKind,
        slots: Vec<(ConnectionId, String, SinkSlot)>,
    ) -> Result<Self, FeedError> {
        let series = slots
            .into_iter()
            .map(|(connection, stream, slot)| {
                let samples = slot.reclaim()?.drain()?;
                Ok(ConnectionSeries {
                    connection,
                    stream,
                    samples,
                })
            })
            .collect::<Result<Vec<_>, FeedError>>()?;
        Ok(Self { kind, series })
    }

    /// Number of logical connections.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn total_samples(&self) -> usize {
        self.series.iter().map(|s| s.samples.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionSeries> {
        self.series.iter()
    }
}

//! Logical connection identity and lifecycle.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Index of a logical connection, unique within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub usize);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a logical connection.
///
/// Transitions only move forward:
/// `Connecting -> Streaming -> Draining -> Closed`. Any state may jump
/// straight to `Closed` (transport error), and `Connecting` may jump to
/// `Draining` when the deadline hits mid-handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Streaming,
    Draining,
    Closed,
}

impl ConnectionStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        next > self
    }
}

/// The three connection-concurrency strategies under comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// One OS thread and one socket per logical connection.
    #[serde(alias = "MWMT", alias = "mwmt")]
    ThreadPerSocket,
    /// One cooperative task and one socket per logical connection, single thread.
    #[serde(alias = "MWST", alias = "mwst")]
    TaskPerSocket,
    /// One socket multiplexing every logical subscription, one receive loop.
    #[serde(alias = "SWST", alias = "swst")]
    SharedSocket,
}

impl StrategyKind {
    /// All variants, in comparison order.
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::ThreadPerSocket,
        StrategyKind::TaskPerSocket,
        StrategyKind::SharedSocket,
    ];

    /// Kebab-case name used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThreadPerSocket => "thread-per-socket",
            Self::TaskPerSocket => "task-per-socket",
            Self::SharedSocket => "shared-socket",
        }
    }

    /// Short label used for output directories
    /// (multiple/single websockets, multiple/single threads).
    pub fn label(&self) -> &'static str {
        match self {
            Self::ThreadPerSocket => "MWMT",
            Self::TaskPerSocket => "MWST",
            Self::SharedSocket => "SWST",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        StrategyKind::ALL
            .into_iter()
            .find(|k| k.as_str() == lower || k.label().eq_ignore_ascii_case(&lower))
            .ok_or_else(|| {
                FeedError::InvalidState(format!(
                    "unknown strategy '{s}', expected one of thread-per-socket (MWMT), \
                     task-per-socket (MWST), shared-socket (SWST)"
                ))
            })
    }
}

/// One logical subscription to the feed, owned by its strategy.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Identity within the run.
    pub id: ConnectionId,
    /// Strategy variant owning this connection.
    pub kind: StrategyKind,
    /// Stream this connection subscribes to.
    pub stream: String,
    /// Run start, epoch milliseconds.
    pub started_at: i64,
    /// Run deadline, epoch milliseconds.
    pub deadline: i64,
    status: ConnectionStatus,
}

impl Connection {
    /// Create a connection in the `Connecting` state.
    pub fn new(
        id: ConnectionId,
        kind: StrategyKind,
        stream: impl Into<String>,
        started_at: i64,
        deadline: i64,
    ) -> Self {
        Self {
            id,
            kind,
            stream: stream.into(),
            started_at,
            deadline,
            status: ConnectionStatus::Connecting,
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Move to `next`, rejecting backward transitions.
    pub fn transition(&mut self, next: ConnectionStatus) -> Result<(), FeedError> {
        if !self.status.can_transition_to(next) {
            return Err(FeedError::InvalidState(format!(
                "{} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

//! Lifecycle and error notifications for logical connections.
//!
//! Strategies never log or swallow connection-scoped failures on their own;
//! they report them to an injected [`Observer`]. The default
//! [`TracingObserver`] turns them into structured log events.

use parking_lot::Mutex;
use wslat_core::error::FeedError;
use wslat_core::types::{ConnectionId, ConnectionStatus};

use crate::result::RunResult;

/// Receives status changes and errors from every execution unit.
///
/// Called from OS threads and from tasks, so implementations must be
/// cheap and must not block.
pub trait Observer: Send + Sync {
    /// A logical connection moved to `status`.
    fn on_status(&self, connection: ConnectionId, status: ConnectionStatus);

    /// A connection-scoped failure. The connection stops recording.
    fn on_error(&self, connection: ConnectionId, error: &FeedError);

    /// The run finished and every sink has been drained.
    fn on_run_complete(&self, _result: &RunResult) {}
}

/// Logs every notification through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_status(&self, connection: ConnectionId, status: ConnectionStatus) {
        tracing::debug!(connection = %connection, status = ?status, "connection status changed");
    }

    fn on_error(&self, connection: ConnectionId, error: &FeedError) {
        match error {
            FeedError::Decode(_) => {
                tracing::trace!(connection = %connection, error = %error, "frame skipped")
            }
            _ => tracing::warn!(connection = %connection, error = %error, "connection failed"),
        }
    }

    fn on_run_complete(&self, result: &RunResult) {
        for series in result.iter() {
            match series.summary() {
                Some(s) => tracing::info!(
                    strategy = %result.kind,
                    connection = %series.connection,
                    samples = s.count,
                    min_ms = s.min,
                    p50_ms = s.p50,
                    p99_ms = s.p99,
                    max_ms = s.max,
                    mean_ms = s.mean,
                    "connection delay summary"
                ),
                None => tracing::info!(
                    strategy = %result.kind,
                    connection = %series.connection,
                    "connection recorded no samples"
                ),
            }
        }
    }
}

/// One recorded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    Status(ConnectionId, ConnectionStatus),
    /// Connection and the rendered error.
    Error(ConnectionId, String),
}

/// Keeps every notification in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    /// Status sequence reported for one connection.
    pub fn statuses(&self, connection: ConnectionId) -> Vec<ConnectionStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::Status(c, s) if *c == connection => Some(*s),
                _ => None,
            })
            .collect()
    }

    /// Errors reported for one connection.
    pub fn errors(&self, connection: ConnectionId) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::Error(c, msg) if *c == connection => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Observer for RecordingObserver {
    fn on_status(&self, connection: ConnectionId, status: ConnectionStatus) {
        self.events
            .lock()
            .push(ObservedEvent::Status(connection, status));
    }

    fn on_error(&self, connection: ConnectionId, error: &FeedError) {
        self.events
            .lock()
            .push(ObservedEvent::Error(connection, error.to_string()));
    }
}

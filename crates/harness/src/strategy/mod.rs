//! Connection-concurrency strategies.
//!
//! Every strategy opens its logical connections, subscribes each to the
//! configured stream, records one [`Sample`] per decoded data frame into that
//! connection's sink, and stops recording at the run deadline:
//!
//! - [`ThreadPerSocket`]: one OS thread and one blocking socket per
//!   connection (MWMT).
//! - [`TaskPerSocket`]: one cooperative task and one socket per connection,
//!   all on a single thread (MWST).
//! - [`SharedSocket`]: one socket carrying every subscription, one receive
//!   loop demultiplexing frames into per-subscription sinks (SWST).

mod router;
mod shared_socket;
mod task_per_socket;
mod thread_per_socket;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use wslat_core::config::AppConfig;
use wslat_core::error::{DecodeFailure, FeedError};
use wslat_core::types::{Clock, Connection, ConnectionId, ConnectionStatus, Sample, StrategyKind};
use wslat_feed::{codec, FeedEvent, WsSink, WsStream};

use crate::observer::Observer;
use crate::result::RunResult;
use crate::sink::SinkSlot;

pub use router::{RouteOutcome, Router, RouterStats, RoutingKey, Subscription};
pub use shared_socket::SharedSocket;
pub use task_per_socket::TaskPerSocket;
pub use thread_per_socket::ThreadPerSocket;

/// Request id of the single `SUBSCRIBE` sent on a dedicated connection.
pub(crate) const SUBSCRIBE_REQUEST_ID: u64 = 1;

/// Endpoint and teardown bounds shared by every strategy.
#[derive(Debug, Clone)]
pub struct StrategySettings {
    pub ws_url: String,
    /// Bound on TCP connect plus WebSocket upgrade.
    pub connect_timeout: Duration,
    /// Blocking read timeout used to observe the stop flag.
    pub stop_poll_interval: Duration,
    /// Time allowed for an orderly close before units are force-cancelled.
    pub close_grace: Duration,
    /// Bounded wait for OS threads after the stop signal.
    pub join_timeout: Duration,
}

impl StrategySettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            ws_url: cfg.feed.ws_url.clone(),
            connect_timeout: cfg.teardown.connect_timeout(),
            stop_poll_interval: cfg.teardown.stop_poll_interval(),
            close_grace: cfg.teardown.close_grace(),
            join_timeout: cfg.teardown.join_timeout(),
        }
    }
}

/// Collaborators injected into every execution unit.
pub struct StrategyContext {
    pub settings: StrategySettings,
    pub observer: Arc<dyn Observer>,
    pub clock: Arc<dyn Clock>,
}

impl StrategyContext {
    pub fn new(settings: StrategySettings, observer: Arc<dyn Observer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            observer,
            clock,
        }
    }
}

/// A configured strategy, ready to run.
pub enum Strategy {
    ThreadPerSocket(ThreadPerSocket),
    TaskPerSocket(TaskPerSocket),
    SharedSocket(SharedSocket),
}

impl Strategy {
    /// Build the `kind` strategy with `connections` logical connections to
    /// `stream`.
    pub fn new(
        kind: StrategyKind,
        ctx: Arc<StrategyContext>,
        stream: &str,
        connections: usize,
    ) -> Result<Self, FeedError> {
        if connections == 0 {
            return Err(FeedError::InvalidState(
                "a run needs at least one connection".to_string(),
            ));
        }
        Ok(match kind {
            StrategyKind::ThreadPerSocket => {
                Self::ThreadPerSocket(ThreadPerSocket::new(ctx, stream, connections))
            }
            StrategyKind::TaskPerSocket => {
                Self::TaskPerSocket(TaskPerSocket::new(ctx, stream, connections))
            }
            StrategyKind::SharedSocket => {
                if connections > 1 {
                    tracing::warn!(
                        stream,
                        connections,
                        "stream repeated on a shared socket: only the first subscription \
                         receives frames, the other series stay empty"
                    );
                }
                Self::SharedSocket(SharedSocket::new(ctx, vec![stream.to_string(); connections]))
            }
        })
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::ThreadPerSocket(_) => StrategyKind::ThreadPerSocket,
            Self::TaskPerSocket(_) => StrategyKind::TaskPerSocket,
            Self::SharedSocket(_) => StrategyKind::SharedSocket,
        }
    }

    /// Number of logical connections the run will report.
    pub fn connections(&self) -> usize {
        match self {
            Self::ThreadPerSocket(s) => s.connections(),
            Self::TaskPerSocket(s) => s.connections(),
            Self::SharedSocket(s) => s.connections(),
        }
    }

    /// Record for `duration`, tear down, and return one series per
    /// connection.
    pub fn run(&self, duration: Duration) -> Result<RunResult, FeedError> {
        match self {
            Self::ThreadPerSocket(s) => s.run(duration),
            Self::TaskPerSocket(s) => s.run(duration),
            Self::SharedSocket(s) => s.run(duration),
        }
    }
}

/// Tracks one logical connection's status and forwards changes to the
/// observer.
pub(crate) struct Lifecycle {
    conn: Connection,
    observer: Arc<dyn Observer>,
}

impl Lifecycle {
    pub(crate) fn new(conn: Connection, observer: Arc<dyn Observer>) -> Self {
        observer.on_status(conn.id, conn.status());
        Self { conn, observer }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.conn.id
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.conn.status()
    }

    /// Move forward to `status`. Repeated or backward moves are ignored.
    pub(crate) fn set(&mut self, status: ConnectionStatus) {
        if self.conn.transition(status).is_ok() {
            self.observer.on_status(self.conn.id, status);
        }
    }

    /// Report a connection-scoped failure and close.
    pub(crate) fn fail(&mut self, err: FeedError) {
        self.fail_with(&err);
    }

    /// Like [`Lifecycle::fail`], for an error shared by several connections.
    pub(crate) fn fail_with(&mut self, err: &FeedError) {
        if self.status() == ConnectionStatus::Closed {
            return;
        }
        self.observer.on_error(self.conn.id, err);
        self.set(ConnectionStatus::Closed);
    }
}

/// What one text frame contributed to a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Ingest {
    Recorded,
    /// Control-plane reply, discarded silently.
    Ack,
    Skipped(DecodeFailure),
}

/// Decode `text` as a plain data frame and append its sample to `slot`.
///
/// `received_at` must be read from the clock as soon as the frame arrived.
pub(crate) fn ingest(text: &str, received_at: i64, slot: &SinkSlot) -> Result<Ingest, FeedError> {
    match codec::decode(text).and_then(|event| sample_of(&event, received_at)) {
        Ok(sample) => {
            slot.append(sample)?;
            Ok(Ingest::Recorded)
        }
        Err(DecodeFailure::ControlAck { .. }) => Ok(Ingest::Ack),
        Err(failure) => {
            tracing::trace!(error = %failure, "skipping undecodable frame");
            Ok(Ingest::Skipped(failure))
        }
    }
}

/// Sample for a decoded frame received at `received_at`. An event time too
/// far from the local clock to yield an `i64` delay is malformed input.
pub(crate) fn sample_of(event: &FeedEvent, received_at: i64) -> Result<Sample, DecodeFailure> {
    Sample::checked_observe(event.update_id, received_at, event.event_time).ok_or_else(|| {
        DecodeFailure::Malformed(format!(
            "event time {} overflows the delay at {received_at}",
            event.event_time
        ))
    })
}

/// Send a close frame and keep reading until the peer completes the close
/// handshake, passing every text frame still in flight to `on_text` along
/// with its receive time.
///
/// Never returns if the peer stays silent; callers bound it with the close
/// grace period.
pub(crate) async fn close_and_drain<F>(mut sink: WsSink, mut stream: WsStream, clock: &dyn Clock, mut on_text: F)
where
    F: FnMut(&str, i64) -> Result<(), FeedError>,
{
    if let Err(e) = sink.send(Message::Close(None)).await {
        tracing::debug!(error = %e, "close frame not sent, connection already gone");
        return;
    }

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let received_at = clock.now_millis();
                if let Err(e) = on_text(&text, received_at) {
                    tracing::warn!(error = %e, "dropping frame received while draining");
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "read error while draining");
                break;
            }
        }
    }
}

/// Build a single-threaded runtime and drive `fut` to completion on it.
///
/// The cooperative strategies spawn every unit onto this runtime, so all of
/// them share the calling thread.
pub(crate) fn block_on_current_thread<F: std::future::Future>(fut: F) -> Result<F::Output, FeedError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| FeedError::InvalidState(format!("failed to build runtime: {e}")))?;
    Ok(runtime.block_on(fut))
}

//! One OS thread and one blocking socket per logical connection.
//!
//! Blocking reads cannot be cancelled, so each socket carries a short read
//! timeout ([`StrategySettings::stop_poll_interval`]). A timed-out read is
//! not an error; it only gives the thread a chance to check the shared stop
//! flag. After the flag is raised the thread sends a close frame, keeps
//! recording frames still in flight for up to the close grace period, and
//! exits. The harness waits a bounded time for every thread to report.
//!
//! [`StrategySettings::stop_poll_interval`]: super::StrategySettings::stop_poll_interval

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use tokio_tungstenite::tungstenite::{self, Message};
use wslat_core::error::FeedError;
use wslat_core::types::{Connection, ConnectionId, ConnectionStatus, StrategyKind};
use wslat_feed::control::subscribe_blocking;
use wslat_feed::transport::{connect_blocking, is_read_timeout};
use wslat_feed::BlockingSocket;

use super::{ingest, Lifecycle, StrategyContext, SUBSCRIBE_REQUEST_ID};
use crate::harness::{join_workers, stop_workers, Worker};
use crate::result::RunResult;
use crate::sink::SinkSlot;

pub struct ThreadPerSocket {
    ctx: Arc<StrategyContext>,
    stream: String,
    connections: usize,
}

impl ThreadPerSocket {
    pub fn new(ctx: Arc<StrategyContext>, stream: &str, connections: usize) -> Self {
        Self {
            ctx,
            stream: stream.to_string(),
            connections,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections
    }

    /// Spawn one thread per connection, record for `duration`, then stop
    /// and join them.
    ///
    /// Fails with [`FeedError::TeardownTimeout`] if any thread has not
    /// exited within the join timeout after the stop signal.
    pub fn run(&self, duration: Duration) -> Result<RunResult, FeedError> {
        let started_at = self.ctx.clock.now_millis();
        let deadline = started_at + duration.as_millis() as i64;
        let stop = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = channel::unbounded();

        tracing::info!(
            strategy = %StrategyKind::ThreadPerSocket,
            connections = self.connections,
            stream = %self.stream,
            duration_ms = duration.as_millis() as u64,
            "starting run"
        );

        let mut workers = Vec::with_capacity(self.connections);
        let mut slots = Vec::with_capacity(self.connections);
        for i in 0..self.connections {
            let id = ConnectionId(i);
            let slot = SinkSlot::new();
            let conn = Connection::new(id, StrategyKind::ThreadPerSocket, &self.stream, started_at, deadline);
            let unit = SocketThread {
                lifecycle: Lifecycle::new(conn, self.ctx.observer.clone()),
                ctx: self.ctx.clone(),
                stream: self.stream.clone(),
                slot: slot.clone(),
                stop: stop.clone(),
                _exit: ExitNotice {
                    id,
                    tx: exit_tx.clone(),
                },
            };

            let spawned = thread::Builder::new()
                .name(format!("wslat-{id}"))
                .spawn(move || unit.run());
            match spawned {
                Ok(handle) => workers.push(Worker { id, handle }),
                Err(e) => {
                    // Stop what is already running before giving up.
                    stop_workers(workers, &exit_rx, self.ctx.settings.join_timeout, &stop);
                    return Err(FeedError::InvalidState(format!("failed to spawn thread for {id}: {e}")));
                }
            }
            slots.push((id, self.stream.clone(), slot));
        }
        drop(exit_tx);

        join_workers(workers, &exit_rx, duration, self.ctx.settings.join_timeout, &stop)?;
        RunResult::collect(StrategyKind::ThreadPerSocket, slots)
    }
}

/// Tells the harness a thread is done, including when it unwinds.
struct ExitNotice {
    id: ConnectionId,
    tx: Sender<ConnectionId>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(self.id);
    }
}

/// The execution unit owned by one OS thread.
struct SocketThread {
    lifecycle: Lifecycle,
    ctx: Arc<StrategyContext>,
    stream: String,
    slot: SinkSlot,
    stop: Arc<AtomicBool>,
    // Dropped last, after the sink handle.
    _exit: ExitNotice,
}

impl SocketThread {
    fn run(mut self) {
        let span = tracing::info_span!("connection", connection = %self.lifecycle.id());
        let _enter = span.enter();

        let settings = &self.ctx.settings;
        let mut socket = match connect_blocking(
            &settings.ws_url,
            settings.connect_timeout,
            settings.stop_poll_interval,
        ) {
            Ok(socket) => socket,
            Err(e) => {
                self.lifecycle.fail(e);
                return;
            }
        };

        if let Err(e) = subscribe_blocking(&mut socket, &self.stream, SUBSCRIBE_REQUEST_ID) {
            self.lifecycle.fail(e);
            return;
        }
        self.lifecycle.set(ConnectionStatus::Streaming);

        while !self.stop.load(Ordering::SeqCst) {
            match socket.read() {
                Ok(Message::Text(text)) => {
                    let received_at = self.ctx.clock.now_millis();
                    if let Err(e) = ingest(&text, received_at, &self.slot) {
                        self.lifecycle.fail(e);
                        return;
                    }
                }
                Ok(Message::Close(frame)) => {
                    tracing::info!(frame = ?frame, "feed closed the connection");
                    self.lifecycle.set(ConnectionStatus::Closed);
                    return;
                }
                Ok(_) => continue,
                Err(e) if is_read_timeout(&e) => continue,
                Err(e) => {
                    self.lifecycle
                        .fail(FeedError::Connection(format!("read failed: {e}")));
                    return;
                }
            }
        }

        self.lifecycle.set(ConnectionStatus::Draining);
        self.drain(&mut socket);
        self.lifecycle.set(ConnectionStatus::Closed);
    }

    /// Start the close handshake and record what is still in flight until
    /// the peer confirms or the close grace period ends.
    fn drain(&mut self, socket: &mut BlockingSocket) {
        if let Err(e) = socket.close(None) {
            tracing::debug!(error = %e, "close frame not sent");
            return;
        }

        let grace_ends = Instant::now() + self.ctx.settings.close_grace;
        while Instant::now() < grace_ends {
            match socket.read() {
                Ok(Message::Text(text)) => {
                    let received_at = self.ctx.clock.now_millis();
                    if let Err(e) = ingest(&text, received_at, &self.slot) {
                        tracing::warn!(error = %e, "dropping frame received while draining");
                    }
                }
                Ok(_) => continue,
                Err(e) if is_read_timeout(&e) => continue,
                Err(tungstenite::Error::ConnectionClosed) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "read error while draining");
                    break;
                }
            }
        }
    }
}

//! One cooperative task and one socket per logical connection, every task
//! on a single-threaded runtime.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use wslat_core::error::FeedError;
use wslat_core::types::{Connection, ConnectionId, ConnectionStatus, StrategyKind};
use wslat_feed::{transport, SubscriptionController};

use super::{block_on_current_thread, close_and_drain, ingest, Lifecycle, StrategyContext, SUBSCRIBE_REQUEST_ID};
use crate::harness::supervise;
use crate::result::RunResult;
use crate::sink::SinkSlot;

pub struct TaskPerSocket {
    ctx: Arc<StrategyContext>,
    stream: String,
    connections: usize,
}

impl TaskPerSocket {
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

    /// Run on a fresh current-thread runtime owned by the calling thread.
    pub fn run(&self, duration: Duration) -> Result<RunResult, FeedError> {
        block_on_current_thread(self.run_async(duration))?
    }

    /// Run inside an existing runtime.
    ///
    /// Units are spawned onto the ambient runtime, so the single-thread
    /// property only holds on a current-thread runtime.
    pub async fn run_async(&self, duration: Duration) -> Result<RunResult, FeedError> {
        let started_at = self.ctx.clock.now_millis();
        let deadline = started_at + duration.as_millis() as i64;
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        tracing::info!(
            strategy = %StrategyKind::TaskPerSocket,
            connections = self.connections,
            stream = %self.stream,
            duration_ms = duration.as_millis() as u64,
            "starting run"
        );

        let mut slots = Vec::with_capacity(self.connections);
        for i in 0..self.connections {
            let id = ConnectionId(i);
            let slot = SinkSlot::new();
            let conn = Connection::new(id, StrategyKind::TaskPerSocket, &self.stream, started_at, deadline);
            let unit = SocketTask {
                lifecycle: Lifecycle::new(conn, self.ctx.observer.clone()),
                ctx: self.ctx.clone(),
                stream: self.stream.clone(),
                slot: slot.clone(),
                cancel: cancel.clone(),
            };
            tasks.spawn(unit.run());
            slots.push((id, self.stream.clone(), slot));
        }

        let report = supervise(&mut tasks, &cancel, duration, self.ctx.settings.close_grace).await;
        tracing::debug!(aborted = report.aborted, "all connection tasks stopped");

        RunResult::collect(StrategyKind::TaskPerSocket, slots)
    }
}

/// The execution unit owned by one task.
struct SocketTask {
    lifecycle: Lifecycle,
    ctx: Arc<StrategyContext>,
    stream: String,
    slot: SinkSlot,
    cancel: CancellationToken,
}

impl SocketTask {
    async fn run(mut self) {
        let settings = &self.ctx.settings;
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.lifecycle.set(ConnectionStatus::Closed);
                return;
            }
            res = transport::connect(&settings.ws_url, settings.connect_timeout) => res,
        };
        let mut ws = match connected {
            Ok(ws) => ws,
            Err(e) => {
                self.lifecycle.fail(e);
                return;
            }
        };

        if let Err(e) = SubscriptionController::new(&mut ws)
            .subscribe(&self.stream, SUBSCRIBE_REQUEST_ID)
            .await
        {
            self.lifecycle.fail(e);
            return;
        }
        self.lifecycle.set(ConnectionStatus::Streaming);
        tracing::debug!(connection = %self.lifecycle.id(), stream = %self.stream, "streaming");

        let (sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let received_at = self.ctx.clock.now_millis();
                        if let Err(e) = ingest(&text, received_at, &self.slot) {
                            self.lifecycle.fail(e);
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(connection = %self.lifecycle.id(), frame = ?frame, "feed closed the connection");
                        self.lifecycle.set(ConnectionStatus::Closed);
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        self.lifecycle.fail(FeedError::Connection(format!("read failed: {e}")));
                        return;
                    }
                    None => {
                        self.lifecycle.fail(FeedError::Connection("stream ended".to_string()));
                        return;
                    }
                },
            }
        }

        self.lifecycle.set(ConnectionStatus::Draining);
        let slot = &self.slot;
        close_and_drain(sink, stream, self.ctx.clock.as_ref(), |text, received_at| {
            ingest(text, received_at, slot).map(|_| ())
        })
        .await;
        self.lifecycle.set(ConnectionStatus::Closed);
    }
}

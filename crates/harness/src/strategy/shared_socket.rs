//! One socket carrying every subscription, read by a single receive loop.
//!
//! The loop first turns on combined mode so frames arrive wrapped in a
//! `{stream, data}` envelope, reads the property back, then sends one
//! `SUBSCRIBE` per logical connection (request id = index + 1) and collects
//! every acknowledgement. A rejected subscription keeps an empty sink; the
//! others share the socket. Data frames that overtake the acknowledgements
//! are buffered with their receive time and routed once the router exists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use wslat_core::error::{DecodeFailure, FeedError};
use wslat_core::types::{Connection, ConnectionId, ConnectionStatus, StrategyKind};
use wslat_feed::{codec, control, transport, FeedSocket, SubscriptionController};

use super::router::{Router, RoutingKey, Subscription};
use super::{block_on_current_thread, close_and_drain, Lifecycle, StrategyContext};
use crate::harness::supervise;
use crate::result::RunResult;
use crate::sink::SinkSlot;

pub struct SharedSocket {
    ctx: Arc<StrategyContext>,
    streams: Vec<String>,
}

impl SharedSocket {
    /// One logical connection per entry of `streams`. Entries may repeat.
    pub fn new(ctx: Arc<StrategyContext>, streams: Vec<String>) -> Self {
        Self { ctx, streams }
    }

    pub fn connections(&self) -> usize {
        self.streams.len()
    }

    /// Run on a fresh current-thread runtime owned by the calling thread.
    pub fn run(&self, duration: Duration) -> Result<RunResult, FeedError> {
        block_on_current_thread(self.run_async(duration))?
    }

    /// Run inside an existing runtime.
    pub async fn run_async(&self, duration: Duration) -> Result<RunResult, FeedError> {
        let started_at = self.ctx.clock.now_millis();
        let deadline = started_at + duration.as_millis() as i64;
        let cancel = CancellationToken::new();

        tracing::info!(
            strategy = %StrategyKind::SharedSocket,
            connections = self.streams.len(),
            duration_ms = duration.as_millis() as u64,
            "starting run"
        );

        let mut lifecycles = Vec::with_capacity(self.streams.len());
        let mut slots = Vec::with_capacity(self.streams.len());
        for (i, stream) in self.streams.iter().enumerate() {
            let id = ConnectionId(i);
            let conn = Connection::new(id, StrategyKind::SharedSocket, stream, started_at, deadline);
            lifecycles.push(Lifecycle::new(conn, self.ctx.observer.clone()));
            slots.push((id, stream.clone(), SinkSlot::new()));
        }

        let receiver = ReceiveLoop {
            ctx: self.ctx.clone(),
            streams: self.streams.clone(),
            slots: slots.iter().map(|(_, _, slot)| slot.clone()).collect(),
            lifecycles,
            cancel: cancel.clone(),
        };
        let mut tasks = JoinSet::new();
        tasks.spawn(receiver.run());

        let report = supervise(&mut tasks, &cancel, duration, self.ctx.settings.close_grace).await;
        tracing::debug!(aborted = report.aborted, "receive loop stopped");

        RunResult::collect(StrategyKind::SharedSocket, slots)
    }
}

/// Outcome of the control-plane exchange on the shared socket.
struct Handshake {
    router: Router,
    /// Data frames read while acknowledgements were pending.
    early: Vec<(String, i64)>,
}

/// The single execution unit of the shared-socket strategy.
struct ReceiveLoop {
    ctx: Arc<StrategyContext>,
    streams: Vec<String>,
    slots: Vec<SinkSlot>,
    lifecycles: Vec<Lifecycle>,
    cancel: CancellationToken,
}

impl ReceiveLoop {
    async fn run(mut self) {
        let settings = &self.ctx.settings;
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.close_all();
                return;
            }
            res = transport::connect(&settings.ws_url, settings.connect_timeout) => res,
        };
        let mut ws = match connected {
            Ok(ws) => ws,
            Err(e) => {
                self.fail_all(&e);
                return;
            }
        };

        let handshake = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.close_all();
                return;
            }
            res = Self::handshake(&self.ctx, &self.streams, &self.slots, &mut self.lifecycles, &mut ws) => res,
        };
        let Handshake { mut router, early } = match handshake {
            Ok(h) => h,
            Err(e) => {
                self.fail_all(&e);
                return;
            }
        };

        for (text, received_at) in &early {
            if let Err(e) = router.route(text, *received_at) {
                self.fail_all(&e);
                return;
            }
        }
        for lifecycle in &mut self.lifecycles {
            lifecycle.set(ConnectionStatus::Streaming);
        }
        tracing::debug!(routing = ?router.key(), buffered = early.len(), "shared socket streaming");

        let (sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let received_at = self.ctx.clock.now_millis();
                        if let Err(e) = router.route(&text, received_at) {
                            self.fail_all(&e);
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(frame = ?frame, "feed closed the shared connection");
                        self.close_all();
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        self.fail_all(&FeedError::Connection(format!("read failed: {e}")));
                        return;
                    }
                    None => {
                        self.fail_all(&FeedError::Connection("stream ended".to_string()));
                        return;
                    }
                },
            }
        }

        for lifecycle in &mut self.lifecycles {
            lifecycle.set(ConnectionStatus::Draining);
        }
        close_and_drain(sink, stream, self.ctx.clock.as_ref(), |text, received_at| {
            router.route(text, received_at).map(|_| ())
        })
        .await;
        self.close_all();

        let stats = router.stats();
        tracing::info!(
            frames = stats.frames,
            acks = stats.acks,
            decode_failures = stats.decode_failures,
            unroutable = stats.unroutable,
            routed = stats.routed_total(),
            "shared socket closed"
        );
    }

    /// Enable combined mode, subscribe every stream and collect the
    /// acknowledgements.
    ///
    /// A failed property exchange is fatal to every subscription; a
    /// rejected `SUBSCRIBE`, or one still unacknowledged after the connect
    /// timeout, only closes its own connection.
    async fn handshake(
        ctx: &StrategyContext,
        streams: &[String],
        slots: &[SinkSlot],
        lifecycles: &mut [Lifecycle],
        ws: &mut FeedSocket,
    ) -> Result<Handshake, FeedError> {
        let n = streams.len() as u64;
        let (set_id, get_id) = (n + 1, n + 2);
        let mut ctl = SubscriptionController::new(ws);

        ctl.set_combined_mode(true, set_id).await?;
        let combined = ctl.get_combined_mode(get_id).await?;
        let key = if combined {
            RoutingKey::Stream
        } else {
            tracing::warn!("feed did not confirm combined mode, routing by request id");
            RoutingKey::RequestId
        };

        for (i, stream) in streams.iter().enumerate() {
            ctl.subscribe(stream, i as u64 + 1).await?;
        }

        let mut awaiting: HashMap<u64, usize> = (0..streams.len()).map(|i| (i as u64 + 1, i)).collect();
        let mut accepted = Vec::with_capacity(streams.len());
        let mut early = Vec::new();
        let ack_deadline = tokio::time::Instant::now() + ctx.settings.connect_timeout;
        while !awaiting.is_empty() {
            let Ok(text) = tokio::time::timeout_at(ack_deadline, ctl.recv_text()).await else {
                for (id, index) in awaiting.drain() {
                    tracing::warn!(stream = %streams[index], id, "subscription never acknowledged");
                    lifecycles[index].fail(FeedError::Protocol(format!(
                        "no acknowledgement for SUBSCRIBE {id} within {:?}",
                        ctx.settings.connect_timeout
                    )));
                }
                break;
            };
            let text = text?;
            let received_at = ctx.clock.now_millis();
            match codec::decode(&text) {
                Err(DecodeFailure::ControlAck { id }) => match awaiting.remove(&id) {
                    Some(index) => match control::parse_reply(&text, id) {
                        Ok(_) => accepted.push(index),
                        Err(e) => {
                            tracing::warn!(stream = %streams[index], error = %e, "subscription rejected");
                            lifecycles[index].fail(e);
                        }
                    },
                    None => tracing::debug!(id, "ignoring unexpected acknowledgement"),
                },
                _ => early.push((text, received_at)),
            }
        }

        accepted.sort_unstable();
        let subscriptions = accepted
            .into_iter()
            .map(|index| Subscription {
                index,
                stream: streams[index].clone(),
                request_id: index as u64 + 1,
                slot: slots[index].clone(),
            })
            .collect();

        Ok(Handshake {
            router: Router::new(key, streams.len(), subscriptions),
            early,
        })
    }

    fn fail_all(&mut self, err: &FeedError) {
        for lifecycle in &mut self.lifecycles {
            lifecycle.fail_with(err);
        }
    }

    fn close_all(&mut self) {
        for lifecycle in &mut self.lifecycles {
            lifecycle.set(ConnectionStatus::Closed);
        }
    }
}

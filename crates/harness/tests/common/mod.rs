//! In-process fake market-data feed for integration tests.
//!
//! Speaks the subset of the Binance WebSocket API the harness uses:
//! `SUBSCRIBE`, `SET_PROPERTY combined` and `GET_PROPERTY combined`. After a
//! connection's first subscription it emits one `bookTicker` frame per
//! subscribed stream every `interval`, with a per-connection `u` sequence
//! starting at 1 and `E` set to the send time. In combined mode frames are
//! wrapped in `{"stream": .., "data": ..}`.
//!
//! The server runs on its own thread and runtime so tests can drive the
//! harness synchronously. Dropping the [`FakeFeed`] shuts it down.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use wslat_core::types::{Clock, ConnectionStatus, SystemClock};
use wslat_harness::{
    ConnectionSeries, Observer, RecordingObserver, RunResult, StrategyContext, StrategySettings,
};

/// Behaviour of the fake feed.
#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// Emission interval; `None` keeps the feed silent after subscribing.
    pub interval: Option<Duration>,
    /// Streams whose `SUBSCRIBE` is answered with an error.
    pub rejected_streams: Vec<String>,
    /// Streams whose `SUBSCRIBE` is never answered nor served.
    pub unacked_streams: Vec<String>,
    /// Whether `SET_PROPERTY combined` is accepted.
    pub combined_supported: bool,
    /// Never complete the close handshake once the client sends a close.
    pub hang_on_close: bool,
    /// `(n, k)`: the `n`-th accepted connection (from 0) drops its TCP
    /// stream without a close frame right after its `k`-th data frame.
    pub drop_after: Option<(usize, u64)>,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            interval: Some(Duration::from_millis(100)),
            rejected_streams: Vec::new(),
            unacked_streams: Vec::new(),
            combined_supported: true,
            hang_on_close: false,
            drop_after: None,
        }
    }
}

impl FeedOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            ..Self::default()
        }
    }

    pub fn silent() -> Self {
        Self {
            interval: None,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct FeedCounters {
    pub connections: AtomicUsize,
    pub subscribes: AtomicUsize,
    pub frames_sent: AtomicUsize,
}

pub struct FakeFeed {
    url: String,
    counters: Arc<FeedCounters>,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl FakeFeed {
    pub fn start(opts: FeedOptions) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind fake feed");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let url = format!("ws://{}/ws", listener.local_addr().expect("local addr"));

        let counters = Arc::new(FeedCounters::default());
        let shutdown = CancellationToken::new();
        let thread = {
            let counters = counters.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("fake-feed".to_string())
                .spawn(move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("fake feed runtime");
                    runtime.block_on(accept_loop(listener, opts, counters, shutdown));
                })
                .expect("spawn fake feed")
        };

        Self {
            url,
            counters,
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.counters.subscribes.load(Ordering::SeqCst)
    }

    pub fn frames_sent(&self) -> usize {
        self.counters.frames_sent.load(Ordering::SeqCst)
    }

    /// Strategy settings pointing at this feed, with short teardown bounds.
    pub fn settings(&self) -> StrategySettings {
        StrategySettings {
            ws_url: self.url.clone(),
            connect_timeout: Duration::from_secs(2),
            stop_poll_interval: Duration::from_millis(20),
            close_grace: Duration::from_millis(300),
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// Context wired to `feed` with the system clock.
pub fn context(feed: &FakeFeed, observer: Arc<dyn Observer>) -> Arc<StrategyContext> {
    Arc::new(StrategyContext::new(feed.settings(), observer, Arc::new(SystemClock)))
}

/// Receive times never go backwards and the feed's sequence only grows.
pub fn assert_ordered(series: &ConnectionSeries) {
    let ts = series.client_timestamps();
    assert!(
        ts.windows(2).all(|w| w[0] <= w[1]),
        "{}: timestamps out of order: {ts:?}",
        series.connection
    );
    let ids = series.update_ids();
    assert!(
        ids.windows(2).all(|w| w[0] < w[1]),
        "{}: update ids not increasing: {ids:?}",
        series.connection
    );
}

/// Exactly one series was cut off by a dropped connection after `k` frames;
/// every other series kept recording without an error.
pub fn assert_one_dropped(result: &RunResult, observer: &RecordingObserver, k: usize) {
    let (dropped, healthy): (Vec<_>, Vec<_>) = result
        .iter()
        .partition(|s| !observer.errors(s.connection).is_empty());
    assert_eq!(dropped.len(), 1, "expected one failed connection");

    let series = dropped[0];
    assert_eq!(series.samples.len(), k, "{}: partial series", series.connection);
    assert_ordered(series);
    let errors = observer.errors(series.connection);
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].starts_with("connection error: read failed"), "{errors:?}");
    assert_eq!(
        observer.statuses(series.connection),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Streaming, ConnectionStatus::Closed]
    );

    for series in healthy {
        assert!(
            series.samples.len() > k * 2,
            "{}: sibling stopped growing at {} samples",
            series.connection,
            series.samples.len()
        );
        assert_ordered(series);
    }
}

impl Drop for FakeFeed {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn accept_loop(
    listener: std::net::TcpListener,
    opts: FeedOptions,
    counters: Arc<FeedCounters>,
    shutdown: CancellationToken,
) {
    let listener = TcpListener::from_std(listener).expect("tokio listener");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((tcp, _)) = accepted else { continue };
                let opts = opts.clone();
                let counters = counters.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                        let index = counters.connections.fetch_add(1, Ordering::SeqCst);
                        let drop_after = opts
                            .drop_after
                            .and_then(|(n, k)| (n == index).then_some(k));
                        serve(ws, opts, drop_after, counters, shutdown).await;
                    }
                });
            }
        }
    }
}

/// Per-connection control-plane state.
struct Session {
    combined: bool,
    streams: Vec<String>,
    next_u: u64,
}

async fn serve(
    mut ws: WebSocketStream<TcpStream>,
    opts: FeedOptions,
    drop_after: Option<u64>,
    counters: Arc<FeedCounters>,
    shutdown: CancellationToken,
) {
    let mut session = Session {
        combined: false,
        streams: Vec::new(),
        next_u: 1,
    };
    let mut next_emit: Option<Instant> = None;
    let mut sent = 0u64;

    loop {
        let emit_at = next_emit.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(emit_at), if next_emit.is_some() => {
                for frame in session.frames() {
                    if ws.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                    counters.frames_sent.fetch_add(1, Ordering::SeqCst);
                    sent += 1;
                    if drop_after == Some(sent) {
                        // Dropping the stream closes the TCP connection with no close frame.
                        return;
                    }
                }
                next_emit = opts.interval.map(|i| emit_at + i);
            }
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(request) = serde_json::from_str::<Value>(&text) else { continue };
                    let Some(reply) = session.handle(&request, &opts, &counters) else { continue };
                    if ws.send(Message::Text(reply.to_string())).await.is_err() {
                        return;
                    }
                    if next_emit.is_none() && !session.streams.is_empty() {
                        next_emit = opts.interval.map(|i| Instant::now() + i);
                    }
                }
                Some(Ok(Message::Close(_))) if opts.hang_on_close => {
                    shutdown.cancelled().await;
                    return;
                }
                // The close reply is flushed by the next read, which then ends the stream.
                Some(Ok(Message::Close(_))) => next_emit = None,
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break,
            },
        }
    }
}

impl Session {
    fn handle(&mut self, request: &Value, opts: &FeedOptions, counters: &FeedCounters) -> Option<Value> {
        let id = request["id"].clone();
        let params = request["params"].as_array().cloned().unwrap_or_default();
        match request["method"].as_str() {
            Some("SUBSCRIBE") => {
                counters.subscribes.fetch_add(1, Ordering::SeqCst);
                let streams: Vec<String> = params
                    .iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect();
                if streams.iter().any(|s| opts.unacked_streams.contains(s)) {
                    return None;
                }
                if streams.iter().any(|s| opts.rejected_streams.contains(s)) {
                    return Some(json!({"error": {"code": 2, "msg": "Invalid request"}, "id": id}));
                }
                for stream in streams {
                    if !self.streams.contains(&stream) {
                        self.streams.push(stream);
                    }
                }
                Some(json!({"result": null, "id": id}))
            }
            Some("SET_PROPERTY") if opts.combined_supported => {
                self.combined = params.get(1).and_then(Value::as_bool).unwrap_or(false);
                Some(json!({"result": null, "id": id}))
            }
            Some("GET_PROPERTY") => Some(json!({"result": self.combined, "id": id})),
            _ => Some(json!({"error": {"code": 2, "msg": "Invalid request"}, "id": id})),
        }
    }

    fn frames(&mut self) -> Vec<String> {
        let now = SystemClock.now_millis();
        let mut frames = Vec::with_capacity(self.streams.len());
        for stream in &self.streams {
            let symbol = stream.split('@').next().unwrap_or_default().to_uppercase();
            let data = json!({
                "e": "bookTicker",
                "u": self.next_u,
                "E": now,
                "T": now,
                "s": symbol,
                "b": "25.35190000",
                "B": "31.21000000",
                "a": "25.36520000",
                "A": "40.66000000"
            });
            self.next_u += 1;
            let frame = if self.combined {
                json!({"stream": stream, "data": data})
            } else {
                data
            };
            frames.push(frame.to_string());
        }
        frames
    }
}

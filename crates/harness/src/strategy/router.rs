//! Demultiplexing for the shared-socket strategy.
//!
//! A [`Router`] maps each frame arriving on the shared socket to the sink of
//! the subscription that produced it. It owns no I/O, so the routing rules
//! can be exercised with hand-written frames and a fixed receive time.

use std::collections::HashMap;

use wslat_core::error::{DecodeFailure, FeedError};
use wslat_core::types::Sample;
use wslat_feed::codec;

use super::sample_of;
use crate::sink::SinkSlot;

/// Which frame attribute identifies the originating subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingKey {
    /// Combined mode is on: frames are `{stream, data}` envelopes.
    Stream,
    /// Combined mode is off: frames may carry the request id of their
    /// `SUBSCRIBE`. Untagged frames fall back to the single stream owner.
    RequestId,
}

/// One accepted subscription on the shared socket.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Index of the logical connection, and of its sink.
    pub index: usize,
    pub stream: String,
    pub request_id: u64,
    pub slot: SinkSlot,
}

/// Frame counters. Every frame lands in exactly one bucket, so
/// `frames == acks + decode_failures + unroutable + routed.sum()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub frames: u64,
    pub acks: u64,
    pub decode_failures: u64,
    pub unroutable: u64,
    /// Samples routed per subscription index.
    pub routed: Vec<u64>,
}

impl RouterStats {
    pub fn routed_total(&self) -> u64 {
        self.routed.iter().sum()
    }
}

/// Where one frame went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sample appended to the sink of this subscription index.
    Routed(usize),
    Ack,
    Skipped(DecodeFailure),
    /// Decoded, but no subscription claims it.
    Unroutable,
}

pub struct Router {
    key: RoutingKey,
    slots: HashMap<usize, SinkSlot>,
    by_stream: HashMap<String, usize>,
    by_request: HashMap<u64, usize>,
    /// Owner of untagged frames when every subscription shares one stream.
    fallback: Option<usize>,
    stats: RouterStats,
}

impl Router {
    /// Build a router over the accepted subscriptions. `connections` is the
    /// total number of logical connections, accepted or not.
    ///
    /// When several subscriptions share a stream name the first one (lowest
    /// index) receives that stream's frames; the feed delivers a single
    /// copy per stream on one socket.
    pub fn new(key: RoutingKey, connections: usize, subscriptions: Vec<Subscription>) -> Self {
        let mut by_stream = HashMap::new();
        let mut by_request = HashMap::new();
        let mut slots = HashMap::new();
        for sub in subscriptions {
            by_stream.entry(sub.stream.clone()).or_insert(sub.index);
            by_request.insert(sub.request_id, sub.index);
            slots.insert(sub.index, sub.slot);
        }
        let fallback = match by_stream.len() {
            1 => by_stream.values().next().copied(),
            _ => None,
        };
        Self {
            key,
            slots,
            by_stream,
            by_request,
            fallback,
            stats: RouterStats {
                routed: vec![0; connections],
                ..RouterStats::default()
            },
        }
    }

    pub fn key(&self) -> RoutingKey {
        self.key
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Route one text frame received at `received_at`.
    ///
    /// Only a failed append is an error; undecodable and unroutable frames
    /// are counted and skipped.
    pub fn route(&mut self, text: &str, received_at: i64) -> Result<RouteOutcome, FeedError> {
        self.stats.frames += 1;

        let decoded = match self.key {
            RoutingKey::Stream => codec::decode_combined(text)
                .map(|c| (self.by_stream.get(&c.stream).copied(), c.event)),
            RoutingKey::RequestId => codec::decode_tagged(text).map(|t| {
                let owner = match t.request_id {
                    Some(id) => self.by_request.get(&id).copied(),
                    None => self.fallback,
                };
                (owner, t.event)
            }),
        };

        let decoded = decoded.and_then(|(owner, event)| sample_of(&event, received_at).map(|sample| (owner, sample)));
        let (owner, sample) = match decoded {
            Ok(pair) => pair,
            Err(DecodeFailure::ControlAck { .. }) => {
                self.stats.acks += 1;
                return Ok(RouteOutcome::Ack);
            }
            Err(failure) => {
                tracing::trace!(error = %failure, "skipping undecodable frame");
                self.stats.decode_failures += 1;
                return Ok(RouteOutcome::Skipped(failure));
            }
        };

        match owner {
            Some(index) => {
                self.append(index, sample)?;
                Ok(RouteOutcome::Routed(index))
            }
            None => {
                tracing::trace!(update_id = sample.update_id, "frame matches no subscription");
                self.stats.unroutable += 1;
                Ok(RouteOutcome::Unroutable)
            }
        }
    }

    fn append(&mut self, index: usize, sample: Sample) -> Result<(), FeedError> {
        let slot = self.slots.get(&index).ok_or_else(|| {
            FeedError::InvalidState(format!("no sink for subscription {index}"))
        })?;
        slot.append(sample)?;
        if let Some(count) = self.stats.routed.get_mut(index) {
            *count += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BTC: &str = "btcusdt@bookTicker";
    const ETH: &str = "ethusdt@bookTicker";

    fn subscriptions(streams: &[&str]) -> (Vec<Subscription>, Vec<SinkSlot>) {
        let slots: Vec<SinkSlot> = streams.iter().map(|_| SinkSlot::new()).collect();
        let subs = streams
            .iter()
            .enumerate()
            .map(|(i, s)| Subscription {
                index: i,
                stream: s.to_string(),
                request_id: i as u64 + 1,
                slot: slots[i].clone(),
            })
            .collect();
        (subs, slots)
    }

    fn drain(router: Router, slots: Vec<SinkSlot>) -> Vec<Vec<Sample>> {
        drop(router);
        slots
            .into_iter()
            .map(|s| s.reclaim().unwrap().drain().unwrap())
            .collect()
    }

    #[test]
    fn test_combined_frame_routes_by_stream() {
        let (subs, slots) = subscriptions(&[BTC, ETH]);
        let mut router = Router::new(RoutingKey::Stream, 2, subs);

        let outcome = router
            .route(r#"{"stream":"btcusdt@bookTicker","data":{"u":42,"E":1000}}"#, 1010)
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Routed(0));

        let sinks = drain(router, slots);
        assert_eq!(sinks[0], vec![Sample::observe(42, 1010, 1000)]);
        assert_eq!(sinks[0][0].delay, 10);
        assert!(sinks[1].is_empty());
    }

    #[test]
    fn test_overflowing_event_time_is_skipped() {
        let (subs, slots) = subscriptions(&[BTC, ETH]);
        let mut router = Router::new(RoutingKey::Stream, 2, subs);

        let outcome = router
            .route(
                r#"{"stream":"btcusdt@bookTicker","data":{"u":1,"E":-9223372036854775808}}"#,
                1010,
            )
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Skipped(DecodeFailure::Malformed(_))));

        let outcome = router
            .route(r#"{"stream":"btcusdt@bookTicker","data":{"u":2,"E":1000}}"#, 1010)
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Routed(0));
        assert_eq!(router.stats().decode_failures, 1);

        let sinks = drain(router, slots);
        assert_eq!(sinks[0], vec![Sample::observe(2, 1010, 1000)]);
    }

    #[test]
    fn test_each_frame_lands_in_one_bucket() {
        let (subs, slots) = subscriptions(&[BTC, ETH]);
        let mut router = Router::new(RoutingKey::Stream, 2, subs);

        let frames = [
            r#"{"result":null,"id":1}"#,
            r#"{"stream":"btcusdt@bookTicker","data":{"u":1,"E":100}}"#,
            r#"{"stream":"ethusdt@bookTicker","data":{"u":2,"E":100}}"#,
            r#"{"stream":"solusdt@bookTicker","data":{"u":3,"E":100}}"#,
            r#"{"u":4,"E":100}"#,
            "not json",
            r#"{"stream":"ethusdt@bookTicker","data":{"u":5,"E":101}}"#,
            r#"{"result":null,"id":2}"#,
        ];
        for (i, f) in frames.iter().enumerate() {
            router.route(f, 200 + i as i64).unwrap();
        }

        let stats = router.stats().clone();
        assert_eq!(stats.frames, 8);
        assert_eq!(stats.acks, 2);
        assert_eq!(stats.decode_failures, 2);
        assert_eq!(stats.unroutable, 1);
        assert_eq!(stats.routed, vec![1, 2]);
        assert_eq!(
            stats.frames,
            stats.acks + stats.decode_failures + stats.unroutable + stats.routed_total()
        );

        let sinks = drain(router, slots);
        let total: usize = sinks.iter().map(Vec::len).sum();
        assert_eq!(total as u64, stats.routed_total());
        assert_eq!(sinks[1].iter().map(|s| s.update_id).collect::<Vec<_>>(), vec![2, 5]);
    }

    #[test]
    fn test_duplicate_stream_goes_to_first_subscription() {
        let (subs, slots) = subscriptions(&[BTC, BTC, BTC]);
        let mut router = Router::new(RoutingKey::Stream, 3, subs);
        for u in 0..4 {
            let frame = format!(r#"{{"stream":"{BTC}","data":{{"u":{u},"E":1}}}}"#);
            assert_eq!(router.route(&frame, 2).unwrap(), RouteOutcome::Routed(0));
        }
        let sinks = drain(router, slots);
        assert_eq!(sinks[0].len(), 4);
        assert!(sinks[1].is_empty() && sinks[2].is_empty());
    }

    #[test]
    fn test_request_id_routing() {
        let (subs, slots) = subscriptions(&[BTC, ETH]);
        let mut router = Router::new(RoutingKey::RequestId, 2, subs);

        assert_eq!(
            router.route(r#"{"id":2,"u":9,"E":50}"#, 60).unwrap(),
            RouteOutcome::Routed(1)
        );
        // Untagged frames are ambiguous with two distinct streams.
        assert_eq!(
            router.route(r#"{"u":10,"E":50}"#, 60).unwrap(),
            RouteOutcome::Unroutable
        );
        assert_eq!(
            router.route(r#"{"id":7,"u":11,"E":50}"#, 60).unwrap(),
            RouteOutcome::Unroutable
        );

        let sinks = drain(router, slots);
        assert!(sinks[0].is_empty());
        assert_eq!(sinks[1], vec![Sample::observe(9, 60, 50)]);
    }

    #[test]
    fn test_untagged_frames_fall_back_to_single_stream() {
        let (subs, slots) = subscriptions(&[BTC, BTC]);
        let mut router = Router::new(RoutingKey::RequestId, 2, subs);
        assert_eq!(
            router.route(r#"{"u":1,"E":5}"#, 6).unwrap(),
            RouteOutcome::Routed(0)
        );
        let sinks = drain(router, slots);
        assert_eq!(sinks[0].len(), 1);
    }

    #[test]
    fn test_plain_frame_in_combined_mode_is_skipped() {
        let (subs, slots) = subscriptions(&[BTC]);
        let mut router = Router::new(RoutingKey::Stream, 1, subs);
        assert_eq!(
            router.route(r#"{"u":1,"E":5}"#, 6).unwrap(),
            RouteOutcome::Skipped(DecodeFailure::NotCombined)
        );
        assert!(drain(router, slots)[0].is_empty());
    }

    #[test]
    fn test_rejected_subscription_keeps_empty_sink() {
        let (mut subs, slots) = subscriptions(&[BTC, ETH]);
        // Subscription 1 was rejected by the feed and never reaches the router.
        subs.truncate(1);
        let mut router = Router::new(RoutingKey::Stream, 2, subs);
        assert_eq!(
            router
                .route(r#"{"stream":"ethusdt@bookTicker","data":{"u":1,"E":5}}"#, 6)
                .unwrap(),
            RouteOutcome::Unroutable
        );
        assert_eq!(router.stats().routed, vec![0, 0]);
        let sinks = drain(router, slots);
        assert!(sinks.iter().all(Vec::is_empty));
    }
}

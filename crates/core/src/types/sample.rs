//! One latency observation.

use serde::{Deserialize, Serialize};

/// Immutable `(update_id, client_timestamp, delay)` triple.
///
/// `delay` is `client_timestamp - server_event_time` in milliseconds. It is
/// signed and never clamped: a negative value means the local clock is
/// behind the feed's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample {
    /// Feed sequence / update id (`u`).
    pub update_id: u64,
    /// Local receive time, epoch milliseconds.
    pub client_timestamp: i64,
    /// Receive time minus the feed's event time (`E`), milliseconds.
    pub delay: i64,
}

impl Sample {
    /// Build a sample from a receive time and the frame's event time.
    ///
    /// Overflows on extreme event times; use [`Sample::checked_observe`]
    /// for values taken off the wire.
    #[inline]
    pub const fn observe(update_id: u64, client_timestamp: i64, server_event_time: i64) -> Self {
        Self {
            update_id,
            client_timestamp,
            delay: client_timestamp - server_event_time,
        }
    }

    /// Like [`Sample::observe`], or `None` when the delay does not fit in
    /// an `i64`.
    #[inline]
    pub const fn checked_observe(update_id: u64, client_timestamp: i64, server_event_time: i64) -> Option<Self> {
        match client_timestamp.checked_sub(server_event_time) {
            Some(delay) => Some(Self {
                update_id,
                client_timestamp,
                delay,
            }),
            None => None,
        }
    }

    /// The server event time this sample was derived from.
    #[inline]
    pub const fn server_event_time(&self) -> i64 {
        self.client_timestamp - self.delay
    }
}

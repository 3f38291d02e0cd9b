//! # wslat-feed
//!
//! Everything the harness needs to talk to a Binance-style market-data
//! WebSocket: the frame codec that extracts `u` / `E` from data frames, the
//! control-plane requests (`SUBSCRIBE`, `SET_PROPERTY`, `GET_PROPERTY`) with
//! their acknowledgement checks, and the async / blocking connect helpers.

pub mod codec;
pub mod control;
pub mod transport;

pub use codec::{
    decode, decode_combined, decode_tagged, is_control_ack, CombinedEvent, FeedEvent, TaggedEvent,
};
pub use control::SubscriptionController;
pub use transport::{BlockingSocket, FeedSocket, WsSink, WsStream};

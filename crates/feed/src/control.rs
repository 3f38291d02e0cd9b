//! Control-plane requests and acknowledgement checks.
//!
//! Requests follow the Binance WebSocket API shape:
//! ```json
//! {"method": "SUBSCRIBE", "params": ["btcusdt@bookTicker"], "id": 1}
//! {"method": "SET_PROPERTY", "params": ["combined", true], "id": 2}
//! {"method": "GET_PROPERTY", "params": ["combined"], "id": 3}
//! ```
//! Replies carry the request `id` and either a `result` (possibly `null`)
//! or an `error` object.
//!
//! The request builders and [`parse_reply`] are transport-agnostic so the
//! blocking thread-per-socket path and the async paths share one wire format.

use std::io::{Read, Write};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use wslat_core::error::FeedError;

/// Server property that toggles `{stream, data}` envelopes.
pub const COMBINED_PROPERTY: &str = "combined";

#[derive(Debug, Serialize)]
struct ControlRequest<'a> {
    method: &'a str,
    params: Vec<Value>,
    id: u64,
}

impl ControlRequest<'_> {
    fn to_text(&self) -> String {
        // Serializing strings, bools and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// `SUBSCRIBE` request for one stream.
pub fn subscribe_request(stream: &str, request_id: u64) -> String {
    ControlRequest {
        method: "SUBSCRIBE",
        params: vec![Value::from(stream)],
        id: request_id,
    }
    .to_text()
}

/// `SET_PROPERTY` request for a boolean property.
pub fn set_property_request(property: &str, value: bool, request_id: u64) -> String {
    ControlRequest {
        method: "SET_PROPERTY",
        params: vec![Value::from(property), Value::from(value)],
        id: request_id,
    }
    .to_text()
}

/// `GET_PROPERTY` request.
pub fn get_property_request(property: &str, request_id: u64) -> String {
    ControlRequest {
        method: "GET_PROPERTY",
        params: vec![Value::from(property)],
        id: request_id,
    }
    .to_text()
}

/// Validate a reply to request `expected_id` and return its `result`.
///
/// `result: null` is a successful acknowledgement and comes back as
/// [`Value::Null`]. A reply for another id, an `error` object, or a reply
/// without `result` is a [`FeedError::Protocol`].
pub fn parse_reply(text: &str, expected_id: u64) -> Result<Value, FeedError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| FeedError::Protocol(format!("reply is not JSON: {e}")))?;
    let mut obj = match value {
        Value::Object(obj) => obj,
        other => {
            return Err(FeedError::Protocol(format!("reply is not an object: {other}")));
        }
    };

    match obj.get("id").and_then(Value::as_u64) {
        Some(id) if id == expected_id => {}
        Some(id) => {
            return Err(FeedError::Protocol(format!(
                "reply out of order: expected id {expected_id}, got {id}"
            )));
        }
        None => {
            return Err(FeedError::Protocol(format!(
                "expected reply to request {expected_id}, got frame without id: {text}"
            )));
        }
    }

    if let Some(error) = obj.get("error") {
        return Err(FeedError::Protocol(format!(
            "request {expected_id} rejected: {error}"
        )));
    }

    obj.remove("result").ok_or_else(|| {
        FeedError::Protocol(format!("reply to request {expected_id} has no `result` field"))
    })
}

/// Issues control-plane requests over one open async connection.
///
/// The controller borrows the socket exclusively, so requests and their
/// replies can never interleave with another reader.
pub struct SubscriptionController<'a, S> {
    ws: &'a mut WebSocketStream<S>,
}

impl<'a, S> SubscriptionController<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an open connection.
    pub fn new(ws: &'a mut WebSocketStream<S>) -> Self {
        Self { ws }
    }

    /// Send `SUBSCRIBE` for `stream`. Does not wait for the acknowledgement.
    pub async fn subscribe(&mut self, stream: &str, request_id: u64) -> Result<(), FeedError> {
        tracing::debug!(stream = %stream, request_id, "sending SUBSCRIBE");
        self.send(subscribe_request(stream, request_id)).await
    }

    /// Toggle combined mode and wait for its acknowledgement.
    pub async fn set_combined_mode(&mut self, enabled: bool, request_id: u64) -> Result<(), FeedError> {
        tracing::debug!(enabled, request_id, "sending SET_PROPERTY combined");
        self.send(set_property_request(COMBINED_PROPERTY, enabled, request_id))
            .await?;
        let reply = self.recv_text().await?;
        parse_reply(&reply, request_id).map(|_| ())
    }

    /// Read the combined-mode property.
    ///
    /// Waits for exactly one reply frame, which must answer `request_id`
    /// with a boolean `result`.
    pub async fn get_combined_mode(&mut self, request_id: u64) -> Result<bool, FeedError> {
        self.send(get_property_request(COMBINED_PROPERTY, request_id))
            .await?;
        let reply = self.recv_text().await?;
        let result = parse_reply(&reply, request_id)?;
        result.as_bool().ok_or_else(|| {
            FeedError::Protocol(format!("combined property is not a boolean: {result}"))
        })
    }

    async fn send(&mut self, text: String) -> Result<(), FeedError> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::Connection(format!("failed to send control request: {e}")))
    }

    /// Next text frame. Ping / pong frames are not replies and are skipped.
    ///
    /// Used to collect `SUBSCRIBE` acknowledgements, which may be
    /// interleaved with data frames.
    pub async fn recv_text(&mut self) -> Result<String, FeedError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    return Err(FeedError::Connection(format!(
                        "connection closed while awaiting reply: {frame:?}"
                    )));
                }
                Some(Ok(other)) => {
                    return Err(FeedError::Protocol(format!(
                        "unexpected non-text reply frame: {other:?}"
                    )));
                }
                Some(Err(e)) => return Err(FeedError::Connection(format!("read error: {e}"))),
                None => {
                    return Err(FeedError::Connection(
                        "stream ended while awaiting reply".to_string(),
                    ))
                }
            }
        }
    }
}

/// Send `SUBSCRIBE` over a blocking socket. Does not wait for the ack.
pub fn subscribe_blocking<S: Read + Write>(
    ws: &mut tungstenite::WebSocket<S>,
    stream: &str,
    request_id: u64,
) -> Result<(), FeedError> {
    tracing::debug!(stream = %stream, request_id, "sending SUBSCRIBE");
    ws.send(Message::Text(subscribe_request(stream, request_id)))
        .map_err(|e| FeedError::Connection(format!("failed to send SUBSCRIBE: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_request_format() {
        let msg = subscribe_request("btcusdt@bookTicker", 1);
        let parsed: Value = serde_json::from_str(&msg).expect("valid JSON");
        assert_eq!(parsed["method"], "SUBSCRIBE");
        assert_eq!(parsed["params"], serde_json::json!(["btcusdt@bookTicker"]));
        assert_eq!(parsed["id"], 1);
    }

    #[test]
    fn test_property_request_format() {
        let set: Value = serde_json::from_str(&set_property_request("combined", true, 201)).unwrap();
        assert_eq!(set["method"], "SET_PROPERTY");
        assert_eq!(set["params"], serde_json::json!(["combined", true]));
        assert_eq!(set["id"], 201);

        let get: Value = serde_json::from_str(&get_property_request("combined", 202)).unwrap();
        assert_eq!(get["method"], "GET_PROPERTY");
        assert_eq!(get["params"], serde_json::json!(["combined"]));
        assert_eq!(get["id"], 202);
    }

    #[test]
    fn test_parse_reply_null_result_is_ack() {
        let result = parse_reply(r#"{"result": null, "id": 3}"#, 3).unwrap();
        assert!(result.is_null());
    }

    #[test]
    fn test_parse_reply_bool_result() {
        let result = parse_reply(r#"{"result": true, "id": 202}"#, 202).unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn test_parse_reply_out_of_order() {
        let err = parse_reply(r#"{"result": true, "id": 9}"#, 202).unwrap_err();
        assert!(matches!(err, FeedError::Protocol(ref m) if m.contains("out of order")));
    }

    #[test]
    fn test_parse_reply_missing_result() {
        let err = parse_reply(r#"{"id": 5}"#, 5).unwrap_err();
        assert!(matches!(err, FeedError::Protocol(ref m) if m.contains("no `result`")));
    }

    #[test]
    fn test_parse_reply_error_object() {
        let err = parse_reply(r#"{"code": 2, "msg": "Invalid request", "error": {"code": 2}, "id": 4}"#, 4)
            .unwrap_err();
        assert!(matches!(err, FeedError::Protocol(ref m) if m.contains("rejected")));
    }

    #[test]
    fn test_parse_reply_data_frame_is_protocol_error() {
        let err = parse_reply(r#"{"u": 1, "E": 2}"#, 1).unwrap_err();
        assert!(matches!(err, FeedError::Protocol(_)));
    }
}

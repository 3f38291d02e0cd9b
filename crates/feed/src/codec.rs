//! Feed frame codec.
//!
//! Extracts the two fields the harness correlates on from a text frame:
//! `u` (update / sequence id) and `E` (server event time, epoch ms). Every
//! other field of the payload is ignored.
//!
//! Control-plane replies such as `{"result": null, "id": 1}` are recognized
//! by the presence of `id` together with the absence of both data fields and
//! reported as [`DecodeFailure::ControlAck`], so callers can discard them
//! without treating them as noise.
//!
//! All functions are pure; decoding the same frame twice yields the same
//! result.

use serde_json::{Map, Value};
use wslat_core::error::DecodeFailure;

/// The correlation fields of one data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedEvent {
    /// Update / sequence id (`u`).
    pub update_id: u64,
    /// Server event time in epoch milliseconds (`E`).
    pub event_time: i64,
}

/// A data frame that may carry the id of the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    /// Originating request id, when the feed tags data frames with one.
    pub request_id: Option<u64>,
    pub event: FeedEvent,
}

/// A combined-mode frame: `{"stream": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedEvent {
    /// Stream name the frame belongs to, e.g. `btcusdt@bookTicker`.
    pub stream: String,
    pub event: FeedEvent,
}

/// Decode a plain (non-combined) data frame.
pub fn decode(text: &str) -> Result<FeedEvent, DecodeFailure> {
    decode_tagged(text).map(|tagged| tagged.event)
}

/// Decode a plain data frame, keeping a request-id tag if present.
pub fn decode_tagged(text: &str) -> Result<TaggedEvent, DecodeFailure> {
    let value = parse(text)?;
    let obj = as_object(&value)?;
    let event = event_from(obj)?;
    Ok(TaggedEvent {
        request_id: obj.get("id").and_then(Value::as_u64),
        event,
    })
}

/// Decode a combined-mode envelope and its inner data frame.
///
/// Acknowledgements on a combined connection are not wrapped, so they are
/// detected on the outer object first.
pub fn decode_combined(text: &str) -> Result<CombinedEvent, DecodeFailure> {
    let value = parse(text)?;
    let obj = as_object(&value)?;
    if let Some(id) = ack_id(obj) {
        return Err(DecodeFailure::ControlAck { id });
    }

    let stream = obj
        .get("stream")
        .and_then(Value::as_str)
        .ok_or(DecodeFailure::NotCombined)?;
    let data = obj
        .get("data")
        .and_then(Value::as_object)
        .ok_or(DecodeFailure::NotCombined)?;

    Ok(CombinedEvent {
        stream: stream.to_string(),
        event: event_from(data)?,
    })
}

/// Whether `text` is a control-plane reply rather than a data frame.
pub fn is_control_ack(text: &str) -> bool {
    match parse(text) {
        Ok(Value::Object(obj)) => ack_id(&obj).is_some(),
        _ => false,
    }
}

fn parse(text: &str) -> Result<Value, DecodeFailure> {
    serde_json::from_str(text).map_err(|e| DecodeFailure::Malformed(e.to_string()))
}

fn as_object(value: &Value) -> Result<&Map<String, Value>, DecodeFailure> {
    value
        .as_object()
        .ok_or_else(|| DecodeFailure::Malformed("frame is not a JSON object".to_string()))
}

/// Request id of an acknowledgement: `id` present, `u` and `E` absent.
fn ack_id(obj: &Map<String, Value>) -> Option<u64> {
    if obj.contains_key("u") || obj.contains_key("E") {
        return None;
    }
    obj.get("id").and_then(Value::as_u64)
}

fn event_from(obj: &Map<String, Value>) -> Result<FeedEvent, DecodeFailure> {
    if let Some(id) = ack_id(obj) {
        return Err(DecodeFailure::ControlAck { id });
    }
    let update_id = match obj.get("u") {
        None => return Err(DecodeFailure::MissingField("u")),
        Some(v) => v.as_u64().ok_or_else(|| {
            DecodeFailure::Malformed(format!("`u` is not an unsigned integer: {v}"))
        })?,
    };
    let event_time = match obj.get("E") {
        None => return Err(DecodeFailure::MissingField("E")),
        Some(v) => v
            .as_i64()
            .ok_or_else(|| DecodeFailure::Malformed(format!("`E` is not an integer: {v}")))?,
    };
    Ok(FeedEvent {
        update_id,
        event_time,
    })
}

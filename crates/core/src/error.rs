//! Error taxonomy shared by the feed codec, the control plane and the
//! connection strategies.
//!
//! Only [`FeedError::InvalidState`] and [`FeedError::TeardownTimeout`] ever
//! abort a run. Decode, protocol and connection failures are scoped to a
//! single logical connection and surface as a shorter sample series.

use crate::types::ConnectionId;

/// Why a text frame produced no `(update_id, event_time)` pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeFailure {
    /// The frame is not valid JSON or not a JSON object.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The frame is a control-plane reply (`id` present, no data fields).
    #[error("control-plane acknowledgement for request {id}")]
    ControlAck { id: u64 },
    /// A required data field is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// A combined-mode frame without a usable `{stream, data}` envelope.
    #[error("frame is not a combined-stream envelope")]
    NotCombined,
}

/// Errors raised by the harness and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Malformed or irrelevant frame; callers skip it.
    #[error("decode failure: {0}")]
    Decode(#[from] DecodeFailure),
    /// Control-plane handshake failed or returned an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Transport-level failure on a physical connection.
    #[error("connection error: {0}")]
    Connection(String),
    /// A sink was mutated after drain, or the harness was misused.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Execution units did not stop within the bounded teardown wait.
    #[error("teardown timed out waiting for connections {pending:?}")]
    TeardownTimeout { pending: Vec<ConnectionId> },
}

impl FeedError {
    /// Whether this error must abort the whole run rather than one connection.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, Self::InvalidState(_) | Self::TeardownTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_failure_converts() {
        let err: FeedError = DecodeFailure::MissingField("u").into();
        assert!(matches!(err, FeedError::Decode(DecodeFailure::MissingField("u"))));
        assert_eq!(err.to_string(), "decode failure: missing field `u`");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(!FeedError::Protocol("bad ack".into()).is_fatal_to_run());
        assert!(!FeedError::Connection("reset".into()).is_fatal_to_run());
        assert!(FeedError::InvalidState("append after drain".into()).is_fatal_to_run());
        assert!(FeedError::TeardownTimeout {
            pending: vec![ConnectionId(3)]
        }
        .is_fatal_to_run());
    }
}

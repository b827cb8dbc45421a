//! Error types for wireprobe.
//!
//! Three layers, kept apart so diagnostics can tell them apart:
//! - [`FrameError`]: a byte sequence is not a valid frame.
//! - [`ProtocolFailure`]: the peer misbehaved (or went away) while we waited on it.
//! - [`ProbeError`]: everything a caller of the library can get back.

use std::time::Duration;

use thiserror::Error;

use crate::correlation::CorrelationKey;
use crate::protocol::OperationKind;
use crate::stream::StreamId;

/// Failure to decode a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// No bytes at all where a frame was expected.
    #[error("empty frame")]
    Empty,

    /// First byte is not a known operation code.
    #[error("unknown operation code 0x{0:02X}")]
    UnknownOpcode(u8),

    /// Fewer bytes than the header (or trailer) declares.
    #[error("truncated {kind} frame: needed {needed} bytes, got {available}")]
    Truncated {
        kind: OperationKind,
        needed: usize,
        available: usize,
    },

    /// A length field that sizes a trailer is negative.
    #[error("negative length {value} in {kind} frame")]
    NegativeLength { kind: OperationKind, value: i64 },

    /// More bytes were supplied than the frame declares.
    #[error("{extra} trailing bytes after {kind} frame")]
    TrailingBytes { kind: OperationKind, extra: usize },

    /// Trailer length exceeds the configured maximum.
    #[error("{kind} trailer of {len} bytes exceeds maximum {max}")]
    Oversized {
        kind: OperationKind,
        len: usize,
        max: usize,
    },

    /// FAIL frame carries an error code outside the taxonomy.
    #[error("unknown error code {0} in FAIL frame")]
    UnknownErrorCode(i16),

    /// Caller asked for one variant and the bytes hold another.
    #[error("expected {expected} frame, found {found}")]
    WrongVariant {
        expected: OperationKind,
        found: OperationKind,
    },
}

/// What went wrong while waiting on the peer.
///
/// Every wait in the crate yields `Result<Operation, ProtocolFailure>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolFailure {
    /// Nothing arrived for the key within the deadline.
    #[error("timed out after {after:?} waiting on {key}")]
    Timeout {
        key: CorrelationKey,
        after: Duration,
    },

    /// The stream carried bytes that do not decode.
    #[error("malformed frame on stream {stream}: {error}")]
    Malformed { stream: StreamId, error: FrameError },

    /// A frame arrived with nobody waiting for it.
    #[error("unsolicited {kind} for {key}")]
    Unsolicited {
        key: CorrelationKey,
        kind: OperationKind,
    },

    /// A global frame names a stream this connection never saw.
    #[error("{kind} targets unknown stream {target}")]
    UnknownTarget { target: StreamId, kind: OperationKind },

    /// Global frames showed up on a second stream.
    #[error("global {kind} on stream {candidate}, control stream is {established}")]
    GlobalStreamConflict {
        established: StreamId,
        candidate: StreamId,
        kind: OperationKind,
    },

    /// The transport session is gone.
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// The wait was withdrawn locally (stream closed before its answer).
    #[error("wait on {0} cancelled")]
    Cancelled(CorrelationKey),
}

/// Main error type for all wireprobe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// I/O error on a transport stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config, handshake, report).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bytes on the wire did not form a valid frame.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The peer misbehaved or did not answer.
    #[error("protocol failure: {0}")]
    Protocol(#[from] ProtocolFailure),

    /// Transport session could not be established.
    #[error("transport error: {0}")]
    Transport(String),

    /// A second waiter was registered for a key that already has one.
    #[error("a waiter is already registered for {0}")]
    DuplicateWaiter(CorrelationKey),

    /// The transport handed out a stream id this connection already knows.
    #[error("stream id {0} was already used on this connection")]
    StreamIdReused(StreamId),

    /// Byte-level read on a stream whose read half is not available.
    #[error("stream {0} is not readable")]
    NotReadable(StreamId),

    /// Write on a stream after finish() or close().
    #[error("stream {0} is closed for writing")]
    StreamClosed(StreamId),

    /// Wait registered on a stream whose handle was already released.
    #[error("stream {0} was released")]
    StreamReleased(StreamId),

    /// Connection is no longer usable.
    #[error("connection is not connected")]
    NotConnected,

    /// Server refused the authentication handshake.
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Two situations registered under one id.
    #[error("duplicate situation id: {0}")]
    DuplicateSituation(String),

    /// A situation depends on an id that is not registered.
    #[error("situation {situation} depends on unknown situation {dependency}")]
    UnknownDependency {
        situation: String,
        dependency: String,
    },

    /// Situation dependencies form a cycle.
    #[error("dependency cycle among situations: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
}

/// Result type alias using ProbeError.
pub type Result<T> = std::result::Result<T, ProbeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_errors_are_distinct() {
        let unknown = FrameError::UnknownOpcode(0x7F);
        let truncated = FrameError::Truncated {
            kind: OperationKind::Block,
            needed: 8,
            available: 4,
        };
        assert_ne!(unknown, truncated);
        assert!(unknown.to_string().contains("0x7F"));
        assert!(truncated.to_string().contains("needed 8"));
    }

    #[test]
    fn test_probe_error_wraps_protocol_failure() {
        let err: ProbeError = ProtocolFailure::TransportLost("reset".into()).into();
        assert!(matches!(err, ProbeError::Protocol(ProtocolFailure::TransportLost(_))));
        assert!(err.to_string().contains("reset"));
    }

    #[test]
    fn test_cycle_message_lists_members() {
        let err = ProbeError::DependencyCycle(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "dependency cycle among situations: a, b");
    }
}

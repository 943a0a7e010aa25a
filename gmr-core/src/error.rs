//! Error types for protocol parsing, sweep reassembly and command translation

use thiserror::Error;

/// Errors that can occur when decoding radar datagrams
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Bytes don't match the expected layout (short header, bad length field)
    #[error("Malformed frame ({len} bytes): {reason}")]
    MalformedFrame { reason: String, len: usize },

    /// Fewer payload bytes are present than the header declares
    #[error("Truncated payload: header declares {expected} bytes, got {actual}")]
    TruncatedPayload { expected: usize, actual: usize },

    /// Frame type not recognized
    #[error("Unknown frame type: {0:#06X}")]
    UnknownFrameType(u32),

    /// Failed to deserialize packet structure
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),
}

impl ParseError {
    pub(crate) fn malformed(reason: impl Into<String>, len: usize) -> Self {
        ParseError::MalformedFrame {
            reason: reason.into(),
            len,
        }
    }
}

impl From<bincode::Error> for ParseError {
    fn from(e: bincode::Error) -> Self {
        ParseError::DeserializationFailed(e.to_string())
    }
}

/// Errors raised while reassembling sweeps from fragments
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SweepError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A fragment conflicts with the accumulation already open for its sweep.
    /// The in-progress sweep has been discarded.
    #[error("Protocol inconsistency in sweep seq {sequence} angle {angle}: {reason}")]
    ProtocolInconsistency {
        sequence: u32,
        angle: u16,
        reason: String,
    },
}

/// Errors raised when turning an external command message into a control frame
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// Value cannot be encoded in the 16-bit command field
    #[error("Value {value} for '{action}' is out of range")]
    OutOfRange { action: &'static str, value: f64 },

    /// Action is not one the radar understands
    #[error("Unsupported command action '{0}'")]
    UnsupportedCommand(String),

    /// Message could not be decoded or lacks a required field
    #[error("Malformed command message: {0}")]
    MalformedMessage(String),
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        CommandError::MalformedMessage(e.to_string())
    }
}

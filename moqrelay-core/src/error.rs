//! Error types for moqrelay

use thiserror::Error;

/// Main error type for moqrelay operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoqtError {
    /// A field declared more bytes than the buffer holds
    #[error("Truncated input: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required by the field being decoded
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// Value does not fit in a QUIC variable-length integer
    #[error("Value too large for varint encoding: {value}")]
    VarIntOutOfRange {
        /// Offending value
        value: u64,
    },

    /// Message type tag is not part of the supported message set
    #[error("Unknown message type: {message_type:#x}")]
    UnknownMessageType {
        /// Tag read from the header
        message_type: u64,
    },

    /// SUBSCRIBE carried a filter type outside the known set
    #[error("Unknown subscribe filter type: {filter_type}")]
    UnknownFilterType {
        /// Raw filter value
        filter_type: u64,
    },

    /// A message body was not fully consumed by its decoder
    #[error("Message {message_type:#x} has {remaining} trailing bytes")]
    TrailingBytes {
        /// Tag of the offending message
        message_type: u64,
        /// Bytes left after decoding every field
        remaining: usize,
    },

    /// A frame exceeds the configured maximum message size
    #[error("Message size {size} exceeds maximum {max}")]
    MessageTooLarge {
        /// Declared frame size
        size: u64,
        /// Configured limit
        max: usize,
    },

    /// Invalid data error
    #[error("Invalid data: {reason}")]
    InvalidData {
        /// Reason for invalid data
        reason: String,
    },

    /// Peer violated the protocol state machine
    #[error("Protocol violation: {reason}")]
    ProtocolViolation {
        /// Description of the violation
        reason: String,
    },

    /// No common version between client and server
    #[error("No supported version among {offered:?}")]
    VersionNegotiation {
        /// Versions the client offered
        offered: Vec<u64>,
    },

    /// Control stream was already established on this connection
    #[error("Control stream already established")]
    ControlStreamAlreadyEstablished,

    /// Operation needs a control stream that does not exist yet
    #[error("No control stream established")]
    NoControlStream,

    /// Stream not found error
    #[error("Stream not found: {stream_id}")]
    StreamNotFound {
        /// Stream ID
        stream_id: u64,
    },

    /// Transport error
    #[error("Transport error: {reason}")]
    Transport {
        /// Reason for transport error
        reason: String,
    },

    /// The connection is closed or no longer in the arena
    #[error("Connection expired")]
    ConnectionExpired,

    /// A subscription worker thread could not be started
    #[error("Failed to spawn worker thread: {reason}")]
    WorkerSpawn {
        /// OS error text
        reason: String,
    },

    /// Invalid state error
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },
}

impl MoqtError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            MoqtError::Truncated { .. } => "TRUNCATED",
            MoqtError::VarIntOutOfRange { .. } => "VARINT_OUT_OF_RANGE",
            MoqtError::UnknownMessageType { .. } => "UNKNOWN_MESSAGE_TYPE",
            MoqtError::UnknownFilterType { .. } => "UNKNOWN_FILTER_TYPE",
            MoqtError::TrailingBytes { .. } => "TRAILING_BYTES",
            MoqtError::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            MoqtError::InvalidData { .. } => "INVALID_DATA",
            MoqtError::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            MoqtError::VersionNegotiation { .. } => "VERSION_NEGOTIATION_FAILED",
            MoqtError::ControlStreamAlreadyEstablished => "CONTROL_STREAM_ALREADY_ESTABLISHED",
            MoqtError::NoControlStream => "NO_CONTROL_STREAM",
            MoqtError::StreamNotFound { .. } => "STREAM_NOT_FOUND",
            MoqtError::Transport { .. } => "TRANSPORT_ERROR",
            MoqtError::ConnectionExpired => "CONNECTION_EXPIRED",
            MoqtError::WorkerSpawn { .. } => "WORKER_SPAWN_FAILED",
            MoqtError::InvalidState { .. } => "INVALID_STATE",
        }
    }

    /// Whether the error is a peer protocol error that should close the connection
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            MoqtError::Truncated { .. }
                | MoqtError::VarIntOutOfRange { .. }
                | MoqtError::UnknownMessageType { .. }
                | MoqtError::UnknownFilterType { .. }
                | MoqtError::TrailingBytes { .. }
                | MoqtError::MessageTooLarge { .. }
                | MoqtError::InvalidData { .. }
                | MoqtError::ProtocolViolation { .. }
                | MoqtError::VersionNegotiation { .. }
        )
    }
}

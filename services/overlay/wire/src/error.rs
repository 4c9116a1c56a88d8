//! Wire protocol error types.

use crate::message::MessageType;
use thiserror::Error;

/// Protocol violations and transport failures at the message block layer
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Type code outside the known set of content types
    #[error("unknown message type code {0}")]
    UnknownType(u8),

    /// Block type does not match what the current decode step expects
    #[error("unexpected message type: expected {expected}, received {actual}")]
    TypeMismatch {
        /// Type the decode operation expects
        expected: MessageType,
        /// Type actually carried by the block
        actual: MessageType,
    },

    /// Structured payload could not be parsed
    #[error("failed to decode {message_type} payload: {reason}")]
    MalformedPayload {
        /// Type of the block being decoded
        message_type: MessageType,
        /// Underlying parser message
        reason: String,
    },

    /// Structured payload could not be serialized
    #[error("failed to encode {message_type} payload: {reason}")]
    Encode {
        /// Type of the block being encoded
        message_type: MessageType,
        /// Underlying serializer message
        reason: String,
    },

    /// Payload exceeds the maximum block data length
    #[error("block data length {0} exceeds limit {1}")]
    BlockTooLarge(usize, usize),

    /// Received bytes would exceed the size declared for a stream transfer
    #[error("received {received} bytes, exceeding the declared total of {declared} bytes")]
    SizeExceeded {
        /// Bytes received including the offending block
        received: u64,
        /// Declared total size of the transfer
        declared: u64,
    },

    /// Attempt to cut a chunk from a fully consumed source
    #[error("attempted to read a chunk from an exhausted source")]
    SourceExhausted,

    /// Stream wrapper used after its transfer completed or was aborted
    #[error("stream transfer already completed")]
    TransferComplete,

    /// Invalid or missing handshake data
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Underlying I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error stems from the transport rather than from peer behavior
    pub fn is_io(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }
}

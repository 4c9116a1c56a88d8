//! Message types and message blocks.
//!
//! A message block is the atomic unit of the uplink protocol: a one-byte
//! content type code plus an opaque payload. The set of content types is
//! closed; every type has a fixed code and a direction contract.

use crate::error::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest code of the reserved content type range
pub const MIN_MESSAGE_TYPE_CODE: u8 = 1;
/// Highest code of the reserved content type range
pub const MAX_MESSAGE_TYPE_CODE: u8 = 127;

/// Maximum payload length of a single message block (256 KiB)
pub const MAX_MESSAGE_BLOCK_DATA_LENGTH: usize = 256 * 1024;

/// Which peers may send a message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by either side of a connection
    Any,
    /// Client to relay only
    ClientToRelay,
    /// Relay to client only
    RelayToClient,
    /// Client to relay and forwarded by the relay to the destination client
    ClientToClientViaRelay,
}

/// Closed set of content types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Protocol version and identity negotiation
    Handshake = 1,
    /// Tool descriptor list published by a client
    ToolDescriptorListUpdate = 11,
    /// Request to open a logical channel to a destination
    ChannelInit = 21,
    /// Channel offer forwarded to the destination
    ChannelOffer = 22,
    /// Destination's answer to a channel offer
    ChannelOfferResponse = 23,
    /// Final answer to a channel init request
    ChannelInitResponse = 24,
    /// Logical channel shutdown
    ChannelClose = 25,
    /// Tool execution request
    ToolExecutionRequest = 31,
    /// Acceptance or rejection of an execution request
    ToolExecutionRequestResponse = 32,
    /// Batch of execution output events
    ToolExecutionEvents = 33,
    /// Final execution result
    ToolExecutionFinished = 34,
    /// Request to cancel a running execution
    ToolCancellationRequest = 35,
    /// Start of a named file transfer section
    FileTransferSectionStart = 41,
    /// Header of a single transferred file
    FileHeader = 42,
    /// Chunk of file content
    FileContent = 43,
    /// End of a file transfer section
    FileTransferSectionEnd = 44,
    /// Request for tool documentation
    ToolDocumentationRequest = 51,
    /// Size announcement of the requested documentation
    ToolDocumentationResponse = 52,
    /// Chunk of documentation content
    ToolDocumentationContent = 53,
    /// Test payload
    Test = 99,
    /// Keepalive request
    Heartbeat = 125,
    /// Keepalive answer
    HeartbeatResponse = 126,
    /// Graceful or error shutdown notice
    Goodbye = 127,
}

impl MessageType {
    /// All content types in code order
    pub const ALL: [MessageType; 23] = [
        MessageType::Handshake,
        MessageType::ToolDescriptorListUpdate,
        MessageType::ChannelInit,
        MessageType::ChannelOffer,
        MessageType::ChannelOfferResponse,
        MessageType::ChannelInitResponse,
        MessageType::ChannelClose,
        MessageType::ToolExecutionRequest,
        MessageType::ToolExecutionRequestResponse,
        MessageType::ToolExecutionEvents,
        MessageType::ToolExecutionFinished,
        MessageType::ToolCancellationRequest,
        MessageType::FileTransferSectionStart,
        MessageType::FileHeader,
        MessageType::FileContent,
        MessageType::FileTransferSectionEnd,
        MessageType::ToolDocumentationRequest,
        MessageType::ToolDocumentationResponse,
        MessageType::ToolDocumentationContent,
        MessageType::Test,
        MessageType::Heartbeat,
        MessageType::HeartbeatResponse,
        MessageType::Goodbye,
    ];

    /// Numeric wire code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Direction contract of this type
    pub fn direction(self) -> Direction {
        use MessageType::*;
        match self {
            Handshake | Heartbeat | HeartbeatResponse | Goodbye | Test => Direction::Any,
            ToolDescriptorListUpdate => Direction::ClientToRelay,
            ChannelInit | ChannelOfferResponse => Direction::ClientToRelay,
            ChannelOffer | ChannelInitResponse => Direction::RelayToClient,
            ChannelClose => Direction::ClientToClientViaRelay,
            ToolExecutionRequest
            | ToolExecutionRequestResponse
            | ToolExecutionEvents
            | ToolExecutionFinished
            | ToolCancellationRequest => Direction::ClientToClientViaRelay,
            FileTransferSectionStart | FileHeader | FileContent | FileTransferSectionEnd => {
                Direction::ClientToClientViaRelay
            }
            ToolDocumentationRequest | ToolDocumentationResponse | ToolDocumentationContent => {
                Direction::ClientToClientViaRelay
            }
        }
    }

    /// Whether blocks of this type carry a JSON payload
    pub fn is_structured(self) -> bool {
        !matches!(
            self,
            MessageType::FileContent
                | MessageType::ToolDocumentationContent
                | MessageType::Goodbye
                | MessageType::Heartbeat
                | MessageType::HeartbeatResponse
                | MessageType::Test
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.code() == value)
            .ok_or(ProtocolError::UnknownType(value))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// A typed payload unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock {
    message_type: MessageType,
    data: Bytes,
}

impl MessageBlock {
    /// Create a block, rejecting payloads above [`MAX_MESSAGE_BLOCK_DATA_LENGTH`]
    pub fn new(message_type: MessageType, data: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let data = data.into();
        if data.len() > MAX_MESSAGE_BLOCK_DATA_LENGTH {
            return Err(ProtocolError::BlockTooLarge(
                data.len(),
                MAX_MESSAGE_BLOCK_DATA_LENGTH,
            ));
        }
        Ok(Self { message_type, data })
    }

    /// Create a block without payload
    pub fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            data: Bytes::new(),
        }
    }

    /// Content type
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Payload bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Consume the block, returning its payload
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fail with a type mismatch unless this block has the expected type
    pub fn expect_type(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.message_type != expected {
            return Err(ProtocolError::TypeMismatch {
                expected,
                actual: self.message_type,
            });
        }
        Ok(())
    }
}

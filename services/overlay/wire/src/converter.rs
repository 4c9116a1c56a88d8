//! Conversion between typed protocol messages and message blocks.
//!
//! Structured payloads are JSON-encoded. Every decode operation first checks
//! the block's type against the type it expects, so a mismatch is reported
//! as such instead of as a parse failure.

use crate::error::ProtocolError;
use crate::message::{MessageBlock, MessageType, MAX_MESSAGE_BLOCK_DATA_LENGTH};
use crate::payload::{
    ChannelCreationRequest, ChannelCreationResponse, FileHeader, FileTransferSectionInfo,
    HandshakeData, ToolDescriptorListUpdate, ToolDocumentationRequest,
    ToolDocumentationResponse, ToolExecutionEvent, ToolExecutionRequest,
    ToolExecutionRequestResponse, ToolExecutionResult,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use tracing::{trace, warn};

/// Substituted for empty error goodbye messages
pub const GOODBYE_PLACEHOLDER_MESSAGE: &str = "<no message available>";

/// Substituted when a received goodbye message is not valid UTF-8
pub const UNDECODABLE_GOODBYE_MESSAGE: &str = "<undecodable error message>";

/// Classification of error goodbye messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolErrorType {
    /// Peers speak incompatible protocol versions
    ProtocolVersionMismatch,
    /// Handshake content was missing or invalid
    InvalidHandshakeData,
    /// The accepting side failed internally
    InternalServerError,
    /// The connecting side failed internally
    InternalClientError,
    /// Transport-level failure
    LowLevelConnectionError,
    /// Another client already uses the requested namespace
    ClientNamespaceCollision,
}

impl ProtocolErrorType {
    /// All error types
    pub const ALL: [ProtocolErrorType; 6] = [
        ProtocolErrorType::ProtocolVersionMismatch,
        ProtocolErrorType::InvalidHandshakeData,
        ProtocolErrorType::InternalServerError,
        ProtocolErrorType::InternalClientError,
        ProtocolErrorType::LowLevelConnectionError,
        ProtocolErrorType::ClientNamespaceCollision,
    ];

    /// Code used for messages without a recognized type
    pub const UNKNOWN_CODE: &'static str = "E99";

    /// Short code prefixed to wrapped messages
    pub fn code(self) -> &'static str {
        match self {
            ProtocolErrorType::ProtocolVersionMismatch => "E1",
            ProtocolErrorType::InvalidHandshakeData => "E2",
            ProtocolErrorType::InternalServerError => "E3",
            ProtocolErrorType::InternalClientError => "E4",
            ProtocolErrorType::LowLevelConnectionError => "E5",
            ProtocolErrorType::ClientNamespaceCollision => "E6",
        }
    }

    /// Prefix a message with this type's code
    pub fn wrap(self, message: &str) -> String {
        format!("{}: {}", self.code(), message)
    }

    /// Split a wrapped message into its type, if recognized, and the message text
    pub fn unwrap_message(wrapped: &str) -> (Option<ProtocolErrorType>, String) {
        if let Some((code, rest)) = wrapped.split_once(": ") {
            if let Some(t) = Self::ALL.iter().copied().find(|t| t.code() == code) {
                return (Some(t), rest.to_string());
            }
            if code == Self::UNKNOWN_CODE {
                return (None, rest.to_string());
            }
        }
        (None, wrapped.to_string())
    }
}

impl fmt::Display for ProtocolErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Encodes and decodes protocol messages for one session
#[derive(Debug, Clone)]
pub struct MessageConverter {
    log_identity: String,
}

impl MessageConverter {
    /// Create a converter; `log_identity` prefixes trace output
    pub fn new(log_identity: impl Into<String>) -> Self {
        Self {
            log_identity: log_identity.into(),
        }
    }

    /// Encode handshake data for either direction
    pub fn encode_handshake(&self, data: &HandshakeData) -> Result<MessageBlock, ProtocolError> {
        self.encode_json(MessageType::Handshake, data)
    }

    /// Decode handshake data
    pub fn decode_handshake(&self, block: &MessageBlock) -> Result<HandshakeData, ProtocolError> {
        self.decode_json(MessageType::Handshake, block)
    }

    /// Encode an empty goodbye signalling a regular shutdown
    pub fn encode_goodbye(&self) -> MessageBlock {
        MessageBlock::empty(MessageType::Goodbye)
    }

    /// Encode a goodbye carrying an error message.
    ///
    /// Never fails: empty messages are replaced by a placeholder and overlong
    /// ones are truncated at a character boundary.
    pub fn encode_error_goodbye(&self, message: &str) -> MessageBlock {
        let message = if message.is_empty() {
            warn!(
                "[{}] Was requested to encode an empty error message; replacing with a placeholder",
                self.log_identity
            );
            GOODBYE_PLACEHOLDER_MESSAGE
        } else {
            message
        };

        let mut end = message.len().min(MAX_MESSAGE_BLOCK_DATA_LENGTH);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        let bytes = message.as_bytes()[..end].to_vec();

        match MessageBlock::new(MessageType::Goodbye, bytes) {
            Ok(block) => block,
            Err(_) => MessageBlock::new(MessageType::Goodbye, GOODBYE_PLACEHOLDER_MESSAGE.as_bytes())
                .unwrap_or_else(|_| MessageBlock::empty(MessageType::Goodbye)),
        }
    }

    /// Decode a goodbye: `None` for a regular goodbye, the error text otherwise
    pub fn decode_goodbye(&self, block: &MessageBlock) -> Result<Option<String>, ProtocolError> {
        block.expect_type(MessageType::Goodbye)?;
        if block.is_empty() {
            return Ok(None);
        }
        match std::str::from_utf8(block.data()) {
            Ok(text) => Ok(Some(text.to_string())),
            Err(_) => Ok(Some(UNDECODABLE_GOODBYE_MESSAGE.to_string())),
        }
    }

    /// Encode a tool descriptor list update
    pub fn encode_tool_descriptor_list_update(
        &self,
        update: &ToolDescriptorListUpdate,
    ) -> Result<MessageBlock, ProtocolError> {
        self.encode_json(MessageType::ToolDescriptorListUpdate, update)
    }

    /// Decode a tool descriptor list update
    pub fn decode_tool_descriptor_list_update(
        &self,
        block: &MessageBlock,
    ) -> Result<ToolDescriptorListUpdate, ProtocolError> {
        self.decode_json(MessageType::ToolDescriptorListUpdate, block)
    }

    /// Encode a channel creation request
    pub fn encode_channel_creation_request(
        &self,
        request: &ChannelCreationRequest,
    ) -> Result<MessageBlock, ProtocolError> {
        self.encode_json(MessageType::ChannelInit, request)
    }

    /// Decode a channel creation request
    pub fn decode_channel_creation_request(
        &self,
        block: &MessageBlock,
    ) -> Result<ChannelCreationRequest, ProtocolError> {
        self.decode_json(MessageType::ChannelInit, block)
    }

    /// Encode a channel creation response
    pub fn encode_channel_creation_response(
        &self,
        response: &ChannelCreationResponse,
    ) -> Result<MessageBlock, ProtocolError> {
        self.encode_json(MessageType::ChannelInitResponse, response)
    }

    /// Decode a channel creation response
    pub fn decode_channel_creation_response(
        &self,
        block: &MessageBlock,
    ) -> Result<ChannelCreationResponse, ProtocolError> {
        self.decode_json(MessageType::ChannelInitResponse, block)
    }

    /// Encode a tool execution request
    pub fn encode_tool_execution_request(
        &self,
        request: &ToolExecutionRequest,
    ) -> Result<MessageBlock, ProtocolError> {
        self.encode_json(MessageType::ToolExecutionRequest, request)
    }

    /// Decode a tool execution request
    pub fn decode_tool_execution_request(
        &self,
        block: &MessageBlock,
    ) -> Result<ToolExecutionRequest, ProtocolError> {
        self.decode_json(MessageType::ToolExecutionRequest, block)
    }

    /// Encode the response to an execution request
    pub fn encode_tool_execution_request_response(
        &self,
        response: &ToolExecutionRequestResponse,
    ) -> Result<MessageBlock, ProtocolError> {
        self.encode_json(MessageType::ToolExecutionRequestResponse, response)
    }

    /// Decode the response to an execution request
    pub fn decode_tool_execution_request_response(
        &self,
        block: &MessageBlock,
    ) -> Result<ToolExecutionRequestResponse, ProtocolError> {
        self.decode_json(MessageType::ToolExecutionRequestResponse, block)
    }

    /// Encode a batch of execution events
    pub fn encode_tool_execution_events(
        &self,
        batch: &[ToolExecutionEvent],
    ) -> Result<MessageBlock, ProtocolError> {
        self.encode_json(MessageType::ToolExecutionEvents, batch)
    }

    /// Decode a batch of execution events
    pub fn decode_tool_execution_events(
        &self,
        block: &MessageBlock,
    ) -> Result<Vec<ToolExecutionEvent>, ProtocolError> {
        self.decode_json(MessageType::ToolExecutionEvents, block)
    }

    /// Create a cancellation request; it carries no payload
    pub fn create_tool_cancellation_request(&self) -> MessageBlock {
        MessageBlock::empty(MessageType::ToolCancellationRequest)
    }

    /// Encode the final result of an execution
    pub fn encode_tool_execution_result(
        &self,
        result: &ToolExecutionResult,
    ) -> Result<MessageBlock, ProtocolError> {
        self.encode_json(MessageType::ToolExecutionFinished, result)
    }

    /// Decode the final result of an execution
    pub fn decode_tool_execution_result(
        &self,
        block: &MessageBlock,
    ) -> Result<ToolExecutionResult, ProtocolError> {
        self.decode_json(MessageType::ToolExecutionFinished, block)
    }

    /// Encode the start of a file transfer section
    pub fn encode_file_transfer_section_start(
        &self,
        info: &FileTransferSectionInfo,
    ) -> Result<MessageBlock, ProtocolError> {
        self.encode_json(MessageType::FileTransferSectionStart, info)
    }

    /// Decode the start of a file transfer section
    pub fn decode_file_transfer_section_start(
        &self,
        block: &MessageBlock,
    ) -> Result<FileTransferSectionInfo, ProtocolError> {
        self.decode_json(MessageType::FileTransferSectionStart, block)
    }

    /// Create the end marker of a file transfer section
    pub fn create_file_transfer_section_end(&self) -> MessageBlock {
        MessageBlock::empty(MessageType::FileTransferSectionEnd)
    }

    /// Encode a file header
    pub fn encode_file_header(&self, header: &FileHeader) -> Result<MessageBlock, ProtocolError> {
        self.encode_json(MessageType::FileHeader, header)
    }

    /// Decode a file header
    pub fn decode_file_header(&self, block: &MessageBlock) -> Result<FileHeader, ProtocolError> {
        self.decode_json(MessageType::FileHeader, block)
    }

    /// Encode a documentation request
    pub fn encode_documentation_request(
        &self,
        request: &ToolDocumentationRequest,
    ) -> Result<MessageBlock, ProtocolError> {
        self.encode_json(MessageType::ToolDocumentationRequest, request)
    }

    /// Decode a documentation request
    pub fn decode_documentation_request(
        &self,
        block: &MessageBlock,
    ) -> Result<ToolDocumentationRequest, ProtocolError> {
        self.decode_json(MessageType::ToolDocumentationRequest, block)
    }

    /// Encode a documentation response
    pub fn encode_documentation_response(
        &self,
        response: &ToolDocumentationResponse,
    ) -> Result<MessageBlock, ProtocolError> {
        self.encode_json(MessageType::ToolDocumentationResponse, response)
    }

    /// Decode a documentation response
    pub fn decode_documentation_response(
        &self,
        block: &MessageBlock,
    ) -> Result<ToolDocumentationResponse, ProtocolError> {
        self.decode_json(MessageType::ToolDocumentationResponse, block)
    }

    fn encode_json<T: Serialize + ?Sized>(
        &self,
        message_type: MessageType,
        value: &T,
    ) -> Result<MessageBlock, ProtocolError> {
        let json = serde_json::to_vec(value).map_err(|e| ProtocolError::Encode {
            message_type,
            reason: e.to_string(),
        })?;
        trace!(
            "[{}] Encoded JSON message of type {}; output: '{}'",
            self.log_identity,
            message_type,
            String::from_utf8_lossy(&json)
        );
        MessageBlock::new(message_type, json).map_err(|e| ProtocolError::Encode {
            message_type,
            reason: e.to_string(),
        })
    }

    fn decode_json<T: DeserializeOwned>(
        &self,
        expected: MessageType,
        block: &MessageBlock,
    ) -> Result<T, ProtocolError> {
        block.expect_type(expected)?;
        trace!(
            "[{}] Decoding JSON message of type {}; input: '{}'",
            self.log_identity,
            expected,
            String::from_utf8_lossy(block.data())
        );
        serde_json::from_slice(block.data()).map_err(|e| ProtocolError::MalformedPayload {
            message_type: expected,
            reason: e.to_string(),
        })
    }
}

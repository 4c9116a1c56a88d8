//! Message blocks, wire framing, message conversion, and stream chunking for the overlay.
//!
//! This crate provides the application protocol layer spoken over overlay
//! connections: the closed set of message types, the framed wire shape of a
//! message block, JSON conversion of typed protocol messages, and the stream
//! wrappers that move large payloads as sequences of bounded blocks.
//!
//! ## Features
//!
//! - **Typed Blocks**: every block carries a known [`MessageType`] code
//! - **Zero-Copy I/O**: uses `Bytes`/`BytesMut` for payloads and framing
//! - **Strict Decoding**: type checks precede every payload decode
//! - **Stream Transfers**: exact-size accounting for chunked uploads and downloads
//!
//! ## Wire Format
//!
//! ```text
//! +-------------------+----------------------------+
//! | u64 channel_id    | logical channel            |
//! +-------------------+----------------------------+
//! | u32 data_len      | payload length             |
//! +-------------------+----------------------------+
//! | u8 type           | message type code          |
//! +-------------------+----------------------------+
//! | data              | variable (0..256 KiB)      |
//! +-------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod converter;
pub mod error;
pub mod frame;
pub mod message;
pub mod payload;

// Re-export main types
pub use chunk::{
    BlockSender, ChunkedDownload, ChunkedUpload, DownloadStream, DEFAULT_PIPE_CAPACITY,
    MAX_STREAM_CHUNK_SIZE,
};
pub use converter::{
    MessageConverter, ProtocolErrorType, GOODBYE_PLACEHOLDER_MESSAGE, UNDECODABLE_GOODBYE_MESSAGE,
};
pub use error::ProtocolError;
pub use frame::{Frame, FrameDecoder, DEFAULT_CHANNEL_ID, FRAME_HEADER_SIZE, HANDSHAKE_HEADER};
pub use message::{
    Direction, MessageBlock, MessageType, MAX_MESSAGE_BLOCK_DATA_LENGTH, MAX_MESSAGE_TYPE_CODE,
    MIN_MESSAGE_TYPE_CODE,
};
pub use payload::{
    ChannelCreationRequest, ChannelCreationResponse, ChannelType, FileEntryType, FileHeader,
    FileTransferSectionInfo, HandshakeData, ToolDescriptor, ToolDescriptorListUpdate,
    ToolDocumentationRequest, ToolDocumentationResponse, ToolExecutionEvent, ToolExecutionRequest,
    ToolExecutionRequestResponse, ToolExecutionResult, HANDSHAKE_KEY_NODE_ID,
    HANDSHAKE_KEY_PROTOCOL_VERSION, PROTOCOL_VERSION,
};

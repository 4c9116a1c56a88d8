//! Message framing for the wire protocol.
//!
//! Each frame carries one message block on a logical channel:
//!
//! ```text
//! +-------------------+----------------------------+
//! | u64 channel_id    | logical channel, 0=control |
//! +-------------------+----------------------------+
//! | u32 data_len      | payload length             |
//! +-------------------+----------------------------+
//! | u8 type           | message type code          |
//! +-------------------+----------------------------+
//! | data              | variable (0..256 KiB)      |
//! +-------------------+----------------------------+
//! ```

use crate::error::ProtocolError;
use crate::message::{MessageBlock, MessageType, MAX_MESSAGE_BLOCK_DATA_LENGTH};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Channel id of the control channel used for handshake and goodbye
pub const DEFAULT_CHANNEL_ID: u64 = 0;

/// Size of the fixed frame prefix (channel id, length, type)
pub const FRAME_HEADER_SIZE: usize = 8 + 4 + 1;

/// Fixed ASCII header each side writes before the handshake block
pub const HANDSHAKE_HEADER: &[u8; 16] = b"OVERLAY-UPLINK/1";

/// A message block addressed to a logical channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Logical channel
    pub channel_id: u64,
    /// Carried block
    pub block: MessageBlock,
}

impl Frame {
    /// Create a new frame
    pub fn new(channel_id: u64, block: MessageBlock) -> Self {
        Self { channel_id, block }
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.block.len()
    }

    /// Append the encoded frame to a buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        buf.put_u64(self.channel_id);
        buf.put_u32(self.block.len() as u32);
        buf.put_u8(self.block.message_type().code());
        buf.put_slice(self.block.data());
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_data_length: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_data_length: MAX_MESSAGE_BLOCK_DATA_LENGTH,
        }
    }

    /// Decode one frame from a buffer
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the length and type without consuming
        let data_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        if data_len > self.max_data_length {
            return Err(ProtocolError::BlockTooLarge(data_len, self.max_data_length));
        }
        let message_type = MessageType::try_from(buf[12])?;

        if buf.len() < FRAME_HEADER_SIZE + data_len {
            return Ok(None);
        }

        let channel_id = buf.get_u64();
        buf.advance(4 + 1);
        let data = buf.split_to(data_len).freeze();

        Ok(Some(Frame {
            channel_id,
            block: MessageBlock::new(message_type, data)?,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

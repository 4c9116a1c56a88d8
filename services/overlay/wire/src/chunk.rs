//! Stream chunking for large payloads.
//!
//! [`ChunkedUpload`] cuts a byte source of known length into message blocks
//! and hands them to a [`BlockSender`]. [`ChunkedDownload`] accepts those
//! blocks on the receiving side and feeds them into an in-memory pipe read
//! through [`DownloadStream`]. Each instance serves exactly one transfer.

use crate::error::ProtocolError;
use crate::message::{MessageBlock, MessageType, MAX_MESSAGE_BLOCK_DATA_LENGTH};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
use tracing::{debug, warn};

/// Maximum payload size of a single stream chunk block (128 KiB)
pub const MAX_STREAM_CHUNK_SIZE: usize = 128 * 1024;

/// Default capacity of the download pipe
pub const DEFAULT_PIPE_CAPACITY: usize = 2 * MAX_STREAM_CHUNK_SIZE;

/// Asynchronous sink for outgoing message blocks
#[async_trait]
pub trait BlockSender: Send + Sync {
    /// Send one block
    async fn send_block(&self, block: MessageBlock) -> Result<(), ProtocolError>;
}

/// Splits a length-known byte source into message blocks
pub struct ChunkedUpload<R> {
    source: R,
    remaining: u64,
    block_type: MessageType,
    chunk_size: usize,
}

impl<R: AsyncRead + Unpin + Send> ChunkedUpload<R> {
    /// Create an upload of `total_size` bytes from `source`
    pub fn new(source: R, total_size: u64, block_type: MessageType) -> Self {
        Self {
            source,
            remaining: total_size,
            block_type,
            chunk_size: MAX_STREAM_CHUNK_SIZE,
        }
    }

    /// Use a smaller chunk size; values are clamped to the block limit
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_MESSAGE_BLOCK_DATA_LENGTH);
        self
    }

    /// Bytes not yet cut into chunks
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Whether the source is fully consumed
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Read the next chunk from the source
    pub async fn next_chunk(&mut self) -> Result<MessageBlock, ProtocolError> {
        if self.remaining == 0 {
            return Err(ProtocolError::SourceExhausted);
        }
        let len = self.remaining.min(self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; len];
        self.source.read_exact(&mut buf).await?;
        self.remaining -= len as u64;
        MessageBlock::new(self.block_type, buf)
    }

    /// Send all remaining chunks, returning the number of blocks sent
    pub async fn send_all(mut self, sender: &dyn BlockSender) -> Result<usize, ProtocolError> {
        let mut blocks = 0;
        while !self.is_exhausted() {
            let block = self.next_chunk().await?;
            sender.send_block(block).await?;
            blocks += 1;
        }
        debug!("Sent {} block(s) of type {}", blocks, self.block_type);
        Ok(blocks)
    }
}

/// Reassembles incoming blocks into a byte stream of declared length
#[derive(Debug)]
pub struct ChunkedDownload {
    writer: Option<DuplexStream>,
    block_type: MessageType,
    total_size: u64,
    received: u64,
}

impl ChunkedDownload {
    /// Create a download expecting `total_size` bytes in blocks of `block_type`
    pub fn new(total_size: u64, block_type: MessageType) -> (Self, DownloadStream) {
        Self::with_capacity(total_size, block_type, DEFAULT_PIPE_CAPACITY)
    }

    /// Like [`ChunkedDownload::new`] with an explicit pipe capacity
    pub fn with_capacity(
        total_size: u64,
        block_type: MessageType,
        capacity: usize,
    ) -> (Self, DownloadStream) {
        let (writer, reader) = tokio::io::duplex(capacity.max(1));
        // Nothing to wait for; the reader sees end-of-stream immediately
        let writer = if total_size == 0 { None } else { Some(writer) };
        (
            Self {
                writer,
                block_type,
                total_size,
                received: 0,
            },
            DownloadStream {
                reader,
                total_size,
                read: 0,
            },
        )
    }

    /// Declared total size
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes accepted so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Whether the transfer is complete or aborted
    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Accept one incoming block.
    ///
    /// Closes the stream once the declared total is reached. A wrong block
    /// type or a block crossing the declared total aborts the transfer.
    pub async fn receive_block(&mut self, block: &MessageBlock) -> Result<(), ProtocolError> {
        if self.writer.is_none() {
            return Err(ProtocolError::TransferComplete);
        }
        if let Err(e) = block.expect_type(self.block_type) {
            self.abort();
            return Err(e);
        }
        let received = self.received + block.len() as u64;
        if received > self.total_size {
            warn!(
                "Aborting stream transfer: received {} bytes, declared {}",
                received, self.total_size
            );
            self.abort();
            return Err(ProtocolError::SizeExceeded {
                received,
                declared: self.total_size,
            });
        }

        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write_all(block.data()).await {
                self.abort();
                return Err(e.into());
            }
        }
        self.received = received;

        if self.received == self.total_size {
            if let Some(mut writer) = self.writer.take() {
                writer.shutdown().await?;
            }
            debug!("Stream transfer of {} bytes complete", self.total_size);
        }
        Ok(())
    }

    /// Abort the transfer; the reader sees an unexpected end of stream
    pub fn abort(&mut self) {
        self.writer = None;
    }
}

/// Consumer side of a [`ChunkedDownload`]
#[derive(Debug)]
pub struct DownloadStream {
    reader: DuplexStream,
    total_size: u64,
    read: u64,
}

impl DownloadStream {
    /// Total number of bytes this stream will yield
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.read
    }
}

impl AsyncRead for DownloadStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut this.reader).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n == 0 && buf.remaining() > 0 && this.read < this.total_size {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "stream ended after {} of {} bytes",
                            this.read, this.total_size
                        ),
                    )));
                }
                this.read += n as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

//! Message channel abstractions.
//!
//! A [`MessageChannel`] is one live, bidirectional transport connection to a
//! remote node. Channels are created and owned by a [`MessageChannelService`];
//! connection setups only hold a handle to their current channel.

use crate::contact_point::NetworkContactPoint;
use crate::error::SessionError;
use async_trait::async_trait;
use overlay_wire::{BlockSender, Frame, MessageBlock, ProtocolError};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Health of a message channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageChannelState {
    /// Handshake completed, channel usable
    Established,
    /// Closed by either side in an orderly way
    Closed,
    /// Closed because of a transport or protocol failure
    MarkedAsBroken,
}

impl fmt::Display for MessageChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageChannelState::Established => write!(f, "ESTABLISHED"),
            MessageChannelState::Closed => write!(f, "CLOSED"),
            MessageChannelState::MarkedAsBroken => write!(f, "MARKED_AS_BROKEN"),
        }
    }
}

/// A live transport channel to a remote node
#[async_trait]
pub trait MessageChannel: Send + Sync + fmt::Debug {
    /// Locally unique channel identifier
    fn channel_id(&self) -> &str;

    /// Node id announced by the remote side during the handshake
    fn remote_node_id(&self) -> &str;

    /// Current channel health
    fn state(&self) -> MessageChannelState;

    /// Whether the channel was closed because the remote side closed it first
    fn is_closed_because_remote_closed(&self) -> bool;

    /// Send one block on a logical sub-channel
    async fn send_block(&self, channel_id: u64, block: MessageBlock) -> Result<(), SessionError>;

    /// Close the channel, sending a goodbye if still possible
    async fn close(&self);

    /// Take the receiver of inbound frames. Returns `None` after the first call.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Frame>>;
}

/// Shared handle to a message channel
pub type ChannelHandle = Arc<dyn MessageChannel>;

/// Callbacks about channels created through a [`MessageChannelService`]
pub trait MessageChannelLifecycleListener: Send + Sync {
    /// An outgoing channel completed its handshake
    fn on_outgoing_channel_established(&self, _channel: &ChannelHandle) {}

    /// An outgoing channel was closed or broke down
    fn on_outgoing_channel_terminated(&self, channel: &ChannelHandle);
}

/// Creates and closes message channels
#[async_trait]
pub trait MessageChannelService: Send + Sync {
    /// Establish a channel to the given contact point, including the handshake
    async fn connect(
        &self,
        contact_point: &NetworkContactPoint,
    ) -> Result<ChannelHandle, SessionError>;

    /// Close a channel that was created by [`MessageChannelService::connect`]
    async fn close_outgoing_channel(&self, channel: ChannelHandle);

    /// Register for channel lifecycle callbacks
    fn add_lifecycle_listener(&self, listener: Arc<dyn MessageChannelLifecycleListener>);
}

/// Sends blocks on one logical sub-channel of a message channel, so chunked
/// uploads can write directly to a connection.
#[derive(Debug, Clone)]
pub struct ChannelBlockSender {
    channel: ChannelHandle,
    channel_id: u64,
}

impl ChannelBlockSender {
    /// Create a sender for `channel_id` on `channel`
    pub fn new(channel: ChannelHandle, channel_id: u64) -> Self {
        Self {
            channel,
            channel_id,
        }
    }
}

#[async_trait]
impl BlockSender for ChannelBlockSender {
    async fn send_block(&self, block: MessageBlock) -> Result<(), ProtocolError> {
        self.channel
            .send_block(self.channel_id, block)
            .await
            .map_err(|e| match e {
                SessionError::Protocol(inner) => inner,
                SessionError::Io(inner) => ProtocolError::Io(inner),
                other => ProtocolError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    other.to_string(),
                )),
            })
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockChannel;
    use super::*;
    use overlay_wire::{ChunkedUpload, MessageType};

    #[tokio::test]
    async fn test_chunked_upload_through_channel() {
        let mock = Arc::new(MockChannel::new("c1"));
        let channel: ChannelHandle = mock.clone();
        let sender = ChannelBlockSender::new(channel, 7);

        let data: Vec<u8> = (0..10u8).collect();
        let upload = ChunkedUpload::new(&data[..], data.len() as u64, MessageType::FileContent)
            .with_chunk_size(4);
        let blocks = upload.send_all(&sender).await.unwrap();
        assert_eq!(blocks, 3);

        let sent = mock.sent.lock().unwrap();
        assert!(sent.iter().all(|(id, _)| *id == 7));
        let joined: Vec<u8> = sent.iter().flat_map(|(_, b)| b.data().to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_send_on_closed_channel_maps_to_io_error() {
        let mock = Arc::new(MockChannel::new("c2"));
        mock.close().await;
        let sender = ChannelBlockSender::new(mock, 0);
        let err = sender
            .send_block(MessageBlock::empty(MessageType::Test))
            .await
            .unwrap_err();
        assert!(err.is_io());
    }
}

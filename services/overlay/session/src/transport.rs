//! TCP transport for overlay channels.
//!
//! [`TcpChannelService`] dials contact points and accepts inbound connections,
//! runs the handshake on the raw stream and wraps the result in a
//! [`TcpMessageChannel`]. Each channel owns a reader task that answers
//! heartbeats, detects goodbyes and forwards all other frames to the
//! channel's incoming queue, and a keepalive task that sends heartbeats and
//! marks the channel broken when the peer stops responding.

use crate::channel::{
    ChannelHandle, MessageChannel, MessageChannelLifecycleListener, MessageChannelService,
    MessageChannelState,
};
use crate::contact_point::NetworkContactPoint;
use crate::error::SessionError;
use crate::handshake::{accept_handshake, initiate_handshake, recv_frame};
use crate::keepalive::{HeartbeatTracker, KeepaliveAction, KeepaliveConfig};
use async_trait::async_trait;
use bytes::BytesMut;
use overlay_wire::{
    Frame, FrameDecoder, MessageBlock, MessageConverter, MessageType, ProtocolErrorType,
    DEFAULT_CHANNEL_ID,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Default time allowed for the handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type ListenerSet = RwLock<Vec<Arc<dyn MessageChannelLifecycleListener>>>;

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: &str) -> Result<TcpListener, SessionError> {
    Ok(TcpListener::bind(addr).await?)
}

/// Creates TCP message channels
pub struct TcpChannelService {
    local_node_id: String,
    handshake_timeout: Duration,
    keepalive: Option<KeepaliveConfig>,
    next_channel_id: AtomicU64,
    listeners: Arc<ListenerSet>,
}

impl TcpChannelService {
    /// Create a service announcing `local_node_id` in handshakes
    pub fn new(local_node_id: impl Into<String>) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive: Some(KeepaliveConfig::default()),
            next_channel_id: AtomicU64::new(1),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Override the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Override the keepalive settings of new channels
    pub fn with_keepalive(mut self, config: KeepaliveConfig) -> Self {
        self.keepalive = Some(config);
        self
    }

    /// Create channels without heartbeats
    pub fn without_keepalive(mut self) -> Self {
        self.keepalive = None;
        self
    }

    /// Node id announced in handshakes
    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    /// Accept inbound connections until `accepted_tx` is closed. Every
    /// connection that completes the handshake is handed to `accepted_tx`.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        accepted_tx: mpsc::UnboundedSender<ChannelHandle>,
    ) -> Result<(), SessionError> {
        info!(
            "Accepting overlay connections on {}",
            listener.local_addr()?
        );
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = accepted_tx.closed() => return Ok(()),
            };
            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept overlay connection: {}", e);
                    continue;
                }
            };
            debug!("Inbound connection from {}", peer_addr);

            let service = self.clone();
            let accepted_tx = accepted_tx.clone();
            tokio::spawn(async move {
                match service.establish(stream, peer_addr, false).await {
                    Ok(channel) => {
                        info!(
                            "Accepted channel {} from node {} at {}",
                            channel.channel_id(),
                            channel.remote_node_id(),
                            peer_addr
                        );
                        if accepted_tx.send(channel.clone()).is_err() {
                            channel.close().await;
                        }
                    }
                    Err(e) => warn!("Rejected inbound connection from {}: {}", peer_addr, e),
                }
            });
        }
    }

    async fn establish(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        outgoing: bool,
    ) -> Result<ChannelHandle, SessionError> {
        stream.set_nodelay(true)?;
        let channel_id = format!(
            "tcp-{}",
            self.next_channel_id.fetch_add(1, Ordering::Relaxed)
        );
        let converter = MessageConverter::new(channel_id.clone());
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::new();

        let handshake = async {
            if outgoing {
                initiate_handshake(
                    &mut stream,
                    &mut decoder,
                    &mut buffer,
                    &converter,
                    &self.local_node_id,
                )
                .await
            } else {
                accept_handshake(
                    &mut stream,
                    &mut decoder,
                    &mut buffer,
                    &converter,
                    &self.local_node_id,
                )
                .await
            }
        };
        let outcome = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| SessionError::HandshakeTimeout(peer_addr.to_string()))??;

        let (read_half, write_half) = stream.into_split();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let channel = Arc::new_cyclic(|weak| TcpMessageChannel {
            id: channel_id,
            remote_node_id: outcome.remote_node_id,
            peer_addr,
            outgoing,
            converter: converter.clone(),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            state: Mutex::new(MessageChannelState::Established),
            closed_by_remote: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            incoming: Mutex::new(Some(incoming_rx)),
            reader: Mutex::new(None),
            heartbeats: HeartbeatTracker::new(),
            keepalive: Mutex::new(None),
            listeners: self.listeners.clone(),
            self_ref: weak.clone(),
        });

        let reader = tokio::spawn(read_loop(
            Arc::downgrade(&channel),
            read_half,
            decoder,
            buffer,
            incoming_tx,
        ));
        *channel.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(reader);

        if let Some(config) = self.keepalive {
            let keepalive = tokio::spawn(keepalive_loop(Arc::downgrade(&channel), config));
            *channel.keepalive.lock().unwrap_or_else(|e| e.into_inner()) = Some(keepalive);
        }

        Ok(channel)
    }

    fn lifecycle_listeners(&self) -> Vec<Arc<dyn MessageChannelLifecycleListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl MessageChannelService for TcpChannelService {
    async fn connect(
        &self,
        contact_point: &NetworkContactPoint,
    ) -> Result<ChannelHandle, SessionError> {
        let address = contact_point.address();
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| SessionError::Connect {
                target: contact_point.to_string(),
                reason: e.to_string(),
            })?;
        let peer_addr = stream.peer_addr()?;

        let channel = self.establish(stream, peer_addr, true).await?;
        info!(
            "Established channel {} to node {} at {}",
            channel.channel_id(),
            channel.remote_node_id(),
            address
        );
        for listener in self.lifecycle_listeners() {
            listener.on_outgoing_channel_established(&channel);
        }
        Ok(channel)
    }

    async fn close_outgoing_channel(&self, channel: ChannelHandle) {
        debug!("Closing outgoing channel {}", channel.channel_id());
        channel.close().await;
    }

    fn add_lifecycle_listener(&self, listener: Arc<dyn MessageChannelLifecycleListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }
}

/// Message channel over one TCP connection
pub struct TcpMessageChannel {
    id: String,
    remote_node_id: String,
    peer_addr: SocketAddr,
    outgoing: bool,
    converter: MessageConverter,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    state: Mutex<MessageChannelState>,
    closed_by_remote: AtomicBool,
    finalized: AtomicBool,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    heartbeats: HeartbeatTracker,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    listeners: Arc<ListenerSet>,
    self_ref: Weak<TcpMessageChannel>,
}

impl TcpMessageChannel {
    /// Remote socket address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether this side initiated the connection
    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    /// Move from ESTABLISHED to `next`. Returns false if the channel was
    /// already closed or broken.
    fn leave_established(&self, next: MessageChannelState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != MessageChannelState::Established {
            return false;
        }
        *state = next;
        true
    }

    async fn mark_closed_by_remote(&self) {
        let left = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == MessageChannelState::Established {
                *state = MessageChannelState::Closed;
                self.closed_by_remote.store(true, Ordering::SeqCst);
                true
            } else {
                false
            }
        };
        if left {
            info!("Channel {} was closed by the remote side", self.id);
            self.shutdown_writer().await;
            self.finalize();
        }
    }

    async fn mark_broken(&self, reason: &str) {
        if self.leave_established(MessageChannelState::MarkedAsBroken) {
            warn!("Channel {} marked as broken: {}", self.id, reason);
            self.shutdown_writer().await;
            self.finalize();
        }
    }

    async fn shutdown_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                trace!("Shutdown of channel {} failed: {}", self.id, e);
            }
        }
    }

    /// Notify lifecycle listeners exactly once
    fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) || !self.outgoing {
            return;
        }
        let Some(handle) = self.self_ref.upgrade() else {
            return;
        };
        let handle: ChannelHandle = handle;
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener.on_outgoing_channel_terminated(&handle);
        }
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(SessionError::ChannelClosed(self.id.clone()));
        };
        stream.write_all(&frame.encode()).await?;
        Ok(())
    }
}

impl fmt::Debug for TcpMessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpMessageChannel")
            .field("id", &self.id)
            .field("remote_node_id", &self.remote_node_id)
            .field("peer_addr", &self.peer_addr)
            .field("outgoing", &self.outgoing)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl MessageChannel for TcpMessageChannel {
    fn channel_id(&self) -> &str {
        &self.id
    }

    fn remote_node_id(&self) -> &str {
        &self.remote_node_id
    }

    fn state(&self) -> MessageChannelState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed_because_remote_closed(&self) -> bool {
        self.closed_by_remote.load(Ordering::SeqCst)
    }

    async fn send_block(&self, channel_id: u64, block: MessageBlock) -> Result<(), SessionError> {
        if self.state() != MessageChannelState::Established {
            return Err(SessionError::ChannelClosed(self.id.clone()));
        }
        trace!(
            "Channel {} sending {} ({} bytes) on sub-channel {}",
            self.id,
            block.message_type(),
            block.len(),
            channel_id
        );
        if let Err(e) = self.write_frame(Frame::new(channel_id, block)).await {
            self.mark_broken(&e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.leave_established(MessageChannelState::Closed) {
            return;
        }
        debug!("Closing channel {}", self.id);
        if let Some(reader) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reader.abort();
        }
        if let Some(keepalive) = self.keepalive.lock().unwrap_or_else(|e| e.into_inner()).take() {
            keepalive.abort();
        }
        let goodbye = Frame::new(DEFAULT_CHANNEL_ID, self.converter.encode_goodbye());
        if let Err(e) = self.write_frame(goodbye).await {
            debug!("Could not send goodbye on channel {}: {}", self.id, e);
        }
        self.shutdown_writer().await;
        self.finalize();
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        self.incoming.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

async fn read_loop(
    channel: Weak<TcpMessageChannel>,
    mut reader: OwnedReadHalf,
    mut decoder: FrameDecoder,
    mut buffer: BytesMut,
    incoming_tx: mpsc::UnboundedSender<Frame>,
) {
    loop {
        let result = recv_frame(&mut reader, &mut decoder, &mut buffer).await;
        let Some(channel) = channel.upgrade() else {
            return;
        };

        let frame = match result {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                channel.mark_closed_by_remote().await;
                return;
            }
            Err(SessionError::Protocol(e)) => {
                let message = ProtocolErrorType::LowLevelConnectionError.wrap(&e.to_string());
                let goodbye = Frame::new(
                    DEFAULT_CHANNEL_ID,
                    channel.converter.encode_error_goodbye(&message),
                );
                if let Err(send_err) = channel.write_frame(goodbye).await {
                    trace!("Could not send error goodbye: {}", send_err);
                }
                channel.mark_broken(&e.to_string()).await;
                return;
            }
            Err(e) => {
                channel.mark_broken(&e.to_string()).await;
                return;
            }
        };

        channel.heartbeats.on_inbound();

        if frame.channel_id == DEFAULT_CHANNEL_ID {
            match frame.block.message_type() {
                MessageType::Goodbye => {
                    match channel.converter.decode_goodbye(&frame.block) {
                        Ok(Some(message)) => warn!(
                            "Channel {} received error goodbye: {}",
                            channel.id, message
                        ),
                        Ok(None) => debug!("Channel {} received goodbye", channel.id),
                        Err(e) => debug!("Channel {} received invalid goodbye: {}", channel.id, e),
                    }
                    channel.mark_closed_by_remote().await;
                    return;
                }
                MessageType::Heartbeat => {
                    let response = MessageBlock::empty(MessageType::HeartbeatResponse);
                    if let Err(e) = channel.send_block(DEFAULT_CHANNEL_ID, response).await {
                        debug!("Heartbeat response on channel {} failed: {}", channel.id, e);
                    }
                    continue;
                }
                MessageType::HeartbeatResponse => continue,
                _ => {}
            }
        }

        if incoming_tx.send(frame).is_err() {
            trace!("Channel {} has no consumer for inbound frames", channel.id);
        }
    }
}

async fn keepalive_loop(channel: Weak<TcpMessageChannel>, config: KeepaliveConfig) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(channel) = channel.upgrade() else {
            return;
        };
        if channel.state() != MessageChannelState::Established {
            return;
        }

        match channel.heartbeats.on_tick(config.max_missed) {
            KeepaliveAction::SendHeartbeat => {
                let heartbeat = MessageBlock::empty(MessageType::Heartbeat);
                if let Err(e) = channel.send_block(DEFAULT_CHANNEL_ID, heartbeat).await {
                    debug!("Heartbeat on channel {} failed: {}", channel.id, e);
                    return;
                }
            }
            KeepaliveAction::Expired { missed } => {
                channel
                    .mark_broken(&format!("no response to {} heartbeats", missed))
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (ChannelHandle, ChannelHandle, Arc<TcpChannelService>) {
        pair_with(KeepaliveConfig::default()).await
    }

    async fn pair_with(
        keepalive: KeepaliveConfig,
    ) -> (ChannelHandle, ChannelHandle, Arc<TcpChannelService>) {
        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = Arc::new(TcpChannelService::new("server-node").with_keepalive(keepalive));
        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
        tokio::spawn(server.clone().serve(listener, accepted_tx));

        let client = Arc::new(TcpChannelService::new("client-node").with_keepalive(keepalive));
        let outgoing = client
            .connect(&NetworkContactPoint::new("127.0.0.1", port))
            .await
            .unwrap();
        let inbound = accepted_rx.recv().await.unwrap();
        (outgoing, inbound, client)
    }

    #[tokio::test]
    async fn test_blocks_flow_both_ways() {
        let (outgoing, inbound, _client) = pair().await;
        assert_eq!(outgoing.remote_node_id(), "server-node");
        assert_eq!(inbound.remote_node_id(), "client-node");

        let mut server_rx = inbound.take_incoming().unwrap();
        assert!(inbound.take_incoming().is_none());
        outgoing
            .send_block(5, MessageBlock::new(MessageType::Test, &b"ping"[..]).unwrap())
            .await
            .unwrap();
        let frame = server_rx.recv().await.unwrap();
        assert_eq!(frame.channel_id, 5);
        assert_eq!(&frame.block.data()[..], b"ping");

        let mut client_rx = outgoing.take_incoming().unwrap();
        inbound
            .send_block(6, MessageBlock::new(MessageType::Test, &b"pong"[..]).unwrap())
            .await
            .unwrap();
        assert_eq!(client_rx.recv().await.unwrap().channel_id, 6);
    }

    const FAST_KEEPALIVE: KeepaliveConfig = KeepaliveConfig {
        interval: Duration::from_secs(1),
        max_missed: 2,
    };

    #[tokio::test(start_paused = true)]
    async fn test_answered_heartbeats_keep_channel_alive() {
        let (outgoing, inbound, _client) = pair_with(FAST_KEEPALIVE).await;
        let mut server_rx = inbound.take_incoming().unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(outgoing.state(), MessageChannelState::Established);
        assert_eq!(inbound.state(), MessageChannelState::Established);

        // heartbeat traffic is not forwarded to the consumer
        outgoing
            .send_block(3, MessageBlock::empty(MessageType::Test))
            .await
            .unwrap();
        let frame = server_rx.recv().await.unwrap();
        assert_eq!(frame.channel_id, 3);
        assert_eq!(frame.block.message_type(), MessageType::Test);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_marked_broken() {
        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // completes the handshake, then never reads again
        let silent = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let converter = MessageConverter::new("silent");
            let mut decoder = FrameDecoder::new();
            let mut buffer = BytesMut::new();
            accept_handshake(&mut stream, &mut decoder, &mut buffer, &converter, "silent-node")
                .await
                .unwrap();
            stream
        });

        let client = Arc::new(
            TcpChannelService::new("client-node")
                .with_handshake_timeout(Duration::from_secs(3600))
                .with_keepalive(FAST_KEEPALIVE),
        );
        let recorder = Arc::new(TerminationRecorder(Mutex::new(Vec::new())));
        client.add_lifecycle_listener(recorder.clone());
        let outgoing = client
            .connect(&NetworkContactPoint::new("127.0.0.1", port))
            .await
            .unwrap();
        let _stream = silent.await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(outgoing.state(), MessageChannelState::Established);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(outgoing.state(), MessageChannelState::MarkedAsBroken);
        assert_eq!(
            recorder.0.lock().unwrap().clone(),
            vec![(
                outgoing.channel_id().to_string(),
                MessageChannelState::MarkedAsBroken,
                false
            )]
        );
    }

    struct TerminationRecorder(Mutex<Vec<(String, MessageChannelState, bool)>>);

    impl MessageChannelLifecycleListener for TerminationRecorder {
        fn on_outgoing_channel_terminated(&self, channel: &ChannelHandle) {
            self.0.lock().unwrap().push((
                channel.channel_id().to_string(),
                channel.state(),
                channel.is_closed_because_remote_closed(),
            ));
        }
    }

    #[tokio::test]
    async fn test_remote_close_is_reported_once() {
        let (outgoing, inbound, client) = pair().await;
        let recorder = Arc::new(TerminationRecorder(Mutex::new(Vec::new())));
        client.add_lifecycle_listener(recorder.clone());

        inbound.close().await;
        let mut client_rx = outgoing.take_incoming().unwrap();
        assert!(client_rx.recv().await.is_none());

        assert_eq!(outgoing.state(), MessageChannelState::Closed);
        assert!(outgoing.is_closed_because_remote_closed());
        outgoing.close().await;
        let recorded = recorder.0.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec![(
                outgoing.channel_id().to_string(),
                MessageChannelState::Closed,
                true
            )]
        );
        assert!(matches!(
            outgoing
                .send_block(0, MessageBlock::empty(MessageType::Test))
                .await,
            Err(SessionError::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = TcpChannelService::new("client-node");
        let err = client
            .connect(&NetworkContactPoint::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Connect { .. }));
    }
}

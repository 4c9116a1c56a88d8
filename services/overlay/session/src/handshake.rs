//! Handshake protocol for overlay channels.
//!
//! Both sides first write the fixed [`HANDSHAKE_HEADER`], then the initiator
//! sends a HANDSHAKE block carrying its node id and protocol version. The
//! acceptor answers with its own HANDSHAKE block, or with an error GOODBYE
//! if it refuses the connection.

use crate::error::SessionError;
use bytes::BytesMut;
use overlay_wire::{
    Frame, FrameDecoder, HandshakeData, MessageBlock, MessageConverter, MessageType,
    ProtocolError, ProtocolErrorType, DEFAULT_CHANNEL_ID, HANDSHAKE_HEADER,
    HANDSHAKE_KEY_NODE_ID, HANDSHAKE_KEY_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// Message used when a refusing peer sent an empty goodbye
const NO_ERROR_MESSAGE: &str = "<no error message available>";

/// Result of a completed handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Node id announced by the peer
    pub remote_node_id: String,
    /// Full handshake data sent by the peer
    pub remote_data: HandshakeData,
}

/// Build the handshake data announced by this node
pub fn local_handshake_data(local_node_id: &str) -> HandshakeData {
    let mut data = HandshakeData::new();
    data.insert(
        HANDSHAKE_KEY_PROTOCOL_VERSION.to_string(),
        PROTOCOL_VERSION.to_string(),
    );
    data.insert(HANDSHAKE_KEY_NODE_ID.to_string(), local_node_id.to_string());
    data
}

/// Write the protocol header
pub async fn send_header<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), SessionError> {
    writer.write_all(HANDSHAKE_HEADER).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and verify the protocol header
pub async fn recv_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), SessionError> {
    let mut header = [0u8; HANDSHAKE_HEADER.len()];
    reader.read_exact(&mut header).await?;
    if &header != HANDSHAKE_HEADER {
        return Err(ProtocolError::Handshake(format!(
            "unexpected protocol header {:?}",
            String::from_utf8_lossy(&header)
        ))
        .into());
    }
    Ok(())
}

/// Write one block as a frame
pub async fn send_block<W: AsyncWrite + Unpin>(
    writer: &mut W,
    channel_id: u64,
    block: MessageBlock,
) -> Result<(), SessionError> {
    let frame = Frame::new(channel_id, block);
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read frames until one is complete. Bytes following the frame stay in
/// `buffer` for the next call.
pub async fn recv_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
) -> Result<Option<Frame>, SessionError> {
    loop {
        if let Some(frame) = decoder.decode(buffer)? {
            return Ok(Some(frame));
        }

        let bytes_read = reader.read_buf(buffer).await?;
        if bytes_read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed inside a frame",
            )));
        }
        trace!(
            "Read {} bytes, buffer now has {} bytes",
            bytes_read,
            buffer.len()
        );
    }
}

/// Run the initiating side of the handshake
pub async fn initiate_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
    converter: &MessageConverter,
    local_node_id: &str,
) -> Result<HandshakeOutcome, SessionError> {
    send_header(stream).await?;
    let block = converter.encode_handshake(&local_handshake_data(local_node_id))?;
    send_block(stream, DEFAULT_CHANNEL_ID, block).await?;
    debug!("Sent handshake from node {}", local_node_id);

    recv_header(stream).await?;
    let frame = recv_frame(stream, decoder, buffer).await?.ok_or_else(|| {
        ProtocolError::Handshake("connection closed before handshake response".into())
    })?;
    if frame.channel_id != DEFAULT_CHANNEL_ID {
        return Err(ProtocolError::Handshake(format!(
            "handshake response on channel {} instead of {}",
            frame.channel_id, DEFAULT_CHANNEL_ID
        ))
        .into());
    }

    match frame.block.message_type() {
        MessageType::Handshake => {
            let remote_data = converter.decode_handshake(&frame.block)?;
            let outcome = outcome_from(remote_data)?;
            debug!("Handshake with node {} completed", outcome.remote_node_id);
            Ok(outcome)
        }
        MessageType::Goodbye => {
            let raw = converter
                .decode_goodbye(&frame.block)?
                .unwrap_or_else(|| format!("{}: {}", ProtocolErrorType::UNKNOWN_CODE, NO_ERROR_MESSAGE));
            let (error_type, message) = ProtocolErrorType::unwrap_message(&raw);
            warn!("Remote side refused the connection: {}", raw);
            Err(SessionError::Refused {
                error_type,
                message,
            })
        }
        other => Err(ProtocolError::TypeMismatch {
            expected: MessageType::Handshake,
            actual: other,
        }
        .into()),
    }
}

/// Run the accepting side of the handshake. Refusals are reported to the
/// peer with an error GOODBYE before returning the error.
pub async fn accept_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
    converter: &MessageConverter,
    local_node_id: &str,
) -> Result<HandshakeOutcome, SessionError> {
    recv_header(stream).await?;
    send_header(stream).await?;

    let frame = recv_frame(stream, decoder, buffer).await?.ok_or_else(|| {
        ProtocolError::Handshake("connection closed before handshake".into())
    })?;

    let remote_data = if frame.channel_id == DEFAULT_CHANNEL_ID
        && frame.block.message_type() == MessageType::Handshake
    {
        converter.decode_handshake(&frame.block).ok()
    } else {
        None
    };
    let Some(remote_data) = remote_data else {
        return Err(refuse(
            stream,
            converter,
            ProtocolErrorType::InvalidHandshakeData,
            "expected a handshake message",
        )
        .await);
    };

    let remote_version = remote_data
        .get(HANDSHAKE_KEY_PROTOCOL_VERSION)
        .map(String::as_str)
        .unwrap_or_default();
    if remote_version != PROTOCOL_VERSION {
        let message = format!(
            "protocol version mismatch: local {}, remote {}",
            PROTOCOL_VERSION, remote_version
        );
        return Err(refuse(
            stream,
            converter,
            ProtocolErrorType::ProtocolVersionMismatch,
            &message,
        )
        .await);
    }

    let outcome = match outcome_from(remote_data) {
        Ok(outcome) => outcome,
        Err(_) => {
            return Err(refuse(
                stream,
                converter,
                ProtocolErrorType::InvalidHandshakeData,
                "missing node id",
            )
            .await)
        }
    };

    let response = converter.encode_handshake(&local_handshake_data(local_node_id))?;
    send_block(stream, DEFAULT_CHANNEL_ID, response).await?;
    debug!("Accepted handshake from node {}", outcome.remote_node_id);
    Ok(outcome)
}

fn outcome_from(remote_data: HandshakeData) -> Result<HandshakeOutcome, SessionError> {
    let remote_node_id = remote_data
        .get(HANDSHAKE_KEY_NODE_ID)
        .filter(|id| !id.is_empty())
        .cloned()
        .ok_or_else(|| ProtocolError::Handshake("handshake data lacks a node id".into()))?;
    Ok(HandshakeOutcome {
        remote_node_id,
        remote_data,
    })
}

async fn refuse<W: AsyncWrite + Unpin>(
    writer: &mut W,
    converter: &MessageConverter,
    error_type: ProtocolErrorType,
    message: &str,
) -> SessionError {
    let wrapped = error_type.wrap(message);
    warn!("Refusing incoming connection: {}", wrapped);
    let goodbye = converter.encode_error_goodbye(&wrapped);
    if let Err(e) = send_block(writer, DEFAULT_CHANNEL_ID, goodbye).await {
        debug!("Failed to send error goodbye: {}", e);
    }
    SessionError::Refused {
        error_type: Some(error_type),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_pair(
        client_id: &'static str,
        server: impl FnOnce(tokio::io::DuplexStream) -> tokio::task::JoinHandle<Result<HandshakeOutcome, SessionError>>,
    ) -> (
        Result<HandshakeOutcome, SessionError>,
        Result<HandshakeOutcome, SessionError>,
    ) {
        let (mut client, server_side) = tokio::io::duplex(4096);
        let server_task = server(server_side);
        let converter = MessageConverter::new("client");
        let client_result = initiate_handshake(
            &mut client,
            &mut FrameDecoder::new(),
            &mut BytesMut::new(),
            &converter,
            client_id,
        )
        .await;
        (client_result, server_task.await.unwrap())
    }

    fn accepting_server(
        stream: tokio::io::DuplexStream,
    ) -> tokio::task::JoinHandle<Result<HandshakeOutcome, SessionError>> {
        tokio::spawn(async move {
            let mut stream = stream;
            accept_handshake(
                &mut stream,
                &mut FrameDecoder::new(),
                &mut BytesMut::new(),
                &MessageConverter::new("server"),
                "server-node",
            )
            .await
        })
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (client, server) = run_pair("client-node", accepting_server).await;
        assert_eq!(client.unwrap().remote_node_id, "server-node");
        let server = server.unwrap();
        assert_eq!(server.remote_node_id, "client-node");
        assert_eq!(
            server.remote_data.get(HANDSHAKE_KEY_PROTOCOL_VERSION).map(String::as_str),
            Some(PROTOCOL_VERSION)
        );
    }

    #[tokio::test]
    async fn test_missing_node_id_is_refused() {
        let (client, server) = run_pair("", accepting_server).await;
        assert!(matches!(
            client,
            Err(SessionError::Refused {
                error_type: Some(ProtocolErrorType::InvalidHandshakeData),
                ..
            })
        ));
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn test_version_mismatch_is_refused() {
        let (client, server) = tokio::io::duplex(4096);
        let server_task = accepting_server(server);

        let mut client = client;
        let converter = MessageConverter::new("client");
        send_header(&mut client).await.unwrap();
        let mut data = local_handshake_data("old-node");
        data.insert(HANDSHAKE_KEY_PROTOCOL_VERSION.to_string(), "0.1".to_string());
        send_block(&mut client, DEFAULT_CHANNEL_ID, converter.encode_handshake(&data).unwrap())
            .await
            .unwrap();

        recv_header(&mut client).await.unwrap();
        let frame = recv_frame(&mut client, &mut FrameDecoder::new(), &mut BytesMut::new())
            .await
            .unwrap()
            .unwrap();
        let goodbye = converter.decode_goodbye(&frame.block).unwrap().unwrap();
        let (error_type, _) = ProtocolErrorType::unwrap_message(&goodbye);
        assert_eq!(error_type, Some(ProtocolErrorType::ProtocolVersionMismatch));

        assert!(matches!(
            server_task.await.unwrap(),
            Err(SessionError::Refused {
                error_type: Some(ProtocolErrorType::ProtocolVersionMismatch),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_response_on_other_channel_is_rejected() {
        let (client, server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut server = server;
            let converter = MessageConverter::new("server");
            recv_header(&mut server).await.unwrap();
            send_header(&mut server).await.unwrap();
            recv_frame(&mut server, &mut FrameDecoder::new(), &mut BytesMut::new())
                .await
                .unwrap()
                .unwrap();
            let response = converter
                .encode_handshake(&local_handshake_data("server-node"))
                .unwrap();
            send_block(&mut server, 5, response).await.unwrap();
            server
        });

        let mut client = client;
        let result = initiate_handshake(
            &mut client,
            &mut FrameDecoder::new(),
            &mut BytesMut::new(),
            &MessageConverter::new("client"),
            "client-node",
        )
        .await;
        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::Handshake(_)))
        ));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_header() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"SOMETHING-ELSE/9").await.unwrap();
        let err = recv_header(&mut server).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_recv_frame_keeps_trailing_bytes() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut bytes = Frame::new(3, MessageBlock::empty(MessageType::Heartbeat)).encode().to_vec();
        bytes.extend_from_slice(&Frame::new(4, MessageBlock::empty(MessageType::Test)).encode());
        client.write_all(&bytes).await.unwrap();
        drop(client);

        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::new();
        let first = recv_frame(&mut server, &mut decoder, &mut buffer).await.unwrap().unwrap();
        let second = recv_frame(&mut server, &mut decoder, &mut buffer).await.unwrap().unwrap();
        assert_eq!(first.channel_id, 3);
        assert_eq!(second.block.message_type(), MessageType::Test);
        assert!(recv_frame(&mut server, &mut decoder, &mut buffer).await.unwrap().is_none());
    }
}

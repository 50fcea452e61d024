//! WS socket setup: the upgrade exchange before framing starts.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::head::{self, MAX_HEAD_BYTES};
use crate::protocol::ws::handshake::{self, HandshakeError};
use crate::protocol::{Role, WsProtocol};
use crate::socket::driver::Established;
use crate::socket::{SocketOptions, TransportError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the upgrade for this side's role and hand back the framing state plus
/// any bytes that arrived after the handshake head.
pub(super) async fn upgrade<S>(options: &SocketOptions, mut stream: S) -> Result<Established<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let leftover = tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange(options, &mut stream))
        .await
        .map_err(|_| TransportError::Timeout)??;

    let protocol = WsProtocol::with_limit(options.role, options.codec.clone(), options.max_message_bytes);
    Ok((stream, Box::new(protocol), leftover))
}

async fn exchange<S>(options: &SocketOptions, stream: &mut S) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match options.role {
        Role::Client => {
            let key = handshake::generate_key();
            let request = handshake::client_request(&options.host, options.port, &options.origin, &key);
            stream.write_all(request.as_bytes()).await?;
            let (response, leftover) = read_head(stream).await?;
            handshake::verify_response(&response, &key)?;
            tracing::debug!(host = %options.host, port = options.port, "Upgrade accepted");
            Ok(leftover)
        }
        Role::Remote => {
            let (request, leftover) = read_head(stream).await?;
            let key = handshake::verify_request(&request)?;
            let response = handshake::server_response(&options.origin, &handshake::accept_key(&key));
            stream.write_all(response.as_bytes()).await?;
            tracing::debug!(host = %options.host, port = options.port, "Upgrade completed");
            Ok(leftover)
        }
    }
}

/// Read until the blank line; returns the head and whatever followed it.
async fn read_head<S>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>), TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = head::find_end(&buffer) {
            let leftover = buffer.split_off(end);
            return Ok((buffer, leftover));
        }
        if buffer.len() > MAX_HEAD_BYTES {
            return Err(HandshakeError::TooLarge(MAX_HEAD_BYTES).into());
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Closed.into());
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::config::TunnelConfig;
    use std::sync::Arc;

    fn options(role: Role) -> SocketOptions {
        SocketOptions::from_config(&TunnelConfig::default(), role, Arc::new(JsonCodec::default()))
    }

    #[tokio::test]
    async fn both_roles_complete_and_keep_leftover_bytes() {
        let (a, b) = tokio::io::duplex(4096);
        let client = tokio::spawn(async move { upgrade(&options(Role::Client), a).await });

        let remote = async move {
            let (mut stream, _protocol, leftover) = upgrade(&options(Role::Remote), b).await.expect("remote");
            assert!(leftover.is_empty());
            stream.write_all(b"early").await.expect("write");
            stream
        };
        let _remote_stream = remote.await;

        let (_, protocol, leftover) = client.await.expect("join").expect("client");
        assert_eq!(protocol.name(), "ws");
        // bytes written right after the 101 may arrive with the head
        assert!(leftover.is_empty() || leftover == b"early".to_vec());
    }

    #[tokio::test]
    async fn client_rejects_wrong_subprotocol() {
        let (a, mut b) = tokio::io::duplex(4096);
        let client = tokio::spawn(async move { upgrade(&options(Role::Client), a).await });

        let (request, _) = read_head(&mut b).await.expect("request");
        let key = handshake::verify_request(&request).expect("valid request");
        let response = handshake::server_response("x", &handshake::accept_key(&key))
            .replace(handshake::SUBPROTOCOL, "other");
        b.write_all(response.as_bytes()).await.expect("write");

        let result = client.await.expect("join");
        assert!(matches!(
            result,
            Err(TransportError::Handshake(HandshakeError::Subprotocol(_)))
        ));
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        b.write_all(&vec![b'a'; MAX_HEAD_BYTES + 2048]).await.expect("write");
        let result = read_head(&mut a).await;
        assert!(matches!(
            result,
            Err(TransportError::Handshake(HandshakeError::TooLarge(_)))
        ));
    }
}

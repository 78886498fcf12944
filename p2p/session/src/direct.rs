//! Direct connections: the NAT-traversed fast path.
//!
//! Both roles open with the fixed `foo` preamble, then exchange a handshake
//! frame carrying a nonce GUID. The listener verifies the presented nonce
//! (hashing it first when the negotiation advertised a hashed nonce) and
//! echoes it back so the connector can verify the same way. Authenticated
//! sockets then carry ordinary framed messages with no relay footer, feeding
//! the same message pump as relay traffic.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use p2p_wire::{
    encode_frame, encode_handshake, parse_handshake, DirectFrameDecoder, Message, WireVersion,
    FOO_PAYLOAD, FOO_PREAMBLE,
};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{MessagePump, MessageProcessor};
use crate::config::P2pConfig;
use crate::error::SessionError;

/// Derives the hashed form of a handshake nonce: SHA-256 over the GUID's
/// little-endian bytes, truncated to 16 bytes and read back as a GUID.
pub fn hash_nonce(nonce: Uuid) -> Uuid {
    let digest = Sha256::digest(nonce.to_bytes_le());
    let mut truncated = [0u8; 16];
    truncated.copy_from_slice(&digest[..16]);
    Uuid::from_bytes_le(truncated)
}

/// Handshake verification state for one direct connection
#[derive(Clone, Copy, Debug)]
pub struct AuthState {
    /// Nonce the peer must present
    pub expected: Uuid,
    /// Whether presented nonces are hashed before comparison
    pub hash_incoming: bool,
}

impl AuthState {
    /// Checks a presented nonce against the expected one.
    pub fn verify(&self, presented: Uuid) -> bool {
        if self.hash_incoming {
            hash_nonce(presented) == self.expected
        } else {
            presented == self.expected
        }
    }
}

async fn read_frame<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    decoder: &mut DirectFrameDecoder,
) -> Result<Bytes, SessionError>
where
    S: AsyncReadExt + Unpin,
{
    loop {
        if let Some(frame) = decoder.decode(buf)? {
            return Ok(frame);
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(SessionError::ConnectionClosed);
        }
    }
}

/// Runs the listener side of the handshake on an accepted socket.
///
/// Returns the verified nonce the peer presented, already echoed back.
pub async fn accept_handshake<S>(stream: &mut S, auth: AuthState) -> Result<Uuid, SessionError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    stream.write_all(&FOO_PREAMBLE).await?;

    let mut decoder = DirectFrameDecoder::new();
    let mut buf = BytesMut::with_capacity(256);
    let opener = read_frame(stream, &mut buf, &mut decoder).await?;
    if opener.as_ref() != FOO_PAYLOAD {
        warn!("direct connection opened without the foo preamble");
        return Err(SessionError::AuthFailed);
    }

    let frame = read_frame(stream, &mut buf, &mut decoder).await?;
    let presented = parse_handshake(&frame)?;
    if !auth.verify(presented) {
        warn!(presented = %presented, "handshake nonce mismatch");
        return Err(SessionError::AuthFailed);
    }

    stream.write_all(&encode_handshake(presented)).await?;
    Ok(presented)
}

/// Runs the connector side of the handshake on a fresh socket.
///
/// Presents `nonce` and verifies the listener's echo against `auth`.
pub async fn connect_handshake<S>(
    stream: &mut S,
    nonce: Uuid,
    auth: AuthState,
) -> Result<Uuid, SessionError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    stream.write_all(&FOO_PREAMBLE).await?;

    let mut decoder = DirectFrameDecoder::new();
    let mut buf = BytesMut::with_capacity(256);
    let opener = read_frame(stream, &mut buf, &mut decoder).await?;
    if opener.as_ref() != FOO_PAYLOAD {
        warn!("listener answered without the foo preamble");
        return Err(SessionError::AuthFailed);
    }

    stream.write_all(&encode_handshake(nonce)).await?;

    let frame = read_frame(stream, &mut buf, &mut decoder).await?;
    let echoed = parse_handshake(&frame)?;
    if !auth.verify(echoed) {
        warn!(echoed = %echoed, "handshake echo mismatch");
        return Err(SessionError::AuthFailed);
    }
    Ok(echoed)
}

/// Binds a listener on the first available probe port.
pub async fn bind_listener(config: &P2pConfig) -> Result<TcpListener, SessionError> {
    let mut last_err = None;
    for port in config.probe_ports() {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                debug!(port, "listening for direct connection");
                return Ok(listener);
            }
            Err(err) => {
                debug!(port, error = %err, "probe port unavailable");
                last_err = Some(err);
            }
        }
    }
    Err(last_err
        .map(SessionError::Io)
        .unwrap_or(SessionError::InvalidOperation("no ports configured to probe")))
}

/// Waits for one inbound connection and authenticates it.
///
/// The expiry timer is single-shot: it is disarmed the moment an accept
/// succeeds and only covers the wait for the connection itself.
pub async fn run_listener(
    listener: TcpListener,
    expiry: Duration,
    auth: AuthState,
) -> Result<(TcpStream, Uuid), SessionError> {
    let timer = tokio::time::sleep(expiry);
    tokio::pin!(timer);

    let (mut stream, peer) = tokio::select! {
        accepted = listener.accept() => accepted?,
        _ = &mut timer => {
            debug!("listener expired before a connection arrived");
            return Err(SessionError::Expired);
        }
    };
    drop(listener);

    info!(%peer, "direct connection accepted");
    let presented = accept_handshake(&mut stream, auth).await?;
    Ok((stream, presented))
}

/// An authenticated direct connection.
///
/// The reader half feeds inbound frames to the shared message pump; the
/// writer half is exposed as a [`MessageProcessor`] so the outbound
/// scheduler can be pointed at it.
pub struct DirectConnection {
    peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    closed: Arc<AtomicBool>,
}

impl DirectConnection {
    /// Takes over an authenticated socket and spawns its reader task.
    pub fn spawn(stream: TcpStream, version: WireVersion, pump: Arc<MessagePump>) -> Arc<Self> {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read_half, write_half) = stream.into_split();
        let closed = Arc::new(AtomicBool::new(false));

        let reader_closed = Arc::clone(&closed);
        tokio::spawn(run_reader(read_half, version, pump, reader_closed, peer));

        Arc::new(Self {
            peer,
            writer: Mutex::new(write_half),
            closed,
        })
    }

    /// Remote endpoint of the socket
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the reader half has observed the socket closing
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn run_reader(
    mut read_half: OwnedReadHalf,
    version: WireVersion,
    pump: Arc<MessagePump>,
    closed: Arc<AtomicBool>,
    peer: SocketAddr,
) {
    let mut decoder = DirectFrameDecoder::new();
    let mut buf = BytesMut::with_capacity(4096);
    'read: loop {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(mut frame)) => match Message::decode_bare(version, &mut frame) {
                    Ok(message) => pump.ingest(message, false),
                    Err(err) => warn!(%peer, error = %err, "undecodable direct frame"),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(%peer, error = %err, "direct framing error");
                    break 'read;
                }
            }
        }
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                info!(%peer, "direct connection closed by peer");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%peer, error = %err, "direct read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
}

#[async_trait]
impl MessageProcessor for DirectConnection {
    async fn send_message(&self, message: Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::ConnectionClosed);
        }
        let frame = encode_frame(&message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{HandlerRegistry, MessageHandler, Outbound};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct NullProcessor;

    #[async_trait]
    impl MessageProcessor for NullProcessor {
        async fn send_message(&self, _message: Message) -> Result<(), SessionError> {
            Ok(())
        }
    }

    struct ForwardingHandler {
        tx: mpsc::UnboundedSender<Message>,
    }

    impl MessageHandler for ForwardingHandler {
        fn handle_message(&self, message: &Message) -> bool {
            self.tx.send(message.clone()).is_ok()
        }
    }

    fn pump_with_capture() -> (Arc<MessagePump>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(ForwardingHandler { tx }));
        let outbound = Outbound::new(Arc::new(NullProcessor), 1352);
        (Arc::new(MessagePump::new(registry, outbound)), rx)
    }

    #[test]
    fn test_hash_nonce_verification() {
        let nonce = Uuid::new_v4();
        let hashed = hash_nonce(nonce);
        assert_ne!(hashed, nonce);
        assert_eq!(hashed, hash_nonce(nonce));

        let hashing = AuthState {
            expected: hashed,
            hash_incoming: true,
        };
        assert!(hashing.verify(nonce));
        assert!(!hashing.verify(Uuid::new_v4()));

        let plain = AuthState {
            expected: nonce,
            hash_incoming: false,
        };
        assert!(plain.verify(nonce));
        assert!(!plain.verify(hashed));
    }

    #[tokio::test]
    async fn test_handshake_with_hashed_nonce() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let nonce = Uuid::new_v4();

        let listener_auth = AuthState {
            expected: hash_nonce(nonce),
            hash_incoming: true,
        };
        let accepting = tokio::spawn(run_listener(listener, Duration::from_secs(5), listener_auth));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let connector_auth = AuthState {
            expected: nonce,
            hash_incoming: false,
        };
        let echoed = timeout(
            Duration::from_secs(2),
            connect_handshake(&mut client, nonce, connector_auth),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(echoed, nonce);

        let (_stream, presented) = timeout(Duration::from_secs(2), accepting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(presented, nonce);
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_nonce() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let nonce = Uuid::new_v4();
        let wrong = Uuid::new_v4();

        let listener_auth = AuthState {
            expected: hash_nonce(nonce),
            hash_incoming: true,
        };
        let accepting = tokio::spawn(run_listener(listener, Duration::from_secs(5), listener_auth));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let connector_auth = AuthState {
            expected: wrong,
            hash_incoming: false,
        };
        let connect_result = timeout(
            Duration::from_secs(2),
            connect_handshake(&mut client, wrong, connector_auth),
        )
        .await
        .unwrap();
        assert!(connect_result.is_err());

        let accept_result = timeout(Duration::from_secs(2), accepting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(accept_result, Err(SessionError::AuthFailed)));
    }

    #[tokio::test]
    async fn test_listener_rejects_bad_preamble() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let auth = AuthState {
            expected: Uuid::new_v4(),
            hash_incoming: false,
        };
        let accepting = tokio::spawn(run_listener(listener, Duration::from_secs(5), auth));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"\x04\x00\x00\x00bar\x00")
            .await
            .unwrap();

        let result = timeout(Duration::from_secs(2), accepting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SessionError::AuthFailed)));
    }

    #[tokio::test]
    async fn test_listener_expires_without_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let auth = AuthState {
            expected: Uuid::new_v4(),
            hash_incoming: false,
        };
        let result = timeout(
            Duration::from_secs(1),
            run_listener(listener, Duration::from_millis(50), auth),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(SessionError::Expired)));
    }

    #[tokio::test]
    async fn test_connection_survives_past_expiry_and_carries_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let nonce = Uuid::new_v4();

        let listener_auth = AuthState {
            expected: nonce,
            hash_incoming: false,
        };
        let expiry = Duration::from_millis(100);
        let accepting = tokio::spawn(run_listener(listener, expiry, listener_auth));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let connector_auth = AuthState {
            expected: nonce,
            hash_incoming: false,
        };
        connect_handshake(&mut client, nonce, connector_auth)
            .await
            .unwrap();
        let (server_stream, _) = timeout(Duration::from_secs(2), accepting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let (server_pump, mut server_rx) = pump_with_capture();
        let _server_conn = DirectConnection::spawn(server_stream, WireVersion::V1, server_pump);
        let (client_pump, _client_rx) = pump_with_capture();
        let client_conn = DirectConnection::spawn(client, WireVersion::V1, client_pump);

        // Outlive the (already disarmed) expiry timer before sending
        tokio::time::sleep(expiry * 2).await;

        let mut message = Message::with_body(WireVersion::V1, Bytes::from(vec![0x5A; 2048]));
        message.set_identifier(7);
        message.set_session_id(31);
        client_conn.send_message(message).await.unwrap();

        let delivered = timeout(Duration::from_secs(2), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.body().len(), 2048);
        assert_eq!(delivered.session_id(), 31);
        assert!(!client_conn.is_closed());
    }
}

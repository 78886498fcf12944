//! Direct-connection probe binary.
//!
//! Listens for or dials a messenger direct connection, runs the foo/nonce
//! handshake, then prints every data frame that arrives. Useful for checking
//! port reachability and handshake behavior without a full messenger stack.

use std::net::SocketAddr;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use clap::Parser;
use p2p_session::{
    bind_listener, connect_handshake, hash_nonce, run_listener, AuthState, P2pConfig,
};
use p2p_wire::{encode_frame, DirectFrameDecoder, Message, WireVersion};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Messenger P2P direct-connection probe
#[derive(Parser, Debug)]
#[command(name = "msnp2p", version, about = "Messenger P2P direct-connection probe")]
struct Args {
    /// Listen for an inbound direct connection instead of dialing out
    #[arg(long, conflicts_with = "connect")]
    listen: bool,

    /// Connect to a listening peer, e.g. 127.0.0.1:1119
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Handshake nonce GUID; generated when omitted
    #[arg(long)]
    nonce: Option<Uuid>,

    /// Verify the peer's presented nonce through its SHA-256 hash (listener)
    #[arg(long)]
    hashed: bool,

    /// Text payload to send once the handshake completes
    #[arg(long)]
    send: Option<String>,

    /// Wire version for data frames (1 or 2)
    #[arg(long, default_value = "1")]
    wire_version: u8,

    /// First port of the listen probe range
    #[arg(long, default_value = "1119")]
    probe_port: u16,

    /// How long the listener waits for a connection, e.g. 12s
    #[arg(long, default_value = "12s")]
    expiry: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(format!("msnp2p={}", args.log_level).parse()?)
        .add_directive(format!("p2p_session={}", args.log_level).parse()?)
        .add_directive(format!("p2p_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!("Starting msnp2p probe v{}", env!("CARGO_PKG_VERSION"));

    let version = match args.wire_version {
        1 => WireVersion::V1,
        2 => WireVersion::V2,
        other => anyhow::bail!("unsupported wire version {other}"),
    };
    let nonce = args.nonce.unwrap_or_else(Uuid::new_v4);
    info!(%nonce, hashed = args.hashed, "using handshake nonce");

    let stream = if args.listen {
        listen(&args, nonce).await?
    } else {
        dial(&args, nonce).await?
    };

    run_probe(stream, version, args.send).await
}

/// Binds a probe port, waits for one connection and authenticates it.
async fn listen(args: &Args, nonce: Uuid) -> anyhow::Result<TcpStream> {
    let config = P2pConfig {
        probe_port_base: args.probe_port,
        listener_expiry: args.expiry.into(),
        ..P2pConfig::default()
    };
    let listener = bind_listener(&config)
        .await
        .context("no probe port available")?;
    let local = listener.local_addr()?;
    info!(%local, "listening for a direct connection");

    let auth = if args.hashed {
        AuthState {
            expected: hash_nonce(nonce),
            hash_incoming: true,
        }
    } else {
        AuthState {
            expected: nonce,
            hash_incoming: false,
        }
    };
    let (stream, presented) = run_listener(listener, config.listener_expiry, auth).await?;
    info!(%presented, "handshake verified");
    Ok(stream)
}

/// Dials the peer and runs the connector side of the handshake.
async fn dial(args: &Args, nonce: Uuid) -> anyhow::Result<TcpStream> {
    let peer = args.connect.context("--connect or --listen is required")?;
    let mut stream = TcpStream::connect(peer)
        .await
        .with_context(|| format!("connecting to {peer}"))?;
    info!(%peer, "connected; running the handshake");

    let auth = AuthState {
        expected: nonce,
        hash_incoming: false,
    };
    let echoed = connect_handshake(&mut stream, nonce, auth).await?;
    info!(%echoed, "handshake verified");
    Ok(stream)
}

/// Optionally sends a text payload, then prints inbound frames until EOF.
async fn run_probe(
    mut stream: TcpStream,
    version: WireVersion,
    payload: Option<String>,
) -> anyhow::Result<()> {
    if let Some(text) = payload {
        let mut message = Message::with_body(version, Bytes::from(text.into_bytes()));
        message.set_identifier(1);
        let frame = encode_frame(&message)?;
        stream.write_all(&frame).await?;
        info!("payload sent");
    }

    let mut decoder = DirectFrameDecoder::new();
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; closing");
                return Ok(());
            }
            read = stream.read_buf(&mut buf) => {
                if read? == 0 {
                    info!("peer closed the connection");
                    return Ok(());
                }
                while let Some(mut frame) = decoder.decode(&mut buf)? {
                    match Message::decode_bare(version, &mut frame) {
                        Ok(message) => print_frame(&message),
                        Err(err) => warn!(error = %err, "undecodable frame"),
                    }
                }
            }
        }
    }
}

fn print_frame(message: &Message) {
    match std::str::from_utf8(message.body()) {
        Ok(text) if !text.is_empty() => info!(
            session_id = message.session_id(),
            identifier = message.identifier(),
            size = message.body().len(),
            "frame: {text:?}"
        ),
        _ => info!(
            session_id = message.session_id(),
            identifier = message.identifier(),
            size = message.body().len(),
            "binary frame"
        ),
    }
}

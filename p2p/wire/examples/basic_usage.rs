//! Basic usage example for the messenger P2P wire protocol.

use bytes::Bytes;
use p2p_wire::{
    encode_frame, DirectFrameDecoder, Message, MessagePool, SlpContentType, SlpMessage,
    WireVersion, METHOD_INVITE,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Messenger P2P Wire Protocol Example ===\n");

    // 1. Create a basic data message
    println!("1. Creating a basic V1 data message...");
    let mut message = Message::with_body(WireVersion::V1, Bytes::from_static(b"Hello, peer!"));
    message.set_identifier(42);
    message.set_session_id(1000);

    println!("   Identifier: {}", message.identifier());
    println!("   Session id: {}", message.session_id());
    println!("   Body size: {} bytes", message.body().len());

    // 2. Encode for the relay transport and decode it back
    println!("\n2. Encoding for the relay transport...");
    let mut encoded = message.encode()?;
    println!("   Encoded size: {} bytes", encoded.len());

    let decoded = Message::decode(WireVersion::V1, &mut encoded)?;
    println!("   Decoded identifier: {}", decoded.identifier());
    println!("   Payload: {:?}", std::str::from_utf8(decoded.body()));

    // 3. Split an oversized message into chunks
    println!("\n3. Splitting an oversized message...");
    let mut large = Message::with_body(WireVersion::V1, Bytes::from(vec![0x42u8; 5000]));
    large.set_identifier(100);
    large.set_session_id(1000);

    let chunks = large.split(1202);
    println!("   Split into {} chunks", chunks.len());

    // 4. Reassemble the chunks through the message pool
    println!("\n4. Reassembling through the message pool...");
    let pool = MessagePool::new();
    for chunk in chunks {
        pool.push(chunk);
    }

    if pool.has_available(WireVersion::V1) {
        let complete = pool.pop(WireVersion::V1);
        println!("   Reassembled size: {} bytes", complete.body().len());
        println!(
            "   Original matches reassembled: {}",
            complete.body() == large.body()
        );
    }

    // 5. Build and parse a session invitation
    println!("\n5. Working with SLP signaling...");
    let mut invite = SlpMessage::request(
        METHOD_INVITE,
        "bob@example.com",
        "alice@example.com",
        SlpContentType::SessionReq,
    );
    invite.set_field("SessionID", "1000");
    invite.set_field("AppID", "2");

    let parsed = SlpMessage::parse(&invite.to_bytes())?;
    println!("   Call id: {}", parsed.call_id);
    if let Some(session_id) = parsed.field("SessionID") {
        println!("   SessionID: {}", session_id);
    }

    // 6. Frame a message for a direct connection
    println!("\n6. Framing for a direct connection...");
    let frame = encode_frame(&message)?;
    println!("   Framed size: {} bytes", frame.len());

    let mut decoder = DirectFrameDecoder::new();
    let mut buf = bytes::BytesMut::from(frame.as_ref());
    if let Some(mut payload) = decoder.decode(&mut buf)? {
        let received = Message::decode_bare(WireVersion::V1, &mut payload)?;
        println!("   Decoded payload: {:?}", std::str::from_utf8(received.body()));
    }

    println!("\n=== Example completed successfully! ===");
    Ok(())
}

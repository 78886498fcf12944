//! Message transport plumbing shared by the relay and direct paths.
//!
//! A connection owns one [`Outbound`] scheduler and one [`MessagePump`].
//! Outgoing messages queue on the scheduler, which stamps identifiers,
//! splits oversized payloads and writes chunks to the active
//! [`MessageProcessor`]. Incoming messages run through the message pool and
//! complete ones fan out to the [`HandlerRegistry`].

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use p2p_wire::{Message, MessagePool, SlpMessage, TransferFlow, WireVersion};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::SessionError;

/// A transport able to carry framed messages to the peer.
///
/// Implemented by the relay bridge the embedding client supplies and by an
/// authenticated direct connection.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Queues one message for delivery.
    async fn send_message(&self, message: Message) -> Result<(), SessionError>;
}

/// A consumer of complete inbound messages.
pub trait MessageHandler: Send + Sync {
    /// Handles one complete message. Returns `true` when consumed.
    fn handle_message(&self, message: &Message) -> bool;
}

/// Registration table fanning complete messages out to consumers
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<Mutex<Vec<Arc<dyn MessageHandler>>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a consumer.
    pub fn register(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .lock()
            .expect("handler lock poisoned")
            .push(handler);
    }

    /// Removes a previously registered consumer.
    pub fn unregister(&self, handler: &Arc<dyn MessageHandler>) {
        self.handlers
            .lock()
            .expect("handler lock poisoned")
            .retain(|h| !Arc::ptr_eq(h, handler));
    }

    /// Offers a message to every consumer.
    ///
    /// Dispatch happens on a snapshot taken under the lock, so a consumer
    /// may register or unregister from inside its callback.
    pub fn dispatch(&self, message: &Message) -> bool {
        let snapshot: Vec<_> = self
            .handlers
            .lock()
            .expect("handler lock poisoned")
            .clone();
        let mut handled = false;
        for handler in snapshot {
            handled |= handler.handle_message(message);
        }
        handled
    }
}

struct OutboundShared {
    scheduler_id: Uuid,
    v1_sequence: AtomicU32,
    v2_sequence: AtomicU32,
    max_chunk: AtomicUsize,
    processor: Mutex<Arc<dyn MessageProcessor>>,
}

impl OutboundShared {
    /// Assigns an identifier from the per-version sequencer when the caller
    /// left it at 0. V1 identifiers are consecutive; V2 identifiers advance
    /// by the payload size so acks can be correlated by byte position.
    fn stamp(&self, message: &mut Message) {
        if message.identifier() != 0 {
            return;
        }
        let identifier = match message.version() {
            WireVersion::V1 => self
                .v1_sequence
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1),
            WireVersion::V2 => {
                let advance = message.body().len() as u32;
                self.v2_sequence.fetch_add(advance, Ordering::Relaxed)
            }
        };
        message.set_identifier(identifier);
    }
}

/// Per-connection outbound scheduler.
///
/// Messages queue on an unbounded channel; a spawned task stamps missing
/// identifiers, splits payloads to the current chunk limit and writes the
/// chunks to the active processor. Swapping the processor reroutes
/// subsequent traffic without disturbing queued senders.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
    shared: Arc<OutboundShared>,
}

impl Outbound {
    /// Creates the scheduler and spawns its delivery task.
    pub fn new(processor: Arc<dyn MessageProcessor>, max_chunk: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let mut rng = rand::thread_rng();
        let shared = Arc::new(OutboundShared {
            scheduler_id: Uuid::new_v4(),
            // Randomized bases, kept clear of the wrap so freshly stamped
            // identifiers are never 0.
            v1_sequence: AtomicU32::new(rng.gen_range(4_000..2_000_000_000)),
            v2_sequence: AtomicU32::new(rng.gen_range(4_000..2_000_000_000)),
            max_chunk: AtomicUsize::new(max_chunk.max(1)),
            processor: Mutex::new(processor),
        });
        let worker = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(mut message) = rx.recv().await {
                worker.stamp(&mut message);
                let max_chunk = worker.max_chunk.load(Ordering::Relaxed);
                let processor = worker
                    .processor
                    .lock()
                    .expect("processor lock poisoned")
                    .clone();
                for chunk in message.split(max_chunk) {
                    trace!(
                        scheduler = %worker.scheduler_id,
                        identifier = chunk.identifier(),
                        session_id = chunk.session_id(),
                        size = chunk.message_size(),
                        "sending chunk"
                    );
                    if let Err(err) = processor.send_message(chunk).await {
                        warn!(scheduler = %worker.scheduler_id, error = %err, "send failed");
                    }
                }
            }
            debug!(scheduler = %worker.scheduler_id, "outbound scheduler stopped");
        });
        Self { tx, shared }
    }

    /// Id of this scheduler, for correlation in traces
    pub fn scheduler_id(&self) -> Uuid {
        self.shared.scheduler_id
    }

    /// Queues a message. An identifier of 0 is assigned by the sequencer.
    pub fn send(&self, message: Message) -> Result<(), SessionError> {
        self.tx
            .send(message)
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// Points the scheduler at a different transport and chunk limit.
    pub fn switch_processor(&self, processor: Arc<dyn MessageProcessor>, max_chunk: usize) {
        self.shared.max_chunk.store(max_chunk.max(1), Ordering::Relaxed);
        *self
            .shared
            .processor
            .lock()
            .expect("processor lock poisoned") = processor;
    }
}

/// Inbound side of a connection.
///
/// Pools fragments until complete, acknowledges data messages when asked to
/// and dispatches completions to the registered handlers.
pub struct MessagePump {
    pool: MessagePool,
    registry: HandlerRegistry,
    outbound: Outbound,
}

impl MessagePump {
    /// Creates a pump feeding `registry`, acknowledging via `outbound`.
    pub fn new(registry: HandlerRegistry, outbound: Outbound) -> Self {
        Self {
            pool: MessagePool::new(),
            registry,
            outbound,
        }
    }

    /// Registry of message consumers
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Outbound scheduler of the owning connection
    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    /// Feeds one inbound message through the pool and dispatches whatever
    /// became complete. With `acknowledge`, completed messages that want an
    /// ack are answered on the outbound scheduler; acks themselves and
    /// zero-size messages never are.
    pub fn ingest(&self, message: Message, acknowledge: bool) {
        let version = message.version();
        self.pool.push(message);
        while self.pool.has_available(version) {
            let complete = self.pool.pop(version);
            trace!(
                identifier = complete.identifier(),
                session_id = complete.session_id(),
                size = complete.message_size(),
                "message complete"
            );
            if acknowledge && complete.requires_ack() {
                if let Err(err) = self.outbound.send(complete.create_ack()) {
                    warn!(identifier = complete.identifier(), error = %err, "failed to queue ack");
                }
            }
            if !self.registry.dispatch(&complete) {
                debug!(
                    identifier = complete.identifier(),
                    session_id = complete.session_id(),
                    "message had no consumer"
                );
            }
        }
    }
}

/// Wraps a session-description message for the wire.
///
/// Signaling rides session id 0; the identifier stays 0 for the outbound
/// sequencer to assign.
pub(crate) fn wrap_slp(version: WireVersion, slp: &SlpMessage) -> Message {
    let mut message = Message::with_body(version, slp.to_bytes());
    if let Some(h) = message.v2_mut() {
        if let Some(data) = h.data_header.as_mut() {
            data.transfer_flow = TransferFlow::FIRST;
        }
    }
    message
}

/// Relay stand-in that runs every frame through the codec into a peer pump.
#[cfg(test)]
pub(crate) struct LoopbackProcessor {
    peer: Mutex<Option<Arc<MessagePump>>>,
}

#[cfg(test)]
impl LoopbackProcessor {
    pub(crate) fn unconnected() -> Arc<Self> {
        Arc::new(Self {
            peer: Mutex::new(None),
        })
    }

    pub(crate) fn connect(&self, peer: Arc<MessagePump>) {
        *self.peer.lock().expect("peer lock poisoned") = Some(peer);
    }
}

#[cfg(test)]
#[async_trait]
impl MessageProcessor for LoopbackProcessor {
    async fn send_message(&self, message: Message) -> Result<(), SessionError> {
        let peer = self
            .peer
            .lock()
            .expect("peer lock poisoned")
            .clone()
            .ok_or(SessionError::ChannelClosed)?;
        let mut framed = message.encode()?;
        let decoded = Message::decode(message.version(), &mut framed)?;
        peer.ingest(decoded, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    struct CaptureProcessor {
        tx: mpsc::UnboundedSender<Message>,
    }

    #[async_trait]
    impl MessageProcessor for CaptureProcessor {
        async fn send_message(&self, message: Message) -> Result<(), SessionError> {
            self.tx.send(message).map_err(|_| SessionError::ChannelClosed)
        }
    }

    fn capture() -> (Arc<CaptureProcessor>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(CaptureProcessor { tx }), rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    struct RecordingHandler {
        seen: Mutex<Vec<Message>>,
    }

    impl MessageHandler for RecordingHandler {
        fn handle_message(&self, message: &Message) -> bool {
            self.seen.lock().unwrap().push(message.clone());
            true
        }
    }

    #[tokio::test]
    async fn test_outbound_stamps_and_splits() {
        let (processor, mut rx) = capture();
        let outbound = Outbound::new(processor, 1202);
        let message = Message::with_body(WireVersion::V1, Bytes::from(vec![7u8; 3000]));
        outbound.send(message).unwrap();

        let first = recv(&mut rx).await;
        let second = recv(&mut rx).await;
        let third = recv(&mut rx).await;
        assert_ne!(first.identifier(), 0);
        assert_eq!(second.identifier(), first.identifier());
        assert_eq!(third.identifier(), first.identifier());
        assert_eq!(first.v1().unwrap().offset, 0);
        assert_eq!(second.v1().unwrap().offset, 1202);
        assert_eq!(third.v1().unwrap().offset, 2404);
        assert_eq!(third.message_size(), 596);
    }

    #[tokio::test]
    async fn test_outbound_v1_identifiers_consecutive() {
        let (processor, mut rx) = capture();
        let outbound = Outbound::new(processor, 1202);
        outbound
            .send(Message::with_body(WireVersion::V1, Bytes::from_static(b"a")))
            .unwrap();
        outbound
            .send(Message::with_body(WireVersion::V1, Bytes::from_static(b"b")))
            .unwrap();
        let first = recv(&mut rx).await;
        let second = recv(&mut rx).await;
        assert_eq!(second.identifier(), first.identifier().wrapping_add(1));
    }

    #[tokio::test]
    async fn test_outbound_v2_advances_by_size() {
        let (processor, mut rx) = capture();
        let outbound = Outbound::new(processor, 1202);
        outbound
            .send(Message::with_body(WireVersion::V2, Bytes::from(vec![1u8; 10])))
            .unwrap();
        outbound
            .send(Message::with_body(WireVersion::V2, Bytes::from(vec![2u8; 4])))
            .unwrap();
        let first = recv(&mut rx).await;
        let second = recv(&mut rx).await;
        assert_eq!(second.identifier(), first.identifier().wrapping_add(10));
    }

    #[tokio::test]
    async fn test_outbound_keeps_existing_identifier() {
        let (processor, mut rx) = capture();
        let outbound = Outbound::new(processor, 1202);
        let mut message = Message::with_body(WireVersion::V1, Bytes::from_static(b"x"));
        message.set_identifier(1234);
        outbound.send(message).unwrap();
        assert_eq!(recv(&mut rx).await.identifier(), 1234);
    }

    #[tokio::test]
    async fn test_switch_processor_reroutes() {
        let (first_processor, mut first_rx) = capture();
        let (second_processor, mut second_rx) = capture();
        let outbound = Outbound::new(first_processor, 1202);

        outbound
            .send(Message::with_body(WireVersion::V1, Bytes::from_static(b"one")))
            .unwrap();
        recv(&mut first_rx).await;

        outbound.switch_processor(second_processor, 1352);
        outbound
            .send(Message::with_body(WireVersion::V1, Bytes::from_static(b"two")))
            .unwrap();
        let rerouted = recv(&mut second_rx).await;
        assert_eq!(rerouted.body().as_ref(), b"two");
    }

    #[tokio::test]
    async fn test_pump_reassembles_then_dispatches() {
        let (processor, _rx) = capture();
        let outbound = Outbound::new(processor, 1202);
        let registry = HandlerRegistry::new();
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        registry.register(handler.clone());
        let pump = MessagePump::new(registry, outbound);

        let mut whole = Message::with_body(WireVersion::V1, Bytes::from(vec![3u8; 2000]));
        whole.set_identifier(500);
        let chunks = whole.split(1202);
        assert_eq!(chunks.len(), 2);
        pump.ingest(chunks[0].clone(), false);
        assert!(handler.seen.lock().unwrap().is_empty());
        pump.ingest(chunks[1].clone(), false);

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].body().len(), 2000);
        assert_eq!(seen[0].identifier(), 500);
    }

    #[tokio::test]
    async fn test_pump_acknowledges_data() {
        let (processor, mut rx) = capture();
        let outbound = Outbound::new(processor, 1202);
        let pump = MessagePump::new(HandlerRegistry::new(), outbound);

        let mut message = Message::with_body(WireVersion::V1, Bytes::from_static(b"payload"));
        message.set_identifier(42);
        pump.ingest(message, true);

        let ack = recv(&mut rx).await;
        assert!(ack.is_ack());
        assert_eq!(ack.v1().unwrap().ack_identifier, 42);
        assert_ne!(ack.identifier(), 0);
    }

    #[tokio::test]
    async fn test_pump_never_acks_an_ack() {
        let (processor, mut rx) = capture();
        let outbound = Outbound::new(processor, 1202);
        let pump = MessagePump::new(HandlerRegistry::new(), outbound);

        let mut message = Message::with_body(WireVersion::V1, Bytes::from_static(b"payload"));
        message.set_identifier(42);
        let ack = message.create_ack();
        pump.ingest(ack, true);

        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[test]
    fn test_registry_unregister() {
        let registry = HandlerRegistry::new();
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let as_dyn: Arc<dyn MessageHandler> = handler.clone();
        registry.register(as_dyn.clone());
        assert!(registry.dispatch(&Message::new(WireVersion::V1)));
        registry.unregister(&as_dyn);
        assert!(!registry.dispatch(&Message::new(WireVersion::V1)));
    }

    #[tokio::test]
    async fn test_loopback_delivers_to_peer() {
        let loopback = LoopbackProcessor::unconnected();
        let outbound = Outbound::new(loopback.clone(), 1202);
        let registry = HandlerRegistry::new();
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        registry.register(handler.clone());
        let (sink, _sink_rx) = capture();
        let peer_pump = Arc::new(MessagePump::new(registry, Outbound::new(sink, 1202)));
        loopback.connect(peer_pump);

        outbound
            .send(Message::with_body(WireVersion::V1, Bytes::from(vec![9u8; 2500])))
            .unwrap();

        timeout(Duration::from_secs(1), async {
            loop {
                if handler.seen.lock().unwrap().len() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("message never arrived");
        assert_eq!(handler.seen.lock().unwrap()[0].body().len(), 2500);
    }
}

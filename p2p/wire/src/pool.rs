//! Message pool: per-connection buffering and reassembly.
//!
//! The pool accepts raw framed messages as they arrive, accumulates fragment
//! runs until they are whole, and exposes one FIFO of complete messages per
//! wire version. Producers (network receive) and consumers (the message pump)
//! touch disjoint structures, so neither blocks the other; a message is only
//! enqueued once its body is complete.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::BytesMut;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::header::{Header, TransferFlow, V2DataHeader, V2Header, WireVersion};
use crate::message::Message;

struct V2Accum {
    header: V2Header,
    data: V2DataHeader,
    body: BytesMut,
}

/// Buffers partial wire messages and queues complete ones per version
#[derive(Default)]
pub struct MessagePool {
    v1_accum: DashMap<u32, BytesMut>,
    v2_accum: DashMap<u32, V2Accum>,
    v1_ready: Mutex<VecDeque<Message>>,
    v2_ready: Mutex<VecDeque<Message>>,
}

impl MessagePool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one inbound message, queueing it once complete
    pub fn push(&self, msg: Message) {
        match &msg.header {
            Header::V1(_) => self.push_v1(msg),
            Header::V2(_) => self.push_v2(msg),
        }
    }

    /// Whether a complete message is waiting for this version
    pub fn has_available(&self, version: WireVersion) -> bool {
        !self.ready(version).lock().expect("pool lock poisoned").is_empty()
    }

    /// Dequeue the next complete message for this version.
    ///
    /// Callers must check [`has_available`](Self::has_available) first;
    /// dequeuing from an empty queue is a contract violation and panics.
    pub fn pop(&self, version: WireVersion) -> Message {
        self.ready(version)
            .lock()
            .expect("pool lock poisoned")
            .pop_front()
            .expect("no complete message available")
    }

    /// Number of fragment runs still accumulating for this version
    pub fn pending_fragments(&self, version: WireVersion) -> usize {
        match version {
            WireVersion::V1 => self.v1_accum.len(),
            WireVersion::V2 => self.v2_accum.len(),
        }
    }

    fn ready(&self, version: WireVersion) -> &Mutex<VecDeque<Message>> {
        match version {
            WireVersion::V1 => &self.v1_ready,
            WireVersion::V2 => &self.v2_ready,
        }
    }

    fn enqueue(&self, msg: Message) {
        let version = msg.version();
        self.ready(version)
            .lock()
            .expect("pool lock poisoned")
            .push_back(msg);
    }

    fn push_v1(&self, mut msg: Message) {
        let h = match msg.v1() {
            Some(h) => *h,
            None => return,
        };

        if h.is_ack() || h.message_size == 0 || u64::from(h.message_size) == h.total_size {
            self.enqueue(msg);
            return;
        }

        // Fragment of a larger message
        {
            let mut buf = self
                .v1_accum
                .entry(h.identifier)
                .or_insert_with(BytesMut::new);
            buf.extend_from_slice(msg.body());
            trace!(
                identifier = h.identifier,
                offset = h.offset,
                buffered = buf.len(),
                total = h.total_size,
                "buffered fragment"
            );
        }

        if h.offset + u64::from(h.message_size) == h.total_size {
            if let Some((_, buf)) = self.v1_accum.remove(&h.identifier) {
                if let Some(header) = msg.v1_mut() {
                    header.offset = 0;
                    header.message_size = h.total_size as u32;
                }
                msg.body = buf.freeze();
                debug!(
                    identifier = h.identifier,
                    size = h.total_size,
                    "reassembled message"
                );
                self.enqueue(msg);
            }
        }
    }

    fn push_v2(&self, msg: Message) {
        let h = match msg.v2() {
            Some(h) => h,
            None => return,
        };
        let identifier = h.identifier;
        let size = h.message_size;
        let (flow, remaining, package) = match &h.data_header {
            Some(d) => (d.transfer_flow, d.remaining_bytes, d.package_number),
            None => (TransferFlow::empty(), 0, 0),
        };

        // Signals, un-split firsts and tagged data chunks pass straight through
        if size == 0
            || flow.bits() > TransferFlow::FIRST.bits()
            || (flow.contains(TransferFlow::FIRST) && remaining == 0)
        {
            self.enqueue(msg);
            return;
        }

        if flow.contains(TransferFlow::FIRST) {
            // Head of a fragment run; keyed so the key equals the next
            // continuation's identifier
            let key = identifier.wrapping_add(size);
            if let Header::V2(mut header) = msg.header {
                if let Some(data) = header.data_header.take() {
                    trace!(identifier, key, remaining, "started fragment run");
                    self.v2_accum.insert(
                        key,
                        V2Accum {
                            header,
                            data,
                            body: BytesMut::from(msg.body.as_ref()),
                        },
                    );
                }
            }
            return;
        }

        // Continuation fragment
        let mut acc = match self.v2_accum.remove(&identifier) {
            Some((_, acc)) => acc,
            None => {
                warn!(identifier, "continuation without a fragment run");
                self.enqueue(msg);
                return;
            }
        };

        if acc.data.package_number != package {
            warn!(
                identifier,
                expected = acc.data.package_number,
                got = package,
                "package number mismatch"
            );
            self.v2_accum.insert(identifier, acc);
            self.enqueue(msg);
            return;
        }

        acc.body.extend_from_slice(msg.body());
        acc.data.remaining_bytes = acc.data.remaining_bytes.saturating_sub(u64::from(size));
        acc.header.message_size = acc.body.len() as u32;
        acc.header.identifier = identifier.wrapping_add(size);

        if acc.data.remaining_bytes == 0 {
            // Rewind so downstream sees the run's original identifier
            acc.header.identifier = acc
                .header
                .identifier
                .wrapping_sub(acc.header.message_size);
            acc.header.data_header = Some(acc.data);
            debug!(
                identifier = acc.header.identifier,
                size = acc.header.message_size,
                "reassembled message"
            );
            self.enqueue(Message {
                header: Header::V2(acc.header),
                footer: 0,
                body: acc.body.freeze(),
            });
        } else {
            let key = acc.header.identifier;
            trace!(
                key,
                remaining = acc.data.remaining_bytes,
                "fragment run continues"
            );
            self.v2_accum.insert(key, acc);
        }
    }
}

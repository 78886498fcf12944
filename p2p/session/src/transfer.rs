//! Transfer sessions: the data plane of one negotiated invitation.
//!
//! A [`TransferSession`] owns the data stream for one call id. The sending
//! side reads the stream into a single logical message and queues it on the
//! outbound scheduler, which chunks it for the active transport. The
//! receiving side writes completed data messages into the stream. Lifecycle
//! outcomes surface as [`TransferSignal`]s drained by the owning handler.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use p2p_wire::{Header, Message, MessageFlags, SlpMessage, TransferFlow, WireVersion};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bridge::{wrap_slp, Outbound};
use crate::error::SessionError;
use crate::properties::DataType;

/// Payload storage for one transfer.
///
/// The sending side reads from the stream; the receiving side writes to it.
/// A session holds the stream exclusively for the duration of the transfer.
pub trait DataStream: Send {
    /// Total bytes the stream currently holds
    fn len(&self) -> u64;

    /// True when the stream holds no bytes
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `buf.len()` bytes at the cursor; returns 0 at the end.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError>;

    /// Appends received bytes.
    fn write(&mut self, data: &[u8]) -> Result<(), SessionError>;
}

/// Shared handle to a transfer's data stream
pub type SharedStream = Arc<Mutex<dyn DataStream>>;

/// Wraps a stream for handing to a session.
pub fn shared_stream<S: DataStream + 'static>(stream: S) -> SharedStream {
    Arc::new(Mutex::new(stream))
}

/// Growable in-memory data stream
#[derive(Debug, Default)]
pub struct MemoryStream {
    data: Vec<u8>,
    position: usize,
}

impl MemoryStream {
    /// Creates an empty stream, ready to receive into.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a stream preloaded with `data`, ready to send from.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }

    /// Bytes held by the stream
    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl DataStream for MemoryStream {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let n = buf.len().min(self.data.len() - self.position);
        buf[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.data.extend_from_slice(data);
        Ok(())
    }
}

/// Lifecycle outcome raised by a session, drained by the owning handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferSignal {
    /// All payload bytes moved
    Finished {
        /// Call id of the session
        call_id: Uuid,
    },
    /// The transfer stopped before completion
    Aborted {
        /// Call id of the session
        call_id: Uuid,
    },
    /// Payload bytes moved in either direction
    Progress {
        /// Call id of the session
        call_id: Uuid,
        /// Bytes moved so far
        transferred: u64,
        /// Expected total, when the wire carries one
        total: u64,
    },
}

/// The data plane of one negotiated invitation
pub struct TransferSession {
    call_id: Uuid,
    session_id: u32,
    version: WireVersion,
    data_type: DataType,
    is_sender: bool,
    package_number: AtomicU16,
    stream: Mutex<Option<SharedStream>>,
    outbound: Outbound,
    signals: mpsc::UnboundedSender<TransferSignal>,
    started: AtomicBool,
    aborted: AtomicBool,
    transferred: AtomicU64,
}

impl TransferSession {
    /// Creates a session for one call.
    pub(crate) fn new(
        call_id: Uuid,
        session_id: u32,
        version: WireVersion,
        data_type: DataType,
        is_sender: bool,
        outbound: Outbound,
        signals: mpsc::UnboundedSender<TransferSignal>,
    ) -> Self {
        Self {
            call_id,
            session_id,
            version,
            data_type,
            is_sender,
            package_number: AtomicU16::new(0),
            stream: Mutex::new(None),
            outbound,
            signals,
            started: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            transferred: AtomicU64::new(0),
        }
    }

    /// Call id of the invitation this session belongs to
    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Session id carried by this session's data messages
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Whether the local side supplies the payload
    pub fn is_sender(&self) -> bool {
        self.is_sender
    }

    /// Payload classification of this session
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Header flags stamped on this session's data messages
    pub fn message_flags(&self) -> MessageFlags {
        self.data_type.message_flags()
    }

    /// Footer tag stamped on this session's data messages
    pub fn message_footer(&self) -> u32 {
        self.data_type.footer()
    }

    /// Running packet number of this session's data messages
    pub fn data_packet_number(&self) -> u16 {
        self.package_number.load(Ordering::Relaxed)
    }

    /// Attaches the data stream.
    pub fn set_stream(&self, stream: SharedStream) {
        *self.stream.lock().expect("stream lock poisoned") = Some(stream);
    }

    /// Whether a data stream is attached
    pub fn has_stream(&self) -> bool {
        self.stream.lock().expect("stream lock poisoned").is_some()
    }

    fn stream_handle(&self) -> Result<SharedStream, SessionError> {
        self.stream
            .lock()
            .expect("stream lock poisoned")
            .clone()
            .ok_or(SessionError::InvalidOperation(
                "data stream must be set before the transfer starts",
            ))
    }

    /// Sends the acceptance for a received invitation.
    ///
    /// Fails without touching the wire when no data stream is attached.
    pub fn accept_invitation(&self, acceptance: Message) -> Result<(), SessionError> {
        if !self.has_stream() {
            return Err(SessionError::InvalidOperation(
                "data stream must be set before accepting an invitation",
            ));
        }
        self.outbound.send(acceptance)
    }

    /// Begins moving payload bytes.
    ///
    /// On the sending side this spawns the streaming task; on the receiving
    /// side it marks the session ready. Calling it again is a no-op, so the
    /// relay fallback and a direct connection may both request a start.
    pub fn start_data_transfer(self: &Arc<Self>, over_direct: bool) -> Result<(), SessionError> {
        let stream = self.stream_handle()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(
            call_id = %self.call_id,
            session_id = self.session_id,
            over_direct,
            sender = self.is_sender,
            "starting data transfer"
        );
        if self.is_sender {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = session.run_send(stream) {
                    warn!(call_id = %session.call_id, error = %err, "data transfer failed");
                    session.signal(TransferSignal::Aborted {
                        call_id: session.call_id,
                    });
                }
            });
        }
        Ok(())
    }

    fn run_send(&self, stream: SharedStream) -> Result<(), SessionError> {
        let mut payload = BytesMut::new();
        let mut scratch = [0u8; 8192];
        loop {
            if self.aborted.load(Ordering::SeqCst) {
                return Ok(());
            }
            let n = stream
                .lock()
                .expect("stream lock poisoned")
                .read(&mut scratch)?;
            if n == 0 {
                break;
            }
            payload.extend_from_slice(&scratch[..n]);
        }

        let total = payload.len() as u64;
        self.outbound.send(self.data_message(payload.freeze()))?;
        self.signal(TransferSignal::Progress {
            call_id: self.call_id,
            transferred: total,
            total,
        });
        // Activities keep their session open on the sending side as well.
        if !matches!(self.data_type, DataType::Activity) {
            self.signal(TransferSignal::Finished {
                call_id: self.call_id,
            });
        }
        Ok(())
    }

    /// Builds the data message carrying `payload`, tagged for this session.
    fn data_message(&self, payload: Bytes) -> Message {
        let mut message = Message::with_body(self.version, payload);
        message.set_session_id(self.session_id);
        match &mut message.header {
            Header::V1(h) => {
                h.flags = self.data_type.message_flags();
            }
            Header::V2(h) => {
                if let Some(data) = h.data_header.as_mut() {
                    data.transfer_flow = TransferFlow::FIRST | self.data_type.transfer_flow();
                    data.package_number = self.package_number.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        message.footer = self.message_footer();
        message
    }

    /// Writes one completed inbound data message into the stream.
    pub fn write_incoming(&self, message: &Message) -> Result<(), SessionError> {
        let stream = self.stream_handle()?;
        stream
            .lock()
            .expect("stream lock poisoned")
            .write(message.body())?;
        let written = message.body().len() as u64;
        let transferred = self.transferred.fetch_add(written, Ordering::SeqCst) + written;

        // Activities keep their session open; for the other payload types
        // the transfer is done once the logical message has fully arrived.
        let auto_finish = !matches!(self.data_type, DataType::Activity);
        let (finished, total) = match &message.header {
            Header::V1(h) => (auto_finish, h.total_size),
            Header::V2(h) => {
                let remaining = h.data_header.as_ref().map_or(0, |d| d.remaining_bytes);
                (auto_finish && remaining == 0, transferred + remaining)
            }
        };

        self.signal(TransferSignal::Progress {
            call_id: self.call_id,
            transferred,
            total,
        });
        if finished {
            self.signal(TransferSignal::Finished {
                call_id: self.call_id,
            });
        }
        Ok(())
    }

    /// Stops the send loop without raising a signal, for handler-driven
    /// teardown where the close is already being reported another way.
    pub(crate) fn stop(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Stops the transfer and raises the aborted outcome.
    pub fn abort_transfer(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(call_id = %self.call_id, session_id = self.session_id, "transfer aborted");
        self.signal(TransferSignal::Aborted {
            call_id: self.call_id,
        });
    }

    /// Sends the session-close description message for this session.
    pub fn send_disconnect_message(&self, close: &SlpMessage) -> Result<(), SessionError> {
        self.outbound.send(wrap_slp(self.version, close))
    }

    fn signal(&self, signal: TransferSignal) {
        if self.signals.send(signal).is_err() {
            debug!(call_id = %self.call_id, "signal channel closed");
        }
    }
}

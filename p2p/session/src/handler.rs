//! SLP negotiation handler.
//!
//! Owns the per-call transfer state for one peer connection: it builds and
//! answers session-description messages, registers transfer sessions,
//! schedules the direct-connection offer after an acceptance settles, and
//! tears sessions down on close or failure. Inbound traffic reaches it
//! through the message pump; outbound signaling and data share one
//! scheduler, so negotiation replies never overtake queued payload.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use dashmap::DashMap;
use p2p_wire::{
    format_guid, parse_guid, Message, SlpContentType, SlpMessage, WireVersion, METHOD_BYE,
    METHOD_INVITE, STATUS_DECLINE, STATUS_INTERNAL_ERROR, STATUS_OK,
};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::bridge::{
    wrap_slp, HandlerRegistry, MessageHandler, MessagePump, MessageProcessor, Outbound,
};
use crate::config::P2pConfig;
use crate::direct::{
    bind_listener, connect_handshake, hash_nonce, run_listener, AuthState, DirectConnection,
};
use crate::error::SessionError;
use crate::nat::{net_id, ConnectionType};
use crate::properties::{ActivityContext, DataType, FileContext, TransferProperties};
use crate::transfer::{SharedStream, TransferSession, TransferSignal};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// What to do with an inbound invitation.
pub enum InviteDecision {
    /// Accept now, moving the payload through the supplied stream
    Accept(SharedStream),
    /// Refuse with a 603 Decline
    Decline,
    /// Decide later through `accept_transfer` / `decline_transfer`
    Delay,
}

/// Inbound invitation details handed to the observer.
#[derive(Clone, Debug)]
pub struct TransferInvitation {
    /// Call id identifying the negotiation
    pub call_id: Uuid,
    /// Session id the data messages will carry
    pub session_id: u32,
    /// Account name of the inviting peer
    pub peer: String,
    /// Payload classification derived from the invitation
    pub data_type: DataType,
    /// Raw (already base64-decoded) context blob from the invitation
    pub context: Bytes,
    /// Parsed file details, for file-transfer invitations
    pub file: Option<FileContext>,
    /// Parsed activity details, for activity invitations
    pub activity: Option<ActivityContext>,
}

/// Collaborator notified of transfer lifecycle events.
///
/// Every method except [`on_invitation`](Self::on_invitation) has a no-op
/// default, so observers implement only what they care about.
pub trait TransferObserver: Send + Sync {
    /// An inbound invitation needs a decision.
    fn on_invitation(&self, invitation: &TransferInvitation) -> InviteDecision;

    /// A transfer session was registered.
    fn on_session_created(&self, call_id: Uuid, session_id: u32) {
        let _ = (call_id, session_id);
    }

    /// A transfer session was removed.
    fn on_session_closed(&self, call_id: Uuid) {
        let _ = call_id;
    }

    /// Every payload byte of a session was moved.
    fn on_transfer_finished(&self, call_id: Uuid) {
        let _ = call_id;
    }

    /// A session stopped before its payload completed.
    fn on_transfer_aborted(&self, call_id: Uuid) {
        let _ = call_id;
    }

    /// Payload bytes moved in either direction.
    fn on_progress(&self, call_id: Uuid, transferred: u64, total: u64) {
        let _ = (call_id, transferred, total);
    }

    /// An authenticated direct connection took over the data path.
    fn on_direct_connected(&self, call_id: Uuid, peer: SocketAddr) {
        let _ = (call_id, peer);
    }
}

/// Negotiation handler for one peer connection.
///
/// Construction wires a fresh message pump and outbound scheduler around the
/// given relay processor and registers the handler with the pump, so feeding
/// [`pump`](Self::pump) with relay traffic is all a transport has to do.
pub struct SlpHandler {
    inner: Arc<HandlerInner>,
}

impl SlpHandler {
    /// Builds the handler for a `local`/`remote` account pair over `relay`.
    pub fn new(
        version: WireVersion,
        config: P2pConfig,
        local: impl Into<String>,
        remote: impl Into<String>,
        observer: Arc<dyn TransferObserver>,
        relay: Arc<dyn MessageProcessor>,
    ) -> Self {
        let registry = HandlerRegistry::new();
        let outbound = Outbound::new(Arc::clone(&relay), config.max_relay_chunk);
        let pump = Arc::new(MessagePump::new(registry.clone(), outbound.clone()));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(HandlerInner {
            version,
            config,
            local_passport: local.into(),
            remote_passport: remote.into(),
            observer,
            relay,
            outbound,
            registry: registry.clone(),
            pump,
            properties: DashMap::new(),
            sessions: DashMap::new(),
            signals: signal_tx,
            direct: StdMutex::new(None),
        });

        registry.register(Arc::new(HandlerHook {
            inner: Arc::downgrade(&inner),
        }));
        tokio::spawn(drain_signals(signal_rx, Arc::downgrade(&inner)));

        Self { inner }
    }

    /// Pump that relay-delivered message chunks must be fed through
    pub fn pump(&self) -> Arc<MessagePump> {
        Arc::clone(&self.inner.pump)
    }

    /// Invites the peer to receive a file read from `stream`.
    ///
    /// Returns the call id of the new negotiation.
    pub fn send_file(&self, file_name: &str, stream: SharedStream) -> Result<Uuid, SessionError> {
        let size = stream.lock().expect("stream lock poisoned").len();
        let context = FileContext::new(file_name, size);
        self.inner
            .send_invitation(DataType::File, context.encode(), stream, true)
    }

    /// Requests an MSN object (user tile or emoticon) delivered into `stream`.
    pub fn send_object_request(
        &self,
        object_context: Bytes,
        data_type: DataType,
        stream: SharedStream,
    ) -> Result<Uuid, SessionError> {
        if !matches!(data_type, DataType::UserTile | DataType::Emoticon) {
            return Err(SessionError::InvalidOperation(
                "object requests carry a user-tile or emoticon payload type",
            ));
        }
        self.inner
            .send_invitation(data_type, object_context, stream, false)
    }

    /// Invites the peer into an activity session.
    ///
    /// `is_sender` states whether the local side will supply the activity
    /// payload once the invitation is accepted.
    pub fn send_activity_invitation(
        &self,
        context: &ActivityContext,
        stream: SharedStream,
        is_sender: bool,
    ) -> Result<Uuid, SessionError> {
        self.inner
            .send_invitation(DataType::Activity, context.encode(), stream, is_sender)
    }

    /// Accepts a pending inbound invitation, wiring `stream` as the payload.
    pub fn accept_transfer(&self, call_id: Uuid, stream: SharedStream) -> Result<(), SessionError> {
        self.inner.accept_transfer(call_id, stream)
    }

    /// Declines a pending inbound invitation.
    pub fn decline_transfer(&self, call_id: Uuid) -> Result<(), SessionError> {
        self.inner.decline_transfer(call_id)
    }

    /// Closes an open session and tells the peer.
    pub fn close_transfer(&self, call_id: Uuid) -> Result<(), SessionError> {
        self.inner.close_transfer(call_id)
    }

    /// Session registered for `call_id`, when one exists
    pub fn session(&self, call_id: Uuid) -> Option<Arc<TransferSession>> {
        self.inner.session_by_call(call_id)
    }

    /// Number of registered transfer sessions
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }
}

/// Registry entry holding the handler weakly, so dropping the handler is
/// enough to stop message delivery.
struct HandlerHook {
    inner: Weak<HandlerInner>,
}

impl MessageHandler for HandlerHook {
    fn handle_message(&self, message: &Message) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.handle_message(message),
            None => false,
        }
    }
}

async fn drain_signals(
    mut signals: mpsc::UnboundedReceiver<TransferSignal>,
    inner: Weak<HandlerInner>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        match signal {
            TransferSignal::Progress {
                call_id,
                transferred,
                total,
            } => inner.observer.on_progress(call_id, transferred, total),
            TransferSignal::Finished { call_id } => inner.finish_session(call_id),
            TransferSignal::Aborted { call_id } => inner.abort_session(call_id),
        }
    }
}

struct HandlerInner {
    version: WireVersion,
    config: P2pConfig,
    local_passport: String,
    remote_passport: String,
    observer: Arc<dyn TransferObserver>,
    relay: Arc<dyn MessageProcessor>,
    outbound: Outbound,
    registry: HandlerRegistry,
    pump: Arc<MessagePump>,
    properties: DashMap<Uuid, TransferProperties>,
    sessions: DashMap<Uuid, Arc<TransferSession>>,
    signals: mpsc::UnboundedSender<TransferSignal>,
    direct: StdMutex<Option<Arc<DirectConnection>>>,
}

impl HandlerInner {
    fn handle_message(self: &Arc<Self>, message: &Message) -> bool {
        if message.is_ack() {
            trace!(identifier = message.identifier(), "acknowledgement received");
            return true;
        }
        if message.session_id() == 0 {
            match SlpMessage::parse(message.body()) {
                Ok(slp) => self.handle_slp(slp),
                Err(err) => warn!(error = %err, "undecodable session-description message"),
            }
            return true;
        }

        let session = self
            .sessions
            .iter()
            .find(|entry| entry.value().session_id() == message.session_id())
            .map(|entry| Arc::clone(entry.value()));
        match session {
            Some(session) => {
                if message.body().is_empty() {
                    return true;
                }
                if let Err(err) = session.write_incoming(message) {
                    warn!(call_id = %session.call_id(), error = %err, "stream write failed");
                    session.abort_transfer();
                }
                true
            }
            None => false,
        }
    }

    fn handle_slp(self: &Arc<Self>, slp: SlpMessage) {
        if slp.is_request(METHOD_INVITE) {
            match slp.content_type {
                SlpContentType::SessionReq => self.handle_invite(slp),
                SlpContentType::TransReq => self.handle_direct_offer(slp),
                _ => trace!(
                    call_id = %slp.call_id,
                    content_type = slp.content_type.as_str(),
                    "ignoring invitation body"
                ),
            }
        } else if slp.is_request(METHOD_BYE) {
            self.handle_bye(slp);
        } else if let Some(code) = slp.status_code() {
            match code {
                STATUS_OK => self.handle_accepted(slp),
                STATUS_DECLINE | STATUS_INTERNAL_ERROR => self.handle_rejected(slp, code),
                other => trace!(call_id = %slp.call_id, code = other, "ignoring status"),
            }
        } else {
            trace!(call_id = %slp.call_id, "ignoring session-description request");
        }
    }

    fn handle_invite(&self, slp: SlpMessage) {
        let euf = slp.field("EUF-GUID").and_then(|v| parse_guid(v).ok());
        let session_id = slp.field("SessionID").and_then(|v| v.parse::<u32>().ok());
        let app_id = slp
            .field("AppID")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        let context = slp
            .field("Context")
            .and_then(|v| BASE64.decode(v.trim_end_matches('\0')).ok())
            .map(Bytes::from);

        let (Some(euf), Some(session_id)) = (euf, session_id) else {
            warn!(call_id = %slp.call_id, "invitation missing EUF-GUID or SessionID");
            self.refuse(&slp);
            return;
        };

        let data_type = DataType::from_invite(euf, app_id);
        if data_type == DataType::Unknown {
            warn!(call_id = %slp.call_id, euf = %euf, "unknown invitation payload type");
            self.refuse(&slp);
            return;
        }

        let context = context.unwrap_or_default();
        let mut file = None;
        let mut activity = None;
        match data_type {
            DataType::File => match FileContext::parse(context.clone()) {
                Ok(parsed) => file = Some(parsed),
                Err(err) => {
                    warn!(call_id = %slp.call_id, error = %err, "malformed file context");
                    self.refuse(&slp);
                    return;
                }
            },
            DataType::Activity => match ActivityContext::parse(&context) {
                Ok(parsed) => activity = Some(parsed),
                Err(err) => {
                    warn!(call_id = %slp.call_id, error = %err, "malformed activity context");
                    self.refuse(&slp);
                    return;
                }
            },
            _ => {}
        }

        let call_id = slp.call_id;
        let mut props = TransferProperties::new(call_id, session_id);
        props.local_passport = self.local_passport.clone();
        props.remote_passport = self.remote_passport.clone();
        props.data_type = data_type;
        props.context = context.clone();
        props.last_branch = slp.branch;
        props.last_cseq = slp.cseq;
        props.remote_invited = true;
        props.pending_invite = Some(slp);
        self.properties.insert(call_id, props);

        let invitation = TransferInvitation {
            call_id,
            session_id,
            peer: self.remote_passport.clone(),
            data_type,
            context,
            file,
            activity,
        };
        info!(call_id = %call_id, session_id, data_type = ?data_type, "invitation received");
        match self.observer.on_invitation(&invitation) {
            InviteDecision::Accept(stream) => {
                if let Err(err) = self.accept_transfer(call_id, stream) {
                    warn!(call_id = %call_id, error = %err, "accept failed");
                }
            }
            InviteDecision::Decline => {
                if let Err(err) = self.decline_transfer(call_id) {
                    warn!(call_id = %call_id, error = %err, "decline failed");
                }
            }
            InviteDecision::Delay => debug!(call_id = %call_id, "invitation left pending"),
        }
    }

    /// Answers an unintelligible invitation with a 500.
    fn refuse(&self, slp: &SlpMessage) {
        let reply = slp.reply(
            STATUS_INTERNAL_ERROR,
            "Internal Error",
            SlpContentType::SessionReq,
        );
        if let Err(err) = self.outbound.send(wrap_slp(self.version, &reply)) {
            warn!(call_id = %slp.call_id, error = %err, "failed to send error reply");
        }
    }

    /// Whether the invited side supplies the payload for `data_type`
    fn invitee_sends(data_type: DataType) -> bool {
        matches!(data_type, DataType::UserTile | DataType::Emoticon)
    }

    fn send_invitation(
        &self,
        data_type: DataType,
        context: Bytes,
        stream: SharedStream,
        is_sender: bool,
    ) -> Result<Uuid, SessionError> {
        let session_id = rand::thread_rng().gen_range(4_000u32..2_000_000_000);
        let mut invite = SlpMessage::request(
            METHOD_INVITE,
            &self.remote_passport,
            &self.local_passport,
            SlpContentType::SessionReq,
        );
        let call_id = invite.call_id;
        invite.set_field("EUF-GUID", format_guid(data_type.euf_guid()));
        invite.set_field("SessionID", session_id.to_string());
        invite.set_field("AppID", data_type.footer().to_string());
        invite.set_field("Context", BASE64.encode(&context));

        let mut props = TransferProperties::new(call_id, session_id);
        props.local_passport = self.local_passport.clone();
        props.remote_passport = self.remote_passport.clone();
        props.data_type = data_type;
        props.context = context;
        props.last_branch = invite.branch;
        props.last_cseq = invite.cseq;
        self.properties.insert(call_id, props);

        let session = Arc::new(TransferSession::new(
            call_id,
            session_id,
            self.version,
            data_type,
            is_sender,
            self.outbound.clone(),
            self.signals.clone(),
        ));
        session.set_stream(stream);
        self.sessions.insert(call_id, session);

        if let Err(err) = self.outbound.send(wrap_slp(self.version, &invite)) {
            self.sessions.remove(&call_id);
            self.properties.remove(&call_id);
            return Err(err);
        }
        self.observer.on_session_created(call_id, session_id);
        info!(call_id = %call_id, session_id, data_type = ?data_type, "invitation sent");
        Ok(call_id)
    }

    fn accept_transfer(&self, call_id: Uuid, stream: SharedStream) -> Result<(), SessionError> {
        let (invite, session_id, data_type) = {
            let mut props = self
                .properties
                .get_mut(&call_id)
                .ok_or(SessionError::UnknownCall(call_id))?;
            let invite = props.pending_invite.take().ok_or(SessionError::InvalidOperation(
                "no pending invitation for this call",
            ))?;
            (invite, props.session_id, props.data_type)
        };

        let session = Arc::new(TransferSession::new(
            call_id,
            session_id,
            self.version,
            data_type,
            Self::invitee_sends(data_type),
            self.outbound.clone(),
            self.signals.clone(),
        ));
        session.set_stream(stream);

        let mut reply = invite.reply(STATUS_OK, "OK", SlpContentType::SessionReq);
        reply.set_field("SessionID", session_id.to_string());
        if let Some(mut props) = self.properties.get_mut(&call_id) {
            props.last_cseq = reply.cseq;
        }

        self.sessions.insert(call_id, Arc::clone(&session));
        if let Err(err) = session.accept_invitation(wrap_slp(self.version, &reply)) {
            self.sessions.remove(&call_id);
            return Err(err);
        }
        self.observer.on_session_created(call_id, session_id);
        info!(call_id = %call_id, session_id, "invitation accepted");

        if session.is_sender() {
            session.start_data_transfer(false)?;
        }
        Ok(())
    }

    fn decline_transfer(&self, call_id: Uuid) -> Result<(), SessionError> {
        let (invite, session_id) = {
            let mut props = self
                .properties
                .get_mut(&call_id)
                .ok_or(SessionError::UnknownCall(call_id))?;
            let invite = props.pending_invite.take().ok_or(SessionError::InvalidOperation(
                "no pending invitation for this call",
            ))?;
            (invite, props.session_id)
        };

        let reply = invite.reply(STATUS_DECLINE, "Decline", SlpContentType::SessionReq);
        self.outbound.send(wrap_slp(self.version, &reply))?;
        self.send_bye(call_id, session_id)?;
        info!(call_id = %call_id, "invitation declined");
        self.remove_call(call_id);
        Ok(())
    }

    fn close_transfer(&self, call_id: Uuid) -> Result<(), SessionError> {
        let session_id = self
            .properties
            .get(&call_id)
            .map(|props| props.session_id)
            .ok_or(SessionError::UnknownCall(call_id))?;
        self.send_bye(call_id, session_id)?;
        info!(call_id = %call_id, "session closed locally");
        self.remove_call(call_id);
        Ok(())
    }

    fn send_bye(&self, call_id: Uuid, session_id: u32) -> Result<(), SessionError> {
        let mut bye = SlpMessage::request(
            METHOD_BYE,
            &self.remote_passport,
            &self.local_passport,
            SlpContentType::SessionClose,
        );
        bye.call_id = call_id;
        bye.set_field("SessionID", session_id.to_string());
        self.outbound.send(wrap_slp(self.version, &bye))
    }

    fn handle_bye(&self, slp: SlpMessage) {
        let call_id = slp.call_id;
        let resolved = match self.properties.get_mut(&call_id) {
            Some(mut props) => {
                props.close_state -= 1;
                props.close_state <= 0
            }
            None => {
                trace!(call_id = %call_id, "close for an unknown call");
                return;
            }
        };
        if resolved {
            info!(call_id = %call_id, "session closed by peer");
            self.remove_call(call_id);
        }
    }

    fn handle_accepted(self: &Arc<Self>, slp: SlpMessage) {
        match slp.content_type {
            SlpContentType::SessionReq => self.handle_invite_accepted(slp),
            SlpContentType::TransResp => self.handle_direct_answer(slp),
            _ => trace!(
                call_id = %slp.call_id,
                content_type = slp.content_type.as_str(),
                "ignoring acceptance body"
            ),
        }
    }

    fn handle_invite_accepted(self: &Arc<Self>, slp: SlpMessage) {
        let call_id = slp.call_id;
        let Some(session) = self.session_by_call(call_id) else {
            trace!(call_id = %call_id, "acceptance for an unknown call");
            return;
        };
        if let Some(mut props) = self.properties.get_mut(&call_id) {
            props.last_branch = slp.branch;
            props.last_cseq = slp.cseq;
        }
        info!(call_id = %call_id, "invitation accepted by peer");
        if !session.is_sender() {
            // The peer supplies the payload; nothing to schedule here.
            return;
        }

        let delay = self.config.settle_delay;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.begin_direct_negotiation(call_id);
            }
        });
        if let Some(mut props) = self.properties.get_mut(&call_id) {
            props.settle_abort = Some(task.abort_handle());
        }
    }

    fn handle_rejected(&self, slp: SlpMessage, code: u16) {
        let call_id = slp.call_id;
        if !self.properties.contains_key(&call_id) {
            trace!(call_id = %call_id, code, "rejection for an unknown call");
            return;
        }
        info!(call_id = %call_id, code, "invitation rejected by peer");
        self.remove_call(call_id);
    }

    fn begin_direct_negotiation(self: &Arc<Self>, call_id: Uuid) {
        match self.send_direct_offer(call_id) {
            Ok(()) => {}
            Err(SessionError::Unsupported(what)) => {
                debug!(call_id = %call_id, what, "falling back to the relay path");
                self.start_transfer(call_id, false);
            }
            Err(SessionError::UnknownCall(_)) => {
                trace!(call_id = %call_id, "negotiation target disappeared");
            }
            Err(err) => {
                warn!(call_id = %call_id, error = %err, "direct-connection offer failed");
                self.start_transfer(call_id, false);
            }
        }
    }

    fn send_direct_offer(&self, call_id: Uuid) -> Result<(), SessionError> {
        if self.version == WireVersion::V2 {
            return Err(SessionError::Unsupported(
                "direct connections on the v2 transport",
            ));
        }
        let nonce = self
            .properties
            .get(&call_id)
            .map(|props| props.nonce)
            .ok_or(SessionError::UnknownCall(call_id))?;

        let mut offer = SlpMessage::request(
            METHOD_INVITE,
            &self.remote_passport,
            &self.local_passport,
            SlpContentType::TransReq,
        );
        offer.call_id = call_id;
        let conn_type =
            ConnectionType::from_endpoints(self.config.local_endpoint, self.config.external_endpoint);
        offer.set_field("Bridges", "TRUDPv1 TCPv1");
        offer.set_field("Capabilities-Flags", "1");
        offer.set_field("NetID", net_id(self.config.external_endpoint).to_string());
        offer.set_field("Conn-Type", conn_type.as_str());
        offer.set_field("UPnPNat", "false");
        offer.set_field("ICF", "false");
        offer.set_field("Hashed-Nonce", format_guid(hash_nonce(nonce)));

        if let Some(mut props) = self.properties.get_mut(&call_id) {
            props.last_branch = offer.branch;
            props.last_cseq = offer.cseq;
        }
        info!(call_id = %call_id, conn_type = %conn_type, "offering a direct connection");
        self.outbound.send(wrap_slp(self.version, &offer))
    }

    fn handle_direct_offer(self: &Arc<Self>, slp: SlpMessage) {
        let call_id = slp.call_id;
        if self.version == WireVersion::V2 {
            trace!(call_id = %call_id, "direct offer on a v2 transport, ignoring");
            return;
        }
        if !self.properties.contains_key(&call_id) {
            trace!(call_id = %call_id, "direct offer for an unknown call");
            return;
        }

        // Which nonce field the peer sent decides the verification mode.
        let hashed = slp.field("Hashed-Nonce").and_then(|v| parse_guid(v).ok());
        let plain = slp.field("Nonce").and_then(|v| parse_guid(v).ok());
        let (auth, echo_key) = match (hashed, plain) {
            (Some(expected), _) => (
                AuthState {
                    expected,
                    hash_incoming: true,
                },
                "Hashed-Nonce",
            ),
            (None, Some(expected)) => (
                AuthState {
                    expected,
                    hash_incoming: false,
                },
                "Nonce",
            ),
            (None, None) => {
                warn!(call_id = %call_id, "direct offer without a nonce");
                return;
            }
        };
        if let Some(mut props) = self.properties.get_mut(&call_id) {
            props.hashed_nonce = hashed;
            props.last_branch = slp.branch;
            props.last_cseq = slp.cseq;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.answer_direct_offer(slp, auth, echo_key).await;
        });
    }

    async fn answer_direct_offer(
        self: Arc<Self>,
        offer: SlpMessage,
        auth: AuthState,
        echo_key: &'static str,
    ) {
        let call_id = offer.call_id;
        let mut reply = offer.reply(STATUS_OK, "OK", SlpContentType::TransResp);
        reply.set_field("Bridge", "TCPv1");
        reply.set_field(echo_key, format_guid(auth.expected));

        let bound = match bind_listener(&self.config).await {
            Ok(listener) => match listener.local_addr() {
                Ok(addr) => Some((listener, addr.port())),
                Err(err) => {
                    warn!(call_id = %call_id, error = %err, "listener address unavailable");
                    None
                }
            },
            Err(err) => {
                debug!(call_id = %call_id, error = %err, "not listening for a direct connection");
                None
            }
        };

        match bound {
            Some((listener, port)) => {
                let internal = self
                    .config
                    .local_endpoint
                    .map(|addr| addr.ip())
                    .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
                reply.set_field("Listening", "true");
                reply.set_field("IPv4Internal-Addrs", internal.to_string());
                reply.set_field("IPv4Internal-Port", port.to_string());
                if let Some(external) = self.config.external_endpoint {
                    if Some(external) != self.config.local_endpoint {
                        reply.set_field("IPv4External-Addrs", external.ip().to_string());
                        reply.set_field("IPv4External-Port", external.port().to_string());
                    }
                }

                let expiry = self.config.listener_expiry;
                let weak = Arc::downgrade(&self);
                tokio::spawn(async move {
                    match run_listener(listener, expiry, auth).await {
                        Ok((stream, _)) => {
                            if let Some(inner) = weak.upgrade() {
                                inner.adopt_direct(call_id, stream);
                            }
                        }
                        Err(err) => {
                            debug!(call_id = %call_id, error = %err, "direct listener gave up")
                        }
                    }
                });
            }
            None => {
                reply.set_field("Listening", "false");
            }
        }

        if let Err(err) = self.outbound.send(wrap_slp(self.version, &reply)) {
            warn!(call_id = %call_id, error = %err, "direct answer failed to send");
        }
        if let Some(mut props) = self.properties.get_mut(&call_id) {
            props.last_cseq = reply.cseq;
        }
    }

    fn handle_direct_answer(self: &Arc<Self>, slp: SlpMessage) {
        let call_id = slp.call_id;
        let Some(nonce) = self.properties.get(&call_id).map(|props| props.nonce) else {
            trace!(call_id = %call_id, "direct answer for an unknown call");
            return;
        };
        if let Some(mut props) = self.properties.get_mut(&call_id) {
            props.last_branch = slp.branch;
            props.last_cseq = slp.cseq;
        }

        let listening = slp
            .field("Listening")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !listening {
            debug!(call_id = %call_id, "peer is not listening; staying on the relay path");
            self.start_transfer(call_id, false);
            return;
        }

        let mut candidates = Vec::new();
        for (addr_key, port_key) in [
            ("IPv4Internal-Addrs", "IPv4Internal-Port"),
            ("IPv4External-Addrs", "IPv4External-Port"),
        ] {
            if let (Some(addr), Some(port)) = (slp.field(addr_key), slp.field(port_key)) {
                if let (Ok(ip), Ok(port)) = (addr.parse::<IpAddr>(), port.parse::<u16>()) {
                    candidates.push(SocketAddr::new(ip, port));
                }
            }
        }
        if candidates.is_empty() {
            debug!(call_id = %call_id, "direct answer without a usable address");
            self.start_transfer(call_id, false);
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.connect_direct(call_id, candidates, nonce).await;
        });
    }

    async fn connect_direct(self: Arc<Self>, call_id: Uuid, candidates: Vec<SocketAddr>, nonce: Uuid) {
        let auth = AuthState {
            expected: nonce,
            hash_incoming: false,
        };
        for candidate in candidates {
            let mut stream =
                match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(candidate)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(err)) => {
                        debug!(%candidate, error = %err, "direct connect failed");
                        continue;
                    }
                    Err(_) => {
                        debug!(%candidate, "direct connect timed out");
                        continue;
                    }
                };
            match connect_handshake(&mut stream, nonce, auth).await {
                Ok(_) => {
                    self.adopt_direct(call_id, stream);
                    self.start_transfer(call_id, true);
                    return;
                }
                Err(err) => {
                    debug!(%candidate, error = %err, "direct handshake failed");
                }
            }
        }
        debug!(call_id = %call_id, "no direct route; staying on the relay path");
        self.start_transfer(call_id, false);
    }

    /// Puts an authenticated socket in charge of the data path.
    fn adopt_direct(self: &Arc<Self>, call_id: Uuid, stream: TcpStream) {
        let pump = Arc::new(MessagePump::new(
            self.registry.clone(),
            self.outbound.clone(),
        ));
        let connection = DirectConnection::spawn(stream, self.version, pump);
        let peer = connection.peer();
        *self.direct.lock().expect("direct lock poisoned") = Some(Arc::clone(&connection));
        self.outbound
            .switch_processor(connection, self.config.max_direct_chunk);
        info!(call_id = %call_id, %peer, "direct connection established");
        self.observer.on_direct_connected(call_id, peer);
    }

    fn start_transfer(&self, call_id: Uuid, over_direct: bool) {
        let Some(session) = self.session_by_call(call_id) else {
            return;
        };
        if let Err(err) = session.start_data_transfer(over_direct) {
            warn!(call_id = %call_id, error = %err, "transfer start failed");
        }
    }

    fn finish_session(&self, call_id: Uuid) {
        info!(call_id = %call_id, "transfer finished");
        self.observer.on_transfer_finished(call_id);
        let local_invited = self
            .properties
            .get(&call_id)
            .map(|props| (!props.remote_invited, props.session_id));
        if let Some((true, session_id)) = local_invited {
            // The inviting side closes once its payload has moved; the
            // invited side waits for that close instead.
            if let Err(err) = self.send_bye(call_id, session_id) {
                warn!(call_id = %call_id, error = %err, "close message failed");
            }
            self.remove_call(call_id);
        }
    }

    fn abort_session(&self, call_id: Uuid) {
        if self.properties.contains_key(&call_id) || self.sessions.contains_key(&call_id) {
            warn!(call_id = %call_id, "transfer aborted");
            self.observer.on_transfer_aborted(call_id);
            self.remove_call(call_id);
        }
    }

    /// Removes all state for `call_id` and reports the closure once.
    fn remove_call(&self, call_id: Uuid) {
        let props = self.properties.remove(&call_id);
        let session = self.sessions.remove(&call_id);
        if props.is_none() && session.is_none() {
            return;
        }
        if let Some((_, props)) = &props {
            if let Some(abort) = &props.settle_abort {
                abort.abort();
            }
        }
        if let Some((_, session)) = &session {
            session.stop();
        }
        if self.sessions.is_empty() {
            self.drop_direct();
        }
        self.observer.on_session_closed(call_id);
    }

    /// Releases the direct connection and points outbound back at the relay.
    fn drop_direct(&self) {
        if let Some(connection) = self.direct.lock().expect("direct lock poisoned").take() {
            debug!(peer = %connection.peer(), "releasing the direct connection");
            self.outbound
                .switch_processor(Arc::clone(&self.relay), self.config.max_relay_chunk);
        }
    }

    fn session_by_call(&self, call_id: Uuid) -> Option<Arc<TransferSession>> {
        self.sessions
            .get(&call_id)
            .map(|entry| Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::LoopbackProcessor;
    use crate::transfer::{shared_stream, MemoryStream};
    use async_trait::async_trait;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Event {
        Invitation,
        Created,
        Closed,
        Finished,
        Aborted,
        Progress,
        DirectConnected,
    }

    struct Recorder {
        decide: Box<dyn Fn(&TransferInvitation) -> InviteDecision + Send + Sync>,
        events: mpsc::UnboundedSender<Event>,
    }

    impl Recorder {
        fn new(
            decide: impl Fn(&TransferInvitation) -> InviteDecision + Send + Sync + 'static,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    decide: Box::new(decide),
                    events: tx,
                }),
                rx,
            )
        }
    }

    impl TransferObserver for Recorder {
        fn on_invitation(&self, invitation: &TransferInvitation) -> InviteDecision {
            let _ = self.events.send(Event::Invitation);
            (self.decide)(invitation)
        }
        fn on_session_created(&self, _call_id: Uuid, _session_id: u32) {
            let _ = self.events.send(Event::Created);
        }
        fn on_session_closed(&self, _call_id: Uuid) {
            let _ = self.events.send(Event::Closed);
        }
        fn on_transfer_finished(&self, _call_id: Uuid) {
            let _ = self.events.send(Event::Finished);
        }
        fn on_transfer_aborted(&self, _call_id: Uuid) {
            let _ = self.events.send(Event::Aborted);
        }
        fn on_progress(&self, _call_id: Uuid, _transferred: u64, _total: u64) {
            let _ = self.events.send(Event::Progress);
        }
        fn on_direct_connected(&self, _call_id: Uuid, _peer: SocketAddr) {
            let _ = self.events.send(Event::DirectConnected);
        }
    }

    struct Capture {
        tx: mpsc::UnboundedSender<Message>,
    }

    #[async_trait]
    impl MessageProcessor for Capture {
        async fn send_message(&self, message: Message) -> Result<(), SessionError> {
            self.tx.send(message).map_err(|_| SessionError::ChannelClosed)
        }
    }

    fn test_config() -> P2pConfig {
        P2pConfig {
            settle_delay: Duration::from_millis(20),
            listener_expiry: Duration::from_millis(500),
            probe_attempts: 0,
            ..P2pConfig::default()
        }
    }

    fn pair_with(
        version: WireVersion,
        alice_config: P2pConfig,
        bob_config: P2pConfig,
        alice: Arc<dyn TransferObserver>,
        bob: Arc<dyn TransferObserver>,
    ) -> (SlpHandler, SlpHandler) {
        let alice_relay = LoopbackProcessor::unconnected();
        let bob_relay = LoopbackProcessor::unconnected();
        let a = SlpHandler::new(
            version,
            alice_config,
            "alice@example.com",
            "bob@example.com",
            alice,
            alice_relay.clone(),
        );
        let b = SlpHandler::new(
            version,
            bob_config,
            "bob@example.com",
            "alice@example.com",
            bob,
            bob_relay.clone(),
        );
        alice_relay.connect(b.pump());
        bob_relay.connect(a.pump());
        (a, b)
    }

    fn connected_pair(
        version: WireVersion,
        alice: Arc<dyn TransferObserver>,
        bob: Arc<dyn TransferObserver>,
    ) -> (SlpHandler, SlpHandler) {
        pair_with(version, test_config(), test_config(), alice, bob)
    }

    async fn expect_event(rx: &mut mpsc::UnboundedReceiver<Event>, wanted: Event) {
        loop {
            let event = timeout(WAIT, rx.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("event channel closed");
            if event == wanted {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_file_transfer_over_relay() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let sink: Arc<StdMutex<MemoryStream>> = Arc::new(StdMutex::new(MemoryStream::new()));
        let decision_sink = Arc::clone(&sink);
        let (bob, mut bob_events) =
            Recorder::new(move |_| InviteDecision::Accept(Arc::clone(&decision_sink) as SharedStream));
        let (alice, mut alice_events) = Recorder::new(|_| InviteDecision::Delay);
        let (a, b) = connected_pair(WireVersion::V1, alice, bob);

        let source = shared_stream(MemoryStream::from_vec(payload.clone()));
        let call_id = a.send_file("report.txt", source).unwrap();

        expect_event(&mut bob_events, Event::Invitation).await;
        expect_event(&mut bob_events, Event::Created).await;
        expect_event(&mut alice_events, Event::Finished).await;
        expect_event(&mut alice_events, Event::Closed).await;
        expect_event(&mut bob_events, Event::Finished).await;
        expect_event(&mut bob_events, Event::Closed).await;

        assert_eq!(sink.lock().unwrap().contents(), &payload[..]);
        assert_eq!(a.session_count(), 0);
        assert_eq!(b.session_count(), 0);
        assert!(a.session(call_id).is_none());

        // The peer never listened, so the data path stayed on the relay.
        while let Ok(event) = alice_events.try_recv() {
            assert_ne!(event, Event::DirectConnected);
        }
    }

    #[tokio::test]
    async fn test_v2_file_transfer_falls_back_to_relay() {
        let payload = vec![0x42u8; 4000];
        let sink: Arc<StdMutex<MemoryStream>> = Arc::new(StdMutex::new(MemoryStream::new()));
        let decision_sink = Arc::clone(&sink);
        let (bob, mut bob_events) =
            Recorder::new(move |_| InviteDecision::Accept(Arc::clone(&decision_sink) as SharedStream));
        let (alice, mut alice_events) = Recorder::new(|_| InviteDecision::Delay);
        let (a, b) = connected_pair(WireVersion::V2, alice, bob);

        let source = shared_stream(MemoryStream::from_vec(payload.clone()));
        a.send_file("photo.jpg", source).unwrap();

        expect_event(&mut alice_events, Event::Finished).await;
        expect_event(&mut bob_events, Event::Finished).await;
        expect_event(&mut bob_events, Event::Closed).await;

        assert_eq!(sink.lock().unwrap().contents(), &payload[..]);
        assert_eq!(b.session_count(), 0);
        while let Ok(event) = alice_events.try_recv() {
            assert_ne!(event, Event::DirectConnected);
        }
    }

    #[tokio::test]
    async fn test_direct_connection_takes_over_transfer() {
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i.wrapping_mul(7) % 256) as u8).collect();
        let sink: Arc<StdMutex<MemoryStream>> = Arc::new(StdMutex::new(MemoryStream::new()));
        let decision_sink = Arc::clone(&sink);
        let (bob, mut bob_events) =
            Recorder::new(move |_| InviteDecision::Accept(Arc::clone(&decision_sink) as SharedStream));
        let (alice, mut alice_events) = Recorder::new(|_| InviteDecision::Delay);

        let mut bob_config = test_config();
        bob_config.probe_port_base = 36119;
        bob_config.probe_attempts = 5;
        let (a, b) = pair_with(WireVersion::V1, test_config(), bob_config, alice, bob);

        let source = shared_stream(MemoryStream::from_vec(payload.clone()));
        a.send_file("big.bin", source).unwrap();

        expect_event(&mut bob_events, Event::DirectConnected).await;
        expect_event(&mut alice_events, Event::DirectConnected).await;
        expect_event(&mut alice_events, Event::Finished).await;
        expect_event(&mut alice_events, Event::Closed).await;
        expect_event(&mut bob_events, Event::Finished).await;
        expect_event(&mut bob_events, Event::Closed).await;

        assert_eq!(sink.lock().unwrap().contents(), &payload[..]);
        assert_eq!(a.session_count(), 0);
        assert_eq!(b.session_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_invitation_type_refused() {
        let (observer, mut events) = Recorder::new(|_| InviteDecision::Delay);
        let (tx, mut outbox) = mpsc::unbounded_channel();
        let handler = SlpHandler::new(
            WireVersion::V1,
            test_config(),
            "alice@example.com",
            "bob@example.com",
            observer,
            Arc::new(Capture { tx }),
        );

        let mut invite = SlpMessage::request(
            METHOD_INVITE,
            "alice@example.com",
            "bob@example.com",
            SlpContentType::SessionReq,
        );
        invite.set_field("EUF-GUID", format_guid(Uuid::from_u128(1)));
        invite.set_field("SessionID", "77");
        invite.set_field("AppID", "1");
        invite.set_field("Context", BASE64.encode(b"anything"));
        handler.pump().ingest(wrap_slp(WireVersion::V1, &invite), false);

        let reply = timeout(WAIT, outbox.recv()).await.unwrap().unwrap();
        let slp = SlpMessage::parse(reply.body()).unwrap();
        assert_eq!(slp.status_code(), Some(STATUS_INTERNAL_ERROR));
        assert!(events.try_recv().is_err());
        assert_eq!(handler.session_count(), 0);
    }

    #[tokio::test]
    async fn test_close_for_unknown_call_is_ignored() {
        let (observer, mut events) = Recorder::new(|_| InviteDecision::Delay);
        let (tx, _outbox) = mpsc::unbounded_channel();
        let handler = SlpHandler::new(
            WireVersion::V1,
            test_config(),
            "alice@example.com",
            "bob@example.com",
            observer,
            Arc::new(Capture { tx }),
        );

        let mut bye = SlpMessage::request(
            METHOD_BYE,
            "alice@example.com",
            "bob@example.com",
            SlpContentType::SessionClose,
        );
        bye.set_field("SessionID", "123");
        handler.pump().ingest(wrap_slp(WireVersion::V1, &bye), false);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_decline_tears_both_sides_down() {
        let (alice, mut alice_events) = Recorder::new(|_| InviteDecision::Delay);
        let (bob, mut bob_events) = Recorder::new(|_| InviteDecision::Decline);
        let (a, b) = connected_pair(WireVersion::V1, alice, bob);

        let source = shared_stream(MemoryStream::from_vec(vec![1u8; 64]));
        let call_id = a.send_file("unwanted.bin", source).unwrap();

        expect_event(&mut bob_events, Event::Invitation).await;
        expect_event(&mut bob_events, Event::Closed).await;
        expect_event(&mut alice_events, Event::Closed).await;

        assert_eq!(a.session_count(), 0);
        assert_eq!(b.session_count(), 0);
        assert!(a.session(call_id).is_none());
    }

    #[tokio::test]
    async fn test_delayed_accept_completes_transfer() {
        let payload = vec![7u8; 1500];
        let (invite_tx, mut invite_rx) = mpsc::unbounded_channel();
        let (bob, mut bob_events) = Recorder::new(move |invitation: &TransferInvitation| {
            let _ = invite_tx.send((invitation.call_id, invitation.file.clone()));
            InviteDecision::Delay
        });
        let (alice, mut alice_events) = Recorder::new(|_| InviteDecision::Delay);
        let (a, b) = connected_pair(WireVersion::V1, alice, bob);

        let source = shared_stream(MemoryStream::from_vec(payload.clone()));
        let call_id = a.send_file("slow.bin", source).unwrap();

        let (seen_call, file) = timeout(WAIT, invite_rx.recv()).await.unwrap().unwrap();
        assert_eq!(seen_call, call_id);
        let file = file.expect("file invitation carries a context");
        assert_eq!(file.file_name, "slow.bin");
        assert_eq!(file.file_size, 1500);

        let sink: Arc<StdMutex<MemoryStream>> = Arc::new(StdMutex::new(MemoryStream::new()));
        b.accept_transfer(seen_call, Arc::clone(&sink) as SharedStream)
            .unwrap();

        expect_event(&mut alice_events, Event::Finished).await;
        expect_event(&mut bob_events, Event::Finished).await;
        expect_event(&mut bob_events, Event::Closed).await;
        assert_eq!(sink.lock().unwrap().contents(), &payload[..]);
    }

    #[tokio::test]
    async fn test_object_request_hands_context_to_observer() {
        let tile = vec![0x89u8; 600];
        let object =
            Bytes::from_static(b"<msnobj Creator=\"bob@example.com\" Type=\"3\" SHA1D=\"u6zC\"/>");
        let tile_source = tile.clone();
        let (invite_tx, mut invite_rx) = mpsc::unbounded_channel();
        let (bob, mut bob_events) = Recorder::new(move |invitation: &TransferInvitation| {
            let _ = invite_tx.send(invitation.clone());
            InviteDecision::Accept(shared_stream(MemoryStream::from_vec(tile_source.clone())))
        });
        let (alice, mut alice_events) = Recorder::new(|_| InviteDecision::Delay);
        let (a, _b) = connected_pair(WireVersion::V1, alice, bob);

        let sink: Arc<StdMutex<MemoryStream>> = Arc::new(StdMutex::new(MemoryStream::new()));
        let call_id = a
            .send_object_request(
                object.clone(),
                DataType::UserTile,
                Arc::clone(&sink) as SharedStream,
            )
            .unwrap();

        let invitation = timeout(WAIT, invite_rx.recv()).await.unwrap().unwrap();
        assert_eq!(invitation.call_id, call_id);
        assert_eq!(invitation.data_type, DataType::UserTile);
        assert_eq!(invitation.context, object);
        assert!(invitation.file.is_none());
        assert!(invitation.activity.is_none());

        expect_event(&mut bob_events, Event::Finished).await;
        expect_event(&mut alice_events, Event::Finished).await;
        expect_event(&mut alice_events, Event::Closed).await;
        expect_event(&mut bob_events, Event::Closed).await;
        assert_eq!(sink.lock().unwrap().contents(), &tile[..]);
    }

    #[tokio::test]
    async fn test_concurrent_invitations_close_independently() {
        let (alice, _alice_events) = Recorder::new(|_| InviteDecision::Delay);
        let (bob, _bob_events) = Recorder::new(|_| InviteDecision::Delay);
        let (a, _b) = connected_pair(WireVersion::V1, alice, bob);

        let first = a
            .send_file("one.bin", shared_stream(MemoryStream::from_vec(vec![1u8; 32])))
            .unwrap();
        let second = a
            .send_file("two.bin", shared_stream(MemoryStream::from_vec(vec![2u8; 32])))
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(a.session_count(), 2);
        assert!(a.session(first).is_some());
        assert!(a.session(second).is_some());

        a.close_transfer(first).unwrap();
        assert_eq!(a.session_count(), 1);
        assert!(a.session(first).is_none());
        assert!(a.session(second).is_some());

        a.close_transfer(second).unwrap();
        assert_eq!(a.session_count(), 0);
    }

    #[tokio::test]
    async fn test_activity_session_stays_open() {
        let payload = b"MOVE 4".to_vec();
        let sink: Arc<StdMutex<MemoryStream>> = Arc::new(StdMutex::new(MemoryStream::new()));
        let decision_sink = Arc::clone(&sink);
        let (invite_tx, mut invite_rx) = mpsc::unbounded_channel();
        let (bob, mut bob_events) = Recorder::new(move |invitation: &TransferInvitation| {
            let _ = invite_tx.send(invitation.activity.clone());
            InviteDecision::Accept(Arc::clone(&decision_sink) as SharedStream)
        });
        let (alice, mut alice_events) = Recorder::new(|_| InviteDecision::Delay);
        let (a, _b) = connected_pair(WireVersion::V1, alice, bob);

        let context = ActivityContext {
            activity_id: 99,
            activity_name: "Tic Tac Toe".to_string(),
        };
        let source = shared_stream(MemoryStream::from_vec(payload.clone()));
        let call_id = a.send_activity_invitation(&context, source, true).unwrap();

        let activity = timeout(WAIT, invite_rx.recv())
            .await
            .unwrap()
            .unwrap()
            .expect("activity invitation carries a context");
        assert_eq!(activity.activity_id, 99);
        assert_eq!(activity.activity_name, "Tic Tac Toe");

        expect_event(&mut bob_events, Event::Progress).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = bob_events.try_recv() {
            assert_ne!(event, Event::Finished);
            assert_ne!(event, Event::Closed);
        }
        assert_eq!(sink.lock().unwrap().contents(), &payload[..]);

        a.close_transfer(call_id).unwrap();
        expect_event(&mut alice_events, Event::Closed).await;
        expect_event(&mut bob_events, Event::Closed).await;
        assert_eq!(a.session_count(), 0);
    }
}

//! One live peer session: the p2p base-capability handshake, the
//! sub-protocol handler registry and frame routing between them.
//!
//! A session consumes already-deciphered RLPx frames from the transport
//! below and owns everything above: Hello exchange, capability agreement,
//! message-id space allocation, keepalive, and the disconnect state
//! machine. Handlers talk back through a [`SessionHandle`], never through
//! a direct reference, so the session ↔ handler graph stays acyclic.

use std::{
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use ethwire_common::H512;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};

use crate::{
    backend::Discovery,
    metrics::METRICS,
    node_stats::{DisconnectDirection, NodeStats},
    types::Node,
};

use super::{
    error::RLPxError,
    message::{Message, MessageProtocol, RLPxMessage},
    multiplexer::ProtocolRegistry,
    p2p::{
        Capability, DisconnectMessage, DisconnectReason, HelloMessage, P2P_MESSAGE_SPACE,
        PingMessage, PongMessage, SNAPPY_P2P_VERSION, SUPPORTED_P2P_VERSION,
    },
    utils::{log_peer_debug, log_peer_warn, snappy_compress, snappy_decompress},
};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Missing pongs for this long mean the peer is gone.
const PONG_TIMEOUT: Duration = Duration::from_secs(30);
/// Outbound frames waiting for the writer task.
const OUTBOUND_QUEUE_SIZE: usize = 64;

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Session lifecycle. Transitions are monotonically non-decreasing; a
/// session never leaves `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    New = 0,
    HandshakeComplete = 1,
    Initialized = 2,
    DisconnectRequested = 3,
    Disconnecting = 4,
    Disconnected = 5,
}

impl SessionState {
    fn from_u8(value: u8) -> SessionState {
        match value {
            0 => SessionState::New,
            1 => SessionState::HandshakeComplete,
            2 => SessionState::Initialized,
            3 => SessionState::DisconnectRequested,
            4 => SessionState::Disconnecting,
            _ => SessionState::Disconnected,
        }
    }
}

/// A sub-protocol endpoint installed on a session, one per protocol code.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Handles one inbound frame of this protocol. `code` is the message
    /// id within the protocol's own space. An error tears the session
    /// down with the mapped disconnect reason.
    async fn handle_message(&self, code: u8, data: Bytes) -> Result<(), RLPxError>;

    /// Called exactly once when the session goes down; outstanding
    /// requests must resolve with a cancellation error here.
    async fn on_disconnect(&self, reason: DisconnectReason);
}

/// Constructs a protocol handler once the capability is agreed.
pub trait ProtocolHandlerFactory: Send + Sync {
    /// Protocol code, e.g. `"eth"`.
    fn code(&self) -> &str;
    /// Versions this factory can speak, used for capability agreement.
    fn supported_versions(&self) -> Vec<u8>;
    /// Size of the message-id space at the given version.
    fn message_space(&self, version: u8) -> u8;
    fn create(&self, session: SessionHandle, version: u8) -> Arc<dyn ProtocolHandler>;
}

/// Message-id space allocation: `p2p` owns `0..16` unconditionally, agreed
/// capabilities follow in agreement order.
#[derive(Debug, Clone)]
pub struct OffsetTable {
    entries: Vec<OffsetEntry>,
}

#[derive(Debug, Clone)]
struct OffsetEntry {
    capability: Capability,
    start: u8,
    size: u8,
}

impl Default for OffsetTable {
    fn default() -> Self {
        Self {
            entries: vec![OffsetEntry {
                capability: Capability::p2p(SUPPORTED_P2P_VERSION),
                start: 0,
                size: P2P_MESSAGE_SPACE,
            }],
        }
    }
}

impl OffsetTable {
    /// Resolves an absolute message id to its capability and the id within
    /// that capability's space.
    pub fn resolve(&self, absolute: u8) -> Option<(&Capability, u8)> {
        self.entries
            .iter()
            .find(|entry| absolute >= entry.start && absolute < entry.start + entry.size)
            .map(|entry| (&entry.capability, absolute - entry.start))
    }

    /// Start offset and negotiated version for a protocol code.
    pub fn offset_for(&self, protocol: &str) -> Option<(u8, u8)> {
        self.entries
            .iter()
            .find(|entry| entry.capability.protocol == protocol)
            .map(|entry| (entry.start, entry.capability.version))
    }

    pub fn contains_protocol(&self, protocol: &str) -> bool {
        self.offset_for(protocol).is_some()
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.entries.iter().map(|entry| &entry.capability).skip(1)
    }

    pub(crate) fn append(&mut self, capability: Capability, size: u8) {
        let start = self
            .entries
            .last()
            .map(|entry| entry.start + entry.size)
            .unwrap_or(P2P_MESSAGE_SPACE);
        self.entries.push(OffsetEntry {
            capability,
            start,
            size,
        });
    }
}

/// State shared between the session task, its writer task and every
/// handler-held [`SessionHandle`].
#[derive(Debug)]
struct SessionShared {
    state: AtomicU8,
    best_state: AtomicU8,
    snappy: AtomicBool,
    disconnect_latch: AtomicBool,
    offsets: RwLock<OffsetTable>,
}

impl Default for SessionShared {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(SessionState::New as u8),
            best_state: AtomicU8::new(SessionState::New as u8),
            snappy: AtomicBool::new(false),
            disconnect_latch: AtomicBool::new(false),
            offsets: RwLock::new(OffsetTable::default()),
        }
    }
}

impl SessionShared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn best_state(&self) -> SessionState {
        SessionState::from_u8(self.best_state.load(Ordering::Acquire))
    }

    /// Monotonic: a transition backwards is ignored.
    fn advance_state(&self, next: SessionState) {
        self.state.fetch_max(next as u8, Ordering::AcqRel);
        self.best_state.fetch_max(next as u8, Ordering::AcqRel);
    }

    fn read_offsets(&self) -> OffsetTable {
        match self.offsets.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write_offsets(&self, table: OffsetTable) {
        match self.offsets.write() {
            Ok(mut guard) => *guard = table,
            Err(mut poisoned) => **poisoned.get_mut() = table,
        }
    }
}

#[derive(Debug)]
enum SessionControl {
    Disconnect {
        reason: DisconnectReason,
        details: String,
    },
}

/// Cheap cloneable handle to a live session. Handlers and external callers
/// use it to send frames and request disconnection; it holds no strong
/// reference to the session task itself.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub node: Node,
    outbound: mpsc::Sender<Message>,
    control: mpsc::Sender<SessionControl>,
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub async fn send_message(&self, message: Message) -> Result<(), RLPxError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| RLPxError::Disconnected())
    }

    /// Requests disconnection; every call after the first is a no-op.
    pub fn disconnect(&self, reason: DisconnectReason, details: impl Into<String>) {
        if self.shared.disconnect_latch.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.advance_state(SessionState::DisconnectRequested);
        let _ = self.control.try_send(SessionControl::Disconnect {
            reason,
            details: details.into(),
        });
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Highest state the session ever reached; latched even after the
    /// session starts tearing down.
    pub fn best_state_reached(&self) -> SessionState {
        self.shared.best_state()
    }

    pub fn negotiated_capabilities(&self) -> Vec<Capability> {
        self.shared.read_offsets().capabilities().cloned().collect()
    }

    pub fn supports_protocol(&self, protocol: &str) -> bool {
        self.shared.read_offsets().contains_protocol(protocol)
    }

    /// Channel-backed handle for driving handlers in tests, without a
    /// session task behind it.
    #[cfg(test)]
    pub(crate) fn for_tests(
        node: Node,
        offsets: OffsetTable,
    ) -> (Self, mpsc::Receiver<Message>, mpsc::Receiver<()>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (control_tx, mut control_rx) = mpsc::channel(8);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            if control_rx.recv().await.is_some() {
                let _ = disconnect_tx.send(()).await;
            }
        });
        let shared = Arc::new(SessionShared::default());
        shared.write_offsets(offsets);
        shared.advance_state(SessionState::Initialized);
        (
            Self {
                session_id: 1,
                node,
                outbound: outbound_tx,
                control: control_tx,
                shared,
            },
            outbound_rx,
            disconnect_rx,
        )
    }
}

/// Lifecycle notifications consumed by the sync-peer registry and node
/// stats.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Initialized {
        session_id: SessionId,
        node: Node,
        capabilities: Vec<Capability>,
    },
    Disconnected {
        session_id: SessionId,
        node: Node,
        reason: DisconnectReason,
    },
}

/// Everything a session needs from its surroundings.
pub struct SessionContext {
    pub id: SessionId,
    pub node: Node,
    pub direction: Direction,
    pub client_id: String,
    pub local_public_key: H512,
    pub listen_port: u16,
    pub registry: Arc<ProtocolRegistry>,
    pub stats: Arc<NodeStats>,
    pub discovery: Arc<dyn Discovery>,
    pub events: broadcast::Sender<SessionEvent>,
}

pub struct Session {
    context: SessionContext,
    shared: Arc<SessionShared>,
    handlers: Vec<(Capability, Arc<dyn ProtocolHandler>)>,
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: Option<mpsc::Receiver<Message>>,
    control_tx: mpsc::Sender<SessionControl>,
    control_rx: Option<mpsc::Receiver<SessionControl>>,
    last_pong: tokio::time::Instant,
}

impl Session {
    pub fn new(context: SessionContext) -> (Self, SessionHandle) {
        let shared = Arc::new(SessionShared::default());
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let (control_tx, control_rx) = mpsc::channel(8);
        let session = Self {
            context,
            shared,
            handlers: Vec::new(),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            control_tx,
            control_rx: Some(control_rx),
            last_pong: tokio::time::Instant::now(),
        };
        let handle = session.handle();
        (session, handle)
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle {
            session_id: self.context.id,
            node: self.context.node.clone(),
            outbound: self.outbound_tx.clone(),
            control: self.control_tx.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Drives the session to completion over the given frame transport.
    /// Returns once the session reaches `Disconnected`.
    pub async fn run<S, W>(mut self, mut frames_in: S, mut frames_out: W)
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin + Send,
        W: Sink<Bytes> + Unpin + Send,
        W::Error: std::fmt::Display,
    {
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            return;
        };
        let Some(mut control_rx) = self.control_rx.take() else {
            return;
        };

        let result = self.handshake(&mut frames_in, &mut frames_out).await;
        let reason = match result {
            Ok(()) => {
                METRICS.sessions_established.inc();
                let capabilities = {
                    let offsets = self.shared.read_offsets();
                    offsets.capabilities().cloned().collect()
                };
                let _ = self.context.events.send(SessionEvent::Initialized {
                    session_id: self.context.id,
                    node: self.context.node.clone(),
                    capabilities,
                });
                self.dispatch_loop(
                    &mut frames_in,
                    &mut frames_out,
                    &mut outbound_rx,
                    &mut control_rx,
                )
                .await
            }
            Err(error) => {
                log_peer_debug(
                    &self.context.node,
                    &format!("Session handshake failed: {error}"),
                );
                if let RLPxError::DisconnectReceived(reason) = &error {
                    self.context
                        .stats
                        .add_disconnect(DisconnectDirection::Remote, *reason);
                }
                error.disconnect_reason()
            }
        };

        self.teardown(&mut frames_out, reason).await;
    }

    /// Hello exchange: always the first frame in both directions.
    async fn handshake<S, W>(
        &mut self,
        frames_in: &mut S,
        frames_out: &mut W,
    ) -> Result<(), RLPxError>
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin + Send,
        W: Sink<Bytes> + Unpin + Send,
        W::Error: std::fmt::Display,
    {
        let supported = self.context.registry.supported_capabilities();
        let hello = Message::Hello(HelloMessage::new(
            self.context.client_id.clone(),
            supported,
            self.context.listen_port,
            self.context.local_public_key,
        ));
        let frame = self.encode_frame(&hello)?;
        write_frame(frames_out, frame).await?;

        let frame = tokio::time::timeout(HELLO_TIMEOUT, frames_in.next())
            .await
            .map_err(|_| RLPxError::HandshakeError("timed out waiting for Hello".to_string()))?
            .ok_or(RLPxError::Disconnected())??;
        let message = self.decode_frame(&frame)?;

        let hello = match message {
            Message::Hello(hello) => hello,
            Message::Disconnect(disconnect) => {
                return Err(RLPxError::DisconnectReceived(disconnect.reason()));
            }
            other => {
                return Err(RLPxError::ProtocolViolation(format!(
                    "expected Hello, got {other}"
                )));
            }
        };
        self.process_hello(hello)?;

        // install one handler per agreed capability; registration is
        // idempotent per protocol code
        let handle = self.handle();
        let offsets = self.shared.read_offsets();
        for capability in offsets.capabilities() {
            if self
                .handlers
                .iter()
                .any(|(installed, _)| installed.protocol == capability.protocol)
            {
                continue;
            }
            if let Some(factory) = self.context.registry.factory(&capability.protocol) {
                let handler = factory.create(handle.clone(), capability.version);
                self.handlers.push((capability.clone(), handler));
            }
        }
        self.shared.advance_state(SessionState::Initialized);
        log_peer_debug(&self.context.node, "Peer connection initialized");
        Ok(())
    }

    fn process_hello(&mut self, hello: HelloMessage) -> Result<(), RLPxError> {
        let negotiated_p2p = hello.protocol_version.min(SUPPORTED_P2P_VERSION);
        self.shared
            .snappy
            .store(negotiated_p2p >= SNAPPY_P2P_VERSION, Ordering::Release);
        self.context.node.version = Some(hello.client_id);
        self.shared.advance_state(SessionState::HandshakeComplete);

        // inbound sessions advertise their listen port here; a nonzero
        // port replaces whatever ephemeral source port we observed
        if self.context.direction == Direction::Inbound
            && hello.listen_port != 0
            && hello.listen_port != self.context.node.tcp_port
        {
            self.context.node.tcp_port = hello.listen_port;
            self.context.discovery.add_node(self.context.node.clone());
        }

        let agreed = agree_capabilities(
            &self.context.registry.supported_capabilities(),
            &hello.capabilities,
        );
        if agreed.is_empty() {
            return Err(RLPxError::NoMatchingCapabilities());
        }
        let mut table = OffsetTable::default();
        for capability in agreed {
            let size = self.context.registry.message_space(&capability);
            table.append(capability, size);
        }
        self.shared.write_offsets(table);
        Ok(())
    }

    async fn dispatch_loop<S, W>(
        &mut self,
        frames_in: &mut S,
        frames_out: &mut W,
        outbound_rx: &mut mpsc::Receiver<Message>,
        control_rx: &mut mpsc::Receiver<SessionControl>,
    ) -> Option<DisconnectReason>
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin + Send,
        W: Sink<Bytes> + Unpin + Send,
        W::Error: std::fmt::Display,
    {
        let mut ping_interval = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.last_pong = tokio::time::Instant::now();

        loop {
            tokio::select! {
                frame = frames_in.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(error)) => {
                            log_peer_debug(&self.context.node, &format!("Transport error: {error}"));
                            return None;
                        }
                        // abrupt close skips Disconnecting
                        None => return None,
                    };
                    match self.handle_frame(frame, frames_out).await {
                        Ok(None) => {}
                        Ok(Some(reason)) => return Some(reason),
                        Err(error) => {
                            if error.is_fatal() {
                                log_peer_warn(
                                    &self.context.node,
                                    &format!("Error handling message: {error}"),
                                );
                                return error.disconnect_reason();
                            }
                            log_peer_debug(&self.context.node, &format!("Request error: {error}"));
                        }
                    }
                }
                outbound = outbound_rx.recv() => {
                    let Some(message) = outbound else { return None };
                    if let Err(error) = self.write_message(&message, frames_out).await {
                        log_peer_debug(&self.context.node, &format!("Write failed: {error}"));
                        return None;
                    }
                }
                control = control_rx.recv() => {
                    if let Some(SessionControl::Disconnect { reason, details }) = control {
                        log_peer_debug(
                            &self.context.node,
                            &format!("Disconnect requested: {reason} ({details})"),
                        );
                        return Some(reason);
                    }
                }
                _ = ping_interval.tick() => {
                    if self.last_pong.elapsed() > PONG_TIMEOUT {
                        return Some(DisconnectReason::PingTimeout);
                    }
                    if let Err(error) = self.write_message(&Message::Ping(PingMessage {}), frames_out).await {
                        log_peer_debug(&self.context.node, &format!("Ping failed: {error}"));
                        return None;
                    }
                }
            }
        }
    }

    /// Routes one frame. `Ok(Some(reason))` means orderly disconnect.
    async fn handle_frame<W>(
        &mut self,
        frame: Bytes,
        frames_out: &mut W,
    ) -> Result<Option<DisconnectReason>, RLPxError>
    where
        W: Sink<Bytes> + Unpin + Send,
        W::Error: std::fmt::Display,
    {
        let (absolute_code, payload) = split_frame(&frame)?;

        // the base capability is handled by the session itself
        if absolute_code < P2P_MESSAGE_SPACE {
            let message = self.decode_frame(&frame)?;
            return self.handle_p2p_message(message, frames_out).await;
        }

        let offsets = self.shared.read_offsets();
        let Some((capability, code)) = offsets.resolve(absolute_code) else {
            METRICS.messages_dropped.with_label_values(&["unknown"]).inc();
            return Err(RLPxError::ProtocolViolation(format!(
                "message id {absolute_code} outside every agreed capability"
            )));
        };
        let payload = self.decompress_payload(absolute_code, payload)?;

        let handler = self
            .handlers
            .iter()
            .find(|(installed, _)| installed.protocol == capability.protocol)
            .map(|(_, handler)| handler.clone())
            .ok_or_else(|| {
                RLPxError::InternalError(format!("no handler for {capability}"))
            })?;

        // the handler does its own decode; a slow or poisonous payload
        // must not block this loop beyond the handler's admission check
        handler.handle_message(code, Bytes::from(payload)).await?;
        Ok(None)
    }

    async fn handle_p2p_message<W>(
        &mut self,
        message: Message,
        frames_out: &mut W,
    ) -> Result<Option<DisconnectReason>, RLPxError>
    where
        W: Sink<Bytes> + Unpin + Send,
        W::Error: std::fmt::Display,
    {
        match message {
            Message::Disconnect(disconnect) => {
                log_peer_debug(
                    &self.context.node,
                    &format!("Received Disconnect: {}", disconnect.reason()),
                );
                self.context
                    .stats
                    .add_disconnect(DisconnectDirection::Remote, disconnect.reason());
                METRICS
                    .disconnects
                    .with_label_values(&[&disconnect.reason().to_string()])
                    .inc();
                return Err(RLPxError::DisconnectReceived(disconnect.reason()));
            }
            Message::Ping(_) => {
                self.write_message(&Message::Pong(PongMessage {}), frames_out)
                    .await?;
            }
            Message::Pong(_) => {
                self.last_pong = tokio::time::Instant::now();
            }
            Message::Hello(_) => {
                return Err(RLPxError::ProtocolViolation(
                    "unexpected Hello after handshake".to_string(),
                ));
            }
            Message::AddCapability(add) => {
                self.handle_add_capability(add.capability)?;
            }
            other => {
                return Err(RLPxError::MessageNotHandled(format!("{other}")));
            }
        }
        Ok(None)
    }

    /// Runtime capability extension. Only legal while `Initialized`; the
    /// new capability's id space goes after every existing one so both
    /// sides compute the same table.
    fn handle_add_capability(&mut self, capability: Capability) -> Result<(), RLPxError> {
        if self.shared.state() != SessionState::Initialized {
            return Err(RLPxError::StateError(format!(
                "AddCapability in state {:?}",
                self.shared.state()
            )));
        }
        let mut table = self.shared.read_offsets();
        if table.contains_protocol(&capability.protocol) {
            return Ok(());
        }
        let Some(factory) = self.context.registry.factory(&capability.protocol) else {
            log_peer_debug(
                &self.context.node,
                &format!("Ignoring unsupported capability {capability}"),
            );
            return Ok(());
        };
        if !factory.supported_versions().contains(&capability.version) {
            return Ok(());
        }
        let size = self.context.registry.message_space(&capability);
        table.append(capability.clone(), size);
        self.shared.write_offsets(table);
        let handler = factory.create(self.handle(), capability.version);
        self.handlers.push((capability, handler));
        Ok(())
    }

    async fn teardown<W>(&mut self, frames_out: &mut W, reason: Option<DisconnectReason>)
    where
        W: Sink<Bytes> + Unpin + Send,
        W::Error: std::fmt::Display,
    {
        self.shared.advance_state(SessionState::Disconnecting);

        if let Some(reason) = reason {
            let disconnect = Message::Disconnect(DisconnectMessage::new(Some(reason)));
            if let Ok(frame) = self.encode_frame(&disconnect) {
                let _ = write_frame(frames_out, frame).await;
            }
            self.context
                .stats
                .add_disconnect(DisconnectDirection::Local, reason);
            METRICS
                .disconnects
                .with_label_values(&[&reason.to_string()])
                .inc();
        }
        let _ = frames_out.close().await;

        let wire_reason = reason.unwrap_or(DisconnectReason::NetworkError);
        // dispose handlers and drain their correlators
        for (_, handler) in self.handlers.drain(..) {
            handler.on_disconnect(wire_reason).await;
        }
        self.shared.advance_state(SessionState::Disconnected);
        let _ = self.context.events.send(SessionEvent::Disconnected {
            session_id: self.context.id,
            node: self.context.node.clone(),
            reason: wire_reason,
        });
        log_peer_debug(&self.context.node, "Session closed");
    }

    async fn write_message<W>(
        &self,
        message: &Message,
        frames_out: &mut W,
    ) -> Result<(), RLPxError>
    where
        W: Sink<Bytes> + Unpin + Send,
        W::Error: std::fmt::Display,
    {
        let frame = self.encode_frame(message)?;
        write_frame(frames_out, frame).await
    }

    fn encode_frame(&self, message: &Message) -> Result<Bytes, RLPxError> {
        use ethwire_rlp::encode::RLPEncode;

        let offsets = self.shared.read_offsets();
        let protocol = message.protocol();
        let Some((start, version)) = offsets.offset_for(protocol.code()) else {
            return Err(RLPxError::MessageNotHandled(format!(
                "capability {} not agreed",
                protocol.code()
            )));
        };

        let mut payload = Vec::new();
        message.encode_payload(&mut payload, version)?;

        let compress = self.shared.snappy.load(Ordering::Acquire)
            && !matches!(message, Message::Hello(_));
        let payload = if compress {
            snappy_compress(&payload)?
        } else {
            payload
        };

        let mut frame = Vec::with_capacity(payload.len() + 2);
        (start + message.code()).encode(&mut frame);
        frame.extend_from_slice(&payload);
        Ok(Bytes::from(frame))
    }

    fn decode_frame(&self, frame: &[u8]) -> Result<Message, RLPxError> {
        let (absolute_code, payload) = split_frame(frame)?;
        let offsets = self.shared.read_offsets();
        let (capability, code) = offsets
            .resolve(absolute_code)
            .ok_or_else(|| {
                RLPxError::ProtocolViolation(format!(
                    "message id {absolute_code} outside every agreed capability"
                ))
            })?;
        let protocol = match capability.protocol.as_str() {
            "p2p" => MessageProtocol::P2P,
            "eth" => MessageProtocol::Eth,
            "snap" => MessageProtocol::Snap,
            other => {
                return Err(RLPxError::MessageNotHandled(format!(
                    "cannot decode frames of satellite protocol {other}"
                )));
            }
        };
        let version = capability.version;
        let payload = self.decompress_payload(absolute_code, payload)?;
        Ok(Message::decode(protocol, version, code, &payload)?)
    }

    /// Payload compression starts after the Hello exchange on p2p v5+.
    /// Disconnects show up both ways in the wild, so they get a second
    /// chance uncompressed.
    fn decompress_payload(&self, absolute_code: u8, payload: &[u8]) -> Result<Vec<u8>, RLPxError> {
        let snappy = self.shared.snappy.load(Ordering::Acquire);
        if !snappy || absolute_code == HelloMessage::CODE {
            return Ok(payload.to_vec());
        }
        match snappy_decompress(payload) {
            Ok(decompressed) => Ok(decompressed),
            Err(_) if absolute_code == DisconnectMessage::CODE => Ok(payload.to_vec()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Splits a frame into its absolute message id and payload.
fn split_frame(frame: &[u8]) -> Result<(u8, &[u8]), RLPxError> {
    use ethwire_rlp::decode::RLPDecode;
    let (code, payload) = u8::decode_unfinished(frame)?;
    Ok((code, payload))
}

async fn write_frame<W>(frames_out: &mut W, frame: Bytes) -> Result<(), RLPxError>
where
    W: Sink<Bytes> + Unpin + Send,
    W::Error: std::fmt::Display,
{
    frames_out
        .send(frame)
        .await
        .map_err(|error| RLPxError::InternalError(format!("transport write failed: {error}")))
}

/// Capability agreement: intersection of both advertisements, highest
/// common version per protocol, sorted by protocol code.
fn agree_capabilities(local: &[Capability], remote: &[Capability]) -> Vec<Capability> {
    let mut agreed: Vec<Capability> = Vec::new();
    for capability in local {
        if !remote.contains(capability) {
            continue;
        }
        match agreed
            .iter_mut()
            .find(|existing| existing.protocol == capability.protocol)
        {
            Some(existing) => {
                if capability.version > existing.version {
                    existing.version = capability.version;
                }
            }
            None => agreed.push(capability.clone()),
        }
    }
    agreed.sort_by(|a, b| a.protocol.cmp(&b.protocol).then(a.version.cmp(&b.version)));
    agreed
}

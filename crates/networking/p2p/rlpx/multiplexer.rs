//! Process-wide session coordination: the open protocol registry, the live
//! session table, and capability announcements.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use futures::{Sink, Stream};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    backend::{Discovery, NetworkStorage, SyncPeerPool},
    node_stats::{NodeStatsEvent, NodeStatsRegistry},
    types::Node,
};

use super::{
    error::RLPxError,
    message::Message,
    p2p::{AddCapabilityMessage, Capability, DisconnectReason},
    session::{
        Direction, ProtocolHandlerFactory, Session, SessionContext, SessionEvent, SessionHandle,
        SessionId,
    },
};

/// Hard cap on concurrently connected peers.
pub const MAX_PEER_SESSIONS: usize = 50;

const SESSION_EVENT_BUFFER: usize = 256;

/// Open registry of sub-protocol factories: short protocol code to the
/// factory that builds a handler once the capability is agreed. Satellite
/// protocols register here at runtime.
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: Mutex<HashMap<String, Arc<dyn ProtocolHandlerFactory>>>,
    extra_capabilities: Mutex<Vec<Capability>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a factory. Fails if the protocol code is already taken.
    pub fn register(&self, factory: Arc<dyn ProtocolHandlerFactory>) -> Result<(), RLPxError> {
        let code = factory.code().to_string();
        let mut factories = lock(&self.factories);
        if factories.contains_key(&code) {
            return Err(RLPxError::DuplicateProtocol(code));
        }
        debug!("Registered protocol {code}");
        factories.insert(code, factory);
        Ok(())
    }

    pub fn factory(&self, code: &str) -> Option<Arc<dyn ProtocolHandlerFactory>> {
        lock(&self.factories).get(code).cloned()
    }

    /// Capabilities advertised in our Hello: every version of every
    /// registered factory, plus runtime additions.
    pub fn supported_capabilities(&self) -> Vec<Capability> {
        let mut capabilities: Vec<Capability> = lock(&self.factories)
            .values()
            .flat_map(|factory| {
                factory
                    .supported_versions()
                    .into_iter()
                    .map(|version| Capability::new(factory.code().to_string(), version))
                    .collect::<Vec<_>>()
            })
            .collect();
        capabilities.extend(lock(&self.extra_capabilities).iter().cloned());
        capabilities.sort_by(|a, b| a.protocol.cmp(&b.protocol).then(a.version.cmp(&b.version)));
        capabilities.dedup();
        capabilities
    }

    /// Adds a capability to the advertised set without a factory (the
    /// factory may be registered later, or the capability is served by an
    /// already registered factory under a new version).
    pub fn add_supported_capability(&self, capability: Capability) {
        let mut extra = lock(&self.extra_capabilities);
        if !extra.contains(&capability) {
            extra.push(capability);
        }
    }

    pub fn message_space(&self, capability: &Capability) -> u8 {
        self.factory(&capability.protocol)
            .map(|factory| factory.message_space(capability.version))
            .unwrap_or_else(|| capability.message_space())
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let protocols: Vec<String> = lock(&self.factories).keys().cloned().collect();
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &protocols)
            .finish()
    }
}

/// Owns every live session and routes lifecycle events to node stats and
/// the sync-peer registry.
pub struct SessionMultiplexer {
    registry: Arc<ProtocolRegistry>,
    stats: NodeStatsRegistry,
    discovery: Arc<dyn Discovery>,
    client_id: String,
    local_public_key: ethwire_common::H512,
    listen_port: u16,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    next_session_id: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionMultiplexer {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        stats: NodeStatsRegistry,
        discovery: Arc<dyn Discovery>,
        client_id: String,
        local_public_key: ethwire_common::H512,
        listen_port: u16,
    ) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_BUFFER);
        Self {
            registry,
            stats,
            discovery,
            client_id,
            local_public_key,
            listen_port,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            events,
        }
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    /// Fires on `Initialized` (after the p2p handshake completes) and on
    /// `Disconnected`.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Spawns a session over an established frame transport. Returns the
    /// handle; the session task runs until disconnect.
    pub fn start_session<S, W>(
        self: &Arc<Self>,
        node: Node,
        direction: Direction,
        frames_in: S,
        frames_out: W,
    ) -> Result<SessionHandle, RLPxError>
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin + Send + 'static,
        W: Sink<Bytes> + Unpin + Send + 'static,
        W::Error: std::fmt::Display,
    {
        if lock(&self.sessions).len() >= MAX_PEER_SESSIONS {
            return Err(RLPxError::DisconnectSent(DisconnectReason::TooManyPeers));
        }

        let stats = self.stats.stats_for(node.public_key);
        stats.add_event(NodeStatsEvent::Connecting);

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let context = SessionContext {
            id,
            node,
            direction,
            client_id: self.client_id.clone(),
            local_public_key: self.local_public_key,
            listen_port: self.listen_port,
            registry: self.registry.clone(),
            stats,
            discovery: self.discovery.clone(),
            events: self.events.clone(),
        };
        let (session, handle) = Session::new(context);
        lock(&self.sessions).insert(id, handle.clone());

        let multiplexer = self.clone();
        tokio::spawn(async move {
            session.run(frames_in, frames_out).await;
            lock(&multiplexer.sessions).remove(&id);
        });
        Ok(handle)
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn session(&self, id: SessionId) -> Option<SessionHandle> {
        lock(&self.sessions).get(&id).cloned()
    }

    /// Starts advertising a capability and announces it to every session
    /// that has not already agreed it.
    pub async fn send_new_capability(&self, capability: Capability) {
        self.registry.add_supported_capability(capability.clone());
        info!("Announcing new capability {capability}");
        let handles: Vec<SessionHandle> = lock(&self.sessions).values().cloned().collect();
        for handle in handles {
            if handle.supports_protocol(&capability.protocol) {
                continue;
            }
            let message = Message::AddCapability(AddCapabilityMessage {
                capability: capability.clone(),
            });
            if handle.send_message(message).await.is_err() {
                debug!("Session {} gone during capability announce", handle.session_id);
            }
        }
    }

    /// Requests disconnection of every session; used on shutdown.
    pub fn disconnect_all(&self, reason: DisconnectReason) {
        for handle in lock(&self.sessions).values() {
            handle.disconnect(reason, "shutting down");
        }
    }

    /// Routes lifecycle events into the sync-peer registry: peers join it
    /// once the handshake completes and leave it on disconnect.
    pub fn attach_peer_pool(&self, pool: Arc<dyn SyncPeerPool>) {
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Initialized { node, .. }) => pool.register(node),
                    Ok(SessionEvent::Disconnected { node, .. }) => {
                        pool.deregister(node.public_key)
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Persists node records on disconnect, with a reputation derived from
    /// the peer's current throttle state, for reboot-warm peer sets.
    pub fn attach_network_storage(&self, storage: Arc<dyn NetworkStorage>) {
        let stats = self.stats.clone();
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Disconnected { node, .. }) => {
                        let (delayed, _) = stats.stats_for(node.public_key).is_connection_delayed();
                        let reputation = if delayed { -1 } else { 1 };
                        storage.persist_node(&node, reputation);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlpx::session::ProtocolHandler;
    use async_trait::async_trait;

    struct NullHandler;

    #[async_trait]
    impl ProtocolHandler for NullHandler {
        async fn handle_message(&self, _code: u8, _data: Bytes) -> Result<(), RLPxError> {
            Ok(())
        }

        async fn on_disconnect(&self, _reason: DisconnectReason) {}
    }

    struct TestFactory {
        code: &'static str,
        versions: Vec<u8>,
    }

    impl ProtocolHandlerFactory for TestFactory {
        fn code(&self) -> &str {
            self.code
        }

        fn supported_versions(&self) -> Vec<u8> {
            self.versions.clone()
        }

        fn message_space(&self, _version: u8) -> u8 {
            8
        }

        fn create(&self, _session: SessionHandle, _version: u8) -> Arc<dyn ProtocolHandler> {
            Arc::new(NullHandler)
        }
    }

    #[test]
    fn duplicate_protocol_registration_fails() {
        let registry = ProtocolRegistry::new();
        registry
            .register(Arc::new(TestFactory {
                code: "wit",
                versions: vec![0],
            }))
            .expect("first registration");
        let err = registry
            .register(Arc::new(TestFactory {
                code: "wit",
                versions: vec![1],
            }))
            .expect_err("duplicate registration");
        assert!(matches!(err, RLPxError::DuplicateProtocol(_)));
    }

    #[test]
    fn supported_capabilities_cover_all_versions_sorted() {
        let registry = ProtocolRegistry::new();
        registry
            .register(Arc::new(TestFactory {
                code: "eth",
                versions: vec![65, 66],
            }))
            .expect("register eth");
        registry
            .register(Arc::new(TestFactory {
                code: "snap",
                versions: vec![1],
            }))
            .expect("register snap");
        registry.add_supported_capability(Capability::new("wit", 0));

        let caps = registry.supported_capabilities();
        let rendered: Vec<String> = caps.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["eth/65", "eth/66", "snap/1", "wit/0"]);
    }
}

//! The eth wire-protocol endpoint of one session, versions 62 through 66.
//!
//! One state struct covers the whole version family; behavior differences
//! are decided per `(version, message)` instead of a handler chain. The
//! heavy message kinds (header/body/receipt/node-data/pooled-tx requests
//! and responses) go through a bounded queue drained by two workers, so a
//! peer spamming large payloads can never hold the session's read loop:
//! decoding happens in the workers, and a full queue disconnects the peer
//! instead of blocking.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use ethwire_common::{
    H256,
    types::{BlockBody, BlockHash, BlockHeader, Receipt},
};
use tokio::sync::mpsc;

use crate::{
    backend::{SyncBackend, TxPoolHandle},
    metrics::METRICS,
    node_stats::{NodeStats, NodeStatsRegistry, TransferSpeedKind},
    rlpx::{
        correlator::MessageDictionary,
        error::RLPxError,
        message::{Message, MessageProtocol, RLPxMessage},
        p2p::{Capability, DisconnectReason},
        session::{ProtocolHandler, ProtocolHandlerFactory, SessionHandle},
        utils::{log_peer_debug, log_peer_warn},
    },
};

use super::{
    ETH_VERSION_WITH_POOLED_TX, ETH_VERSION_WITH_REQUEST_ID, SUPPORTED_ETH_VERSIONS,
    blocks::{
        BlockBodies, BlockHeaders, GetBlockBodies, GetBlockHeaders, HashOrNumber, NewBlock,
        NewBlockHashes,
    },
    node_data::{GetNodeData, NodeData},
    receipts::{GetReceipts, Receipts},
    status::StatusMessage,
    transactions::{
        GetPooledTransactions, NEW_POOLED_TRANSACTION_HASHES_SOFT_LIMIT,
        NewPooledTransactionHashes, PooledTransactions, Transactions,
    },
};

/// Capacity of the heavy-message queue. The 33rd undrained message costs
/// the peer its session.
const INCOMING_QUEUE_SIZE: usize = 32;
/// Exactly this many workers drain the queue.
const INCOMING_WORKERS: usize = 2;

const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const PEER_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const TX_BROADCAST_INTERVAL: Duration = Duration::from_millis(500);

/// An undecoded eth frame parked for a worker. `Bytes` keeps the payload
/// refcounted: the queue holds one reference, dropped on either completion
/// or enqueue failure.
#[derive(Debug)]
struct RawEthFrame {
    code: u8,
    data: Bytes,
}

pub struct EthHandlerFactory {
    pub backend: Arc<dyn SyncBackend>,
    pub tx_pool: Arc<dyn TxPoolHandle>,
    pub stats: NodeStatsRegistry,
}

impl ProtocolHandlerFactory for EthHandlerFactory {
    fn code(&self) -> &str {
        "eth"
    }

    fn supported_versions(&self) -> Vec<u8> {
        SUPPORTED_ETH_VERSIONS.to_vec()
    }

    fn message_space(&self, version: u8) -> u8 {
        Capability::eth(version).message_space()
    }

    fn create(&self, session: SessionHandle, version: u8) -> Arc<dyn ProtocolHandler> {
        let stats = self.stats.stats_for(session.node.public_key);
        EthHandler::spawn(
            session,
            version,
            self.backend.clone(),
            self.tx_pool.clone(),
            stats,
        )
    }
}

pub struct EthHandler {
    version: u8,
    session: SessionHandle,
    backend: Arc<dyn SyncBackend>,
    tx_pool: Arc<dyn TxPoolHandle>,
    stats: Arc<NodeStats>,

    /// Whether this peer participates in tx-pool gossip. Requires the
    /// pooled-transaction message family (eth/65+).
    include_in_tx_pool: bool,
    status_exchanged: AtomicBool,

    headers: MessageDictionary<BlockHeaders>,
    bodies: MessageDictionary<BlockBodies>,
    receipts: MessageDictionary<Receipts>,
    node_data: MessageDictionary<NodeData>,
    pooled_txs: MessageDictionary<PooledTransactions>,

    /// Hashes we asked for, by request id, to validate pooled responses.
    requested_pooled_txs: Mutex<HashMap<u64, Vec<H256>>>,
    /// Hashes already announced to this peer.
    broadcasted_txs: Mutex<HashSet<H256>>,

    incoming_tx: mpsc::Sender<RawEthFrame>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<RawEthFrame>>,

    /// Weak self-reference for background tasks, so a disposed session
    /// does not keep the handler and its dictionaries alive.
    weak_self: Weak<EthHandler>,
}

impl EthHandler {
    pub(crate) fn new(
        session: SessionHandle,
        version: u8,
        backend: Arc<dyn SyncBackend>,
        tx_pool: Arc<dyn TxPoolHandle>,
        stats: Arc<NodeStats>,
    ) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_SIZE);
        Self {
            include_in_tx_pool: version >= ETH_VERSION_WITH_POOLED_TX,
            version,
            session,
            backend,
            tx_pool,
            stats,
            status_exchanged: AtomicBool::new(false),
            headers: MessageDictionary::new(),
            bodies: MessageDictionary::new(),
            receipts: MessageDictionary::new(),
            node_data: MessageDictionary::new(),
            pooled_txs: MessageDictionary::new(),
            requested_pooled_txs: Mutex::new(HashMap::new()),
            broadcasted_txs: Mutex::new(HashSet::new()),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            weak_self: Weak::new(),
        }
    }

    /// Builds the handler, starts its queue workers and kicks off the
    /// Status exchange.
    pub fn spawn(
        session: SessionHandle,
        version: u8,
        backend: Arc<dyn SyncBackend>,
        tx_pool: Arc<dyn TxPoolHandle>,
        stats: Arc<NodeStats>,
    ) -> Arc<Self> {
        let handler = Arc::new_cyclic(|weak| {
            let mut handler = Self::new(session, version, backend, tx_pool, stats);
            handler.weak_self = weak.clone();
            handler
        });
        for _ in 0..INCOMING_WORKERS {
            let worker = handler.clone();
            tokio::spawn(async move { worker.worker_loop().await });
        }
        {
            let handler = handler.clone();
            tokio::spawn(async move { handler.exchange_status().await });
        }
        handler
    }

    async fn exchange_status(&self) {
        let status = self.local_status();
        if self.send(Message::Status(status)).await.is_err() {
            return;
        }
        tokio::time::sleep(STATUS_TIMEOUT).await;
        if !self.status_exchanged.load(Ordering::Acquire) {
            self.session
                .disconnect(DisconnectReason::Other, "eth Status exchange timed out");
        }
    }

    fn local_status(&self) -> StatusMessage {
        let genesis = self.backend.genesis_hash();
        let best_hash = self
            .backend
            .head()
            .map(|header| header.hash())
            .unwrap_or(genesis);
        StatusMessage::new(
            self.version,
            self.backend.network_id(),
            self.backend.total_difficulty(),
            best_hash,
            genesis,
            self.backend.fork_id(),
        )
    }

    async fn send(&self, message: Message) -> Result<(), RLPxError> {
        METRICS
            .messages_sent
            .with_label_values(&[&message_label(self.version, &message)])
            .inc();
        self.session.send_message(message).await
    }

    /// Two of these run per session. Decoding happens here so that a slow
    /// deserialization cannot block network IO.
    async fn worker_loop(&self) {
        loop {
            let frame = {
                let mut incoming = self.incoming_rx.lock().await;
                incoming.recv().await
            };
            let Some(frame) = frame else { return };
            let payload_size = frame.data.len();
            let message =
                match Message::decode(MessageProtocol::Eth, self.version, frame.code, &frame.data)
                {
                    Ok(message) => message,
                    Err(error) => {
                        log_peer_warn(
                            &self.session.node,
                            &format!("Dropping undecodable eth frame: {error}"),
                        );
                        self.session
                            .disconnect(DisconnectReason::ProtocolError, error.to_string());
                        return;
                    }
                };
            METRICS
                .messages_received
                .with_label_values(&[&message_label(self.version, &message)])
                .inc();
            if let Err(error) = self.process_heavy(message, payload_size).await {
                if error.is_fatal() {
                    self.session
                        .disconnect(DisconnectReason::Other, error.to_string());
                    return;
                }
                log_peer_debug(&self.session.node, &format!("Request failed: {error}"));
            }
        }
    }

    async fn process_heavy(&self, message: Message, payload_size: usize) -> Result<(), RLPxError> {
        match message {
            // requests from the peer, served from the backend
            Message::GetBlockHeaders(req) => {
                let id = req.id;
                let limit = req.limit.min(super::blocks::BLOCK_HEADER_LIMIT);
                let headers = self
                    .backend
                    .headers(req.startblock, limit, req.skip, req.reverse);
                self.send(Message::BlockHeaders(BlockHeaders::new(id, headers)))
                    .await
            }
            Message::GetBlockBodies(req) => {
                let mut hashes = req.block_hashes;
                hashes.truncate(super::blocks::BLOCK_BODY_LIMIT);
                let bodies = self.backend.bodies(hashes);
                self.send(Message::BlockBodies(BlockBodies::new(req.id, bodies)))
                    .await
            }
            Message::GetReceipts(req) => {
                let receipts = self.backend.receipts(req.block_hashes);
                self.send(Message::Receipts(Receipts::new(req.id, receipts)))
                    .await
            }
            Message::GetNodeData(req) => {
                let nodes = self.backend.node_data(req.hashes);
                self.send(Message::NodeData(NodeData::new(req.id, nodes)))
                    .await
            }
            Message::GetPooledTransactions(req) => {
                let pooled = self.tx_pool.pooled_transactions(&req.transaction_hashes);
                self.send(Message::PooledTransactions(PooledTransactions::new(
                    req.id, pooled,
                )))
                .await
            }

            // responses, correlated back to their requests
            Message::BlockHeaders(res) => {
                self.complete(&self.headers, res.id, payload_size, TransferSpeedKind::Headers, res);
                Ok(())
            }
            Message::BlockBodies(res) => {
                self.complete(&self.bodies, res.id, payload_size, TransferSpeedKind::Bodies, res);
                Ok(())
            }
            Message::Receipts(res) => {
                self.complete(
                    &self.receipts,
                    res.id,
                    payload_size,
                    TransferSpeedKind::Receipts,
                    res,
                );
                Ok(())
            }
            Message::NodeData(res) => {
                self.complete(
                    &self.node_data,
                    res.id,
                    payload_size,
                    TransferSpeedKind::NodeData,
                    res,
                );
                Ok(())
            }
            Message::PooledTransactions(res) => {
                self.handle_pooled_transactions(res, payload_size)
            }

            other => Err(RLPxError::MessageNotHandled(format!("{other}"))),
        }
    }

    /// Matches a response to its pending request: by id from eth/66 on,
    /// oldest-first below. Unknown and duplicate ids are dropped.
    fn complete<Res>(
        &self,
        dictionary: &MessageDictionary<Res>,
        id: u64,
        payload_size: usize,
        kind: TransferSpeedKind,
        response: Res,
    ) {
        let matched = if self.version >= ETH_VERSION_WITH_REQUEST_ID {
            dictionary.complete(id, payload_size, response)
        } else {
            dictionary.complete_oldest(payload_size, response)
        };
        if !matched {
            METRICS
                .messages_dropped
                .with_label_values(&["unmatched_response"])
                .inc();
            log_peer_debug(
                &self.session.node,
                &format!("Dropped response with unmatched request id {id}"),
            );
        }
    }

    fn handle_pooled_transactions(
        &self,
        res: PooledTransactions,
        payload_size: usize,
    ) -> Result<(), RLPxError> {
        let requested = self.lock_requested().remove(&res.id);
        if self.version >= ETH_VERSION_WITH_REQUEST_ID && requested.is_none() {
            // a response we never asked for; drop it
            METRICS
                .messages_dropped
                .with_label_values(&["unmatched_response"])
                .inc();
            return Ok(());
        }
        if let Some(requested) = requested {
            for tx in &res.pooled_transactions {
                if !requested.contains(&tx.compute_hash()) {
                    return Err(RLPxError::BadRequest(
                        "unrequested transaction in PooledTransactions".to_string(),
                    ));
                }
            }
        }
        let peer = self.session.node.public_key;
        self.tx_pool
            .add_transactions(peer, res.pooled_transactions.clone());
        self.complete(
            &self.pooled_txs,
            res.id,
            payload_size,
            TransferSpeedKind::Latency,
            res,
        );
        Ok(())
    }

    async fn handle_status(&self, status: StatusMessage) -> Result<(), RLPxError> {
        if self.status_exchanged.load(Ordering::Acquire) {
            return Err(RLPxError::ProtocolViolation(
                "duplicate eth Status".to_string(),
            ));
        }
        if status.network_id != self.backend.network_id() {
            return Err(RLPxError::ChainMismatch(format!(
                "network id {} != {}",
                status.network_id,
                self.backend.network_id()
            )));
        }
        if status.genesis != self.backend.genesis_hash() {
            return Err(RLPxError::ChainMismatch("genesis mismatch".to_string()));
        }
        if let Some(fork_id) = status.fork_id {
            use ethwire_common::types::ForkValidation;
            match self.backend.validate_fork_id(fork_id) {
                ForkValidation::Valid => {}
                verdict => {
                    return Err(RLPxError::ChainMismatch(format!("{verdict:?}")));
                }
            }
        }
        self.status_exchanged.store(true, Ordering::Release);
        log_peer_debug(&self.session.node, "eth Status validated");

        if self.include_in_tx_pool {
            self.tx_pool.add_peer(self.session.node.public_key);
            // announce our pending transactions from now on
            let weak = self.weak_self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(TX_BROADCAST_INTERVAL);
                loop {
                    interval.tick().await;
                    let Some(handler) = weak.upgrade() else { return };
                    let disconnecting = handler.session.state()
                        >= crate::rlpx::session::SessionState::Disconnecting;
                    if disconnecting || handler.broadcast_pending_hashes().await.is_err() {
                        return;
                    }
                }
            });
        }
        Ok(())
    }

    /// Announces pool transactions this peer has not seen yet, in chunks
    /// under the devp2p soft limit.
    async fn broadcast_pending_hashes(&self) -> Result<(), RLPxError> {
        let pending = self.tx_pool.pending_hashes();
        let fresh: Vec<H256> = {
            let mut broadcasted = self.lock_broadcasted();
            pending
                .into_iter()
                .filter(|hash| broadcasted.insert(*hash))
                .collect()
        };
        for chunk in fresh.chunks(NEW_POOLED_TRANSACTION_HASHES_SOFT_LIMIT) {
            self.send(Message::NewPooledTransactionHashes(
                NewPooledTransactionHashes::new(chunk.to_vec()),
            ))
            .await?;
        }
        Ok(())
    }

    async fn handle_new_pooled_hashes(
        &self,
        msg: NewPooledTransactionHashes,
    ) -> Result<(), RLPxError> {
        let unknown = self.tx_pool.filter_unknown(&msg.transaction_hashes);
        if unknown.is_empty() {
            return Ok(());
        }
        let (id, receiver) = self.pooled_txs.open();
        self.lock_requested().insert(id, unknown.clone());
        self.send(Message::GetPooledTransactions(GetPooledTransactions::new(
            id, unknown,
        )))
        .await?;

        // the response lands in the pool inside the worker; this watchdog
        // only reclaims the request slot
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let result = tokio::time::timeout(PEER_REPLY_TIMEOUT, receiver).await;
            if result.is_err() {
                if let Some(handler) = weak.upgrade() {
                    handler.pooled_txs.fail(id, RLPxError::RequestTimeout);
                    handler.lock_requested().remove(&id);
                    handler
                        .stats
                        .add_transfer_speed(TransferSpeedKind::Latency, 0);
                }
            }
        });
        Ok(())
    }

    // ── client side ────────────────────────────────────────────────────

    pub async fn get_block_headers(
        &self,
        start: HashOrNumber,
        limit: u64,
        skip: u64,
        reverse: bool,
    ) -> Result<Vec<BlockHeader>, RLPxError> {
        let (id, receiver) = self.headers.open();
        self.send(Message::GetBlockHeaders(GetBlockHeaders::new(
            id, start, limit, skip, reverse,
        )))
        .await?;
        let completed = self
            .await_response(&self.headers, id, TransferSpeedKind::Headers, receiver)
            .await?;
        Ok(completed.block_headers)
    }

    pub async fn get_block_bodies(
        &self,
        hashes: Vec<BlockHash>,
    ) -> Result<Vec<BlockBody>, RLPxError> {
        let (id, receiver) = self.bodies.open();
        self.send(Message::GetBlockBodies(GetBlockBodies::new(id, hashes)))
            .await?;
        let completed = self
            .await_response(&self.bodies, id, TransferSpeedKind::Bodies, receiver)
            .await?;
        Ok(completed.block_bodies)
    }

    pub async fn get_receipts(
        &self,
        hashes: Vec<BlockHash>,
    ) -> Result<Vec<Vec<Receipt>>, RLPxError> {
        let (id, receiver) = self.receipts.open();
        self.send(Message::GetReceipts(GetReceipts::new(id, hashes)))
            .await?;
        let completed = self
            .await_response(&self.receipts, id, TransferSpeedKind::Receipts, receiver)
            .await?;
        Ok(completed.receipts)
    }

    pub async fn get_node_data(&self, hashes: Vec<H256>) -> Result<Vec<Bytes>, RLPxError> {
        let (id, receiver) = self.node_data.open();
        self.send(Message::GetNodeData(GetNodeData::new(id, hashes)))
            .await?;
        let completed = self
            .await_response(&self.node_data, id, TransferSpeedKind::NodeData, receiver)
            .await?;
        Ok(completed.nodes)
    }

    /// Suspends until the correlated response arrives, the request times
    /// out, or the session goes down (which drains the dictionary).
    async fn await_response<Res>(
        &self,
        dictionary: &MessageDictionary<Res>,
        id: u64,
        kind: TransferSpeedKind,
        receiver: tokio::sync::oneshot::Receiver<
            Result<crate::rlpx::correlator::CompletedRequest<Res>, RLPxError>,
        >,
    ) -> Result<Res, RLPxError> {
        match tokio::time::timeout(PEER_REPLY_TIMEOUT, receiver).await {
            Ok(Ok(Ok(completed))) => {
                self.stats.add_transfer_speed(kind, completed.bytes_per_ms());
                Ok(completed.response)
            }
            Ok(Ok(Err(error))) => Err(error),
            // slot dropped without completion: session is gone
            Ok(Err(_)) => Err(RLPxError::RequestCancelled),
            Err(_) => {
                dictionary.fail(id, RLPxError::RequestTimeout);
                // a timed-out peer gets a zero-speed sample, pushing it
                // down the selection order
                self.stats.add_transfer_speed(kind, 0);
                METRICS
                    .request_timeouts
                    .with_label_values(&[kind_label(kind)])
                    .inc();
                Err(RLPxError::RequestTimeout)
            }
        }
    }

    fn lock_requested(&self) -> MutexGuard<'_, HashMap<u64, Vec<H256>>> {
        match self.requested_pooled_txs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_broadcasted(&self) -> MutexGuard<'_, HashSet<H256>> {
        match self.broadcasted_txs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ProtocolHandler for EthHandler {
    async fn handle_message(&self, code: u8, data: Bytes) -> Result<(), RLPxError> {
        if is_heavy(code) {
            // bounded admission: a peer outpacing the two workers is
            // disconnected, never allowed to block the read loop
            return match self.incoming_tx.try_send(RawEthFrame { code, data }) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    // release our reference before raising
                    drop(frame);
                    METRICS.incoming_queue_full.inc();
                    Err(RLPxError::IncomingQueueFull)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(RLPxError::Disconnected()),
            };
        }

        // light messages decode and process inline
        let message = Message::decode(MessageProtocol::Eth, self.version, code, &data)?;
        METRICS
            .messages_received
            .with_label_values(&[&message_label(self.version, &message)])
            .inc();
        match message {
            Message::Status(status) => self.handle_status(status).await,
            Message::Transactions(txs) if self.backend.is_synced() => {
                let peer = self.session.node.public_key;
                self.tx_pool.add_transactions(peer, txs.transactions);
                Ok(())
            }
            Message::NewPooledTransactionHashes(msg) if self.backend.is_synced() => {
                self.handle_new_pooled_hashes(msg).await
            }
            // gossip while syncing is useless; drop it
            Message::Transactions(_) | Message::NewPooledTransactionHashes(_) => Ok(()),
            // block gossip is obsolete post-merge; count and ignore
            Message::NewBlock(_) | Message::NewBlockHashes(_) => Ok(()),
            other => Err(RLPxError::MessageNotHandled(format!("{other}"))),
        }
    }

    async fn on_disconnect(&self, _reason: DisconnectReason) {
        self.headers.cancel_all();
        self.bodies.cancel_all();
        self.receipts.cancel_all();
        self.node_data.cancel_all();
        self.pooled_txs.cancel_all();
        self.lock_requested().clear();
        if self.include_in_tx_pool {
            self.tx_pool.remove_peer(self.session.node.public_key);
        }
    }
}

fn is_heavy(code: u8) -> bool {
    matches!(
        code,
        GetBlockHeaders::CODE
            | BlockHeaders::CODE
            | GetBlockBodies::CODE
            | BlockBodies::CODE
            | GetPooledTransactions::CODE
            | PooledTransactions::CODE
            | GetNodeData::CODE
            | NodeData::CODE
            | GetReceipts::CODE
            | Receipts::CODE
    )
}

fn kind_label(kind: TransferSpeedKind) -> &'static str {
    match kind {
        TransferSpeedKind::Headers => "headers",
        TransferSpeedKind::Bodies => "bodies",
        TransferSpeedKind::Receipts => "receipts",
        TransferSpeedKind::NodeData => "node_data",
        TransferSpeedKind::Latency => "latency",
        TransferSpeedKind::SnapRanges => "snap_ranges",
    }
}

fn message_label(version: u8, message: &Message) -> String {
    let name = message.to_string();
    let name = name.split(':').next_back().unwrap_or("unknown");
    format!("eth{version}_{name}")
}

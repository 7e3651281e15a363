//! snap/1 endpoint of one session.
//!
//! Client side fetches account/storage ranges, byte codes and trie nodes
//! under an adaptive `response_bytes` budget: fast responses double the
//! budget, slow ones halve it, failures reset it to the floor. Server side
//! frames requests to the [`SnapServer`] collaborator; trie traversal is
//! not this module's business.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use ethwire_common::H256;
use tokio::sync::oneshot;

use crate::{
    backend::SnapServer,
    metrics::METRICS,
    node_stats::{NodeStats, NodeStatsRegistry, TransferSpeedKind},
    rlpx::{
        error::RLPxError,
        message::{Message, MessageProtocol, RLPxMessage},
        p2p::{Capability, DisconnectReason},
        session::{ProtocolHandler, ProtocolHandlerFactory, SessionHandle},
        utils::log_peer_debug,
    },
};

use super::{
    AccountRange, ByteCodes, GetAccountRange, GetByteCodes, GetStorageRanges, GetTrieNodes,
    SUPPORTED_SNAP_VERSIONS, StorageRanges, TrieNodes,
};

/// Bounds of the adaptive response-byte budget.
pub const MIN_RESPONSE_BYTES: u64 = 20_000;
pub const MAX_RESPONSE_BYTES: u64 = 2_000_000;

/// Responses faster than this double the budget.
const LOWER_LATENCY: Duration = Duration::from_secs(1);
/// Responses slower than this halve it.
const UPPER_LATENCY: Duration = Duration::from_secs(2);

pub struct SnapHandlerFactory {
    pub server: Arc<dyn SnapServer>,
    pub stats: NodeStatsRegistry,
}

impl ProtocolHandlerFactory for SnapHandlerFactory {
    fn code(&self) -> &str {
        "snap"
    }

    fn supported_versions(&self) -> Vec<u8> {
        SUPPORTED_SNAP_VERSIONS.to_vec()
    }

    fn message_space(&self, version: u8) -> u8 {
        Capability::snap(version).message_space()
    }

    fn create(&self, session: SessionHandle, _version: u8) -> Arc<dyn ProtocolHandler> {
        let stats = self.stats.stats_for(session.node.public_key);
        Arc::new(SnapHandler::new(session, self.server.clone(), stats))
    }
}

/// One in-flight request: issuance time plus the budget it was sized
/// against, so concurrent requests do not compound adjustments.
struct PendingSnapRequest<Res> {
    sent_at: Instant,
    start_limit: u64,
    responder: oneshot::Sender<Result<Res, RLPxError>>,
}

/// snap/1 has no response correlation problem worth an id table: requests
/// of one kind are answered in order, so matching is FIFO per kind.
struct PendingQueue<Res> {
    queue: Mutex<VecDeque<PendingSnapRequest<Res>>>,
}

impl<Res> Default for PendingQueue<Res> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl<Res> PendingQueue<Res> {
    fn push(
        &self,
        start_limit: u64,
    ) -> oneshot::Receiver<Result<Res, RLPxError>> {
        let (responder, receiver) = oneshot::channel();
        self.lock().push_back(PendingSnapRequest {
            sent_at: Instant::now(),
            start_limit,
            responder,
        });
        receiver
    }

    fn pop(&self) -> Option<PendingSnapRequest<Res>> {
        self.lock().pop_front()
    }

    fn drain(&self) -> Vec<PendingSnapRequest<Res>> {
        self.lock().drain(..).collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingSnapRequest<Res>>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct SnapHandler {
    session: SessionHandle,
    server: Arc<dyn SnapServer>,
    stats: Arc<NodeStats>,
    next_request_id: AtomicU64,

    /// Current `response_bytes` budget, kept within
    /// `[MIN_RESPONSE_BYTES, MAX_RESPONSE_BYTES]`.
    bytes_limit: AtomicU64,

    account_ranges: PendingQueue<AccountRange>,
    storage_ranges: PendingQueue<StorageRanges>,
    byte_codes: PendingQueue<ByteCodes>,
    trie_nodes: PendingQueue<TrieNodes>,
}

impl SnapHandler {
    pub fn new(session: SessionHandle, server: Arc<dyn SnapServer>, stats: Arc<NodeStats>) -> Self {
        Self {
            session,
            server,
            stats,
            next_request_id: AtomicU64::new(1),
            bytes_limit: AtomicU64::new(MIN_RESPONSE_BYTES),
            account_ranges: PendingQueue::default(),
            storage_ranges: PendingQueue::default(),
            byte_codes: PendingQueue::default(),
            trie_nodes: PendingQueue::default(),
        }
    }

    pub fn current_bytes_limit(&self) -> u64 {
        self.bytes_limit.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Applies the latency rule against the budget captured at issuance:
    /// fast doubles, slow halves, bounds always hold.
    fn adjust_limit(&self, start_limit: u64, elapsed: Duration) {
        if elapsed < LOWER_LATENCY {
            self.bytes_limit
                .store((start_limit * 2).min(MAX_RESPONSE_BYTES), Ordering::Release);
        } else if elapsed > UPPER_LATENCY && start_limit > MIN_RESPONSE_BYTES {
            self.bytes_limit
                .store((start_limit / 2).max(MIN_RESPONSE_BYTES), Ordering::Release);
        }
    }

    /// A failed request drops the budget back to the floor.
    fn reset_limit(&self) {
        self.bytes_limit.store(MIN_RESPONSE_BYTES, Ordering::Release);
    }

    fn resolve<Res>(
        &self,
        queue: &PendingQueue<Res>,
        payload_size: usize,
        response: Res,
    ) {
        let Some(pending) = queue.pop() else {
            METRICS
                .messages_dropped
                .with_label_values(&["unsolicited_snap_response"])
                .inc();
            log_peer_debug(&self.session.node, "Dropping unsolicited snap response");
            return;
        };
        let elapsed = pending.sent_at.elapsed();
        self.adjust_limit(pending.start_limit, elapsed);
        let elapsed_ms = elapsed.as_millis().max(1) as u64;
        self.stats.add_transfer_speed(
            TransferSpeedKind::SnapRanges,
            payload_size as u64 / elapsed_ms,
        );
        let _ = pending.responder.send(Ok(response));
    }

    async fn await_snap_response<Res>(
        &self,
        receiver: oneshot::Receiver<Result<Res, RLPxError>>,
    ) -> Result<Res, RLPxError> {
        match receiver.await {
            Ok(result) => {
                if result.is_err() {
                    self.reset_limit();
                }
                result
            }
            Err(_) => {
                self.reset_limit();
                Err(RLPxError::RequestCancelled)
            }
        }
    }

    async fn send(&self, message: Message) -> Result<(), RLPxError> {
        METRICS
            .messages_sent
            .with_label_values(&[&format!("snap_{message}")])
            .inc();
        self.session.send_message(message).await
    }

    // ── client side ────────────────────────────────────────────────────

    pub async fn get_account_range(
        &self,
        root_hash: H256,
        starting_hash: H256,
        limit_hash: H256,
    ) -> Result<AccountRange, RLPxError> {
        let budget = self.current_bytes_limit();
        let receiver = self.account_ranges.push(budget);
        let request = GetAccountRange {
            id: self.next_id(),
            root_hash,
            starting_hash,
            limit_hash,
            response_bytes: budget,
        };
        if let Err(error) = self.send(Message::GetAccountRange(request)).await {
            self.account_ranges.pop();
            self.reset_limit();
            return Err(error);
        }
        self.await_snap_response(receiver).await
    }

    pub async fn get_storage_ranges(
        &self,
        root_hash: H256,
        account_hashes: Vec<H256>,
        starting_hash: H256,
        limit_hash: H256,
    ) -> Result<StorageRanges, RLPxError> {
        let budget = self.current_bytes_limit();
        let receiver = self.storage_ranges.push(budget);
        let request = GetStorageRanges {
            id: self.next_id(),
            root_hash,
            account_hashes,
            starting_hash,
            limit_hash,
            response_bytes: budget,
        };
        if let Err(error) = self.send(Message::GetStorageRanges(request)).await {
            self.storage_ranges.pop();
            self.reset_limit();
            return Err(error);
        }
        self.await_snap_response(receiver).await
    }

    pub async fn get_byte_codes(&self, hashes: Vec<H256>) -> Result<ByteCodes, RLPxError> {
        let budget = self.current_bytes_limit();
        let receiver = self.byte_codes.push(budget);
        let request = GetByteCodes {
            id: self.next_id(),
            hashes,
            bytes: budget,
        };
        if let Err(error) = self.send(Message::GetByteCodes(request)).await {
            self.byte_codes.pop();
            self.reset_limit();
            return Err(error);
        }
        self.await_snap_response(receiver).await
    }

    pub async fn get_trie_nodes(
        &self,
        root_hash: H256,
        paths: Vec<Vec<Bytes>>,
    ) -> Result<TrieNodes, RLPxError> {
        let budget = self.current_bytes_limit();
        let receiver = self.trie_nodes.push(budget);
        let request = GetTrieNodes {
            id: self.next_id(),
            root_hash,
            paths,
            bytes: budget,
        };
        if let Err(error) = self.send(Message::GetTrieNodes(request)).await {
            self.trie_nodes.pop();
            self.reset_limit();
            return Err(error);
        }
        self.await_snap_response(receiver).await
    }
}

#[async_trait]
impl ProtocolHandler for SnapHandler {
    async fn handle_message(&self, code: u8, data: Bytes) -> Result<(), RLPxError> {
        let payload_size = data.len();
        let message = Message::decode(MessageProtocol::Snap, 1, code, &data)?;
        METRICS
            .messages_received
            .with_label_values(&[&format!("snap_{message}")])
            .inc();
        match message {
            // server side: framing around the SnapServer collaborator
            Message::GetAccountRange(request) => {
                let response = self.server.account_range(request);
                self.send(Message::AccountRange(response)).await
            }
            Message::GetStorageRanges(request) => {
                let response = self.server.storage_ranges(request);
                self.send(Message::StorageRanges(response)).await
            }
            Message::GetByteCodes(request) => {
                let response = self.server.byte_codes(request);
                self.send(Message::ByteCodes(response)).await
            }
            Message::GetTrieNodes(request) => {
                let response = self.server.trie_nodes(request);
                self.send(Message::TrieNodes(response)).await
            }

            // client side: responses match their requests in order
            Message::AccountRange(response) => {
                self.resolve(&self.account_ranges, payload_size, response);
                Ok(())
            }
            Message::StorageRanges(response) => {
                self.resolve(&self.storage_ranges, payload_size, response);
                Ok(())
            }
            Message::ByteCodes(response) => {
                self.resolve(&self.byte_codes, payload_size, response);
                Ok(())
            }
            Message::TrieNodes(response) => {
                self.resolve(&self.trie_nodes, payload_size, response);
                Ok(())
            }

            other => Err(RLPxError::MessageNotHandled(format!("{other}"))),
        }
    }

    async fn on_disconnect(&self, _reason: DisconnectReason) {
        for pending in self.account_ranges.drain() {
            let _ = pending.responder.send(Err(RLPxError::RequestCancelled));
        }
        for pending in self.storage_ranges.drain() {
            let _ = pending.responder.send(Err(RLPxError::RequestCancelled));
        }
        for pending in self.byte_codes.drain() {
            let _ = pending.responder.send(Err(RLPxError::RequestCancelled));
        }
        for pending in self.trie_nodes.drain() {
            let _ = pending.responder.send(Err(RLPxError::RequestCancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlpx::session::OffsetTable;
    use crate::types::Node;
    use ethwire_common::H512;

    struct EmptySnapServer;

    impl SnapServer for EmptySnapServer {
        fn account_range(&self, request: GetAccountRange) -> AccountRange {
            AccountRange {
                id: request.id,
                accounts: vec![],
                proof: vec![],
            }
        }

        fn storage_ranges(&self, request: GetStorageRanges) -> StorageRanges {
            StorageRanges {
                id: request.id,
                slots: vec![],
                proof: vec![],
            }
        }

        fn byte_codes(&self, request: GetByteCodes) -> ByteCodes {
            ByteCodes {
                id: request.id,
                codes: vec![],
            }
        }

        fn trie_nodes(&self, request: GetTrieNodes) -> TrieNodes {
            TrieNodes {
                id: request.id,
                nodes: vec![],
            }
        }
    }

    fn snap_offsets() -> OffsetTable {
        let mut table = OffsetTable::default();
        table.append(Capability::eth(66), 17);
        table.append(Capability::snap(1), 8);
        table
    }

    fn test_handler() -> (SnapHandler, tokio::sync::mpsc::Receiver<Message>) {
        let node = Node::new(
            "127.0.0.1".parse().expect("ip"),
            30303,
            30303,
            H512::from_low_u64_be(7),
        );
        let (session, outbound, _disconnects) = SessionHandle::for_tests(node, snap_offsets());
        let handler = SnapHandler::new(session, Arc::new(EmptySnapServer), Arc::new(NodeStats::default()));
        (handler, outbound)
    }

    fn resolve_after<Res>(
        handler: &SnapHandler,
        queue: &PendingQueue<Res>,
        elapsed: Duration,
        response: Res,
    ) {
        let mut pending = queue.pop().expect("pending request");
        pending.sent_at = Instant::now() - elapsed;
        queue.lock().push_front(pending);
        handler.resolve(queue, 1000, response);
    }

    fn empty_account_range() -> AccountRange {
        AccountRange {
            id: 0,
            accounts: vec![],
            proof: vec![],
        }
    }

    #[tokio::test]
    async fn budget_starts_at_the_floor() {
        let (handler, _outbound) = test_handler();
        assert_eq!(handler.current_bytes_limit(), MIN_RESPONSE_BYTES);
    }

    #[tokio::test]
    async fn fast_response_doubles_the_budget() {
        let (handler, _outbound) = test_handler();
        handler.bytes_limit.store(100_000, Ordering::Release);
        handler.adjust_limit(100_000, Duration::from_millis(500));
        assert_eq!(handler.current_bytes_limit(), 200_000);
    }

    #[tokio::test]
    async fn slow_response_halves_the_budget() {
        let (handler, _outbound) = test_handler();
        handler.bytes_limit.store(100_000, Ordering::Release);
        handler.adjust_limit(100_000, Duration::from_secs(3));
        assert_eq!(handler.current_bytes_limit(), 50_000);
    }

    #[tokio::test]
    async fn middling_latency_leaves_the_budget_alone() {
        let (handler, _outbound) = test_handler();
        handler.bytes_limit.store(100_000, Ordering::Release);
        handler.adjust_limit(100_000, Duration::from_millis(1500));
        assert_eq!(handler.current_bytes_limit(), 100_000);
    }

    #[tokio::test]
    async fn budget_never_leaves_its_bounds() {
        let (handler, _outbound) = test_handler();
        handler.adjust_limit(MAX_RESPONSE_BYTES, Duration::from_millis(1));
        assert_eq!(handler.current_bytes_limit(), MAX_RESPONSE_BYTES);
        handler.adjust_limit(MIN_RESPONSE_BYTES, Duration::from_secs(10));
        assert_eq!(handler.current_bytes_limit(), MIN_RESPONSE_BYTES);
    }

    #[tokio::test]
    async fn failure_resets_to_the_floor() {
        let (handler, _outbound) = test_handler();
        handler.bytes_limit.store(1_000_000, Ordering::Release);
        handler.reset_limit();
        assert_eq!(handler.current_bytes_limit(), MIN_RESPONSE_BYTES);
    }

    #[tokio::test]
    async fn consecutive_fast_responses_saturate_at_max() {
        let (handler, _outbound) = test_handler();
        let mut expected = MIN_RESPONSE_BYTES;
        for _ in 0..8 {
            let start = handler.current_bytes_limit();
            handler.adjust_limit(start, Duration::from_millis(500));
            expected = (expected * 2).min(MAX_RESPONSE_BYTES);
            assert_eq!(handler.current_bytes_limit(), expected);
        }
        assert_eq!(handler.current_bytes_limit(), MAX_RESPONSE_BYTES);
    }

    #[tokio::test]
    async fn requests_carry_the_current_budget() {
        let (handler, mut outbound) = test_handler();
        handler.bytes_limit.store(123_456, Ordering::Release);
        let handler = Arc::new(handler);
        let request_task = {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .get_account_range(H256::zero(), H256::zero(), H256::from([0xff; 32]))
                    .await
            })
        };
        let sent = outbound.recv().await.expect("request sent");
        match sent {
            Message::GetAccountRange(request) => {
                assert_eq!(request.response_bytes, 123_456);
                assert!(request.id > 0);
            }
            other => panic!("unexpected message {other}"),
        }

        handler.resolve(&handler.account_ranges, 100, empty_account_range());
        let response = request_task.await.expect("task").expect("resolved");
        assert!(response.accounts.is_empty());
    }

    #[tokio::test]
    async fn responses_match_requests_in_order() {
        let (handler, _outbound) = test_handler();
        let rx1 = handler.account_ranges.push(handler.current_bytes_limit());
        let rx2 = handler.account_ranges.push(handler.current_bytes_limit());

        handler.resolve(
            &handler.account_ranges,
            10,
            AccountRange {
                id: 1,
                accounts: vec![],
                proof: vec![],
            },
        );
        handler.resolve(
            &handler.account_ranges,
            10,
            AccountRange {
                id: 2,
                accounts: vec![],
                proof: vec![],
            },
        );

        assert_eq!(rx1.await.expect("first").expect("ok").id, 1);
        assert_eq!(rx2.await.expect("second").expect("ok").id, 2);
    }

    #[tokio::test]
    async fn fast_fifo_response_doubles_through_the_wire_path() {
        let (handler, _outbound) = test_handler();
        let _receiver = handler.account_ranges.push(100_000);
        resolve_after(
            &handler,
            &handler.account_ranges,
            Duration::from_millis(500),
            empty_account_range(),
        );
        assert_eq!(handler.current_bytes_limit(), 200_000);
    }

    #[tokio::test]
    async fn unsolicited_snap_response_is_dropped() {
        let (handler, _outbound) = test_handler();
        let mut buf = Vec::new();
        empty_account_range().encode(&mut buf).expect("encode");
        handler
            .handle_message(AccountRange::CODE, Bytes::from(buf))
            .await
            .expect("dropped without error");
        assert_eq!(handler.current_bytes_limit(), MIN_RESPONSE_BYTES);
    }

    #[tokio::test]
    async fn serves_account_range_requests() {
        let (handler, mut outbound) = test_handler();
        let request = GetAccountRange {
            id: 77,
            root_hash: H256::zero(),
            starting_hash: H256::zero(),
            limit_hash: H256::from([0xff; 32]),
            response_bytes: 50_000,
        };
        let mut buf = Vec::new();
        request.encode(&mut buf).expect("encode");
        handler
            .handle_message(GetAccountRange::CODE, Bytes::from(buf))
            .await
            .expect("served");
        match outbound.recv().await.expect("response") {
            Message::AccountRange(response) => assert_eq!(response.id, 77),
            other => panic!("unexpected message {other}"),
        }
    }

    #[tokio::test]
    async fn disconnect_cancels_outstanding_requests() {
        let (handler, _outbound) = test_handler();
        let receiver = handler.account_ranges.push(handler.current_bytes_limit());
        handler.on_disconnect(DisconnectReason::ClientQuitting).await;
        assert!(matches!(
            receiver.await.expect("completed"),
            Err(RLPxError::RequestCancelled)
        ));
    }
}

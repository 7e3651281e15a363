//! Session-level tests driving a full handshake and message exchange over
//! an in-memory frame transport, with this side of the wire played by the
//! real stack and the remote side scripted by the test.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use futures::StreamExt;
use tokio::time::timeout;

use ethwire_common::{
    H256, H512, U256,
    types::{BlockBody, BlockHash, BlockHeader, ForkId, ForkValidation, Receipt, Transaction},
};
use ethwire_rlp::{decode::RLPDecode, encode::RLPEncode};

use ethwire_p2p::{
    backend::{Discovery, SnapServer, SyncBackend, TxPoolHandle},
    node_stats::NodeStatsRegistry,
    rlpx::{
        eth::{
            blocks::{BlockHeaders, GetBlockHeaders, HashOrNumber},
            handler::EthHandlerFactory,
            status::StatusMessage,
        },
        message::RLPxMessage,
        multiplexer::{ProtocolRegistry, SessionMultiplexer},
        p2p::{Capability, DisconnectMessage, DisconnectReason, HelloMessage},
        session::{Direction, SessionEvent},
        snap::{
            AccountRange, ByteCodes, GetAccountRange, GetByteCodes, GetStorageRanges,
            GetTrieNodes, StorageRanges, TrieNodes, handler::SnapHandlerFactory,
        },
    },
    types::Node,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ── scripted remote peer ───────────────────────────────────────────────

struct RemotePeer {
    to_session: futures::channel::mpsc::UnboundedSender<Bytes>,
    from_session: futures::channel::mpsc::UnboundedReceiver<Bytes>,
    snappy: bool,
}

impl RemotePeer {
    fn send_frame(&mut self, code: u8, payload: &[u8]) {
        let payload = if self.snappy && code != 0 {
            let mut encoder = snap::raw::Encoder::new();
            let mut out = vec![0; snap::raw::max_compress_len(payload.len()) + 1];
            let size = encoder.compress(payload, &mut out).expect("compress");
            out.truncate(size);
            out
        } else {
            payload.to_vec()
        };
        let mut frame = Vec::new();
        code.encode(&mut frame);
        frame.extend_from_slice(&payload);
        self.to_session
            .unbounded_send(Bytes::from(frame))
            .expect("session alive");
    }

    fn send_message<M: RLPxMessage>(&mut self, code: u8, message: &M, eth66: bool) {
        let mut payload = Vec::new();
        if eth66 {
            message.encode66(&mut payload).expect("encode");
        } else {
            message.encode(&mut payload).expect("encode");
        }
        self.send_frame(code, &payload);
    }

    async fn recv_frame(&mut self) -> (u8, Vec<u8>) {
        loop {
            let frame = timeout(TEST_TIMEOUT, self.from_session.next())
                .await
                .expect("frame within timeout")
                .expect("transport open");
            let (code, payload) = u8::decode_unfinished(&frame).expect("frame id");
            // keepalive pings are not interesting to any scenario
            if code == 2 {
                continue;
            }
            let payload = if self.snappy && code != 0 {
                let mut decoder = snap::raw::Decoder::new();
                decoder.decompress_vec(payload).expect("decompress")
            } else {
                payload.to_vec()
            };
            return (code, payload);
        }
    }
}

// ── collaborator mocks ─────────────────────────────────────────────────

struct TestBackend;

impl SyncBackend for TestBackend {
    fn network_id(&self) -> u64 {
        1
    }

    fn genesis_hash(&self) -> BlockHash {
        BlockHash::from_low_u64_be(0xcafe)
    }

    fn total_difficulty(&self) -> U256 {
        U256::from(17_000)
    }

    fn head(&self) -> Option<BlockHeader> {
        Some(BlockHeader {
            number: 200,
            ..Default::default()
        })
    }

    fn is_synced(&self) -> bool {
        true
    }

    fn fork_id(&self) -> Option<ForkId> {
        Some(ForkId {
            fork_hash: ethwire_common::H32::from_low_u64_be(0xfeedbeef),
            fork_next: 0,
        })
    }

    fn validate_fork_id(&self, remote: ForkId) -> ForkValidation {
        if remote.fork_hash == ethwire_common::H32::from_low_u64_be(0xfeedbeef) {
            ForkValidation::Valid
        } else {
            ForkValidation::IncompatibleOrStale
        }
    }

    fn headers(
        &self,
        start: HashOrNumber,
        limit: u64,
        _skip: u64,
        _reverse: bool,
    ) -> Vec<BlockHeader> {
        let HashOrNumber::Number(start) = start else {
            return vec![];
        };
        (start..start + limit)
            .map(|number| BlockHeader {
                number,
                ..Default::default()
            })
            .collect()
    }

    fn bodies(&self, _hashes: Vec<BlockHash>) -> Vec<BlockBody> {
        vec![]
    }

    fn receipts(&self, _hashes: Vec<BlockHash>) -> Vec<Vec<Receipt>> {
        vec![]
    }

    fn node_data(&self, _hashes: Vec<H256>) -> Vec<Bytes> {
        vec![]
    }
}

struct TestTxPool;

impl TxPoolHandle for TestTxPool {
    fn add_peer(&self, _public_key: H512) {}
    fn remove_peer(&self, _public_key: H512) {}

    fn filter_unknown(&self, hashes: &[H256]) -> Vec<H256> {
        hashes.to_vec()
    }

    fn add_transactions(&self, _peer: H512, _transactions: Vec<Transaction>) {}

    fn pending_hashes(&self) -> Vec<H256> {
        vec![]
    }

    fn pooled_transactions(&self, _hashes: &[H256]) -> Vec<Transaction> {
        vec![]
    }
}

struct TestSnapServer;

impl SnapServer for TestSnapServer {
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

#[derive(Default)]
struct RecordingDiscovery {
    added: Mutex<Vec<Node>>,
}

impl Discovery for RecordingDiscovery {
    fn add_node(&self, node: Node) {
        self.added.lock().expect("lock").push(node);
    }
}

// ── harness ────────────────────────────────────────────────────────────

fn build_multiplexer(
    discovery: Arc<RecordingDiscovery>,
) -> (Arc<SessionMultiplexer>, NodeStatsRegistry) {
    let registry = Arc::new(ProtocolRegistry::new());
    let stats = NodeStatsRegistry::new();
    registry
        .register(Arc::new(EthHandlerFactory {
            backend: Arc::new(TestBackend),
            tx_pool: Arc::new(TestTxPool),
            stats: stats.clone(),
        }))
        .expect("register eth");
    registry
        .register(Arc::new(SnapHandlerFactory {
            server: Arc::new(TestSnapServer),
            stats: stats.clone(),
        }))
        .expect("register snap");

    let multiplexer = Arc::new(SessionMultiplexer::new(
        registry,
        stats.clone(),
        discovery,
        "ethwire/v0.1.0/test".to_string(),
        H512::from_low_u64_be(0xa11ce),
        30303,
    ));
    (multiplexer, stats)
}

fn remote_node() -> Node {
    Node::new(
        "127.0.0.1".parse().expect("ip"),
        40404,
        40404,
        H512::from_low_u64_be(0xb0b),
    )
}

fn start_session(
    multiplexer: &Arc<SessionMultiplexer>,
    node: Node,
) -> (RemotePeer, tokio::sync::broadcast::Receiver<SessionEvent>) {
    let (to_session_tx, to_session_rx) = futures::channel::mpsc::unbounded::<Bytes>();
    let (from_session_tx, from_session_rx) = futures::channel::mpsc::unbounded::<Bytes>();
    let events = multiplexer.subscribe();

    multiplexer
        .start_session(
            node,
            Direction::Inbound,
            to_session_rx.map(Ok::<Bytes, std::io::Error>),
            from_session_tx,
        )
        .expect("session started");

    (
        RemotePeer {
            to_session: to_session_tx,
            from_session: from_session_rx,
            snappy: false,
        },
        events,
    )
}

fn remote_hello(capabilities: Vec<Capability>, listen_port: u16) -> HelloMessage {
    HelloMessage::new(
        "other-client/v1".to_string(),
        capabilities,
        listen_port,
        H512::from_low_u64_be(0xb0b),
    )
}

async fn drive_handshake(remote: &mut RemotePeer) {
    // local Hello comes first, uncompressed
    let (code, payload) = remote.recv_frame().await;
    assert_eq!(code, 0);
    let hello = HelloMessage::decode(&payload).expect("local hello");
    assert!(
        hello
            .capabilities
            .iter()
            .any(|capability| capability.protocol == "eth" && capability.version == 66)
    );

    remote.send_message(
        0,
        &remote_hello(vec![Capability::eth(66), Capability::snap(1)], 40404),
        false,
    );
    // both ends agreed on p2p v5: compression from here on
    remote.snappy = true;
}

async fn exchange_status(remote: &mut RemotePeer) {
    // eth occupies ids 16.., Status is eth message 0
    let (code, payload) = remote.recv_frame().await;
    assert_eq!(code, 16);
    let status = StatusMessage::decode(&payload).expect("local status");
    assert_eq!(status.network_id, 1);
    assert_eq!(status.genesis, BlockHash::from_low_u64_be(0xcafe));
    let fork_id = status.fork_id.expect("eth/66 carries a fork id");

    let remote_status = StatusMessage::new(
        66,
        1,
        U256::from(17_000),
        BlockHash::from_low_u64_be(0xbeef),
        BlockHash::from_low_u64_be(0xcafe),
        Some(fork_id),
    );
    let mut payload = Vec::new();
    remote_status.encode(&mut payload).expect("encode");
    remote.send_frame(16, &payload);
}

// ── tests ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_initializes_session_and_serves_headers() {
    let discovery = Arc::new(RecordingDiscovery::default());
    let (multiplexer, _stats) = build_multiplexer(discovery);
    let (mut remote, mut events) = start_session(&multiplexer, remote_node());

    drive_handshake(&mut remote).await;

    let event = timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("event within timeout")
        .expect("event");
    let SessionEvent::Initialized { capabilities, .. } = event else {
        panic!("expected Initialized, got {event:?}");
    };
    assert_eq!(
        capabilities,
        vec![Capability::eth(66), Capability::snap(1)]
    );

    exchange_status(&mut remote).await;

    // eth/66 header fetch: GetBlockHeaders is eth message 3 → absolute 19
    let request = GetBlockHeaders::new(7, HashOrNumber::Number(100), 5, 0, false);
    remote.send_message(19, &request, true);

    let (code, payload) = remote.recv_frame().await;
    assert_eq!(code, 20);
    let response = BlockHeaders::decode66(&payload).expect("headers response");
    assert_eq!(response.id, 7);
    assert_eq!(response.block_headers.len(), 5);
    assert_eq!(response.block_headers[0].number, 100);
    assert_eq!(response.block_headers[4].number, 104);
}

#[tokio::test]
async fn inbound_listen_port_is_offered_to_discovery() {
    let discovery = Arc::new(RecordingDiscovery::default());
    let (multiplexer, _stats) = build_multiplexer(discovery.clone());
    // the observed source port differs from the advertised listen port
    let mut node = remote_node();
    node.tcp_port = 54321;
    let (mut remote, _events) = start_session(&multiplexer, node);

    drive_handshake(&mut remote).await;

    let added = timeout(TEST_TIMEOUT, async {
        loop {
            if let Some(node) = discovery.added.lock().expect("lock").first().cloned() {
                return node;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("node offered to discovery");
    assert_eq!(added.tcp_port, 40404);
}

#[tokio::test]
async fn no_common_capabilities_is_a_useless_peer() {
    let discovery = Arc::new(RecordingDiscovery::default());
    let (multiplexer, _stats) = build_multiplexer(discovery);
    let (mut remote, mut events) = start_session(&multiplexer, remote_node());

    let (code, _) = remote.recv_frame().await;
    assert_eq!(code, 0);
    remote.send_message(0, &remote_hello(vec![Capability::new("les", 4)], 40404), false);
    remote.snappy = true;

    let (code, payload) = remote.recv_frame().await;
    assert_eq!(code, 1);
    let disconnect = DisconnectMessage::decode(&payload).expect("disconnect");
    assert_eq!(disconnect.reason(), DisconnectReason::UselessPeer);

    let event = timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("event within timeout")
        .expect("event");
    assert!(matches!(
        event,
        SessionEvent::Disconnected {
            reason: DisconnectReason::UselessPeer,
            ..
        }
    ));
}

#[tokio::test]
async fn remote_disconnect_closes_the_session_and_throttles_redial() {
    let discovery = Arc::new(RecordingDiscovery::default());
    let (multiplexer, stats) = build_multiplexer(discovery);
    let node = remote_node();
    let (mut remote, mut events) = start_session(&multiplexer, node.clone());

    drive_handshake(&mut remote).await;
    // skip the Initialized event
    let _ = timeout(TEST_TIMEOUT, events.recv()).await.expect("event");

    let mut payload = Vec::new();
    DisconnectMessage::new(Some(DisconnectReason::TooManyPeers))
        .encode(&mut payload)
        .expect("encode");
    remote.send_frame(1, &payload);

    let event = timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("event within timeout")
        .expect("event");
    assert!(matches!(event, SessionEvent::Disconnected { .. }));

    // session table is cleaned up and the peer is throttled
    timeout(TEST_TIMEOUT, async {
        while multiplexer.session_count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session removed");
    let (delayed, cause) = stats.stats_for(node.public_key).is_connection_delayed();
    assert!(delayed);
    assert!(cause.is_some());
}

#[tokio::test]
async fn snap_request_is_served_over_the_session() {
    let discovery = Arc::new(RecordingDiscovery::default());
    let (multiplexer, _stats) = build_multiplexer(discovery);
    let (mut remote, mut events) = start_session(&multiplexer, remote_node());

    drive_handshake(&mut remote).await;
    let _ = timeout(TEST_TIMEOUT, events.recv()).await.expect("event");
    exchange_status(&mut remote).await;

    // snap sits after eth: ids 33..41, GetAccountRange is snap message 0
    let request = GetAccountRange {
        id: 55,
        root_hash: H256::zero(),
        starting_hash: H256::zero(),
        limit_hash: H256::from([0xff; 32]),
        response_bytes: 50_000,
    };
    let mut payload = Vec::new();
    request.encode(&mut payload).expect("encode");
    remote.send_frame(33, &payload);

    let (code, payload) = remote.recv_frame().await;
    assert_eq!(code, 34);
    let response = AccountRange::decode(&payload).expect("account range");
    assert_eq!(response.id, 55);
}

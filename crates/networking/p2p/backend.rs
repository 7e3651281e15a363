//! Narrow interfaces to the collaborators the networking core consumes.
//!
//! The core never reaches into storage, the mempool or the sync pipeline
//! directly; everything goes through these traits so the owning subsystems
//! stay swappable (and trivially mockable in tests).

use ethwire_common::{
    H256, H512, U256,
    types::{BlockBody, BlockHash, BlockHeader, ForkId, ForkValidation, Receipt, Transaction},
};

use crate::rlpx::{
    eth::blocks::HashOrNumber,
    snap::{
        AccountRange, ByteCodes, GetAccountRange, GetByteCodes, GetStorageRanges, GetTrieNodes,
        StorageRanges, TrieNodes,
    },
};

/// Chain state the eth handlers need: serving data to peers and describing
/// our own position for the `Status` exchange.
pub trait SyncBackend: Send + Sync {
    fn network_id(&self) -> u64;
    fn genesis_hash(&self) -> BlockHash;
    fn total_difficulty(&self) -> U256;
    /// `None` while the chain head is still unknown (bootstrapping).
    fn head(&self) -> Option<BlockHeader>;
    /// Transaction gossip is only processed once the chain is caught up.
    fn is_synced(&self) -> bool;

    /// Local fork id at the current head.
    fn fork_id(&self) -> Option<ForkId>;
    /// Validates a remote fork id against the local fork table.
    fn validate_fork_id(&self, remote: ForkId) -> ForkValidation;

    fn headers(&self, start: HashOrNumber, limit: u64, skip: u64, reverse: bool)
    -> Vec<BlockHeader>;
    fn bodies(&self, hashes: Vec<BlockHash>) -> Vec<BlockBody>;
    fn receipts(&self, hashes: Vec<BlockHash>) -> Vec<Vec<Receipt>>;
    fn node_data(&self, hashes: Vec<H256>) -> Vec<bytes::Bytes>;
}

/// Fulfils snap/1 requests; the handler's role is framing, not trie
/// traversal.
pub trait SnapServer: Send + Sync {
    fn account_range(&self, request: GetAccountRange) -> AccountRange;
    fn storage_ranges(&self, request: GetStorageRanges) -> StorageRanges;
    fn byte_codes(&self, request: GetByteCodes) -> ByteCodes;
    fn trie_nodes(&self, request: GetTrieNodes) -> TrieNodes;
}

/// Transaction pool hooks used by the gossip path.
pub trait TxPoolHandle: Send + Sync {
    /// A peer joined the broadcast set (eth/65+ with a validated status).
    fn add_peer(&self, public_key: H512);
    fn remove_peer(&self, public_key: H512);
    /// Of the announced hashes, those the pool does not know yet and wants
    /// fetched.
    fn filter_unknown(&self, hashes: &[H256]) -> Vec<H256>;
    /// Transactions received from a peer, gossip or pooled-tx response.
    fn add_transactions(&self, peer: H512, transactions: Vec<Transaction>);
    /// Hashes of transactions this node should announce to a new peer.
    fn pending_hashes(&self) -> Vec<H256>;
    /// Pooled transactions served to a `GetPooledTransactions` request.
    fn pooled_transactions(&self, hashes: &[H256]) -> Vec<Transaction>;
}

/// Registry of peers usable by the sync pipeline.
pub trait SyncPeerPool: Send + Sync {
    fn register(&self, node: crate::types::Node);
    fn deregister(&self, public_key: H512);
    fn mark_priority(&self, public_key: H512);
}

/// Discovery hook: nodes learned outside the discovery protocol (e.g. an
/// inbound session advertising its listen port) are offered here.
pub trait Discovery: Send + Sync {
    fn add_node(&self, node: crate::types::Node);
}

/// Persists node records with reputation for reboot-warm peer sets.
pub trait NetworkStorage: Send + Sync {
    fn persist_node(&self, node: &crate::types::Node, reputation: i64);
}

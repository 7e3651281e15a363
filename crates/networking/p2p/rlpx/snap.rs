pub mod handler;
pub mod messages;

pub use messages::{
    AccountRange, AccountRangeUnit, ByteCodes, GetAccountRange, GetByteCodes, GetStorageRanges,
    GetTrieNodes, StorageRanges, StorageSlot, TrieNodes,
};

pub const SUPPORTED_SNAP_VERSIONS: [u8; 1] = [1];

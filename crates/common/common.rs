// Keep the hash and uint types from ethereum_types
pub use bytes::Bytes;
pub use ethereum_types::{Address, Bloom, H32, H64, H128, H256, H264, H512, U256};

pub mod constants;
pub mod types;

use tiny_keccak::{Hasher, Keccak};

/// Keccak-256 as used for block hashes, transaction hashes and node ids.
pub fn keccak_hash(data: impl AsRef<[u8]>) -> H256 {
    let mut hasher = Keccak::v256();
    hasher.update(data.as_ref());
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    H256(out)
}

pub mod error;
pub mod gas_price;
pub mod nonce_manager;

use ethwire_common::types::{Block, BlockHeader, BlockNumber};

/// Narrow read interface over the canonical chain, implemented by the block
/// tree / storage layer.
pub trait BlockAccess: Send + Sync {
    fn head_header(&self) -> Option<BlockHeader>;
    fn find_block(&self, number: BlockNumber) -> Option<Block>;
    fn genesis(&self) -> Option<Block>;
}

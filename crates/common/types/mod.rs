mod account;
mod block;
mod chain_config;
mod fork_id;
mod receipt;
mod transaction;

pub use account::*;
pub use block::*;
pub use chain_config::*;
pub use fork_id::*;
pub use receipt::*;
pub use transaction::*;

pub type BlockNumber = u64;
pub type BlockHash = ethereum_types::H256;

pub const GWEI_TO_WEI: u64 = 1_000_000_000;

/// Base fee of the genesis block per EIP-1559.
pub const INITIAL_BASE_FEE: u64 = GWEI_TO_WEI;

//! Gas price estimation from recent blocks.
//!
//! Samples effective gas prices from the last blocks behind the head,
//! filters out noise (beneficiary self-payments, dust prices, fee-market
//! transactions on chains that predate it) and reports a percentile of the
//! sample distribution, cached per head block.

use std::sync::Mutex;

use ethereum_types::U256;
use tracing::debug;

use ethwire_common::types::{BlockHash, ChainConfig};

use crate::{BlockAccess, error::OracleError};

const DEFAULT_BLOCK_LIMIT: u64 = 20;
const DEFAULT_TX_LIMIT_PER_BLOCK: usize = 3;
const DEFAULT_SOFT_TX_THRESHOLD: usize = 40;
const DEFAULT_PERCENTILE: usize = 60;
/// 1 gwei, used for blocks that yield no usable sample.
const DEFAULT_GAS_PRICE: u64 = 1_000_000_000;
/// 500 gwei cap on the reported estimate.
const DEFAULT_MAX_GAS_PRICE: u64 = 500_000_000_000;

#[derive(Debug, Clone)]
pub struct GasPriceOracleConfig {
    /// How many blocks behind the head are sampled at most.
    pub block_limit: u64,
    /// How many transactions per block enter the sample list.
    pub tx_limit_per_block: usize,
    /// Sampling stops early once the sample list plus the remaining block
    /// allowance reaches this count.
    pub soft_tx_threshold: usize,
    /// Percentile of the sorted sample list that is reported.
    pub percentile: usize,
    /// Prices below this are ignored.
    pub ignore_under: U256,
    /// Price used for blocks without a single accepted sample.
    pub default_gas_price: U256,
    /// Upper bound on the reported estimate.
    pub max_gas_price: U256,
}

impl Default for GasPriceOracleConfig {
    fn default() -> Self {
        Self {
            block_limit: DEFAULT_BLOCK_LIMIT,
            tx_limit_per_block: DEFAULT_TX_LIMIT_PER_BLOCK,
            soft_tx_threshold: DEFAULT_SOFT_TX_THRESHOLD,
            percentile: DEFAULT_PERCENTILE,
            ignore_under: U256::zero(),
            default_gas_price: U256::from(DEFAULT_GAS_PRICE),
            max_gas_price: U256::from(DEFAULT_MAX_GAS_PRICE),
        }
    }
}

#[derive(Debug)]
pub struct GasPriceOracle {
    config: GasPriceOracleConfig,
    chain_config: ChainConfig,
    /// Estimate for the current head; serving the same head again is free.
    cache: Mutex<Option<(BlockHash, U256)>>,
}

impl GasPriceOracle {
    pub fn new(chain_config: ChainConfig) -> Self {
        Self::with_config(chain_config, GasPriceOracleConfig::default())
    }

    pub fn with_config(chain_config: ChainConfig, config: GasPriceOracleConfig) -> Self {
        Self {
            config,
            chain_config,
            cache: Mutex::new(None),
        }
    }

    pub fn estimate(&self, chain: &dyn BlockAccess) -> Result<U256, OracleError> {
        let head = chain.head_header().ok_or(OracleError::MissingHead)?;
        let head_hash = head.hash();

        if let Some((cached_head, cached_price)) = *self.lock_cache() {
            if cached_head == head_hash {
                return Ok(cached_price);
            }
        }
        chain.genesis().ok_or(OracleError::MissingGenesis)?;

        let samples = self.collect_samples(chain, head.number);
        let price = self.pick_percentile(samples);

        debug!("Gas price estimate for head {head_hash:?}: {price}");
        *self.lock_cache() = Some((head_hash, price));
        Ok(price)
    }

    fn collect_samples(&self, chain: &dyn BlockAccess, head_number: u64) -> Vec<U256> {
        let mut samples: Vec<U256> = Vec::new();
        let mut number = head_number;
        let mut blocks_left = self.config.block_limit;

        while blocks_left > 0 {
            let Some(block) = chain.find_block(number) else {
                break;
            };
            blocks_left -= 1;

            let base_fee = block.header.base_fee_per_gas;
            let beneficiary = block.header.coinbase;
            let london_active = self.chain_config.is_london_activated(block.header.number);

            let mut prices: Vec<U256> = block
                .body
                .transactions
                .iter()
                .filter(|tx| {
                    // fee-market transactions are junk data on a pre-1559
                    // chain
                    london_active || !tx_is_fee_market(tx)
                })
                .filter(|tx| tx.sender() != Some(beneficiary))
                .filter_map(|tx| tx.effective_gas_price(base_fee).map(U256::from))
                .filter(|price| *price >= self.config.ignore_under)
                .collect();
            prices.sort();

            if prices.is_empty() {
                samples.push(self.config.default_gas_price);
            } else {
                samples.extend(prices.into_iter().take(self.config.tx_limit_per_block));
            }

            if samples.len() + blocks_left as usize >= self.config.soft_tx_threshold {
                break;
            }
            if number == 0 {
                break;
            }
            number -= 1;
        }
        samples
    }

    fn pick_percentile(&self, mut samples: Vec<U256>) -> U256 {
        if samples.is_empty() {
            return self.config.default_gas_price.min(self.config.max_gas_price);
        }
        samples.sort();
        let index = ((samples.len() - 1) * self.config.percentile + 50) / 100;
        samples[index].min(self.config.max_gas_price)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, Option<(BlockHash, U256)>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn tx_is_fee_market(tx: &ethwire_common::types::Transaction) -> bool {
    use ethwire_common::types::TxType;
    matches!(tx.tx_type(), TxType::EIP1559 | TxType::EIP4844)
}

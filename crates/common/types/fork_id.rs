use crc32fast::Hasher;
use ethereum_types::H32;
use ethwire_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use tracing::debug;

use super::{BlockHash, BlockNumber, ChainConfig};

/// EIP-2124 fork identifier: the CRC32 chain over the genesis hash and every
/// past fork activation, plus the next scheduled activation (0 if none).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkId {
    pub fork_hash: H32,
    pub fork_next: u64,
}

/// Verdict of matching a remote fork id against the local fork table.
/// See <https://eips.ethereum.org/EIPS/eip-2124#validation-rules>.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkValidation {
    Valid,
    /// Remote is a subset of our chain but announces the wrong next fork;
    /// it needs a software update.
    RemoteStale,
    /// Either we are stale or the chains are simply different.
    IncompatibleOrStale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    Genesis,
    Block(u64),
    Timestamp(u64),
}

impl Activation {
    fn value(&self) -> u64 {
        match self {
            Activation::Genesis => 0,
            Activation::Block(number) => *number,
            Activation::Timestamp(timestamp) => *timestamp,
        }
    }

    fn passed_by(&self, head_number: BlockNumber, head_timestamp: u64) -> bool {
        match self {
            Activation::Genesis => true,
            Activation::Block(number) => *number <= head_number,
            Activation::Timestamp(timestamp) => *timestamp <= head_timestamp,
        }
    }
}

#[derive(Debug, Clone)]
struct ForkEntry {
    activation: Activation,
    fork_id: ForkId,
}

/// Precomputed fork-id table for one chain: entry 0 is genesis, entry `i`
/// the `i-1`-th activation, each carrying the id advertised while that fork
/// is the latest one passed. Strictly ordered by activation, block numbers
/// before timestamps.
#[derive(Debug, Clone)]
pub struct ForkIdTable {
    entries: Vec<ForkEntry>,
}

impl ForkIdTable {
    pub fn new(
        chain_config: &ChainConfig,
        genesis_hash: BlockHash,
        genesis_timestamp: u64,
    ) -> Self {
        let (block_forks, timestamp_forks) = chain_config.gather_forks(genesis_timestamp);
        let activations: Vec<Activation> = block_forks
            .into_iter()
            .map(Activation::Block)
            .chain(timestamp_forks.into_iter().map(Activation::Timestamp))
            .collect();

        let mut hasher = Hasher::new();
        hasher.update(genesis_hash.as_bytes());

        let mut entries = Vec::with_capacity(activations.len() + 1);
        for i in 0..=activations.len() {
            let fork_hash = H32::from_slice(&hasher.clone().finalize().to_be_bytes());
            let fork_next = activations.get(i).map(|a| a.value()).unwrap_or(0);
            let activation = if i == 0 {
                Activation::Genesis
            } else {
                activations[i - 1]
            };
            entries.push(ForkEntry {
                activation,
                fork_id: ForkId {
                    fork_hash,
                    fork_next,
                },
            });
            if let Some(next) = activations.get(i) {
                hasher.update(&next.value().to_be_bytes());
            }
        }
        Self { entries }
    }

    /// Fork id to advertise at the given head: the entry of the last
    /// activation the head has passed.
    pub fn id_at(&self, head_number: BlockNumber, head_timestamp: u64) -> ForkId {
        let first_unpassed = self
            .entries
            .partition_point(|entry| entry.activation.passed_by(head_number, head_timestamp));
        // entry 0 (genesis) is always passed
        self.entries[first_unpassed - 1].fork_id
    }

    /// Validates a remote fork id against our table. `head` is the local
    /// chain head; while it is still unknown every remote is acceptable.
    pub fn validate(
        &self,
        remote: ForkId,
        head: Option<(BlockNumber, u64)>,
    ) -> ForkValidation {
        let Some((head_number, head_timestamp)) = head else {
            return ForkValidation::Valid;
        };
        let local = self.id_at(head_number, head_timestamp);

        if remote.fork_hash == local.fork_hash {
            // rule #1: same checksum. Reject only a future fork the remote
            // announces that we already passed without changing checksum.
            if remote.fork_next > 0 && remote.fork_next <= self.head_scalar(head_number, head_timestamp)
            {
                debug!("Remote announces a future fork we already passed locally");
                return ForkValidation::IncompatibleOrStale;
            }
            return ForkValidation::Valid;
        }

        let local_position = self
            .entries
            .iter()
            .position(|entry| entry.fork_id.fork_hash == local.fork_hash)
            .unwrap_or_default();

        // rule #2: remote is a subset of our past; it must know about the
        // fork we took next.
        for entry in &self.entries[..local_position] {
            if remote.fork_hash == entry.fork_id.fork_hash {
                return if remote.fork_next == entry.fork_id.fork_next {
                    ForkValidation::Valid
                } else {
                    debug!("Remote needs a software update");
                    ForkValidation::RemoteStale
                };
            }
        }

        // rule #3: remote is a superset of our chain; we are the laggard.
        for entry in &self.entries[local_position + 1..] {
            if remote.fork_hash == entry.fork_id.fork_hash {
                return ForkValidation::Valid;
            }
        }

        // rule #4
        debug!("Local or remote is incompatible");
        ForkValidation::IncompatibleOrStale
    }

    /// Scalar the remote's `fork_next` is compared against: the head block
    /// number while block-based forks are still pending, the head timestamp
    /// afterwards.
    fn head_scalar(&self, head_number: BlockNumber, head_timestamp: u64) -> u64 {
        let pending_block_fork = self.entries.iter().any(|entry| {
            matches!(entry.activation, Activation::Block(number) if number > head_number)
        });
        if pending_block_fork {
            head_number
        } else {
            head_timestamp
        }
    }
}

impl ForkId {
    pub fn new(
        chain_config: &ChainConfig,
        genesis_hash: BlockHash,
        genesis_timestamp: u64,
        head_timestamp: u64,
        head_block_number: BlockNumber,
    ) -> Self {
        ForkIdTable::new(chain_config, genesis_hash, genesis_timestamp)
            .id_at(head_block_number, head_timestamp)
    }
}

impl RLPEncode for ForkId {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.fork_hash)
            .encode_field(&self.fork_next)
            .finish();
    }
}

impl RLPDecode for ForkId {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (fork_hash, decoder) = decoder.decode_field("forkHash")?;
        let (fork_next, decoder) = decoder.decode_field("forkNext")?;
        let remaining = decoder.finish()?;
        let fork_id = ForkId {
            fork_hash,
            fork_next,
        };
        Ok((fork_id, remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H256;
    use hex_literal::hex;
    use std::str::FromStr;

    fn mainnet_config() -> ChainConfig {
        ChainConfig {
            chain_id: 1,
            homestead_block: Some(1_150_000),
            dao_fork_block: Some(1_920_000),
            eip150_block: Some(2_463_000),
            eip155_block: Some(2_675_000),
            eip158_block: Some(2_675_000),
            byzantium_block: Some(4_370_000),
            constantinople_block: Some(7_280_000),
            petersburg_block: Some(7_280_000),
            istanbul_block: Some(9_069_000),
            muir_glacier_block: Some(9_200_000),
            berlin_block: Some(12_244_000),
            london_block: Some(12_965_000),
            arrow_glacier_block: Some(13_773_000),
            gray_glacier_block: Some(15_050_000),
            terminal_total_difficulty: Some(58_750_000_000_000_000_000_000),
            shanghai_time: Some(1_681_338_455),
            cancun_time: Some(1_710_338_135),
            ..Default::default()
        }
    }

    fn mainnet_genesis_hash() -> H256 {
        H256::from_str("0xd4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3")
            .unwrap()
    }

    fn mainnet_table() -> ForkIdTable {
        ForkIdTable::new(&mainnet_config(), mainnet_genesis_hash(), 0)
    }

    fn id(hash: [u8; 4], next: u64) -> ForkId {
        ForkId {
            fork_hash: H32(hash),
            fork_next: next,
        }
    }

    #[test]
    fn encode_fork_id() {
        let fork = ForkId {
            fork_hash: H32::zero(),
            fork_next: 0,
        };
        let expected = hex!("c6840000000080");
        assert_eq!(fork.encode_to_vec(), expected);
    }

    #[test]
    fn encode_fork_id_nonzero() {
        let fork = ForkId {
            fork_hash: H32::from_str("0xdeadbeef").unwrap(),
            fork_next: 0xbaddcafe,
        };
        let expected = hex!("ca84deadbeef84baddcafe");
        assert_eq!(fork.encode_to_vec(), expected);
        assert_eq!(ForkId::decode(&expected).unwrap(), fork);
    }

    #[test]
    fn encode_fork_id_max() {
        let fork = ForkId {
            fork_hash: H32([0xff; 4]),
            fork_next: u64::MAX,
        };
        let expected = hex!("ce84ffffffff88ffffffffffffffff");
        assert_eq!(fork.encode_to_vec(), expected);
    }

    // See https://github.com/ethereum/go-ethereum/blob/master/core/forkid/forkid_test.go
    // (mainnet cases)
    #[test]
    fn mainnet_fork_ids() {
        let table = mainnet_table();
        let cases: Vec<(u64, u64, ForkId)> = vec![
            (0, 0, id(hex!("fc64ec04"), 1_150_000)),
            (1_149_999, 0, id(hex!("fc64ec04"), 1_150_000)),
            (1_150_000, 0, id(hex!("97c2c34c"), 1_920_000)),
            (1_920_000, 0, id(hex!("91d1f948"), 2_463_000)),
            (2_463_000, 0, id(hex!("7a64da13"), 2_675_000)),
            (2_675_000, 0, id(hex!("3edd5b10"), 4_370_000)),
            (4_370_000, 0, id(hex!("a00bc324"), 7_280_000)),
            (7_280_000, 0, id(hex!("668db0af"), 9_069_000)),
            (9_069_000, 0, id(hex!("879d6e30"), 9_200_000)),
            (9_200_000, 0, id(hex!("e029e991"), 12_244_000)),
            (12_244_000, 0, id(hex!("0eb440f6"), 12_965_000)),
            (12_965_000, 0, id(hex!("b715077d"), 13_773_000)),
            (13_773_000, 0, id(hex!("20c327fc"), 15_050_000)),
            (15_050_000, 0, id(hex!("f0afd0e3"), 1_681_338_455)),
            (20_000_000, 1_681_338_455, id(hex!("dce96c2d"), 1_710_338_135)),
            (20_000_000, 1_710_338_135, id(hex!("9f3d2254"), 0)),
            (21_000_000, 2_000_000_000, id(hex!("9f3d2254"), 0)),
        ];
        for (head, time, expected) in cases {
            assert_eq!(table.id_at(head, time), expected, "head {head} time {time}");
        }
    }

    #[test]
    fn validation_is_reflexive() {
        let table = mainnet_table();
        for (head, time) in [
            (0, 0),
            (1_150_000, 0),
            (7_987_396, 0),
            (15_050_000, 0),
            (20_000_000, 1_681_338_455),
            (20_000_000, 1_800_000_000),
        ] {
            let local = table.id_at(head, time);
            assert_eq!(
                table.validate(local, Some((head, time))),
                ForkValidation::Valid
            );
        }
    }

    #[test]
    fn validation_accepts_future_announcement() {
        let table = mainnet_table();
        // Remote on our chain, aware of a fork we don't know about yet.
        let remote = id(hex!("9f3d2254"), u64::MAX);
        assert_eq!(
            table.validate(remote, Some((20_000_000, 1_800_000_000))),
            ForkValidation::Valid
        );
    }

    #[test]
    fn validation_accepts_subset_with_correct_next() {
        let table = mainnet_table();
        // Local at Petersburg, remote still on Byzantium but aware of the
        // Constantinople activation.
        let remote = id(hex!("a00bc324"), 7_280_000);
        assert_eq!(
            table.validate(remote, Some((7_987_396, 0))),
            ForkValidation::Valid
        );
    }

    #[test]
    fn validation_flags_stale_subset() {
        let table = mainnet_table();
        // Remote stuck on Byzantium with no knowledge of the next fork.
        let remote = id(hex!("a00bc324"), 0);
        assert_eq!(
            table.validate(remote, Some((7_987_396, 0))),
            ForkValidation::RemoteStale
        );
    }

    #[test]
    fn validation_accepts_superset() {
        let table = mainnet_table();
        // Local still on Byzantium, remote already past Constantinople.
        let remote = id(hex!("668db0af"), 0);
        assert_eq!(
            table.validate(remote, Some((7_279_999, 0))),
            ForkValidation::Valid
        );
    }

    #[test]
    fn validation_rejects_unknown_hash() {
        let table = mainnet_table();
        let remote = id(hex!("deadbeef"), 0);
        assert_eq!(
            table.validate(remote, Some((7_987_396, 0))),
            ForkValidation::IncompatibleOrStale
        );
    }

    #[test]
    fn validation_rejects_passed_future_fork() {
        let table = mainnet_table();
        // Same checksum but the remote expects a fork at a timestamp we are
        // already past without having forked.
        let remote = id(hex!("9f3d2254"), 1_750_000_000);
        assert_eq!(
            table.validate(remote, Some((20_000_000, 1_800_000_000))),
            ForkValidation::IncompatibleOrStale
        );
    }

    #[test]
    fn unknown_head_accepts_anything() {
        let table = mainnet_table();
        assert_eq!(
            table.validate(id(hex!("deadbeef"), 12345), None),
            ForkValidation::Valid
        );
    }
}

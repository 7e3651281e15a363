use serde::{Deserialize, Serialize};

/// Hard-fork schedule of a chain, as found in the `config` section of a
/// genesis file. `None` means the fork is not scheduled; `0` (or a past
/// activation) means it is already active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainConfig {
    pub chain_id: u64,

    pub homestead_block: Option<u64>,
    pub dao_fork_block: Option<u64>,
    pub eip150_block: Option<u64>,
    pub eip155_block: Option<u64>,
    pub eip158_block: Option<u64>,
    pub byzantium_block: Option<u64>,
    pub constantinople_block: Option<u64>,
    pub petersburg_block: Option<u64>,
    pub istanbul_block: Option<u64>,
    pub muir_glacier_block: Option<u64>,
    pub berlin_block: Option<u64>,
    pub london_block: Option<u64>,
    pub arrow_glacier_block: Option<u64>,
    pub gray_glacier_block: Option<u64>,
    pub merge_netsplit_block: Option<u64>,

    /// Total difficulty that triggers the consensus upgrade.
    pub terminal_total_difficulty: Option<u128>,

    pub shanghai_time: Option<u64>,
    pub cancun_time: Option<u64>,
    pub prague_time: Option<u64>,
}

impl ChainConfig {
    /// Splits the schedule into block-number and timestamp activations, each
    /// sorted ascending with duplicates removed, zero and pre-genesis
    /// activations filtered out. This is the exact input the fork-id
    /// checksum chain is built over.
    pub fn gather_forks(&self, genesis_timestamp: u64) -> (Vec<u64>, Vec<u64>) {
        let mut block_number_based_forks: Vec<u64> = [
            self.homestead_block,
            self.dao_fork_block,
            self.eip150_block,
            self.eip155_block,
            self.eip158_block,
            self.byzantium_block,
            self.constantinople_block,
            self.petersburg_block,
            self.istanbul_block,
            self.muir_glacier_block,
            self.berlin_block,
            self.london_block,
            self.arrow_glacier_block,
            self.gray_glacier_block,
            self.merge_netsplit_block,
        ]
        .into_iter()
        .flatten()
        .collect();
        block_number_based_forks.sort();
        block_number_based_forks.dedup();
        block_number_based_forks.retain(|block_number| *block_number != 0);

        let mut timestamp_based_forks: Vec<u64> =
            [self.shanghai_time, self.cancun_time, self.prague_time]
                .into_iter()
                .flatten()
                .collect();
        timestamp_based_forks.sort();
        timestamp_based_forks.dedup();
        timestamp_based_forks.retain(|fork_timestamp| *fork_timestamp > genesis_timestamp);

        (block_number_based_forks, timestamp_based_forks)
    }

    pub fn is_london_activated(&self, block_number: u64) -> bool {
        self.london_block.is_some_and(|london| london <= block_number)
    }

    pub fn is_shanghai_activated(&self, block_timestamp: u64) -> bool {
        self.shanghai_time
            .is_some_and(|shanghai| shanghai <= block_timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_forks_sorts_dedups_and_filters() {
        let config = ChainConfig {
            chain_id: 1,
            homestead_block: Some(5),
            eip150_block: Some(3),
            eip155_block: Some(3),
            berlin_block: Some(0),
            shanghai_time: Some(100),
            cancun_time: Some(50),
            ..Default::default()
        };
        let (blocks, timestamps) = config.gather_forks(60);
        assert_eq!(blocks, vec![3, 5]);
        // cancun_time predates genesis and is dropped
        assert_eq!(timestamps, vec![100]);
    }
}

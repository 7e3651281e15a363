use bytes::BufMut;
use ethwire_common::{
    U256,
    types::{BlockHash, ForkId},
};
use ethwire_rlp::{
    error::{RLPDecodeError, RLPEncodeError},
    structs::{Decoder, Encoder},
};

use crate::rlpx::{eth::ETH_VERSION_WITH_FORK_ID, message::RLPxMessage};

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#status-0x00
// The fork id field exists from eth/64 (EIP-2124) on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub eth_version: u8,
    pub network_id: u64,
    pub total_difficulty: U256,
    pub block_hash: BlockHash,
    pub genesis: BlockHash,
    pub fork_id: Option<ForkId>,
}

impl StatusMessage {
    pub fn new(
        eth_version: u8,
        network_id: u64,
        total_difficulty: U256,
        block_hash: BlockHash,
        genesis: BlockHash,
        fork_id: Option<ForkId>,
    ) -> Self {
        Self {
            eth_version,
            network_id,
            total_difficulty,
            block_hash,
            genesis,
            fork_id: fork_id.filter(|_| eth_version >= ETH_VERSION_WITH_FORK_ID),
        }
    }
}

impl RLPxMessage for StatusMessage {
    const CODE: u8 = 0x00;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.eth_version)
            .encode_field(&self.network_id)
            .encode_field(&self.total_difficulty)
            .encode_field(&self.block_hash)
            .encode_field(&self.genesis)
            .encode_optional_field(&self.fork_id)
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (eth_version, decoder): (u8, _) = decoder.decode_field("protocolVersion")?;
        let (network_id, decoder): (u64, _) = decoder.decode_field("networkId")?;
        let (total_difficulty, decoder): (U256, _) = decoder.decode_field("totalDifficulty")?;
        let (block_hash, decoder): (BlockHash, _) = decoder.decode_field("blockHash")?;
        let (genesis, decoder): (BlockHash, _) = decoder.decode_field("genesis")?;
        let (fork_id, decoder) = if eth_version >= ETH_VERSION_WITH_FORK_ID {
            let (fork_id, decoder): (ForkId, _) = decoder.decode_field("forkId")?;
            (Some(fork_id), decoder)
        } else {
            (None, decoder)
        };
        // implementations must ignore any additional list elements
        let _padding = decoder.finish_unchecked();

        Ok(Self {
            eth_version,
            network_id,
            total_difficulty,
            block_hash,
            genesis,
            fork_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethwire_common::H32;

    fn status(version: u8, fork_id: Option<ForkId>) -> StatusMessage {
        StatusMessage::new(
            version,
            1,
            U256::from(17_179_869_184u64),
            BlockHash::from_low_u64_be(0xbeef),
            BlockHash::from_low_u64_be(0xcafe),
            fork_id,
        )
    }

    #[test]
    fn eth64_status_round_trip() {
        let msg = status(
            64,
            Some(ForkId {
                fork_hash: H32::from_low_u64_be(0xfc64ec04),
                fork_next: 1_150_000,
            }),
        );
        let mut buf = Vec::new();
        msg.encode(&mut buf).expect("encode");
        assert_eq!(StatusMessage::decode(&buf).expect("decode"), msg);
    }

    #[test]
    fn eth63_status_has_no_fork_id() {
        let msg = status(
            63,
            Some(ForkId {
                fork_hash: H32::zero(),
                fork_next: 0,
            }),
        );
        // the constructor drops the fork id below eth/64
        assert_eq!(msg.fork_id, None);
        let mut buf = Vec::new();
        msg.encode(&mut buf).expect("encode");
        assert_eq!(StatusMessage::decode(&buf).expect("decode"), msg);
    }
}

use bytes::BufMut;
use ethwire_common::types::{BlockHash, Receipt};
use ethwire_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::{RLPDecodeError, RLPEncodeError},
    structs::{Decoder, Encoder},
};

use crate::rlpx::message::RLPxMessage;

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#getreceipts-0x0f
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetReceipts {
    /// Mirrored by the response from eth/66 on; zero below.
    pub id: u64,
    pub block_hashes: Vec<BlockHash>,
}

impl GetReceipts {
    pub fn new(id: u64, block_hashes: Vec<BlockHash>) -> Self {
        Self { id, block_hashes }
    }
}

impl RLPxMessage for GetReceipts {
    const CODE: u8 = 0x0f;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        self.block_hashes.encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let block_hashes = Vec::decode(msg_data)?;
        Ok(Self::new(0, block_hashes))
    }

    fn encode66(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.block_hashes)
            .finish();
        Ok(())
    }

    fn decode66(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder): (u64, _) = decoder.decode_field("request-id")?;
        let (block_hashes, decoder) = decoder.decode_field("blockHashes")?;
        decoder.finish()?;
        Ok(Self::new(id, block_hashes))
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#receipts-0x10
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipts {
    pub id: u64,
    /// One receipt list per requested block.
    pub receipts: Vec<Vec<Receipt>>,
}

impl Receipts {
    pub fn new(id: u64, receipts: Vec<Vec<Receipt>>) -> Self {
        Self { id, receipts }
    }
}

impl RLPxMessage for Receipts {
    const CODE: u8 = 0x10;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        self.receipts.encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let receipts = Vec::decode(msg_data)?;
        Ok(Self::new(0, receipts))
    }

    fn encode66(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.receipts)
            .finish();
        Ok(())
    }

    fn decode66(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder): (u64, _) = decoder.decode_field("request-id")?;
        let (receipts, decoder) = decoder.decode_field("receipts")?;
        decoder.finish()?;
        Ok(Self::new(id, receipts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethwire_common::types::TxType;

    #[test]
    fn receipts_eth66_round_trip() {
        let msg = Receipts::new(
            12,
            vec![
                vec![Receipt {
                    tx_type: TxType::Legacy,
                    succeeded: true,
                    cumulative_gas_used: 21_000,
                    ..Default::default()
                }],
                vec![],
            ],
        );
        let mut buf = Vec::new();
        msg.encode66(&mut buf).expect("encode");
        assert_eq!(Receipts::decode66(&buf).expect("decode"), msg);
    }

    #[test]
    fn get_receipts_eth65_round_trip() {
        let msg = GetReceipts::new(0, vec![BlockHash::from([3; 32])]);
        let mut buf = Vec::new();
        msg.encode(&mut buf).expect("encode");
        assert_eq!(GetReceipts::decode(&buf).expect("decode"), msg);
    }
}

use bytes::BufMut;
use ethwire_common::types::{BlockBody, BlockHash, BlockHeader, BlockNumber};
use ethwire_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::{RLPDecodeError, RLPEncodeError},
    structs::{Decoder, Encoder},
};

use crate::rlpx::message::RLPxMessage;

pub const HASH_FIRST_BYTE_DECODER: u8 = 160;

// Limits taken from
// https://github.com/ethereum/go-ethereum/blob/master/eth/protocols/eth/handler.go
pub const BLOCK_HEADER_LIMIT: u64 = 1024;
pub const BLOCK_BODY_LIMIT: usize = 1024;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum HashOrNumber {
    Hash(BlockHash),
    Number(BlockNumber),
}

impl RLPEncode for HashOrNumber {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            HashOrNumber::Hash(hash) => hash.encode(buf),
            HashOrNumber::Number(number) => number.encode(buf),
        }
    }
}

impl From<BlockHash> for HashOrNumber {
    fn from(value: BlockHash) -> Self {
        Self::Hash(value)
    }
}

impl RLPDecode for HashOrNumber {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let first_byte = buf.first().ok_or(RLPDecodeError::InvalidLength)?;
        // a 32-byte hash always encodes with prefix 0x80 + 32 = 0xa0;
        // block numbers are shorter
        if *first_byte == HASH_FIRST_BYTE_DECODER {
            let (hash, rest) = BlockHash::decode_unfinished(buf)?;
            return Ok((Self::Hash(hash), rest));
        }
        let (number, rest) = u64::decode_unfinished(buf)?;
        Ok((Self::Number(number), rest))
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#getblockheaders-0x03
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockHeaders {
    /// Chosen by the requesting peer from eth/66 on; the responding peer
    /// must mirror it. Zero below eth/66.
    pub id: u64,
    pub startblock: HashOrNumber,
    pub limit: u64,
    pub skip: u64,
    pub reverse: bool,
}

impl GetBlockHeaders {
    pub fn new(id: u64, startblock: HashOrNumber, limit: u64, skip: u64, reverse: bool) -> Self {
        Self {
            id,
            startblock,
            limit,
            skip,
            reverse,
        }
    }
}

impl RLPxMessage for GetBlockHeaders {
    const CODE: u8 = 0x03;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.startblock)
            .encode_field(&self.limit)
            .encode_field(&self.skip)
            .encode_field(&(self.reverse as u8))
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (startblock, decoder) = decoder.decode_field("startBlock")?;
        let (limit, decoder) = decoder.decode_field("limit")?;
        let (skip, decoder) = decoder.decode_field("skip")?;
        let (reverse, decoder): (u8, _) = decoder.decode_field("reverse")?;
        decoder.finish()?;
        Ok(Self::new(0, startblock, limit, skip, reverse != 0))
    }

    fn encode66(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&(
                self.startblock.clone(),
                self.limit,
                self.skip,
                self.reverse as u8,
            ))
            .finish();
        Ok(())
    }

    fn decode66(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder): (u64, _) = decoder.decode_field("request-id")?;
        let ((startblock, limit, skip, reverse), decoder): ((HashOrNumber, u64, u64, u8), _) =
            decoder.decode_field("getBlockHeaders params")?;
        decoder.finish()?;
        Ok(Self::new(id, startblock, limit, skip, reverse != 0))
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#blockheaders-0x04
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeaders {
    pub id: u64,
    pub block_headers: Vec<BlockHeader>,
}

impl BlockHeaders {
    pub fn new(id: u64, block_headers: Vec<BlockHeader>) -> Self {
        Self { block_headers, id }
    }
}

impl RLPxMessage for BlockHeaders {
    const CODE: u8 = 0x04;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        self.block_headers.encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let block_headers = Vec::decode(msg_data)?;
        Ok(Self::new(0, block_headers))
    }

    fn encode66(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.block_headers)
            .finish();
        Ok(())
    }

    fn decode66(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder): (u64, _) = decoder.decode_field("request-id")?;
        let (block_headers, decoder) = decoder.decode_field("headers")?;
        decoder.finish()?;
        Ok(Self::new(id, block_headers))
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#getblockbodies-0x05
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockBodies {
    pub id: u64,
    pub block_hashes: Vec<BlockHash>,
}

impl GetBlockBodies {
    pub fn new(id: u64, block_hashes: Vec<BlockHash>) -> Self {
        Self { block_hashes, id }
    }
}

impl RLPxMessage for GetBlockBodies {
    const CODE: u8 = 0x05;

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

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#blockbodies-0x06
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBodies {
    pub id: u64,
    pub block_bodies: Vec<BlockBody>,
}

impl BlockBodies {
    pub fn new(id: u64, block_bodies: Vec<BlockBody>) -> Self {
        Self { block_bodies, id }
    }
}

impl RLPxMessage for BlockBodies {
    const CODE: u8 = 0x06;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        self.block_bodies.encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let block_bodies = Vec::decode(msg_data)?;
        Ok(Self::new(0, block_bodies))
    }

    fn encode66(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.block_bodies)
            .finish();
        Ok(())
    }

    fn decode66(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder): (u64, _) = decoder.decode_field("request-id")?;
        let (block_bodies, decoder) = decoder.decode_field("blockBodies")?;
        decoder.finish()?;
        Ok(Self::new(id, block_bodies))
    }
}

/// `NewBlockHashes` announcement entry (gossip, pre-merge only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHashAndNumber {
    pub hash: BlockHash,
    pub number: BlockNumber,
}

impl RLPEncode for BlockHashAndNumber {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.hash)
            .encode_field(&self.number)
            .finish();
    }
}

impl RLPDecode for BlockHashAndNumber {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (hash, decoder) = decoder.decode_field("hash")?;
        let (number, decoder) = decoder.decode_field("number")?;
        let remaining = decoder.finish()?;
        Ok((Self { hash, number }, remaining))
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#newblockhashes-0x01
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlockHashes {
    pub block_hashes: Vec<BlockHashAndNumber>,
}

impl RLPxMessage for NewBlockHashes {
    const CODE: u8 = 0x01;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        self.block_hashes.encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let block_hashes = Vec::decode(msg_data)?;
        Ok(Self { block_hashes })
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#newblock-0x07
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlock {
    pub block: ethwire_common::types::Block,
    pub total_difficulty: ethwire_common::U256,
}

impl RLPxMessage for NewBlock {
    const CODE: u8 = 0x07;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.block)
            .encode_field(&self.total_difficulty)
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (block, decoder) = decoder.decode_field("block")?;
        let (total_difficulty, decoder) = decoder.decode_field("totalDifficulty")?;
        decoder.finish()?;
        Ok(Self {
            block,
            total_difficulty,
        })
    }
}

use bytes::{BufMut, Bytes};
use ethwire_common::H256;
use ethwire_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::{RLPDecodeError, RLPEncodeError},
    structs::{Decoder, Encoder},
};

use crate::rlpx::message::RLPxMessage;

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#getnodedata-0x0d
// eth/63 through eth/66; superseded by snap/1 afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetNodeData {
    /// Mirrored by the response from eth/66 on; zero below.
    pub id: u64,
    pub hashes: Vec<H256>,
}

impl GetNodeData {
    pub fn new(id: u64, hashes: Vec<H256>) -> Self {
        Self { id, hashes }
    }
}

impl RLPxMessage for GetNodeData {
    const CODE: u8 = 0x0d;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        self.hashes.encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let hashes = Vec::decode(msg_data)?;
        Ok(Self::new(0, hashes))
    }

    fn encode66(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.hashes)
            .finish();
        Ok(())
    }

    fn decode66(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder): (u64, _) = decoder.decode_field("request-id")?;
        let (hashes, decoder) = decoder.decode_field("hashes")?;
        decoder.finish()?;
        Ok(Self::new(id, hashes))
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#nodedata-0x0e
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub id: u64,
    pub nodes: Vec<Bytes>,
}

impl NodeData {
    pub fn new(id: u64, nodes: Vec<Bytes>) -> Self {
        Self { id, nodes }
    }
}

impl RLPxMessage for NodeData {
    const CODE: u8 = 0x0e;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        self.nodes.encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let nodes = Vec::decode(msg_data)?;
        Ok(Self::new(0, nodes))
    }

    fn encode66(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.nodes)
            .finish();
        Ok(())
    }

    fn decode66(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder): (u64, _) = decoder.decode_field("request-id")?;
        let (nodes, decoder) = decoder.decode_field("nodes")?;
        decoder.finish()?;
        Ok(Self::new(id, nodes))
    }
}

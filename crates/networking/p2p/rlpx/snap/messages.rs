//! snap/1 message definitions.
//!
//! Four request/response pairs, per
//! https://github.com/ethereum/devp2p/blob/master/caps/snap.md. Every
//! request carries a `response_bytes` budget the server must stay under;
//! range responses carry merkle proofs for their boundaries.

use bytes::{BufMut, Bytes};
use ethwire_common::{H256, U256, types::AccountState};
use ethwire_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::{RLPDecodeError, RLPEncodeError},
    structs::{Decoder, Encoder},
};

use crate::rlpx::message::RLPxMessage;

// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#getaccountrange-0x00
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetAccountRange {
    /// Mirrored by the responding peer.
    pub id: u64,
    /// State root to query against.
    pub root_hash: H256,
    pub starting_hash: H256,
    pub limit_hash: H256,
    pub response_bytes: u64,
}

impl RLPxMessage for GetAccountRange {
    const CODE: u8 = 0x00;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.root_hash)
            .encode_field(&self.starting_hash)
            .encode_field(&self.limit_hash)
            .encode_field(&self.response_bytes)
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (root_hash, decoder) = decoder.decode_field("rootHash")?;
        let (starting_hash, decoder) = decoder.decode_field("startingHash")?;
        let (limit_hash, decoder) = decoder.decode_field("limitHash")?;
        let (response_bytes, decoder) = decoder.decode_field("responseBytes")?;
        decoder.finish()?;
        Ok(Self {
            id,
            root_hash,
            starting_hash,
            limit_hash,
            response_bytes,
        })
    }
}

/// A single account entry in an `AccountRange` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRangeUnit {
    pub hash: H256,
    pub account: AccountState,
}

impl RLPEncode for AccountRangeUnit {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.hash)
            .encode_field(&self.account)
            .finish();
    }
}

impl RLPDecode for AccountRangeUnit {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (hash, decoder) = decoder.decode_field("hash")?;
        let (account, decoder) = decoder.decode_field("account")?;
        let remaining = decoder.finish()?;
        Ok((Self { hash, account }, remaining))
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#accountrange-0x01
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRange {
    pub id: u64,
    pub accounts: Vec<AccountRangeUnit>,
    pub proof: Vec<Bytes>,
}

impl RLPxMessage for AccountRange {
    const CODE: u8 = 0x01;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.accounts)
            .encode_field(&self.proof)
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (accounts, decoder) = decoder.decode_field("accounts")?;
        let (proof, decoder) = decoder.decode_field("proof")?;
        decoder.finish()?;
        Ok(Self {
            id,
            accounts,
            proof,
        })
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#getstorageranges-0x02
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStorageRanges {
    pub id: u64,
    pub root_hash: H256,
    pub account_hashes: Vec<H256>,
    pub starting_hash: H256,
    pub limit_hash: H256,
    pub response_bytes: u64,
}

impl RLPxMessage for GetStorageRanges {
    const CODE: u8 = 0x02;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.root_hash)
            .encode_field(&self.account_hashes)
            .encode_field(&self.starting_hash)
            .encode_field(&self.limit_hash)
            .encode_field(&self.response_bytes)
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (root_hash, decoder) = decoder.decode_field("rootHash")?;
        let (account_hashes, decoder) = decoder.decode_field("accountHashes")?;
        let (starting_hash, decoder) = decoder.decode_field("startingHash")?;
        let (limit_hash, decoder) = decoder.decode_field("limitHash")?;
        let (response_bytes, decoder) = decoder.decode_field("responseBytes")?;
        decoder.finish()?;
        Ok(Self {
            id,
            root_hash,
            account_hashes,
            starting_hash,
            limit_hash,
            response_bytes,
        })
    }
}

/// A single storage slot entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSlot {
    pub hash: H256,
    pub data: U256,
}

impl RLPEncode for StorageSlot {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.hash)
            .encode_field(&self.data)
            .finish();
    }
}

impl RLPDecode for StorageSlot {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (hash, decoder) = decoder.decode_field("hash")?;
        let (data, decoder) = decoder.decode_field("data")?;
        let remaining = decoder.finish()?;
        Ok((Self { hash, data }, remaining))
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#storageranges-0x03
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRanges {
    pub id: u64,
    /// Storage slots per requested account, in request order.
    pub slots: Vec<Vec<StorageSlot>>,
    pub proof: Vec<Bytes>,
}

impl RLPxMessage for StorageRanges {
    const CODE: u8 = 0x03;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.slots)
            .encode_field(&self.proof)
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (slots, decoder) = decoder.decode_field("slots")?;
        let (proof, decoder) = decoder.decode_field("proof")?;
        decoder.finish()?;
        Ok(Self { id, slots, proof })
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#getbytecodes-0x04
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetByteCodes {
    pub id: u64,
    pub hashes: Vec<H256>,
    pub bytes: u64,
}

impl RLPxMessage for GetByteCodes {
    const CODE: u8 = 0x04;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.hashes)
            .encode_field(&self.bytes)
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (hashes, decoder) = decoder.decode_field("hashes")?;
        let (bytes, decoder) = decoder.decode_field("bytes")?;
        decoder.finish()?;
        Ok(Self { id, hashes, bytes })
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#bytecodes-0x05
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteCodes {
    pub id: u64,
    pub codes: Vec<Bytes>,
}

impl RLPxMessage for ByteCodes {
    const CODE: u8 = 0x05;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.codes)
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (codes, decoder) = decoder.decode_field("codes")?;
        decoder.finish()?;
        Ok(Self { id, codes })
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#gettrienodes-0x06
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetTrieNodes {
    pub id: u64,
    pub root_hash: H256,
    /// Paths to trie nodes: `[[acc_path, slot_path_1, ...], ...]`, full
    /// hashes or compact-encoded partial paths.
    pub paths: Vec<Vec<Bytes>>,
    pub bytes: u64,
}

impl RLPxMessage for GetTrieNodes {
    const CODE: u8 = 0x06;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.root_hash)
            .encode_field(&self.paths)
            .encode_field(&self.bytes)
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (root_hash, decoder) = decoder.decode_field("rootHash")?;
        let (paths, decoder) = decoder.decode_field("paths")?;
        let (bytes, decoder) = decoder.decode_field("bytes")?;
        decoder.finish()?;
        Ok(Self {
            id,
            root_hash,
            paths,
            bytes,
        })
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#trienodes-0x07
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieNodes {
    pub id: u64,
    pub nodes: Vec<Bytes>,
}

impl RLPxMessage for TrieNodes {
    const CODE: u8 = 0x07;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.nodes)
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder) = decoder.decode_field("request-id")?;
        let (nodes, decoder) = decoder.decode_field("nodes")?;
        decoder.finish()?;
        Ok(Self { id, nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_account_range_round_trip() {
        let msg = GetAccountRange {
            id: 1,
            root_hash: H256::from_low_u64_be(1),
            starting_hash: H256::zero(),
            limit_hash: H256::from([0xff; 32]),
            response_bytes: 20_000,
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).expect("encode");
        assert_eq!(GetAccountRange::decode(&buf).expect("decode"), msg);
    }

    #[test]
    fn account_range_round_trip() {
        let msg = AccountRange {
            id: 1,
            accounts: vec![AccountRangeUnit {
                hash: H256::from_low_u64_be(2),
                account: AccountState {
                    nonce: 3,
                    balance: U256::from(1000),
                    storage_root: H256::zero(),
                    code_hash: H256::zero(),
                },
            }],
            proof: vec![Bytes::from_static(&[0x80])],
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).expect("encode");
        assert_eq!(AccountRange::decode(&buf).expect("decode"), msg);
    }

    #[test]
    fn storage_ranges_round_trip() {
        let msg = StorageRanges {
            id: 9,
            slots: vec![vec![StorageSlot {
                hash: H256::from_low_u64_be(5),
                data: U256::from(77),
            }]],
            proof: vec![],
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).expect("encode");
        assert_eq!(StorageRanges::decode(&buf).expect("decode"), msg);
    }

    #[test]
    fn trie_nodes_round_trip() {
        let msg = TrieNodes {
            id: 3,
            nodes: vec![Bytes::from_static(&[0xde, 0xad])],
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).expect("encode");
        assert_eq!(TrieNodes::decode(&buf).expect("decode"), msg);
    }
}

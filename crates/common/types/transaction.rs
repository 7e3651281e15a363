use bytes::{BufMut, Bytes};
use ethereum_types::{Address, H256, U256};
use ethwire_rlp::{
    constants::RLP_NULL,
    decode::{RLPDecode, decode_rlp_item},
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};

use crate::keccak_hash;

pub type AccessList = Vec<(Address, Vec<H256>)>;

/// Recipient of a transaction: either a contract creation or a call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TxKind {
    #[default]
    Create,
    Call(Address),
}

impl RLPEncode for TxKind {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            // a creation encodes as the empty string
            TxKind::Create => buf.put_u8(RLP_NULL),
            TxKind::Call(address) => address.encode(buf),
        }
    }
}

impl RLPDecode for TxKind {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        if rlp.first() == Some(&RLP_NULL) {
            return Ok((TxKind::Create, &rlp[1..]));
        }
        let (address, rest) = Address::decode_unfinished(rlp)?;
        Ok((TxKind::Call(address), rest))
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxType {
    #[default]
    Legacy = 0x00,
    EIP2930 = 0x01,
    EIP1559 = 0x02,
    EIP4844 = 0x03,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas: u64,
    pub to: TxKind,
    pub value: U256,
    pub data: Bytes,
    pub v: U256,
    pub r: U256,
    pub s: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EIP2930Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub to: TxKind,
    pub value: U256,
    pub data: Bytes,
    pub access_list: AccessList,
    pub signature_y_parity: bool,
    pub signature_r: U256,
    pub signature_s: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EIP1559Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: u64,
    pub max_fee_per_gas: u64,
    pub gas_limit: u64,
    pub to: TxKind,
    pub value: U256,
    pub data: Bytes,
    pub access_list: AccessList,
    pub signature_y_parity: bool,
    pub signature_r: U256,
    pub signature_s: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EIP4844Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: u64,
    pub max_fee_per_gas: u64,
    pub gas: u64,
    /// Blob transactions cannot create contracts.
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub access_list: AccessList,
    pub max_fee_per_blob_gas: U256,
    pub blob_versioned_hashes: Vec<H256>,
    pub signature_y_parity: bool,
    pub signature_r: U256,
    pub signature_s: U256,
}

/// A transaction in its network form: legacy transactions are plain RLP
/// lists, typed transactions (EIP-2718) are byte strings holding the type
/// byte followed by the type-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    LegacyTransaction(LegacyTransaction),
    EIP2930Transaction(EIP2930Transaction),
    EIP1559Transaction(EIP1559Transaction),
    EIP4844Transaction(EIP4844Transaction),
}

impl Transaction {
    pub fn tx_type(&self) -> TxType {
        match self {
            Transaction::LegacyTransaction(_) => TxType::Legacy,
            Transaction::EIP2930Transaction(_) => TxType::EIP2930,
            Transaction::EIP1559Transaction(_) => TxType::EIP1559,
            Transaction::EIP4844Transaction(_) => TxType::EIP4844,
        }
    }

    pub fn nonce(&self) -> u64 {
        match self {
            Transaction::LegacyTransaction(tx) => tx.nonce,
            Transaction::EIP2930Transaction(tx) => tx.nonce,
            Transaction::EIP1559Transaction(tx) => tx.nonce,
            Transaction::EIP4844Transaction(tx) => tx.nonce,
        }
    }

    pub fn gas_limit(&self) -> u64 {
        match self {
            Transaction::LegacyTransaction(tx) => tx.gas,
            Transaction::EIP2930Transaction(tx) => tx.gas_limit,
            Transaction::EIP1559Transaction(tx) => tx.gas_limit,
            Transaction::EIP4844Transaction(tx) => tx.gas,
        }
    }

    pub fn data(&self) -> &Bytes {
        match self {
            Transaction::LegacyTransaction(tx) => &tx.data,
            Transaction::EIP2930Transaction(tx) => &tx.data,
            Transaction::EIP1559Transaction(tx) => &tx.data,
            Transaction::EIP4844Transaction(tx) => &tx.data,
        }
    }

    /// Price actually paid per gas unit under the given base fee.
    /// `None` when the transaction cannot be included (max fee below base).
    pub fn effective_gas_price(&self, base_fee_per_gas: Option<u64>) -> Option<u64> {
        match self {
            Transaction::LegacyTransaction(tx) => Some(tx.gas_price),
            Transaction::EIP2930Transaction(tx) => Some(tx.gas_price),
            Transaction::EIP1559Transaction(tx) => effective_1559_price(
                tx.max_fee_per_gas,
                tx.max_priority_fee_per_gas,
                base_fee_per_gas,
            ),
            Transaction::EIP4844Transaction(tx) => effective_1559_price(
                tx.max_fee_per_gas,
                tx.max_priority_fee_per_gas,
                base_fee_per_gas,
            ),
        }
    }

    /// Hash of the canonical (EIP-2718) encoding.
    pub fn compute_hash(&self) -> H256 {
        keccak_hash(self.canonical_bytes())
    }

    /// Canonical encoding: the legacy RLP list, or type byte plus payload
    /// for typed transactions, without any outer byte-string wrapping.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Transaction::LegacyTransaction(tx) => tx.encode(&mut buf),
            Transaction::EIP2930Transaction(tx) => {
                buf.put_u8(TxType::EIP2930 as u8);
                tx.encode(&mut buf);
            }
            Transaction::EIP1559Transaction(tx) => {
                buf.put_u8(TxType::EIP1559 as u8);
                tx.encode(&mut buf);
            }
            Transaction::EIP4844Transaction(tx) => {
                buf.put_u8(TxType::EIP4844 as u8);
                tx.encode(&mut buf);
            }
        }
        buf
    }

    /// Recovers the signing address. `None` when the signature does not
    /// recover (including the all-zero signatures used in fixtures).
    pub fn sender(&self) -> Option<Address> {
        let (payload, recovery_id) = self.signing_payload()?;
        let (r, s) = self.signature_rs();
        let mut compact = [0u8; 64];
        compact[..32].copy_from_slice(&r.to_big_endian());
        compact[32..].copy_from_slice(&s.to_big_endian());

        let recovery_id = secp256k1::ecdsa::RecoveryId::from_i32(recovery_id as i32).ok()?;
        let signature =
            secp256k1::ecdsa::RecoverableSignature::from_compact(&compact, recovery_id).ok()?;
        let message = secp256k1::Message::from_digest(keccak_hash(&payload).0);
        let public_key = signature.recover(&message).ok()?;

        let hash = keccak_hash(&public_key.serialize_uncompressed()[1..]);
        Some(Address::from_slice(&hash.0[12..]))
    }

    fn signature_rs(&self) -> (U256, U256) {
        match self {
            Transaction::LegacyTransaction(tx) => (tx.r, tx.s),
            Transaction::EIP2930Transaction(tx) => (tx.signature_r, tx.signature_s),
            Transaction::EIP1559Transaction(tx) => (tx.signature_r, tx.signature_s),
            Transaction::EIP4844Transaction(tx) => (tx.signature_r, tx.signature_s),
        }
    }

    /// Builds the bytes the sender signed over, plus the recovery id.
    fn signing_payload(&self) -> Option<(Vec<u8>, u8)> {
        let mut payload = Vec::new();
        match self {
            Transaction::LegacyTransaction(tx) => {
                let v = u64::try_from(tx.v).ok()?;
                if v >= 35 {
                    // EIP-155: [nonce, gas_price, gas, to, value, data, chain_id, 0, 0]
                    let chain_id = (v - 35) / 2;
                    Encoder::new(&mut payload)
                        .encode_field(&tx.nonce)
                        .encode_field(&tx.gas_price)
                        .encode_field(&tx.gas)
                        .encode_field(&tx.to)
                        .encode_field(&tx.value)
                        .encode_field(&tx.data)
                        .encode_field(&chain_id)
                        .encode_field(&0u8)
                        .encode_field(&0u8)
                        .finish();
                    Some((payload, (v - 35 - chain_id * 2) as u8))
                } else if v == 27 || v == 28 {
                    Encoder::new(&mut payload)
                        .encode_field(&tx.nonce)
                        .encode_field(&tx.gas_price)
                        .encode_field(&tx.gas)
                        .encode_field(&tx.to)
                        .encode_field(&tx.value)
                        .encode_field(&tx.data)
                        .finish();
                    Some((payload, (v - 27) as u8))
                } else {
                    None
                }
            }
            Transaction::EIP2930Transaction(tx) => {
                payload.put_u8(TxType::EIP2930 as u8);
                Encoder::new(&mut payload)
                    .encode_field(&tx.chain_id)
                    .encode_field(&tx.nonce)
                    .encode_field(&tx.gas_price)
                    .encode_field(&tx.gas_limit)
                    .encode_field(&tx.to)
                    .encode_field(&tx.value)
                    .encode_field(&tx.data)
                    .encode_field(&tx.access_list)
                    .finish();
                Some((payload, tx.signature_y_parity as u8))
            }
            Transaction::EIP1559Transaction(tx) => {
                payload.put_u8(TxType::EIP1559 as u8);
                Encoder::new(&mut payload)
                    .encode_field(&tx.chain_id)
                    .encode_field(&tx.nonce)
                    .encode_field(&tx.max_priority_fee_per_gas)
                    .encode_field(&tx.max_fee_per_gas)
                    .encode_field(&tx.gas_limit)
                    .encode_field(&tx.to)
                    .encode_field(&tx.value)
                    .encode_field(&tx.data)
                    .encode_field(&tx.access_list)
                    .finish();
                Some((payload, tx.signature_y_parity as u8))
            }
            Transaction::EIP4844Transaction(tx) => {
                payload.put_u8(TxType::EIP4844 as u8);
                Encoder::new(&mut payload)
                    .encode_field(&tx.chain_id)
                    .encode_field(&tx.nonce)
                    .encode_field(&tx.max_priority_fee_per_gas)
                    .encode_field(&tx.max_fee_per_gas)
                    .encode_field(&tx.gas)
                    .encode_field(&tx.to)
                    .encode_field(&tx.value)
                    .encode_field(&tx.data)
                    .encode_field(&tx.access_list)
                    .encode_field(&tx.max_fee_per_blob_gas)
                    .encode_field(&tx.blob_versioned_hashes)
                    .finish();
                Some((payload, tx.signature_y_parity as u8))
            }
        }
    }
}

fn effective_1559_price(
    max_fee_per_gas: u64,
    max_priority_fee_per_gas: u64,
    base_fee_per_gas: Option<u64>,
) -> Option<u64> {
    let base_fee = base_fee_per_gas.unwrap_or_default();
    if max_fee_per_gas < base_fee {
        return None;
    }
    Some(max_fee_per_gas.min(base_fee + max_priority_fee_per_gas))
}

impl RLPEncode for LegacyTransaction {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.nonce)
            .encode_field(&self.gas_price)
            .encode_field(&self.gas)
            .encode_field(&self.to)
            .encode_field(&self.value)
            .encode_field(&self.data)
            .encode_field(&self.v)
            .encode_field(&self.r)
            .encode_field(&self.s)
            .finish();
    }
}

impl RLPDecode for LegacyTransaction {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (gas_price, decoder) = decoder.decode_field("gas_price")?;
        let (gas, decoder) = decoder.decode_field("gas")?;
        let (to, decoder) = decoder.decode_field("to")?;
        let (value, decoder) = decoder.decode_field("value")?;
        let (data, decoder) = decoder.decode_field("data")?;
        let (v, decoder) = decoder.decode_field("v")?;
        let (r, decoder) = decoder.decode_field("r")?;
        let (s, decoder) = decoder.decode_field("s")?;
        let remaining = decoder.finish()?;
        let tx = LegacyTransaction {
            nonce,
            gas_price,
            gas,
            to,
            value,
            data,
            v,
            r,
            s,
        };
        Ok((tx, remaining))
    }
}

impl RLPEncode for EIP2930Transaction {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.chain_id)
            .encode_field(&self.nonce)
            .encode_field(&self.gas_price)
            .encode_field(&self.gas_limit)
            .encode_field(&self.to)
            .encode_field(&self.value)
            .encode_field(&self.data)
            .encode_field(&self.access_list)
            .encode_field(&self.signature_y_parity)
            .encode_field(&self.signature_r)
            .encode_field(&self.signature_s)
            .finish();
    }
}

impl RLPDecode for EIP2930Transaction {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (chain_id, decoder) = decoder.decode_field("chain_id")?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (gas_price, decoder) = decoder.decode_field("gas_price")?;
        let (gas_limit, decoder) = decoder.decode_field("gas_limit")?;
        let (to, decoder) = decoder.decode_field("to")?;
        let (value, decoder) = decoder.decode_field("value")?;
        let (data, decoder) = decoder.decode_field("data")?;
        let (access_list, decoder) = decoder.decode_field("access_list")?;
        let (signature_y_parity, decoder) = decoder.decode_field("signature_y_parity")?;
        let (signature_r, decoder) = decoder.decode_field("signature_r")?;
        let (signature_s, decoder) = decoder.decode_field("signature_s")?;
        let remaining = decoder.finish()?;
        let tx = EIP2930Transaction {
            chain_id,
            nonce,
            gas_price,
            gas_limit,
            to,
            value,
            data,
            access_list,
            signature_y_parity,
            signature_r,
            signature_s,
        };
        Ok((tx, remaining))
    }
}

impl RLPEncode for EIP1559Transaction {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.chain_id)
            .encode_field(&self.nonce)
            .encode_field(&self.max_priority_fee_per_gas)
            .encode_field(&self.max_fee_per_gas)
            .encode_field(&self.gas_limit)
            .encode_field(&self.to)
            .encode_field(&self.value)
            .encode_field(&self.data)
            .encode_field(&self.access_list)
            .encode_field(&self.signature_y_parity)
            .encode_field(&self.signature_r)
            .encode_field(&self.signature_s)
            .finish();
    }
}

impl RLPDecode for EIP1559Transaction {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (chain_id, decoder) = decoder.decode_field("chain_id")?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (max_priority_fee_per_gas, decoder) =
            decoder.decode_field("max_priority_fee_per_gas")?;
        let (max_fee_per_gas, decoder) = decoder.decode_field("max_fee_per_gas")?;
        let (gas_limit, decoder) = decoder.decode_field("gas_limit")?;
        let (to, decoder) = decoder.decode_field("to")?;
        let (value, decoder) = decoder.decode_field("value")?;
        let (data, decoder) = decoder.decode_field("data")?;
        let (access_list, decoder) = decoder.decode_field("access_list")?;
        let (signature_y_parity, decoder) = decoder.decode_field("signature_y_parity")?;
        let (signature_r, decoder) = decoder.decode_field("signature_r")?;
        let (signature_s, decoder) = decoder.decode_field("signature_s")?;
        let remaining = decoder.finish()?;
        let tx = EIP1559Transaction {
            chain_id,
            nonce,
            max_priority_fee_per_gas,
            max_fee_per_gas,
            gas_limit,
            to,
            value,
            data,
            access_list,
            signature_y_parity,
            signature_r,
            signature_s,
        };
        Ok((tx, remaining))
    }
}

impl RLPEncode for EIP4844Transaction {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.chain_id)
            .encode_field(&self.nonce)
            .encode_field(&self.max_priority_fee_per_gas)
            .encode_field(&self.max_fee_per_gas)
            .encode_field(&self.gas)
            .encode_field(&self.to)
            .encode_field(&self.value)
            .encode_field(&self.data)
            .encode_field(&self.access_list)
            .encode_field(&self.max_fee_per_blob_gas)
            .encode_field(&self.blob_versioned_hashes)
            .encode_field(&self.signature_y_parity)
            .encode_field(&self.signature_r)
            .encode_field(&self.signature_s)
            .finish();
    }
}

impl RLPDecode for EIP4844Transaction {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (chain_id, decoder) = decoder.decode_field("chain_id")?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (max_priority_fee_per_gas, decoder) =
            decoder.decode_field("max_priority_fee_per_gas")?;
        let (max_fee_per_gas, decoder) = decoder.decode_field("max_fee_per_gas")?;
        let (gas, decoder) = decoder.decode_field("gas")?;
        let (to, decoder) = decoder.decode_field("to")?;
        let (value, decoder) = decoder.decode_field("value")?;
        let (data, decoder) = decoder.decode_field("data")?;
        let (access_list, decoder) = decoder.decode_field("access_list")?;
        let (max_fee_per_blob_gas, decoder) = decoder.decode_field("max_fee_per_blob_gas")?;
        let (blob_versioned_hashes, decoder) = decoder.decode_field("blob_versioned_hashes")?;
        let (signature_y_parity, decoder) = decoder.decode_field("signature_y_parity")?;
        let (signature_r, decoder) = decoder.decode_field("signature_r")?;
        let (signature_s, decoder) = decoder.decode_field("signature_s")?;
        let remaining = decoder.finish()?;
        let tx = EIP4844Transaction {
            chain_id,
            nonce,
            max_priority_fee_per_gas,
            max_fee_per_gas,
            gas,
            to,
            value,
            data,
            access_list,
            max_fee_per_blob_gas,
            blob_versioned_hashes,
            signature_y_parity,
            signature_r,
            signature_s,
        };
        Ok((tx, remaining))
    }
}

impl RLPEncode for Transaction {
    /// Network form: legacy as a plain list, typed wrapped in a byte string.
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            Transaction::LegacyTransaction(tx) => tx.encode(buf),
            _ => self.canonical_bytes().as_slice().encode(buf),
        }
    }
}

impl RLPDecode for Transaction {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (is_list, _, _) = decode_rlp_item(rlp)?;
        if is_list {
            let (tx, rest) = LegacyTransaction::decode_unfinished(rlp)?;
            return Ok((Transaction::LegacyTransaction(tx), rest));
        }
        // typed transaction wrapped in a byte string
        let (payload, rest) = ethwire_rlp::decode::decode_bytes(rlp)?;
        let (tx_type, tx_payload) = payload
            .split_first()
            .ok_or(RLPDecodeError::InvalidLength)?;
        let tx = match *tx_type {
            0x01 => Transaction::EIP2930Transaction(EIP2930Transaction::decode(tx_payload)?),
            0x02 => Transaction::EIP1559Transaction(EIP1559Transaction::decode(tx_payload)?),
            0x03 => Transaction::EIP4844Transaction(EIP4844Transaction::decode(tx_payload)?),
            unknown => {
                return Err(RLPDecodeError::Custom(format!(
                    "Invalid transaction type: {unknown}"
                )));
            }
        };
        Ok((tx, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_round_trip() {
        let tx = Transaction::LegacyTransaction(LegacyTransaction {
            nonce: 7,
            gas_price: 1_000_000_000,
            gas: 21_000,
            to: TxKind::Call(Address::from_low_u64_be(0xcafe)),
            value: U256::from(10),
            data: Bytes::from_static(&[0x01, 0x02]),
            v: U256::from(27),
            r: U256::from(1),
            s: U256::from(2),
        });
        let encoded = tx.encode_to_vec();
        assert_eq!(Transaction::decode(&encoded).unwrap(), tx);
    }

    #[test]
    fn eip1559_round_trip() {
        let tx = Transaction::EIP1559Transaction(EIP1559Transaction {
            chain_id: 1,
            nonce: 3,
            max_priority_fee_per_gas: 2_000_000_000,
            max_fee_per_gas: 30_000_000_000,
            gas_limit: 100_000,
            to: TxKind::Create,
            value: U256::zero(),
            data: Bytes::from_static(b"\x60\x00"),
            access_list: vec![(Address::from_low_u64_be(1), vec![H256::zero()])],
            signature_y_parity: true,
            signature_r: U256::one(),
            signature_s: U256::one(),
        });
        let encoded = tx.encode_to_vec();
        assert_eq!(Transaction::decode(&encoded).unwrap(), tx);
    }

    #[test]
    fn effective_gas_price_respects_base_fee() {
        let tx = Transaction::EIP1559Transaction(EIP1559Transaction {
            max_priority_fee_per_gas: 2,
            max_fee_per_gas: 10,
            ..Default::default()
        });
        assert_eq!(tx.effective_gas_price(Some(5)), Some(7));
        assert_eq!(tx.effective_gas_price(Some(9)), Some(10));
        assert_eq!(tx.effective_gas_price(Some(11)), None);

        let legacy = Transaction::LegacyTransaction(LegacyTransaction {
            gas_price: 42,
            ..Default::default()
        });
        assert_eq!(legacy.effective_gas_price(Some(100)), Some(42));
    }

    #[test]
    fn unsigned_fixture_has_no_sender() {
        let tx = Transaction::LegacyTransaction(LegacyTransaction::default());
        assert!(tx.sender().is_none());
    }
}

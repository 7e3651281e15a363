use bytes::{BufMut, Bytes};
use ethereum_types::{Address, Bloom, H256};
use ethwire_rlp::{
    decode::{RLPDecode, decode_rlp_item},
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};

use super::TxType;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

impl RLPEncode for Log {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.address)
            .encode_field(&self.topics)
            .encode_field(&self.data)
            .finish();
    }
}

impl RLPDecode for Log {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (address, decoder) = decoder.decode_field("address")?;
        let (topics, decoder) = decoder.decode_field("topics")?;
        let (data, decoder) = decoder.decode_field("data")?;
        let remaining = decoder.finish()?;
        let log = Log {
            address,
            topics,
            data,
        };
        Ok((log, remaining))
    }
}

/// Execution receipt in its network form (EIP-2718): legacy receipts are
/// plain lists, typed receipts byte strings of type byte plus payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Receipt {
    pub tx_type: TxType,
    pub succeeded: bool,
    pub cumulative_gas_used: u64,
    pub logs_bloom: Bloom,
    pub logs: Vec<Log>,
}

impl Receipt {
    fn encode_inner(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.succeeded)
            .encode_field(&self.cumulative_gas_used)
            .encode_field(&self.logs_bloom)
            .encode_field(&self.logs)
            .finish();
    }

    fn decode_inner(tx_type: TxType, rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (succeeded, decoder) = decoder.decode_field("succeeded")?;
        let (cumulative_gas_used, decoder) = decoder.decode_field("cumulative_gas_used")?;
        let (logs_bloom, decoder) = decoder.decode_field("logs_bloom")?;
        let (logs, decoder) = decoder.decode_field("logs")?;
        let remaining = decoder.finish()?;
        let receipt = Receipt {
            tx_type,
            succeeded,
            cumulative_gas_used,
            logs_bloom,
            logs,
        };
        Ok((receipt, remaining))
    }
}

impl RLPEncode for Receipt {
    fn encode(&self, buf: &mut dyn BufMut) {
        if self.tx_type == TxType::Legacy {
            self.encode_inner(buf);
        } else {
            let mut payload = vec![self.tx_type as u8];
            self.encode_inner(&mut payload);
            payload.as_slice().encode(buf);
        }
    }
}

impl RLPDecode for Receipt {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (is_list, _, _) = decode_rlp_item(rlp)?;
        if is_list {
            return Self::decode_inner(TxType::Legacy, rlp);
        }
        let (payload, rest) = ethwire_rlp::decode::decode_bytes(rlp)?;
        let (tx_type, receipt_payload) = payload
            .split_first()
            .ok_or(RLPDecodeError::InvalidLength)?;
        let tx_type = match tx_type {
            0x01 => TxType::EIP2930,
            0x02 => TxType::EIP1559,
            0x03 => TxType::EIP4844,
            unknown => {
                return Err(RLPDecodeError::Custom(format!(
                    "Invalid receipt type: {unknown}"
                )));
            }
        };
        let (receipt, remaining) = Self::decode_inner(tx_type, receipt_payload)?;
        if !remaining.is_empty() {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok((receipt, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_receipt_round_trip() {
        let receipt = Receipt {
            tx_type: TxType::Legacy,
            succeeded: true,
            cumulative_gas_used: 21_000,
            logs_bloom: Bloom::zero(),
            logs: vec![Log {
                address: Address::from_low_u64_be(1),
                topics: vec![H256::from_low_u64_be(2)],
                data: Bytes::from_static(&[0xaa]),
            }],
        };
        let encoded = receipt.encode_to_vec();
        assert_eq!(Receipt::decode(&encoded).unwrap(), receipt);
    }

    #[test]
    fn typed_receipt_round_trip() {
        let receipt = Receipt {
            tx_type: TxType::EIP1559,
            succeeded: false,
            cumulative_gas_used: 55_000,
            ..Default::default()
        };
        let encoded = receipt.encode_to_vec();
        assert_eq!(Receipt::decode(&encoded).unwrap(), receipt);
    }
}

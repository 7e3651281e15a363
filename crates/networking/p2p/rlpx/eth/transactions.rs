use bytes::BufMut;
use ethwire_common::{H256, types::Transaction};
use ethwire_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::{RLPDecodeError, RLPEncodeError},
    structs::{Decoder, Encoder},
};

use crate::rlpx::message::RLPxMessage;

/// Soft limit on hashes per `NewPooledTransactionHashes` message, per
/// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#newpooledtransactionhashes-0x08
pub const NEW_POOLED_TRANSACTION_HASHES_SOFT_LIMIT: usize = 4096;

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#transactions-0x02
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transactions {
    pub transactions: Vec<Transaction>,
}

impl Transactions {
    pub fn new(transactions: Vec<Transaction>) -> Self {
        Self { transactions }
    }
}

impl RLPxMessage for Transactions {
    const CODE: u8 = 0x02;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        self.transactions.encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let transactions = Vec::decode(msg_data)?;
        Ok(Self::new(transactions))
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#newpooledtransactionhashes-0x08
// The eth/65 form: a plain list of hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPooledTransactionHashes {
    pub transaction_hashes: Vec<H256>,
}

impl NewPooledTransactionHashes {
    pub fn new(transaction_hashes: Vec<H256>) -> Self {
        Self { transaction_hashes }
    }
}

impl RLPxMessage for NewPooledTransactionHashes {
    const CODE: u8 = 0x08;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        self.transaction_hashes.encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let transaction_hashes = Vec::decode(msg_data)?;
        Ok(Self::new(transaction_hashes))
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#getpooledtransactions-0x09
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPooledTransactions {
    /// Mirrored by the response from eth/66 on; zero below.
    pub id: u64,
    pub transaction_hashes: Vec<H256>,
}

impl GetPooledTransactions {
    pub fn new(id: u64, transaction_hashes: Vec<H256>) -> Self {
        Self {
            id,
            transaction_hashes,
        }
    }
}

impl RLPxMessage for GetPooledTransactions {
    const CODE: u8 = 0x09;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        self.transaction_hashes.encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let transaction_hashes = Vec::decode(msg_data)?;
        Ok(Self::new(0, transaction_hashes))
    }

    fn encode66(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.transaction_hashes)
            .finish();
        Ok(())
    }

    fn decode66(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder): (u64, _) = decoder.decode_field("request-id")?;
        let (transaction_hashes, decoder) = decoder.decode_field("transactionHashes")?;
        decoder.finish()?;
        Ok(Self::new(id, transaction_hashes))
    }
}

// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#pooledtransactions-0x0a
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PooledTransactions {
    pub id: u64,
    pub pooled_transactions: Vec<Transaction>,
}

impl PooledTransactions {
    pub fn new(id: u64, pooled_transactions: Vec<Transaction>) -> Self {
        Self {
            id,
            pooled_transactions,
        }
    }
}

impl RLPxMessage for PooledTransactions {
    const CODE: u8 = 0x0a;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        self.pooled_transactions.encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let pooled_transactions = Vec::decode(msg_data)?;
        Ok(Self::new(0, pooled_transactions))
    }

    fn encode66(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.pooled_transactions)
            .finish();
        Ok(())
    }

    fn decode66(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (id, decoder): (u64, _) = decoder.decode_field("request-id")?;
        let (pooled_transactions, decoder) = decoder.decode_field("pooledTransactions")?;
        decoder.finish()?;
        Ok(Self::new(id, pooled_transactions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethwire_common::types::{EIP1559Transaction, LegacyTransaction};

    fn sample_txs() -> Vec<Transaction> {
        vec![
            Transaction::LegacyTransaction(LegacyTransaction {
                nonce: 1,
                gas_price: 10,
                gas: 21_000,
                ..Default::default()
            }),
            Transaction::EIP1559Transaction(EIP1559Transaction {
                chain_id: 1,
                nonce: 2,
                max_fee_per_gas: 100,
                gas_limit: 21_000,
                ..Default::default()
            }),
        ]
    }

    #[test]
    fn transactions_round_trip() {
        let msg = Transactions::new(sample_txs());
        let mut buf = Vec::new();
        msg.encode(&mut buf).expect("encode");
        assert_eq!(Transactions::decode(&buf).expect("decode"), msg);
    }

    #[test]
    fn new_pooled_transaction_hashes_round_trip() {
        let msg = NewPooledTransactionHashes::new(vec![
            H256::from_low_u64_be(1),
            H256::from_low_u64_be(2),
        ]);
        let mut buf = Vec::new();
        msg.encode(&mut buf).expect("encode");
        assert_eq!(
            NewPooledTransactionHashes::decode(&buf).expect("decode"),
            msg
        );
    }

    #[test]
    fn get_pooled_transactions_eth66_round_trip() {
        let msg = GetPooledTransactions::new(99, vec![H256::from_low_u64_be(5)]);
        let mut buf = Vec::new();
        msg.encode66(&mut buf).expect("encode");
        assert_eq!(GetPooledTransactions::decode66(&buf).expect("decode"), msg);
    }

    #[test]
    fn pooled_transactions_eth66_round_trip() {
        let msg = PooledTransactions::new(99, sample_txs());
        let mut buf = Vec::new();
        msg.encode66(&mut buf).expect("encode");
        assert_eq!(PooledTransactions::decode66(&buf).expect("decode"), msg);
    }
}

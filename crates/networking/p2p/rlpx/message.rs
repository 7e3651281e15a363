use bytes::BufMut;
use ethwire_rlp::error::{RLPDecodeError, RLPEncodeError};
use std::fmt::Display;

use super::eth::ETH_VERSION_WITH_REQUEST_ID;
use super::eth::blocks::{
    BlockBodies, BlockHeaders, GetBlockBodies, GetBlockHeaders, NewBlock, NewBlockHashes,
};
use super::eth::node_data::{GetNodeData, NodeData};
use super::eth::receipts::{GetReceipts, Receipts};
use super::eth::status::StatusMessage;
use super::eth::transactions::{
    GetPooledTransactions, NewPooledTransactionHashes, PooledTransactions, Transactions,
};
use super::p2p::{
    AddCapabilityMessage, DisconnectMessage, HelloMessage, PingMessage, PongMessage,
};
use super::snap::{
    AccountRange, ByteCodes, GetAccountRange, GetByteCodes, GetStorageRanges, GetTrieNodes,
    StorageRanges, TrieNodes,
};

/// One message of one sub-protocol. `CODE` is the message id within the
/// protocol's own id space; the session applies the capability offset.
///
/// `encode`/`decode` are the plain forms; messages that grew a request-id
/// envelope in eth/66 override `encode66`/`decode66`, everything else
/// inherits the plain form.
pub trait RLPxMessage: Sized {
    const CODE: u8;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError>;

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError>;

    fn encode66(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        self.encode(buf)
    }

    fn decode66(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        Self::decode(msg_data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageProtocol {
    P2P,
    Eth,
    Snap,
}

impl MessageProtocol {
    pub const fn code(&self) -> &'static str {
        match self {
            MessageProtocol::P2P => "p2p",
            MessageProtocol::Eth => "eth",
            MessageProtocol::Snap => "snap",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Hello(HelloMessage),
    Disconnect(DisconnectMessage),
    Ping(PingMessage),
    Pong(PongMessage),
    AddCapability(AddCapabilityMessage),
    // eth capability
    // https://github.com/ethereum/devp2p/blob/master/caps/eth.md
    Status(StatusMessage),
    NewBlockHashes(NewBlockHashes),
    Transactions(Transactions),
    GetBlockHeaders(GetBlockHeaders),
    BlockHeaders(BlockHeaders),
    GetBlockBodies(GetBlockBodies),
    BlockBodies(BlockBodies),
    NewBlock(Box<NewBlock>),
    NewPooledTransactionHashes(NewPooledTransactionHashes),
    GetPooledTransactions(GetPooledTransactions),
    PooledTransactions(PooledTransactions),
    GetNodeData(GetNodeData),
    NodeData(NodeData),
    GetReceipts(GetReceipts),
    Receipts(Receipts),
    // snap capability
    // https://github.com/ethereum/devp2p/blob/master/caps/snap.md
    GetAccountRange(GetAccountRange),
    AccountRange(AccountRange),
    GetStorageRanges(GetStorageRanges),
    StorageRanges(StorageRanges),
    GetByteCodes(GetByteCodes),
    ByteCodes(ByteCodes),
    GetTrieNodes(GetTrieNodes),
    TrieNodes(TrieNodes),
}

impl Message {
    pub fn protocol(&self) -> MessageProtocol {
        match self {
            Message::Hello(_)
            | Message::Disconnect(_)
            | Message::Ping(_)
            | Message::Pong(_)
            | Message::AddCapability(_) => MessageProtocol::P2P,

            Message::Status(_)
            | Message::NewBlockHashes(_)
            | Message::Transactions(_)
            | Message::GetBlockHeaders(_)
            | Message::BlockHeaders(_)
            | Message::GetBlockBodies(_)
            | Message::BlockBodies(_)
            | Message::NewBlock(_)
            | Message::NewPooledTransactionHashes(_)
            | Message::GetPooledTransactions(_)
            | Message::PooledTransactions(_)
            | Message::GetNodeData(_)
            | Message::NodeData(_)
            | Message::GetReceipts(_)
            | Message::Receipts(_) => MessageProtocol::Eth,

            Message::GetAccountRange(_)
            | Message::AccountRange(_)
            | Message::GetStorageRanges(_)
            | Message::StorageRanges(_)
            | Message::GetByteCodes(_)
            | Message::ByteCodes(_)
            | Message::GetTrieNodes(_)
            | Message::TrieNodes(_) => MessageProtocol::Snap,
        }
    }

    /// Message id within the owning protocol's id space.
    pub fn code(&self) -> u8 {
        match self {
            Message::Hello(_) => HelloMessage::CODE,
            Message::Disconnect(_) => DisconnectMessage::CODE,
            Message::Ping(_) => PingMessage::CODE,
            Message::Pong(_) => PongMessage::CODE,
            Message::AddCapability(_) => AddCapabilityMessage::CODE,

            Message::Status(_) => StatusMessage::CODE,
            Message::NewBlockHashes(_) => NewBlockHashes::CODE,
            Message::Transactions(_) => Transactions::CODE,
            Message::GetBlockHeaders(_) => GetBlockHeaders::CODE,
            Message::BlockHeaders(_) => BlockHeaders::CODE,
            Message::GetBlockBodies(_) => GetBlockBodies::CODE,
            Message::BlockBodies(_) => BlockBodies::CODE,
            Message::NewBlock(_) => NewBlock::CODE,
            Message::NewPooledTransactionHashes(_) => NewPooledTransactionHashes::CODE,
            Message::GetPooledTransactions(_) => GetPooledTransactions::CODE,
            Message::PooledTransactions(_) => PooledTransactions::CODE,
            Message::GetNodeData(_) => GetNodeData::CODE,
            Message::NodeData(_) => NodeData::CODE,
            Message::GetReceipts(_) => GetReceipts::CODE,
            Message::Receipts(_) => Receipts::CODE,

            Message::GetAccountRange(_) => GetAccountRange::CODE,
            Message::AccountRange(_) => AccountRange::CODE,
            Message::GetStorageRanges(_) => GetStorageRanges::CODE,
            Message::StorageRanges(_) => StorageRanges::CODE,
            Message::GetByteCodes(_) => GetByteCodes::CODE,
            Message::ByteCodes(_) => ByteCodes::CODE,
            Message::GetTrieNodes(_) => GetTrieNodes::CODE,
            Message::TrieNodes(_) => TrieNodes::CODE,
        }
    }

    /// Encodes the message payload, without the absolute message id.
    /// `protocol_version` is the negotiated version of the owning protocol
    /// and selects the request-id envelope for eth/66+.
    pub fn encode_payload(
        &self,
        buf: &mut dyn BufMut,
        protocol_version: u8,
    ) -> Result<(), RLPEncodeError> {
        let with_request_id = self.protocol() == MessageProtocol::Eth
            && protocol_version >= ETH_VERSION_WITH_REQUEST_ID;
        match self {
            Message::Hello(msg) => msg.encode(buf),
            Message::Disconnect(msg) => msg.encode(buf),
            Message::Ping(msg) => msg.encode(buf),
            Message::Pong(msg) => msg.encode(buf),
            Message::AddCapability(msg) => msg.encode(buf),

            Message::Status(msg) => msg.encode(buf),
            Message::NewBlockHashes(msg) => msg.encode(buf),
            Message::Transactions(msg) => msg.encode(buf),
            Message::NewBlock(msg) => msg.encode(buf),
            Message::NewPooledTransactionHashes(msg) => msg.encode(buf),

            Message::GetBlockHeaders(msg) if with_request_id => msg.encode66(buf),
            Message::GetBlockHeaders(msg) => msg.encode(buf),
            Message::BlockHeaders(msg) if with_request_id => msg.encode66(buf),
            Message::BlockHeaders(msg) => msg.encode(buf),
            Message::GetBlockBodies(msg) if with_request_id => msg.encode66(buf),
            Message::GetBlockBodies(msg) => msg.encode(buf),
            Message::BlockBodies(msg) if with_request_id => msg.encode66(buf),
            Message::BlockBodies(msg) => msg.encode(buf),
            Message::GetPooledTransactions(msg) if with_request_id => msg.encode66(buf),
            Message::GetPooledTransactions(msg) => msg.encode(buf),
            Message::PooledTransactions(msg) if with_request_id => msg.encode66(buf),
            Message::PooledTransactions(msg) => msg.encode(buf),
            Message::GetNodeData(msg) if with_request_id => msg.encode66(buf),
            Message::GetNodeData(msg) => msg.encode(buf),
            Message::NodeData(msg) if with_request_id => msg.encode66(buf),
            Message::NodeData(msg) => msg.encode(buf),
            Message::GetReceipts(msg) if with_request_id => msg.encode66(buf),
            Message::GetReceipts(msg) => msg.encode(buf),
            Message::Receipts(msg) if with_request_id => msg.encode66(buf),
            Message::Receipts(msg) => msg.encode(buf),

            Message::GetAccountRange(msg) => msg.encode(buf),
            Message::AccountRange(msg) => msg.encode(buf),
            Message::GetStorageRanges(msg) => msg.encode(buf),
            Message::StorageRanges(msg) => msg.encode(buf),
            Message::GetByteCodes(msg) => msg.encode(buf),
            Message::ByteCodes(msg) => msg.encode(buf),
            Message::GetTrieNodes(msg) => msg.encode(buf),
            Message::TrieNodes(msg) => msg.encode(buf),
        }
    }

    /// Decodes a message payload given its protocol, the negotiated version
    /// of that protocol, and the message id within the protocol's space.
    pub fn decode(
        protocol: MessageProtocol,
        protocol_version: u8,
        code: u8,
        data: &[u8],
    ) -> Result<Message, RLPDecodeError> {
        match protocol {
            MessageProtocol::P2P => match code {
                HelloMessage::CODE => Ok(Message::Hello(HelloMessage::decode(data)?)),
                DisconnectMessage::CODE => {
                    Ok(Message::Disconnect(DisconnectMessage::decode(data)?))
                }
                PingMessage::CODE => Ok(Message::Ping(PingMessage::decode(data)?)),
                PongMessage::CODE => Ok(Message::Pong(PongMessage::decode(data)?)),
                AddCapabilityMessage::CODE => {
                    Ok(Message::AddCapability(AddCapabilityMessage::decode(data)?))
                }
                _ => Err(RLPDecodeError::MalformedData),
            },
            MessageProtocol::Eth => {
                Self::decode_eth(protocol_version, code, data)
            }
            MessageProtocol::Snap => match code {
                GetAccountRange::CODE => {
                    Ok(Message::GetAccountRange(GetAccountRange::decode(data)?))
                }
                AccountRange::CODE => Ok(Message::AccountRange(AccountRange::decode(data)?)),
                GetStorageRanges::CODE => {
                    Ok(Message::GetStorageRanges(GetStorageRanges::decode(data)?))
                }
                StorageRanges::CODE => Ok(Message::StorageRanges(StorageRanges::decode(data)?)),
                GetByteCodes::CODE => Ok(Message::GetByteCodes(GetByteCodes::decode(data)?)),
                ByteCodes::CODE => Ok(Message::ByteCodes(ByteCodes::decode(data)?)),
                GetTrieNodes::CODE => Ok(Message::GetTrieNodes(GetTrieNodes::decode(data)?)),
                TrieNodes::CODE => Ok(Message::TrieNodes(TrieNodes::decode(data)?)),
                _ => Err(RLPDecodeError::MalformedData),
            },
        }
    }

    fn decode_eth(version: u8, code: u8, data: &[u8]) -> Result<Message, RLPDecodeError> {
        let with_request_id = version >= ETH_VERSION_WITH_REQUEST_ID;
        macro_rules! versioned {
            ($t:ident) => {
                if with_request_id {
                    $t::decode66(data)?
                } else {
                    $t::decode(data)?
                }
            };
        }
        match code {
            StatusMessage::CODE => Ok(Message::Status(StatusMessage::decode(data)?)),
            NewBlockHashes::CODE => Ok(Message::NewBlockHashes(NewBlockHashes::decode(data)?)),
            Transactions::CODE => Ok(Message::Transactions(Transactions::decode(data)?)),
            GetBlockHeaders::CODE => Ok(Message::GetBlockHeaders(versioned!(GetBlockHeaders))),
            BlockHeaders::CODE => Ok(Message::BlockHeaders(versioned!(BlockHeaders))),
            GetBlockBodies::CODE => Ok(Message::GetBlockBodies(versioned!(GetBlockBodies))),
            BlockBodies::CODE => Ok(Message::BlockBodies(versioned!(BlockBodies))),
            NewBlock::CODE => Ok(Message::NewBlock(Box::new(NewBlock::decode(data)?))),
            NewPooledTransactionHashes::CODE if version >= 65 => Ok(
                Message::NewPooledTransactionHashes(NewPooledTransactionHashes::decode(data)?),
            ),
            GetPooledTransactions::CODE if version >= 65 => Ok(Message::GetPooledTransactions(
                versioned!(GetPooledTransactions),
            )),
            PooledTransactions::CODE if version >= 65 => {
                Ok(Message::PooledTransactions(versioned!(PooledTransactions)))
            }
            GetNodeData::CODE if version >= 63 => {
                Ok(Message::GetNodeData(versioned!(GetNodeData)))
            }
            NodeData::CODE if version >= 63 => Ok(Message::NodeData(versioned!(NodeData))),
            GetReceipts::CODE if version >= 63 => {
                Ok(Message::GetReceipts(versioned!(GetReceipts)))
            }
            Receipts::CODE if version >= 63 => Ok(Message::Receipts(versioned!(Receipts))),
            _ => Err(RLPDecodeError::MalformedData),
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Hello(_) => "p2p:Hello".fmt(f),
            Message::Disconnect(_) => "p2p:Disconnect".fmt(f),
            Message::Ping(_) => "p2p:Ping".fmt(f),
            Message::Pong(_) => "p2p:Pong".fmt(f),
            Message::AddCapability(_) => "p2p:AddCapability".fmt(f),
            Message::Status(_) => "eth:Status".fmt(f),
            Message::NewBlockHashes(_) => "eth:NewBlockHashes".fmt(f),
            Message::Transactions(_) => "eth:Transactions".fmt(f),
            Message::GetBlockHeaders(_) => "eth:GetBlockHeaders".fmt(f),
            Message::BlockHeaders(_) => "eth:BlockHeaders".fmt(f),
            Message::GetBlockBodies(_) => "eth:GetBlockBodies".fmt(f),
            Message::BlockBodies(_) => "eth:BlockBodies".fmt(f),
            Message::NewBlock(_) => "eth:NewBlock".fmt(f),
            Message::NewPooledTransactionHashes(_) => "eth:NewPooledTransactionHashes".fmt(f),
            Message::GetPooledTransactions(_) => "eth:GetPooledTransactions".fmt(f),
            Message::PooledTransactions(_) => "eth:PooledTransactions".fmt(f),
            Message::GetNodeData(_) => "eth:GetNodeData".fmt(f),
            Message::NodeData(_) => "eth:NodeData".fmt(f),
            Message::GetReceipts(_) => "eth:GetReceipts".fmt(f),
            Message::Receipts(_) => "eth:Receipts".fmt(f),
            Message::GetAccountRange(_) => "snap:GetAccountRange".fmt(f),
            Message::AccountRange(_) => "snap:AccountRange".fmt(f),
            Message::GetStorageRanges(_) => "snap:GetStorageRanges".fmt(f),
            Message::StorageRanges(_) => "snap:StorageRanges".fmt(f),
            Message::GetByteCodes(_) => "snap:GetByteCodes".fmt(f),
            Message::ByteCodes(_) => "snap:ByteCodes".fmt(f),
            Message::GetTrieNodes(_) => "snap:GetTrieNodes".fmt(f),
            Message::TrieNodes(_) => "snap:TrieNodes".fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlpx::eth::blocks::HashOrNumber;

    #[test]
    fn eth66_payload_round_trip_keeps_request_id() {
        let msg = Message::GetBlockHeaders(GetBlockHeaders::new(
            42,
            HashOrNumber::Number(100),
            5,
            0,
            false,
        ));
        let mut buf = Vec::new();
        msg.encode_payload(&mut buf, 66).expect("encode");
        let decoded =
            Message::decode(MessageProtocol::Eth, 66, GetBlockHeaders::CODE, &buf).expect("decode");
        match decoded {
            Message::GetBlockHeaders(decoded) => assert_eq!(decoded.id, 42),
            other => panic!("decoded wrong variant: {other}"),
        }
    }

    #[test]
    fn eth65_payload_drops_request_id() {
        let msg = Message::GetBlockHeaders(GetBlockHeaders::new(
            42,
            HashOrNumber::Number(100),
            5,
            0,
            false,
        ));
        let mut buf = Vec::new();
        msg.encode_payload(&mut buf, 65).expect("encode");
        let decoded =
            Message::decode(MessageProtocol::Eth, 65, GetBlockHeaders::CODE, &buf).expect("decode");
        match decoded {
            Message::GetBlockHeaders(decoded) => assert_eq!(decoded.id, 0),
            other => panic!("decoded wrong variant: {other}"),
        }
    }

    #[test]
    fn pooled_tx_messages_rejected_below_eth65() {
        let msg = NewPooledTransactionHashes::new(vec![]);
        let mut buf = Vec::new();
        msg.encode(&mut buf).expect("encode");
        assert!(
            Message::decode(
                MessageProtocol::Eth,
                64,
                NewPooledTransactionHashes::CODE,
                &buf
            )
            .is_err()
        );
    }

    #[test]
    fn snap_message_round_trip() {
        let msg = Message::GetAccountRange(GetAccountRange {
            id: 9,
            root_hash: Default::default(),
            starting_hash: Default::default(),
            limit_hash: Default::default(),
            response_bytes: 50_000,
        });
        let mut buf = Vec::new();
        msg.encode_payload(&mut buf, 1).expect("encode");
        let decoded =
            Message::decode(MessageProtocol::Snap, 1, GetAccountRange::CODE, &buf).expect("decode");
        match decoded {
            Message::GetAccountRange(decoded) => assert_eq!(decoded.response_bytes, 50_000),
            other => panic!("decoded wrong variant: {other}"),
        }
    }
}

use bytes::BufMut;
use ethwire_common::H512;
use ethwire_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use serde::Serialize;

use super::message::RLPxMessage;

/// p2p version after which frame payloads are snappy-compressed.
pub const SNAPPY_P2P_VERSION: u8 = 5;
/// p2p version we advertise.
pub const SUPPORTED_P2P_VERSION: u8 = 5;
/// The base capability always occupies message ids `0..16`.
pub const P2P_MESSAGE_SPACE: u8 = 16;

/// A named, versioned sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capability {
    pub protocol: String,
    pub version: u8,
}

impl Capability {
    pub fn new(protocol: impl Into<String>, version: u8) -> Self {
        Capability {
            protocol: protocol.into(),
            version,
        }
    }

    pub fn eth(version: u8) -> Self {
        Capability::new("eth", version)
    }

    pub fn p2p(version: u8) -> Self {
        Capability::new("p2p", version)
    }

    pub fn snap(version: u8) -> Self {
        Capability::new("snap", version)
    }

    /// Size of the message-id space the capability occupies.
    pub fn message_space(&self) -> u8 {
        match (self.protocol.as_str(), self.version) {
            ("p2p", _) => P2P_MESSAGE_SPACE,
            // eth/62 predates receipts and node data
            ("eth", ..=62) => 8,
            ("eth", _) => 17,
            ("snap", _) => 8,
            _ => 0,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.protocol, self.version)
    }
}

impl RLPEncode for Capability {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.protocol)
            .encode_field(&self.version)
            .finish();
    }
}

impl RLPDecode for Capability {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (protocol, decoder): (String, _) = decoder.decode_field("protocol")?;
        let (version, decoder) = decoder.decode_field("version")?;
        let remaining = decoder.finish()?;
        Ok((Capability { protocol, version }, remaining))
    }
}

impl Serialize for Capability {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("{}/{}", self.protocol, self.version))
    }
}

// https://github.com/ethereum/devp2p/blob/master/rlpx.md#hello-0x00
#[derive(Debug, Clone)]
pub struct HelloMessage {
    pub protocol_version: u8,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    pub listen_port: u16,
    pub node_id: H512,
}

impl HelloMessage {
    pub fn new(
        client_id: String,
        mut capabilities: Vec<Capability>,
        listen_port: u16,
        node_id: H512,
    ) -> Self {
        // capability lists go out sorted by protocol code
        capabilities.sort_by(|a, b| {
            a.protocol
                .cmp(&b.protocol)
                .then(a.version.cmp(&b.version))
        });
        Self {
            protocol_version: SUPPORTED_P2P_VERSION,
            client_id,
            capabilities,
            listen_port,
            node_id,
        }
    }
}

impl RLPxMessage for HelloMessage {
    const CODE: u8 = 0x00;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), ethwire_rlp::error::RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.protocol_version)
            .encode_field(&self.client_id)
            .encode_field(&self.capabilities)
            .encode_field(&self.listen_port)
            .encode_field(&self.node_id)
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        // [protocolVersion: P, clientId: B, capabilities, listenPort: P, nodeId: B_64, ...]
        let decoder = Decoder::new(msg_data)?;
        let (protocol_version, decoder): (u8, _) = decoder.decode_field("protocolVersion")?;
        let (client_id, decoder): (String, _) = decoder.decode_field("clientId")?;
        // [[cap1, capVersion1], [cap2, capVersion2], ...]
        let (capabilities, decoder): (Vec<Capability>, _) = decoder.decode_field("capabilities")?;
        let (listen_port, decoder): (u16, _) = decoder.decode_field("listenPort")?;
        let (node_id, decoder): (H512, _) = decoder.decode_field("nodeId")?;
        // implementations must ignore any additional list elements
        let _padding = decoder.finish_unchecked();

        Ok(Self {
            protocol_version,
            client_id,
            capabilities,
            listen_port,
            node_id,
        })
    }
}

// https://github.com/ethereum/devp2p/blob/master/rlpx.md#disconnect-0x01
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    DisconnectRequested = 0x00,
    NetworkError = 0x01,
    ProtocolError = 0x02,
    UselessPeer = 0x03,
    TooManyPeers = 0x04,
    AlreadyConnected = 0x05,
    IncompatibleVersion = 0x06,
    InvalidIdentity = 0x07,
    ClientQuitting = 0x08,
    UnexpectedIdentity = 0x09,
    SelfIdentity = 0x0a,
    PingTimeout = 0x0b,
    Other = 0x10,
    InvalidReason = 0xff,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::DisconnectRequested => write!(f, "Disconnect Requested"),
            DisconnectReason::NetworkError => write!(f, "TCP Subsystem Error"),
            DisconnectReason::ProtocolError => write!(f, "Breach of Protocol"),
            DisconnectReason::UselessPeer => write!(f, "Useless Peer"),
            DisconnectReason::TooManyPeers => write!(f, "Too Many Peers"),
            DisconnectReason::AlreadyConnected => write!(f, "Already Connected"),
            DisconnectReason::IncompatibleVersion => {
                write!(f, "Incompatible P2P Protocol Version")
            }
            DisconnectReason::InvalidIdentity => write!(f, "Null Node Identity Received"),
            DisconnectReason::ClientQuitting => write!(f, "Client Quitting"),
            DisconnectReason::UnexpectedIdentity => write!(f, "Unexpected Identity in Handshake"),
            DisconnectReason::SelfIdentity => write!(f, "Identity is the Same as This Node"),
            DisconnectReason::PingTimeout => write!(f, "Ping Timeout"),
            DisconnectReason::Other => write!(f, "Some Other Reason Specific to a Subprotocol"),
            DisconnectReason::InvalidReason => write!(f, "Invalid Disconnect Reason"),
        }
    }
}

impl From<u8> for DisconnectReason {
    fn from(value: u8) -> Self {
        match value {
            0x00 => DisconnectReason::DisconnectRequested,
            0x01 => DisconnectReason::NetworkError,
            0x02 => DisconnectReason::ProtocolError,
            0x03 => DisconnectReason::UselessPeer,
            0x04 => DisconnectReason::TooManyPeers,
            0x05 => DisconnectReason::AlreadyConnected,
            0x06 => DisconnectReason::IncompatibleVersion,
            0x07 => DisconnectReason::InvalidIdentity,
            0x08 => DisconnectReason::ClientQuitting,
            0x09 => DisconnectReason::UnexpectedIdentity,
            0x0a => DisconnectReason::SelfIdentity,
            0x0b => DisconnectReason::PingTimeout,
            0x10 => DisconnectReason::Other,
            _ => DisconnectReason::InvalidReason,
        }
    }
}

impl From<DisconnectReason> for u8 {
    fn from(val: DisconnectReason) -> Self {
        val as u8
    }
}

#[derive(Debug, Clone)]
pub struct DisconnectMessage {
    pub reason: Option<DisconnectReason>,
}

impl DisconnectMessage {
    pub fn new(reason: Option<DisconnectReason>) -> Self {
        Self { reason }
    }

    pub fn reason(&self) -> DisconnectReason {
        self.reason.unwrap_or(DisconnectReason::InvalidReason)
    }
}

impl RLPxMessage for DisconnectMessage {
    const CODE: u8 = 0x01;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), ethwire_rlp::error::RLPEncodeError> {
        match self.reason.map(Into::<u8>::into) {
            Some(value) => Encoder::new(buf).encode_field(&value).finish(),
            None => Vec::<u8>::new().encode(buf),
        }
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        // the reason shows up encoded in a few different ways in the wild
        let reason = match msg_data.len() {
            0 => None,
            // as a single u8
            1 => Some(msg_data[0]),
            // as an RLP encoded list with one element
            _ => {
                let decoder = Decoder::new(msg_data)?;
                let (reason, _): (Option<u8>, _) = decoder.decode_optional_field();
                reason
            }
        };
        Ok(Self::new(reason.map(|r| r.into())))
    }
}

#[derive(Debug, Clone)]
pub struct PingMessage {}

impl RLPxMessage for PingMessage {
    const CODE: u8 = 0x02;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), ethwire_rlp::error::RLPEncodeError> {
        Vec::<u8>::new().encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        // data is an empty list; extra elements must be ignored
        let _ = Decoder::new(msg_data)?;
        Ok(Self {})
    }
}

#[derive(Debug, Clone)]
pub struct PongMessage {}

impl RLPxMessage for PongMessage {
    const CODE: u8 = 0x03;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), ethwire_rlp::error::RLPEncodeError> {
        Vec::<u8>::new().encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let _ = Decoder::new(msg_data)?;
        Ok(Self {})
    }
}

/// Runtime capability announcement: tells the remote we just started
/// serving an additional sub-protocol, so both ends can extend their
/// message-id tables without a reconnect.
#[derive(Debug, Clone)]
pub struct AddCapabilityMessage {
    pub capability: Capability,
}

impl RLPxMessage for AddCapabilityMessage {
    const CODE: u8 = 0x04;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), ethwire_rlp::error::RLPEncodeError> {
        Encoder::new(buf).encode_field(&self.capability).finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(msg_data)?;
        let (capability, decoder) = decoder.decode_field("capability")?;
        decoder.finish()?;
        Ok(Self { capability })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlpx::message::RLPxMessage;

    #[test]
    fn hello_round_trip_sorts_capabilities() {
        let hello = HelloMessage::new(
            "ethwire/v0.1.0".to_string(),
            vec![Capability::snap(1), Capability::eth(66), Capability::eth(65)],
            30303,
            H512::from_low_u64_be(3),
        );
        assert_eq!(
            hello
                .capabilities
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            vec!["eth/65", "eth/66", "snap/1"]
        );

        let mut buf = Vec::new();
        hello.encode(&mut buf).expect("encode");
        let decoded = HelloMessage::decode(&buf).expect("decode");
        assert_eq!(decoded.protocol_version, SUPPORTED_P2P_VERSION);
        assert_eq!(decoded.client_id, "ethwire/v0.1.0");
        assert_eq!(decoded.listen_port, 30303);
        assert_eq!(decoded.capabilities, hello.capabilities);
    }

    #[test]
    fn disconnect_reason_round_trip() {
        let msg = DisconnectMessage::new(Some(DisconnectReason::TooManyPeers));
        let mut buf = Vec::new();
        msg.encode(&mut buf).expect("encode");
        let decoded = DisconnectMessage::decode(&buf).expect("decode");
        assert_eq!(decoded.reason(), DisconnectReason::TooManyPeers);
    }

    #[test]
    fn disconnect_decodes_bare_byte() {
        let decoded = DisconnectMessage::decode(&[0x03]).expect("decode");
        assert_eq!(decoded.reason(), DisconnectReason::UselessPeer);
    }

    #[test]
    fn unknown_reason_maps_to_invalid() {
        assert_eq!(DisconnectReason::from(0x42), DisconnectReason::InvalidReason);
    }

    #[test]
    fn message_spaces() {
        assert_eq!(Capability::p2p(5).message_space(), 16);
        assert_eq!(Capability::eth(62).message_space(), 8);
        assert_eq!(Capability::eth(66).message_space(), 17);
        assert_eq!(Capability::snap(1).message_space(), 8);
    }
}

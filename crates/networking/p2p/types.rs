use ethwire_common::{H256, H512, keccak_hash};
use ethwire_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use serde::{Deserialize, Serialize, ser::Serializer};
use std::{
    fmt::Display,
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::OnceLock,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

/// A peer on the network: 64-byte secp256k1 public key plus its endpoint.
/// Two nodes are the same peer iff their public keys match, whatever
/// endpoint they currently dial from.
#[derive(Debug, Clone)]
pub struct Node {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub public_key: H512,
    /// Client id advertised in the p2p Hello.
    pub version: Option<String>,
    node_id: OnceLock<H256>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for Node {}

impl Node {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16, public_key: H512) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
            public_key,
            version: None,
            node_id: OnceLock::new(),
        }
    }

    /// Keccak hash of the public key, the discovery-table identity.
    pub fn node_id(&self) -> H256 {
        *self
            .node_id
            .get_or_init(|| keccak_hash(self.public_key.as_bytes()))
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn enode_url(&self) -> String {
        let node_id = hex::encode(self.public_key.as_bytes());
        if self.udp_port == self.tcp_port {
            format!("enode://{node_id}@{}:{}", self.ip, self.tcp_port)
        } else {
            format!(
                "enode://{node_id}@{}:{}?discport={}",
                self.ip, self.tcp_port, self.udp_port
            )
        }
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:#x}@{}:{}",
            H256::from_slice(&self.public_key.as_bytes()[..32]),
            self.ip,
            self.tcp_port
        )
    }
}

impl FromStr for Node {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("enode://")
            .ok_or_else(|| NodeError::InvalidFormat("missing enode:// scheme".to_string()))?;
        let (node_id, endpoint) = rest
            .split_once('@')
            .ok_or_else(|| NodeError::InvalidFormat("missing @host part".to_string()))?;

        let public_key = H512::from_str(node_id)
            .map_err(|_| NodeError::ParseError("invalid node id".to_string()))?;

        let (endpoint, discport) = match endpoint.split_once("?discport=") {
            Some((endpoint, discport)) => (endpoint, Some(discport)),
            None => (endpoint, None),
        };
        let addr: SocketAddr = endpoint
            .parse()
            .map_err(|_| NodeError::ParseError("invalid endpoint".to_string()))?;
        let udp_port = match discport {
            Some(port) => port
                .parse()
                .map_err(|_| NodeError::ParseError("invalid discport".to_string()))?,
            None => addr.port(),
        };

        Ok(Node::new(addr.ip(), udp_port, addr.port(), public_key))
    }
}

impl Serialize for Node {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.enode_url())
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Node::from_str(&<String>::deserialize(deserializer)?)
            .map_err(|e| serde::de::Error::custom(format!("{e}")))
    }
}

impl RLPEncode for Node {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.ip)
            .encode_field(&self.udp_port)
            .encode_field(&self.tcp_port)
            .encode_field(&self.public_key)
            .finish();
    }
}

impl RLPDecode for Node {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (ip, decoder) = decoder.decode_field("ip")?;
        let (udp_port, decoder) = decoder.decode_field("udp_port")?;
        let (tcp_port, decoder) = decoder.decode_field("tcp_port")?;
        let (public_key, decoder) = decoder.decode_field("public_key")?;
        let remaining = decoder.finish_unchecked();
        Ok((Node::new(ip, udp_port, tcp_port, public_key), remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enode_url_round_trip() {
        let url = format!("enode://{}@10.3.58.6:30303?discport=30301", "a".repeat(128));
        let node = Node::from_str(&url).expect("valid enode url");
        assert_eq!(node.tcp_port, 30303);
        assert_eq!(node.udp_port, 30301);
        assert_eq!(node.enode_url(), url);
    }

    #[test]
    fn same_key_different_endpoint_is_same_peer() {
        let key = H512::from_low_u64_be(7);
        let a = Node::new("10.0.0.1".parse().expect("ip"), 1, 2, key);
        let b = Node::new("10.0.0.2".parse().expect("ip"), 3, 4, key);
        assert_eq!(a, b);
        assert_eq!(a.node_id(), b.node_id());
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(Node::from_str("enode://nope").is_err());
        assert!(Node::from_str("http://foo@1.2.3.4:30303").is_err());
    }
}

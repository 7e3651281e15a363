use bytes::{BufMut, Bytes};
use ethereum_types::{Bloom, H32, H64, H128, H160, H256, H264, H512, U256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::constants::RLP_NULL;

/// Trait for encoding a value into RLP.
/// See <https://ethereum.org/en/developers/docs/data-structures-and-encoding/rlp/>.
/// Implementors only need to provide [`encode`](RLPEncode::encode).
pub trait RLPEncode {
    fn encode(&self, buf: &mut dyn BufMut);

    fn length(&self) -> usize {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf.len()
    }

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Writes the length prefix of a list payload, to be followed by the payload
/// itself.
pub fn encode_length(payload_len: usize, buf: &mut dyn BufMut) {
    if payload_len < 56 {
        buf.put_u8(0xc0 + payload_len as u8);
    } else {
        let be = payload_len.to_be_bytes();
        let skip = be.iter().take_while(|b| **b == 0).count();
        buf.put_u8(0xf7 + (be.len() - skip) as u8);
        buf.put_slice(&be[skip..]);
    }
}

/// Writes a byte-string item (prefix plus payload).
fn encode_bytes(payload: &[u8], buf: &mut dyn BufMut) {
    match payload {
        [single] if *single < RLP_NULL => buf.put_u8(*single),
        _ if payload.len() < 56 => {
            buf.put_u8(RLP_NULL + payload.len() as u8);
            buf.put_slice(payload);
        }
        _ => {
            let be = payload.len().to_be_bytes();
            let skip = be.iter().take_while(|b| **b == 0).count();
            buf.put_u8(0xb7 + (be.len() - skip) as u8);
            buf.put_slice(&be[skip..]);
            buf.put_slice(payload);
        }
    }
}

/// Unsigned integers encode as their minimal big-endian representation; zero
/// is the empty string.
fn encode_unsigned<const N: usize>(value_be: [u8; N], buf: &mut dyn BufMut) {
    let skip = value_be.iter().take_while(|b| **b == 0).count();
    encode_bytes(&value_be[skip..], buf);
}

impl RLPEncode for bool {
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u8(if *self { 0x01 } else { RLP_NULL });
    }

    fn length(&self) -> usize {
        1
    }
}

macro_rules! impl_encode_uint {
    ($($t:ty),*) => {
        $(impl RLPEncode for $t {
            fn encode(&self, buf: &mut dyn BufMut) {
                encode_unsigned(self.to_be_bytes(), buf);
            }
        })*
    };
}

impl_encode_uint!(u8, u16, u32, u64, usize, u128);

impl RLPEncode for [u8] {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf);
    }
}

impl<const N: usize> RLPEncode for [u8; N] {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf);
    }
}

impl RLPEncode for Bytes {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf);
    }
}

impl RLPEncode for str {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for String {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for U256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned(self.to_big_endian(), buf);
    }
}

macro_rules! impl_encode_hash {
    ($($t:ty),*) => {
        $(impl RLPEncode for $t {
            fn encode(&self, buf: &mut dyn BufMut) {
                encode_bytes(self.as_bytes(), buf);
            }
        })*
    };
}

impl_encode_hash!(H32, H64, H128, H160, H256, H264, H512, Bloom);

impl RLPEncode for Ipv4Addr {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(&self.octets(), buf);
    }
}

impl RLPEncode for Ipv6Addr {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(&self.octets(), buf);
    }
}

impl RLPEncode for IpAddr {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            IpAddr::V4(ip) => ip.encode(buf),
            IpAddr::V6(ip) => ip.encode(buf),
        }
    }
}

impl<T: RLPEncode> RLPEncode for &T {
    fn encode(&self, buf: &mut dyn BufMut) {
        (*self).encode(buf)
    }
}

// A Vec<T> is a list of homogeneous items; byte strings go through
// Bytes/[u8; N] instead.
impl<T: RLPEncode> RLPEncode for Vec<T> {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut payload = Vec::new();
        for item in self {
            item.encode(&mut payload);
        }
        encode_length(payload.len(), buf);
        buf.put_slice(&payload);
    }
}

macro_rules! impl_encode_tuple {
    ($(($($name:ident : $t:ident),+)),*) => {
        $(impl<$($t: RLPEncode),+> RLPEncode for ($($t,)+) {
            fn encode(&self, buf: &mut dyn BufMut) {
                let ($($name,)+) = self;
                let mut payload = Vec::new();
                $($name.encode(&mut payload);)+
                encode_length(payload.len(), buf);
                buf.put_slice(&payload);
            }
        })*
    };
}

impl_encode_tuple!(
    (a: T1, b: T2),
    (a: T1, b: T2, c: T3),
    (a: T1, b: T2, c: T3, d: T4)
);

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn encode_unsigned_values() {
        assert_eq!(0u64.encode_to_vec(), vec![0x80]);
        assert_eq!(1u64.encode_to_vec(), vec![0x01]);
        assert_eq!(0x7fu64.encode_to_vec(), vec![0x7f]);
        assert_eq!(0x80u64.encode_to_vec(), vec![0x81, 0x80]);
        assert_eq!(1024u64.encode_to_vec(), vec![0x82, 0x04, 0x00]);
        assert_eq!(
            u64::MAX.encode_to_vec(),
            hex!("88ffffffffffffffff").to_vec()
        );
    }

    #[test]
    fn encode_strings() {
        assert_eq!("dog".encode_to_vec(), vec![0x83, b'd', b'o', b'g']);
        assert_eq!("".encode_to_vec(), vec![0x80]);
        let long = "Lorem ipsum dolor sit amet, consectetur adipisicing elit";
        let mut expected = vec![0xb8, 0x38];
        expected.extend_from_slice(long.as_bytes());
        assert_eq!(long.encode_to_vec(), expected);
    }

    #[test]
    fn encode_lists() {
        let list: Vec<String> = vec!["cat".into(), "dog".into()];
        assert_eq!(
            list.encode_to_vec(),
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );
        let empty: Vec<String> = vec![];
        assert_eq!(empty.encode_to_vec(), vec![0xc0]);
    }

    #[test]
    fn encode_hashes() {
        assert_eq!(H32::zero().encode_to_vec(), hex!("8400000000").to_vec());
        let mut expected = vec![0xa0];
        expected.extend_from_slice(&[0x11; 32]);
        assert_eq!(H256::from([0x11; 32]).encode_to_vec(), expected);
    }

    #[test]
    fn encode_u256() {
        assert_eq!(U256::zero().encode_to_vec(), vec![0x80]);
        assert_eq!(
            U256::from(0xdeadbeefu64).encode_to_vec(),
            hex!("84deadbeef").to_vec()
        );
    }
}

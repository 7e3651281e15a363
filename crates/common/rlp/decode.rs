use super::{
    constants::{RLP_EMPTY_LIST, RLP_NULL},
    error::RLPDecodeError,
};
use bytes::Bytes;
use ethereum_types::{Address, Bloom, H32, H64, H128, H256, H264, H512, U256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Max payload size accepted when decoding. Larger payloads have no
/// well-formed use in our protocols and are either bugs or hostile.
const MAX_RLP_BYTES: usize = 1024 * 1024 * 1024;

/// Trait for decoding RLP encoded slices of data.
/// See <https://ethereum.org/en/developers/docs/data-structures-and-encoding/rlp/#rlp-decoding>.
/// Implementors provide [`decode_unfinished`](RLPDecode::decode_unfinished),
/// which returns the decoded value along with the remaining bytes; consumers
/// normally call [`decode`](RLPDecode::decode).
pub trait RLPDecode: Sized {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError>;

    fn decode(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        let (decoded, remaining) = Self::decode_unfinished(rlp)?;
        if !remaining.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }
        Ok(decoded)
    }
}

impl RLPDecode for bool {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        match buf.first() {
            Some(&RLP_NULL) => Ok((false, &buf[1..])),
            Some(0x01) => Ok((true, &buf[1..])),
            Some(b) => Err(RLPDecodeError::MalformedBoolean(*b)),
            None => Err(RLPDecodeError::InvalidLength),
        }
    }
}

macro_rules! impl_decode_uint {
    ($($t:ty),*) => {
        $(impl RLPDecode for $t {
            fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
                let (bytes, rest) = decode_bytes(rlp)?;
                Ok((<$t>::from_be_bytes(static_left_pad(bytes)?), rest))
            }
        })*
    };
}

impl_decode_uint!(u8, u16, u32, u64, usize, u128);

impl<const N: usize> RLPDecode for [u8; N] {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let value = bytes
            .try_into()
            .map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl RLPDecode for Bytes {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        Ok((Bytes::copy_from_slice(bytes), rest))
    }
}

impl RLPDecode for String {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let value =
            String::from_utf8(bytes.to_vec()).map_err(|_| RLPDecodeError::MalformedData)?;
        Ok((value, rest))
    }
}

macro_rules! impl_decode_hash {
    ($($t:ident),*) => {
        $(impl RLPDecode for $t {
            fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
                let (bytes, rest) = RLPDecode::decode_unfinished(rlp)?;
                Ok(($t(bytes), rest))
            }
        })*
    };
}

impl_decode_hash!(H32, H64, H128, H256, H264, H512, Bloom);

impl RLPDecode for Address {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = <[u8; 20]>::decode_unfinished(rlp)?;
        Ok((Address::from(bytes), rest))
    }
}

impl RLPDecode for U256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let padded: [u8; 32] = static_left_pad(bytes)?;
        Ok((U256::from_big_endian(&padded), rest))
    }
}

impl RLPDecode for Ipv4Addr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let octets: [u8; 4] = bytes
            .try_into()
            .map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((Ipv4Addr::from(octets), rest))
    }
}

impl RLPDecode for Ipv6Addr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let octets: [u8; 16] = bytes
            .try_into()
            .map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((Ipv6Addr::from(octets), rest))
    }
}

impl RLPDecode for IpAddr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        match bytes.len() {
            4 => {
                let octets: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| RLPDecodeError::InvalidLength)?;
                Ok((IpAddr::V4(Ipv4Addr::from(octets)), rest))
            }
            16 => {
                let octets: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| RLPDecodeError::InvalidLength)?;
                // to_canonical in case it's an Ipv6-mapped Ipv4 address
                Ok((IpAddr::V6(Ipv6Addr::from(octets)).to_canonical(), rest))
            }
            _ => Err(RLPDecodeError::InvalidLength),
        }
    }
}

// A Vec<T> is a list of homogeneous items; byte strings decode through
// Bytes/[u8; N] instead.
impl<T: RLPDecode> RLPDecode for Vec<T> {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        if rlp.first() == Some(&RLP_EMPTY_LIST) {
            return Ok((Vec::new(), &rlp[1..]));
        }
        let (is_list, payload, input_rest) = decode_rlp_item(rlp)?;
        if !is_list {
            return Err(RLPDecodeError::UnexpectedString);
        }

        let mut result = Vec::new();
        let mut current = payload;
        while !current.is_empty() {
            let (item, rest) = T::decode_unfinished(current)?;
            result.push(item);
            current = rest;
        }
        Ok((result, input_rest))
    }
}

macro_rules! impl_decode_tuple {
    ($(($($name:ident : $t:ident),+)),*) => {
        $(impl<$($t: RLPDecode),+> RLPDecode for ($($t,)+) {
            fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
                let (is_list, payload, input_rest) = decode_rlp_item(rlp)?;
                if !is_list {
                    return Err(RLPDecodeError::UnexpectedString);
                }
                let current = payload;
                $(let ($name, current) = $t::decode_unfinished(current)?;)+
                if !current.is_empty() {
                    return Err(RLPDecodeError::MalformedData);
                }
                Ok((($($name,)+), input_rest))
            }
        })*
    };
}

impl_decode_tuple!(
    (a: T1, b: T2),
    (a: T1, b: T2, c: T3),
    (a: T1, b: T2, c: T3, d: T4)
);

/// Decodes the header of an RLP item.
/// Returns whether the item is a list, its payload without the prefix, and
/// the remaining bytes after the item.
pub fn decode_rlp_item(data: &[u8]) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    let (is_list, item, rest) = split_rlp_item(data)?;
    let payload_start = item.len() - payload_length(item)?;
    Ok((is_list, &item[payload_start..], rest))
}

/// Splits off the first RLP item, prefix included, from the remaining bytes.
pub fn get_item_with_prefix(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (_, item, rest) = split_rlp_item(data)?;
    Ok((item, rest))
}

fn split_rlp_item(data: &[u8]) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    let first_byte = *data.first().ok_or(RLPDecodeError::InvalidLength)?;

    let (is_list, header_len, payload_len) = match first_byte {
        // single byte, its own encoding
        0..=0x7f => (false, 0, 1),
        // short string
        0x80..=0xb7 => (false, 1, (first_byte - 0x80) as usize),
        // long string
        0xb8..=0xbf => {
            let len_of_len = (first_byte - 0xb7) as usize;
            let len = decode_length_bytes(data, len_of_len)?;
            (false, 1 + len_of_len, len)
        }
        // short list
        RLP_EMPTY_LIST..=0xf7 => (true, 1, (first_byte - RLP_EMPTY_LIST) as usize),
        // long list
        0xf8..=0xff => {
            let len_of_len = (first_byte - 0xf7) as usize;
            let len = decode_length_bytes(data, len_of_len)?;
            (true, 1 + len_of_len, len)
        }
    };

    let total = header_len + payload_len;
    if payload_len > MAX_RLP_BYTES || data.len() < total {
        return Err(RLPDecodeError::InvalidLength);
    }
    Ok((is_list, &data[..total], &data[total..]))
}

fn decode_length_bytes(data: &[u8], len_of_len: usize) -> Result<usize, RLPDecodeError> {
    let bytes = data
        .get(1..1 + len_of_len)
        .ok_or(RLPDecodeError::InvalidLength)?;
    Ok(usize::from_be_bytes(static_left_pad(bytes)?))
}

fn payload_length(item: &[u8]) -> Result<usize, RLPDecodeError> {
    let first_byte = *item.first().ok_or(RLPDecodeError::InvalidLength)?;
    match first_byte {
        0..=0x7f => Ok(1),
        0x80..=0xb7 => Ok((first_byte - 0x80) as usize),
        0xb8..=0xbf => decode_length_bytes(item, (first_byte - 0xb7) as usize),
        RLP_EMPTY_LIST..=0xf7 => Ok((first_byte - RLP_EMPTY_LIST) as usize),
        0xf8..=0xff => decode_length_bytes(item, (first_byte - 0xf7) as usize),
    }
}

/// Decodes the payload of a byte-string item.
/// Returns the payload and the remaining bytes after the item.
pub fn decode_bytes(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (is_list, payload, rest) = decode_rlp_item(data)?;
    if is_list {
        return Err(RLPDecodeError::UnexpectedList);
    }
    Ok((payload, rest))
}

/// Left-pads a big-endian byte slice with zeros up to a fixed width.
/// Rejects non-canonical encodings with leading zero bytes.
pub fn static_left_pad<const N: usize>(data: &[u8]) -> Result<[u8; N], RLPDecodeError> {
    let mut result = [0; N];
    if data.is_empty() {
        return Ok(result);
    }
    if data[0] == 0 {
        return Err(RLPDecodeError::MalformedData);
    }
    if data.len() > N {
        return Err(RLPDecodeError::InvalidLength);
    }
    result[N - data.len()..].copy_from_slice(data);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::RLPEncode;
    use hex_literal::hex;

    #[test]
    fn decode_unsigned_values() {
        assert_eq!(u64::decode(&[0x80]).unwrap(), 0);
        assert_eq!(u64::decode(&[0x07]).unwrap(), 7);
        assert_eq!(u64::decode(&[0x81, 0x80]).unwrap(), 0x80);
        assert_eq!(u64::decode(&hex!("820400")).unwrap(), 1024);
    }

    #[test]
    fn decode_rejects_leading_zeros() {
        assert!(u64::decode(&[0x82, 0x00, 0x01]).is_err());
    }

    #[test]
    fn decode_strings() {
        assert_eq!(String::decode(&[0x83, b'd', b'o', b'g']).unwrap(), "dog");
        assert_eq!(String::decode(&[0x80]).unwrap(), "");
    }

    #[test]
    fn decode_lists() {
        let encoded = vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g'];
        let decoded: Vec<String> = Vec::decode(&encoded).unwrap();
        assert_eq!(decoded, vec!["cat".to_string(), "dog".to_string()]);

        let empty: Vec<u64> = Vec::decode(&[0xc0]).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        assert!(u64::decode(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn round_trip_mixed_tuple() {
        let value = (H256::from([1; 32]), 77u64, true);
        let encoded = value.encode_to_vec();
        assert_eq!(<(H256, u64, bool)>::decode(&encoded).unwrap(), value);
    }

    #[test]
    fn round_trip_ip_addresses() {
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(IpAddr::decode(&v4.encode_to_vec()).unwrap(), v4);
        let v6: IpAddr = "::1".parse().unwrap();
        assert_eq!(IpAddr::decode(&v6.encode_to_vec()).unwrap(), v6);
    }
}

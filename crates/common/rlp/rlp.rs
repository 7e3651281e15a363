//! Recursive Length Prefix (RLP) encoding and decoding.
//!
//! RLP is the serialization format used across the Ethereum wire protocols
//! for structured data: protocol messages, headers, transactions, node
//! records.
//!
//! Types implement [`encode::RLPEncode`] and [`decode::RLPDecode`]; structs
//! are encoded as lists through the [`structs::Encoder`] and
//! [`structs::Decoder`] builders:
//!
//! ```rust
//! use ethwire_rlp::encode::RLPEncode;
//! use ethwire_rlp::decode::RLPDecode;
//!
//! let value: u64 = 42;
//! let encoded = value.encode_to_vec();
//! assert_eq!(u64::decode(&encoded).unwrap(), value);
//! ```

pub mod constants;
pub mod decode;
pub mod encode;
pub mod error;
pub mod structs;

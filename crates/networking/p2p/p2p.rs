//! Peer networking and chain synchronization core.
//!
//! This crate owns the live peer sessions of the node:
//! - **RLPx session multiplexer**: the `p2p` base capability handshake,
//!   dynamic sub-protocol negotiation and per-capability frame routing
//! - **eth protocol**: block, receipt and transaction exchange for wire
//!   versions 62 through 66, with request-id correlation from 66 on
//! - **snap protocol**: flat state-range synchronization with an adaptive
//!   response-byte budget
//! - **Node stats**: rolling per-peer transfer speeds and the reconnection
//!   throttle fed by disconnect history
//!
//! The encrypted transport below (ECIES handshake, AES frame ciphers) is
//! not part of this crate: sessions consume already-deciphered frames
//! through a stream/sink pair and never touch sockets directly.

pub mod backend;
pub(crate) mod metrics;
pub mod node_stats;
pub mod rlpx;
pub mod types;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("{0}")]
    ConnectionError(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

// Don't export RLPxErrors outside this crate, just display the message
impl From<rlpx::error::RLPxError> for NetworkError {
    fn from(value: rlpx::error::RLPxError) -> Self {
        Self::ConnectionError(value.to_string())
    }
}

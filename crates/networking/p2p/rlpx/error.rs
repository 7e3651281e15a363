use ethwire_rlp::error::{RLPDecodeError, RLPEncodeError};
use thiserror::Error;

use super::p2p::DisconnectReason;

#[derive(Debug, Error)]
pub enum RLPxError {
    #[error("Handshake failed: {0}")]
    HandshakeError(String),
    #[error("No matching capabilities")]
    NoMatchingCapabilities(),
    #[error("Disconnect requested: {0}")]
    DisconnectSent(DisconnectReason),
    #[error("Disconnect received: {0}")]
    DisconnectReceived(DisconnectReason),
    #[error("Peer disconnected")]
    Disconnected(),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Fork id mismatch: {0}")]
    ChainMismatch(String),
    #[error("Incoming message queue is full")]
    IncomingQueueFull,
    #[error("Request timed out")]
    RequestTimeout,
    #[error("Request cancelled")]
    RequestCancelled,
    #[error("Protocol \"{0}\" already registered")]
    DuplicateProtocol(String),
    #[error("Invalid session state: {0}")]
    StateError(String),
    #[error("Message not handled: {0}")]
    MessageNotHandled(String),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    RLPDecodeError(#[from] RLPDecodeError),
    #[error(transparent)]
    RLPEncodeError(#[from] RLPEncodeError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl RLPxError {
    /// Disconnect reason to put on the wire when this error tears the
    /// session down. Request-local errors produce none.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            RLPxError::DisconnectSent(reason) => Some(*reason),
            RLPxError::DisconnectReceived(_) | RLPxError::Disconnected() => None,
            RLPxError::ProtocolViolation(_) | RLPxError::RLPDecodeError(_) => {
                Some(DisconnectReason::ProtocolError)
            }
            RLPxError::ChainMismatch(_) => Some(DisconnectReason::UselessPeer),
            RLPxError::NoMatchingCapabilities() => Some(DisconnectReason::UselessPeer),
            RLPxError::HandshakeError(_) => Some(DisconnectReason::IncompatibleVersion),
            RLPxError::IncomingQueueFull => Some(DisconnectReason::Other),
            RLPxError::InternalError(_) | RLPxError::MessageNotHandled(_) => {
                Some(DisconnectReason::Other)
            }
            RLPxError::RequestTimeout | RLPxError::RequestCancelled => None,
            _ => None,
        }
    }

    /// Whether the error threatens session integrity. Errors local to a
    /// single request fail just that request.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RLPxError::RequestTimeout | RLPxError::RequestCancelled | RLPxError::BadRequest(_)
        )
    }
}

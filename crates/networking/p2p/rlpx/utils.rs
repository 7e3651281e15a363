use crate::types::Node;
use ethwire_rlp::error::{RLPDecodeError, RLPEncodeError};
use snap::raw::{Decoder as SnappyDecoder, Encoder as SnappyEncoder, max_compress_len};
use tracing::{debug, error, warn};

pub fn snappy_compress(encoded_data: &[u8]) -> Result<Vec<u8>, RLPEncodeError> {
    let mut snappy_encoder = SnappyEncoder::new();
    let mut msg_data = vec![0; max_compress_len(encoded_data.len()) + 1];
    let compressed_size = snappy_encoder
        .compress(encoded_data, &mut msg_data)
        .map_err(|e| RLPEncodeError::Custom(e.to_string()))?;
    msg_data.truncate(compressed_size);
    Ok(msg_data)
}

pub fn snappy_decompress(msg_data: &[u8]) -> Result<Vec<u8>, RLPDecodeError> {
    let mut snappy_decoder = SnappyDecoder::new();
    snappy_decoder
        .decompress_vec(msg_data)
        .map_err(|e| RLPDecodeError::Custom(e.to_string()))
}

pub(crate) fn log_peer_debug(node: &Node, text: &str) {
    debug!("[{0}]: {1}", node, text)
}

pub(crate) fn log_peer_error(node: &Node, text: &str) {
    error!("[{0}]: {1}", node, text)
}

pub(crate) fn log_peer_warn(node: &Node, text: &str) {
    warn!("[{0}]: {1}", node, text)
}

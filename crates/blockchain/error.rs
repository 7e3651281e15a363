use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("Chain head is not available")]
    MissingHead,
    #[error("Genesis block is not available")]
    MissingGenesis,
}

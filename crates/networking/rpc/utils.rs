use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RpcErr {
    #[error("Bad params: {0}")]
    BadParams(String),
    #[error("Missing param: {0}")]
    MissingParam(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

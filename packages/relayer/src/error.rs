//! I/O error taxonomy for source-chain and hub-chain calls
//!
//! These errors mean "could not ask the chain". Contract-level rejections
//! are not errors; they come back as outcome enums from the engines.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    /// Node answered with a JSON-RPC error object
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Request never produced a usable response
    #[error("transport error: {0}")]
    Transport(String),

    /// Response arrived but could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Requested block, header or transaction is unknown to the node
    #[error("not found: {0}")]
    NotFound(String),

    /// Hub contract call failed before producing a receipt
    #[error("contract call failed: {0}")]
    Contract(String),
}

pub type ChainResult<T> = std::result::Result<T, ChainError>;

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ChainError::Decode(e.to_string())
        } else {
            ChainError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(e: serde_json::Error) -> Self {
        ChainError::Decode(e.to_string())
    }
}

impl From<hex::FromHexError> for ChainError {
    fn from(e: hex::FromHexError) -> Self {
        ChainError::Decode(format!("invalid hex: {}", e))
    }
}

impl ChainError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChainError::NotFound(_))
    }
}

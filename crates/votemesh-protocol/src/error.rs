//! Error type for protocol operations.

use thiserror::Error;

/// Errors from framing, sealing, or opening protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Hex field could not be decoded
    #[error("Invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A key or IV had the wrong length
    #[error("Invalid {what} length: expected {expected} bytes, got {got}")]
    Length {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// Ciphertext did not open under the supplied key and IV
    #[error("Ballot could not be opened")]
    Open,
}

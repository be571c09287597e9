//! Error types for the node.

use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in node operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid startup configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Operator request rejected without any state change
    #[error("{0}")]
    Policy(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Ballot sealing/opening error
    #[error("Crypto error: {0}")]
    Crypto(#[from] votemesh_protocol::ProtocolError),

    /// Another node on the mesh already uses our name. Fatal.
    #[error("Duplicate node identity: \"{node_id}\" is already on the mesh")]
    DuplicateIdentity { node_id: String },
}

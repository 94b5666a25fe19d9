//! Blocksync Error Types

use thiserror::Error;

/// Result type alias for blocksync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Blocksync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Metadata errors
    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Metadata serialization error: {0}")]
    MetadataSerialization(#[from] serde_json::Error),

    #[error("Split brain: local ({local_gen}, {peer_gen}) vs peer ({remote_local_gen}, {remote_peer_gen})")]
    SplitBrain {
        local_gen: u64,
        peer_gen: u64,
        remote_local_gen: u64,
        remote_peer_gen: u64,
    },

    // Extent map errors
    #[error("Extent map error: {0}")]
    ExtentMap(String),

    // Wire protocol errors
    #[error("Wire serialization error: {0}")]
    WireSerialization(#[from] bincode::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake rejected by {address}: {reason}")]
    HandshakeRejected { address: String, reason: String },

    // Network errors
    #[error("Not connected to remote component")]
    NotConnected,

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Gateway closed")]
    GatewayClosed,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

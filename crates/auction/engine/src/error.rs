//! Error types for the auction engine

use auction_types::{AuctionConfigError, ProtocolViolation, ServerResponseError};
use thiserror::Error;

/// Engine error type
#[derive(Debug, Error)]
pub enum AuctionError {
    /// The auction config failed structural validation
    #[error("invalid auction config: {0}")]
    InvalidConfig(#[from] AuctionConfigError),

    /// A caller or worklet broke the protocol
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// A server-side auction response could not be used
    #[error("server response error: {0}")]
    ServerResponse(#[from] ServerResponseError),

    /// Engine configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The auction task ended without producing a result
    #[error("auction task failed: {0}")]
    TaskFailed(String),
}

/// Errors loading or applying engine configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to initialise tracing: {0}")]
    Telemetry(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, AuctionError>;

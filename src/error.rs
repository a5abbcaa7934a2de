//! Error types for the duplex client

use thiserror::Error;

/// Errors surfaced to callers of the duplex client.
///
/// Transport failures are not reported here once the client is running: they
/// only show up as connection state transitions while the client reconnects.
#[derive(Error, Debug)]
pub enum DuplexError {
    /// Opening the transport failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The socket is not open, so nothing was sent
    #[error("Not connected")]
    NotConnected,

    /// A request or connection attempt timed out
    #[error("Operation timed out")]
    Timeout,

    /// The request was dropped before a response arrived
    #[error("Request abandoned")]
    Abandoned,

    /// Failed to serialize/deserialize a message
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The endpoint address cannot be used
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A subscription pattern failed to compile
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// The client has been disposed
    #[error("Client shut down")]
    Shutdown,
}

/// Result type for duplex client operations
pub type Result<T> = std::result::Result<T, DuplexError>;

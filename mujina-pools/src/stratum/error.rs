//! Error types for the pool wire protocol.

use thiserror::Error;

/// Wire-level errors. Mapped into
/// [`StrategyError`](crate::error::StrategyError) before strategies see them.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid message format received from pool
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Pool returned an error response
    #[error("Pool error: {0}")]
    PoolError(String),

    /// TCP connect failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// `mining.subscribe` rejected
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// `login` or `mining.authorize` rejected
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    /// Unexpected response (wrong ID, wrong shape)
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Missing required field in message
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Endpoint asks for TLS, which this transport doesn't provide
    #[error("TLS not supported for {0}")]
    TlsUnsupported(String),

    /// Connection lost
    #[error("Connection lost")]
    Disconnected,

    /// Timeout waiting for connect or response
    #[error("Timeout waiting for response")]
    Timeout,
}

/// Convenient Result type for wire operations.
pub type StratumResult<T> = Result<T, StratumError>;

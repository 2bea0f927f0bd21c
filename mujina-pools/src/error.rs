//! Error types for pool strategies and their configuration.

use thiserror::Error;

use crate::stratum::StratumError;

/// Runtime failures inside the strategy layer.
///
/// None of these are fatal to the process. Strategies log them with the
/// endpoint and failure count and decide on a retry delay themselves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    /// Endpoint unreachable or handshake rejected
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectFailure { endpoint: String, reason: String },

    /// Pool rejected our capabilities or algorithm list
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Result rejected by the pool
    #[error("Submission failed: {0}")]
    SubmissionFailure(String),

    /// Result could not be sent because no session is connected
    #[error("Not connected")]
    NotConnected,

    /// Primary session lost the tunnel capability or dropped mid-tunnel
    #[error("Tunnel unavailable: {0}")]
    TunnelUnavailable(String),
}

/// Malformed configuration, rejected when a strategy is constructed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Endpoint list is empty")]
    NoEndpoints,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Auxiliary level {0} out of range (1-99)")]
    LevelOutOfRange(u8),

    #[error("Invalid jitter range {min}..{max}")]
    InvalidJitter { min: f64, max: f64 },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required setting: {0}")]
    Missing(String),
}

impl StrategyError {
    /// Map a wire-level error into the strategy taxonomy.
    pub fn from_stratum(endpoint: &str, err: &StratumError) -> Self {
        match err {
            StratumError::AuthorizationFailed(msg) | StratumError::SubscriptionFailed(msg) => {
                StrategyError::ProtocolMismatch(msg.clone())
            }
            StratumError::PoolError(msg) => StrategyError::SubmissionFailure(msg.clone()),
            StratumError::Disconnected => StrategyError::NotConnected,
            other => StrategyError::ConnectFailure {
                endpoint: endpoint.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stratum_errors_map_into_taxonomy() {
        let err = StrategyError::from_stratum(
            "pool:3333",
            &StratumError::AuthorizationFailed("bad wallet".into()),
        );
        assert_eq!(err, StrategyError::ProtocolMismatch("bad wallet".into()));

        let err = StrategyError::from_stratum("pool:3333", &StratumError::Timeout);
        match err {
            StrategyError::ConnectFailure { endpoint, .. } => assert_eq!(endpoint, "pool:3333"),
            other => panic!("Expected ConnectFailure, got {:?}", other),
        }
    }
}

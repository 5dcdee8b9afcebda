//! Gateway error taxonomy

use thiserror::Error;

/// Coarse error classification used to decide how a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeout, missing ACK, malformed frame, send failure
    Transport,
    /// Unexpected response or out-of-sequence message
    Protocol,
    /// Secure-element failure, MAC mismatch, anti-replay violation
    Security,
    /// Queue full or session slot occupied
    Resource,
    /// Invalid configuration
    Config,
    /// Persistent storage failure
    Storage,
}

/// Errors surfaced by gateway components
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("ECU {0} is not in the registry")]
    InvalidEcu(u8),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Transport(_) => ErrorKind::Transport,
            GatewayError::Protocol(_) | GatewayError::InvalidEcu(_) => ErrorKind::Protocol,
            GatewayError::Security(_) => ErrorKind::Security,
            GatewayError::Resource(_) => ErrorKind::Resource,
            GatewayError::Config(_) => ErrorKind::Config,
            GatewayError::Storage(_) => ErrorKind::Storage,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_ecu_is_protocol_kind() {
        assert_eq!(GatewayError::InvalidEcu(9).kind(), ErrorKind::Protocol);
        assert_eq!(
            GatewayError::InvalidEcu(9).to_string(),
            "ECU 9 is not in the registry"
        );
    }
}

//! Configuration and firmware update errors

use ecugw_core::{ErrorKind, GatewayError, StorageError};
use ecugw_she::KeyServiceError;
use thiserror::Error;

use crate::firmware::SessionState;
use crate::transport::TransportError;

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for GatewayError {
    fn from(err: ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

/// Reasons a firmware update session ends in `Failed`
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("No response in state {state:?}")]
    Timeout { state: SessionState },

    #[error("Unexpected response {payload:02X?} in state {state:?}")]
    UnexpectedResponse { state: SessionState, payload: Vec<u8> },

    #[error("ECU refused in state {state:?}")]
    Nack { state: SessionState },

    #[error("Challenge has {0} bytes, expected 16")]
    ChallengeLength(usize),

    #[error("Invalid firmware header: {0}")]
    InvalidHeader(String),

    #[error("Firmware image unreadable: {0}")]
    Storage(#[from] StorageError),

    #[error("Key service failure: {0}")]
    Key(#[from] KeyServiceError),

    #[error("No key service configured")]
    NoKeyService,

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Session inbox closed")]
    InboxClosed,

    #[error("Session task aborted")]
    Aborted,
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Timeout { .. } | UpdateError::Transport(_) => ErrorKind::Transport,
            UpdateError::UnexpectedResponse { .. }
            | UpdateError::Nack { .. }
            | UpdateError::ChallengeLength(_)
            | UpdateError::InboxClosed
            | UpdateError::Aborted => ErrorKind::Protocol,
            UpdateError::InvalidHeader(_) | UpdateError::NoKeyService => ErrorKind::Security,
            UpdateError::Key(KeyServiceError::Busy) => ErrorKind::Resource,
            UpdateError::Key(_) => ErrorKind::Security,
            UpdateError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Failures this core cannot recover from by retrying the update
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UpdateError::InvalidHeader(_)
                | UpdateError::Storage(_)
                | UpdateError::Key(_)
                | UpdateError::NoKeyService
        )
    }
}

impl From<UpdateError> for GatewayError {
    fn from(err: UpdateError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Transport => GatewayError::Transport(message),
            ErrorKind::Protocol => GatewayError::Protocol(message),
            ErrorKind::Security => GatewayError::Security(message),
            ErrorKind::Resource => GatewayError::Resource(message),
            ErrorKind::Config => GatewayError::Config(message),
            ErrorKind::Storage => GatewayError::Storage(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_error_kinds() {
        let timeout = UpdateError::Timeout {
            state: SessionState::ResetSent,
        };
        assert_eq!(timeout.kind(), ErrorKind::Transport);
        assert!(!timeout.is_fatal());

        let header = UpdateError::InvalidHeader("tag mismatch".into());
        assert_eq!(GatewayError::from(header).kind(), ErrorKind::Security);

        let storage = UpdateError::Storage(StorageError::Unavailable("card".into()));
        assert!(storage.is_fatal());
        assert_eq!(storage.kind(), ErrorKind::Storage);
    }
}

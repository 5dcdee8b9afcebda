//! Channel adapter errors

use ecugw_core::GatewayError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Send timed out on interface {0}")]
    Timeout(u8),

    #[error("Unknown interface {0}")]
    UnknownInterface(u8),

    #[error("Frame too long: {0} bytes")]
    FrameTooLong(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}

impl From<TransportError> for GatewayError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidConfig(_) | TransportError::Unsupported(_) => {
                GatewayError::Config(err.to_string())
            }
            _ => GatewayError::Transport(err.to_string()),
        }
    }
}

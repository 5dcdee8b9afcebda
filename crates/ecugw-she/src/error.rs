//! Secure element and key service errors

use std::time::Duration;

use ecugw_core::GatewayError;
use thiserror::Error;

use crate::slot::KeySlot;

/// Error codes reported by a SHE secure element
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SheError {
    #[error("Command issued out of sequence")]
    SequenceError,

    #[error("Key not available for this operation")]
    KeyNotAvailable,

    #[error("Key usage not permitted")]
    KeyInvalid,

    #[error("Key slot is empty")]
    KeyEmpty,

    #[error("Key slot is write protected")]
    KeyWriteProtected,

    #[error("Key update rejected")]
    KeyUpdateError,

    #[error("Debugging not authorized")]
    NoDebugging,

    #[error("Secure element busy")]
    Busy,

    #[error("Secure element memory failure")]
    MemoryFailure,

    #[error("Invalid data length {0}")]
    InvalidLength(usize),

    #[error("Command cancelled")]
    Cancelled,

    #[error("General secure element error")]
    GeneralError,
}

/// Key service errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyServiceError {
    #[error("Secure element busy")]
    Busy,

    #[error("Secure element command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Anti-replay violation on {slot}: counter {counter} does not exceed {stored}")]
    CounterNotIncreasing {
        slot: KeySlot,
        counter: u32,
        stored: u32,
    },

    #[error("Counter {0} exceeds 28 bits")]
    CounterOverflow(u32),

    #[error("Slot {0} cannot be loaded this way")]
    InvalidSlot(KeySlot),

    #[error("Authorization key not provisioned")]
    AuthKeyUnknown,

    #[error("Key load verification failed (M4/M5 mismatch)")]
    VerificationFailed,

    #[error("Unexpected secure element response to {0}")]
    UnexpectedResponse(&'static str),

    #[error("Secure element error: {0}")]
    Element(#[from] SheError),

    #[error("Key service task ended without a result")]
    Closed,
}

impl From<KeyServiceError> for GatewayError {
    fn from(err: KeyServiceError) -> Self {
        match err {
            KeyServiceError::Busy | KeyServiceError::Element(SheError::Busy) => {
                GatewayError::Resource(err.to_string())
            }
            KeyServiceError::Timeout(_) => GatewayError::Transport(err.to_string()),
            _ => GatewayError::Security(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecugw_core::ErrorKind;

    #[test]
    fn test_error_taxonomy() {
        let busy: GatewayError = KeyServiceError::Busy.into();
        assert_eq!(busy.kind(), ErrorKind::Resource);

        let replay: GatewayError = KeyServiceError::CounterNotIncreasing {
            slot: KeySlot::User(1),
            counter: 1,
            stored: 2,
        }
        .into();
        assert_eq!(replay.kind(), ErrorKind::Security);

        let timeout: GatewayError = KeyServiceError::Timeout(Duration::from_millis(5)).into();
        assert_eq!(timeout.kind(), ErrorKind::Transport);
    }
}

//! Firmware update sessions
//!
//! ```text
//! Idle ──start──▶ ResetSent ──RESET_ACK──▶ BeginSent / AwaitingChallenge
//!                                              │ sentinel / challenge
//!                                              ▼
//!          Complete ◀──END_ACK── EndSent ◀── Transferring (chunk, FRAME_ACK)*
//! ```
//!
//! Any timeout, wrong byte or NACK moves the session to `Failed`. There is
//! no resume: a retried update starts again with RESET.

mod manager;
mod session;
mod table;

pub use manager::{FirmwareManager, UpdateHandle, UpdateReport};
pub use table::{SessionSlot, SessionTable};

use serde::Serialize;

/// Firmware update session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    ResetSent,
    /// BEGIN-nonsecure sent, waiting for the sentinel byte
    BeginSent,
    /// BEGIN-secure sent, waiting for the 16-byte challenge
    AwaitingChallenge,
    Transferring,
    EndSent,
    Complete,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed)
    }
}

//! Secure element command interface

use async_trait::async_trait;

use crate::error::SheError;
use crate::slot::{KeySlot, Uid};

/// Command issued to a SHE secure element
#[derive(Debug, Clone)]
pub enum SheCommand {
    EncryptEcb { slot: KeySlot, data: Vec<u8> },
    DecryptEcb { slot: KeySlot, data: Vec<u8> },
    EncryptCbc { slot: KeySlot, iv: [u8; 16], data: Vec<u8> },
    DecryptCbc { slot: KeySlot, iv: [u8; 16], data: Vec<u8> },
    GenerateMac { slot: KeySlot, data: Vec<u8> },
    VerifyMac { slot: KeySlot, data: Vec<u8>, mac: [u8; 16] },
    Random,
    /// Authenticated key load (M1..M3)
    LoadKey { m1: [u8; 16], m2: [u8; 32], m3: [u8; 16] },
    /// Plain-text load into the RAM slot
    LoadPlainKey { key: [u8; 16] },
    GetId { challenge: [u8; 16] },
    /// First half of the erase sequence
    DebugChallenge,
    /// Second half: on success every key slot is wiped
    DebugAuthorize { auth: [u8; 16] },
}

impl SheCommand {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            SheCommand::EncryptEcb { .. } => "ENC_ECB",
            SheCommand::DecryptEcb { .. } => "DEC_ECB",
            SheCommand::EncryptCbc { .. } => "ENC_CBC",
            SheCommand::DecryptCbc { .. } => "DEC_CBC",
            SheCommand::GenerateMac { .. } => "GENERATE_MAC",
            SheCommand::VerifyMac { .. } => "VERIFY_MAC",
            SheCommand::Random => "RND",
            SheCommand::LoadKey { .. } => "LOAD_KEY",
            SheCommand::LoadPlainKey { .. } => "LOAD_PLAIN_KEY",
            SheCommand::GetId { .. } => "GET_ID",
            SheCommand::DebugChallenge => "DEBUG_CHAL",
            SheCommand::DebugAuthorize { .. } => "DEBUG_AUTH",
        }
    }
}

/// Secure element response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheResponse {
    Data(Vec<u8>),
    Mac([u8; 16]),
    Verified(bool),
    Random([u8; 16]),
    KeyLoaded { m4: [u8; 32], m5: [u8; 16] },
    Id { uid: Uid, status: u8, mac: [u8; 16] },
    Challenge([u8; 16]),
    Done,
}

/// Hardware (or emulated) SHE secure element
///
/// Implementations may take milliseconds per command. Callers must not
/// issue a second command while one is outstanding; [`KeyService`]
/// enforces this.
///
/// [`KeyService`]: crate::KeyService
#[async_trait]
pub trait SecureElement: Send + Sync {
    async fn execute(&self, command: SheCommand) -> Result<SheResponse, SheError>;

    /// Abort the outstanding command and drain any partial result
    async fn cancel(&self);
}

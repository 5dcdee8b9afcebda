//! One firmware update session
//!
//! The session owns its inbound queue (fed only by the router) and the
//! image cursor. Every wait is bounded by the ACK timeout; the first
//! failure ends the session.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};
use uuid::Uuid;

use ecugw_core::firmware::{handshake, subtype as frame_type};
use ecugw_core::{
    EcuId, FirmwareHeader, MessageKind, Pdu, PduId, Storage, CHALLENGE_SIZE, CHUNK_SIZE,
    SECURE_FRAME_SIZE,
};
use ecugw_she::KeyService;

use super::SessionState;
use crate::config::FirmwareConfig;
use crate::error::UpdateError;
use crate::transport::{ChannelAdapter, TransportError};

/// Read size used when authenticating a whole image
const IMAGE_READ_BLOCK: usize = 4096;

/// Collaborators shared by every session
pub(crate) struct SessionContext {
    pub channel: Arc<dyn ChannelAdapter>,
    pub storage: Arc<dyn Storage>,
    pub keys: Option<KeyService>,
    pub config: FirmwareConfig,
}

/// What a session got done before it ended
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Progress {
    pub chunks: u32,
    pub bytes: u64,
    pub padded: bool,
    pub header_version: Option<u32>,
    pub header_invalid: bool,
}

/// A session that stopped talking to its ECU
///
/// The terminal state is not visible to observers until [`publish`] runs,
/// so the owner can release the session slot first.
///
/// [`publish`]: Finished::publish
pub(crate) struct Finished {
    pub progress: Progress,
    pub result: Result<(), UpdateError>,
    state: watch::Sender<SessionState>,
}

impl Finished {
    pub fn publish(self) -> (Progress, Result<(), UpdateError>) {
        let terminal = match self.result {
            Ok(()) => SessionState::Complete,
            Err(_) => SessionState::Failed,
        };
        self.state.send_replace(terminal);
        (self.progress, self.result)
    }
}

pub(crate) struct UpdateSession {
    id: Uuid,
    ecu: EcuId,
    interface: u8,
    image: String,
    secure: bool,
    ctx: Arc<SessionContext>,
    inbox: mpsc::Receiver<Pdu>,
    state: watch::Sender<SessionState>,
    challenge: [u8; CHALLENGE_SIZE],
    progress: Progress,
    last_event: Instant,
}

impl UpdateSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        ecu: EcuId,
        interface: u8,
        image: String,
        secure: bool,
        ctx: Arc<SessionContext>,
        inbox: mpsc::Receiver<Pdu>,
        state: watch::Sender<SessionState>,
    ) -> Self {
        Self {
            id,
            ecu,
            interface,
            image,
            secure,
            ctx,
            inbox,
            state,
            challenge: [0u8; CHALLENGE_SIZE],
            progress: Progress::default(),
            last_event: Instant::now(),
        }
    }

    /// Drive the session until it completes or fails
    pub async fn run(mut self) -> Finished {
        info!(session = %self.id, ecu = %self.ecu, image = %self.image, secure = self.secure, "Firmware update started");
        let result = self.execute().await;
        match &result {
            Ok(()) => {
                info!(
                    session = %self.id,
                    ecu = %self.ecu,
                    chunks = self.progress.chunks,
                    bytes = self.progress.bytes,
                    "Firmware update complete"
                );
            }
            Err(e) => {
                let state = self.state();
                error!(
                    session = %self.id,
                    ecu = %self.ecu,
                    ?state,
                    chunks = self.progress.chunks,
                    idle_ms = self.last_event.elapsed().as_millis() as u64,
                    error = %e,
                    "Firmware update failed"
                );
            }
        }
        Finished {
            progress: self.progress,
            result,
            state: self.state,
        }
    }

    async fn execute(&mut self) -> Result<(), UpdateError> {
        self.check_header().await?;

        self.send_control(handshake::RESET_CMD).await?;
        self.set_state(SessionState::ResetSent);
        self.expect_byte(handshake::RESET_ACK).await?;

        if self.secure {
            self.send_control(handshake::BEGIN_SECURE).await?;
            self.set_state(SessionState::AwaitingChallenge);
            let payload = self.receive().await?;
            if payload.as_ref() == [handshake::NACK] {
                return Err(UpdateError::Nack {
                    state: self.state(),
                });
            }
            if payload.len() != CHALLENGE_SIZE {
                return Err(UpdateError::ChallengeLength(payload.len()));
            }
            self.challenge.copy_from_slice(&payload);
        } else {
            self.send_control(handshake::BEGIN_NONSECURE).await?;
            self.set_state(SessionState::BeginSent);
            self.expect_byte(handshake::BEGIN_ACK).await?;
        }

        self.set_state(SessionState::Transferring);
        self.transfer().await?;

        self.send_control(handshake::END_CMD).await?;
        self.set_state(SessionState::EndSent);
        self.expect_byte(handshake::END_ACK).await
    }

    async fn transfer(&mut self) -> Result<(), UpdateError> {
        let id = PduId::firmware(self.ecu, frame_type::CHUNK).raw();
        let mut offset = 0u64;
        loop {
            let mut chunk = [0u8; CHUNK_SIZE];
            let n = self
                .ctx
                .storage
                .read_firmware_chunk(&self.image, offset, &mut chunk)
                .await?;
            if n == 0 {
                break;
            }
            // Bytes past `n` are still zero
            if n < CHUNK_SIZE {
                self.progress.padded = true;
            }

            let frame = self.seal(&chunk).await?;
            self.send(id, &frame).await?;
            self.progress.chunks += 1;
            self.progress.bytes += n as u64;
            debug!(ecu = %self.ecu, chunk = self.progress.chunks, len = n, "Chunk sent");

            self.expect_byte(handshake::FRAME_ACK).await?;
            offset += n as u64;
            if n < CHUNK_SIZE {
                break;
            }
        }
        Ok(())
    }

    /// Frame payload for one chunk: plain, or `CBC(chunk || challenge)`
    async fn seal(&self, chunk: &[u8; CHUNK_SIZE]) -> Result<Vec<u8>, UpdateError> {
        if !self.secure {
            return Ok(chunk.to_vec());
        }
        let keys = self.ctx.keys.as_ref().ok_or(UpdateError::NoKeyService)?;
        let mut block = [0u8; SECURE_FRAME_SIZE];
        block[..CHUNK_SIZE].copy_from_slice(chunk);
        block[CHUNK_SIZE..].copy_from_slice(&self.challenge);
        Ok(keys
            .encrypt_cbc(self.ctx.config.update_key, [0u8; 16], &block)
            .await?)
    }

    async fn check_header(&mut self) -> Result<(), UpdateError> {
        if !self.ctx.config.verify_header {
            return Ok(());
        }
        let Some(bytes) = self.ctx.storage.read_firmware_header(&self.image).await? else {
            debug!(image = %self.image, "No header record, skipping verification");
            return Ok(());
        };
        let result = self.verify_header(&bytes).await;
        if matches!(result, Err(UpdateError::InvalidHeader(_))) {
            self.progress.header_invalid = true;
        }
        result
    }

    async fn verify_header(&mut self, bytes: &[u8]) -> Result<(), UpdateError> {
        let header =
            FirmwareHeader::decode(bytes).map_err(|e| UpdateError::InvalidHeader(e.to_string()))?;
        if header.target != self.ecu {
            return Err(UpdateError::InvalidHeader(format!(
                "image targets ECU {}",
                header.target
            )));
        }

        let image = self.read_image(u64::from(header.length)).await?;
        if image.len() as u64 != u64::from(header.length) {
            return Err(UpdateError::InvalidHeader(format!(
                "length {} does not match image size {}",
                header.length,
                image.len()
            )));
        }

        let keys = self.ctx.keys.as_ref().ok_or(UpdateError::NoKeyService)?;
        if !keys
            .verify_mac(self.ctx.config.update_key, &image, &header.tag)
            .await?
        {
            return Err(UpdateError::InvalidHeader(
                "authentication tag mismatch".to_string(),
            ));
        }

        info!(ecu = %self.ecu, version = header.version, "Firmware header verified");
        self.progress.header_version = Some(header.version);
        Ok(())
    }

    /// Read the whole image, stopping one byte past `expected`
    async fn read_image(&self, expected: u64) -> Result<Vec<u8>, UpdateError> {
        let mut image = Vec::new();
        let mut block = vec![0u8; IMAGE_READ_BLOCK];
        loop {
            let n = self
                .ctx
                .storage
                .read_firmware_chunk(&self.image, image.len() as u64, &mut block)
                .await?;
            if n == 0 {
                break;
            }
            image.extend_from_slice(&block[..n]);
            if image.len() as u64 > expected {
                break;
            }
        }
        Ok(image)
    }

    async fn send_control(&self, byte: u8) -> Result<(), UpdateError> {
        let id = PduId::firmware(self.ecu, frame_type::CONTROL).raw();
        self.send(id, &[byte]).await
    }

    async fn send(&self, id: u32, data: &[u8]) -> Result<(), UpdateError> {
        let timeout = self.ctx.config.ack_timeout();
        match tokio::time::timeout(timeout, self.ctx.channel.send(self.interface, id, data)).await {
            Ok(result) => result.map_err(UpdateError::from),
            Err(_) => Err(TransportError::Timeout(self.interface).into()),
        }
    }

    /// Next response from the ECU, bounded by the ACK timeout
    async fn receive(&mut self) -> Result<Bytes, UpdateError> {
        let deadline = tokio::time::Instant::now() + self.ctx.config.ack_timeout();
        loop {
            let pdu = match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(pdu)) => pdu,
                Ok(None) => return Err(UpdateError::InboxClosed),
                Err(_) => {
                    return Err(UpdateError::Timeout {
                        state: self.state(),
                    })
                }
            };
            match pdu.id().kind() {
                Ok(MessageKind::Firmware { subtype, .. }) if subtype == frame_type::RESPONSE => {
                    self.last_event = Instant::now();
                    return Ok(pdu.into_payload());
                }
                _ => debug!(ecu = %self.ecu, id = %pdu.id(), "Ignoring non-response frame"),
            }
        }
    }

    async fn expect_byte(&mut self, expected: u8) -> Result<(), UpdateError> {
        let payload = self.receive().await?;
        match payload.as_ref() {
            [b] if *b == expected => Ok(()),
            [handshake::NACK] => Err(UpdateError::Nack {
                state: self.state(),
            }),
            other => Err(UpdateError::UnexpectedResponse {
                state: self.state(),
                payload: other.to_vec(),
            }),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(ecu = %self.ecu, ?previous, ?state, "Session state");
        }
    }
}

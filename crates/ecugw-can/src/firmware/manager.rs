//! Firmware session lifecycle
//!
//! The manager validates an update request, claims the ECU's session slot,
//! marks the ECU `Updating` and spawns the session task. When the task ends
//! the ECU status reflects the outcome and the slot is released.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use ecugw_core::{EcuId, EcuRegistry, EcuStatus, GatewayError, Storage};
use ecugw_she::KeyService;

use super::session::{Progress, SessionContext, UpdateSession};
use super::{SessionState, SessionTable};
use crate::config::FirmwareConfig;
use crate::error::UpdateError;
use crate::transport::ChannelAdapter;

/// Summary of a completed update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub session_id: Uuid,
    pub ecu: EcuId,
    pub image: String,
    pub secure: bool,
    pub state: SessionState,
    /// Chunk frames sent and acknowledged
    pub chunks: u32,
    /// Image bytes sent, excluding padding
    pub bytes: u64,
    /// The final chunk was zero-padded
    pub padded: bool,
    /// Version taken from a verified header record
    pub firmware_version: Option<u32>,
}

/// Handle on a running session
pub struct UpdateHandle {
    session_id: Uuid,
    ecu: EcuId,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<Result<UpdateReport, UpdateError>>,
}

impl UpdateHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn ecu(&self) -> EcuId {
        self.ecu
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait for the session to end
    pub async fn wait(self) -> Result<UpdateReport, UpdateError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                warn!(ecu = %self.ecu, error = %e, "Session task did not finish");
                Err(UpdateError::Aborted)
            }
        }
    }
}

/// Starts firmware update sessions
pub struct FirmwareManager {
    registry: Arc<EcuRegistry>,
    sessions: Arc<SessionTable>,
    ctx: Arc<SessionContext>,
}

impl FirmwareManager {
    pub fn new(
        registry: Arc<EcuRegistry>,
        sessions: Arc<SessionTable>,
        channel: Arc<dyn ChannelAdapter>,
        storage: Arc<dyn Storage>,
        keys: Option<KeyService>,
        config: FirmwareConfig,
    ) -> Self {
        Self {
            registry,
            sessions,
            ctx: Arc::new(SessionContext {
                channel,
                storage,
                keys,
                config,
            }),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn is_active(&self, ecu: EcuId) -> bool {
        self.sessions.is_active(ecu)
    }

    /// Start updating `ecu` with `image`
    ///
    /// Fails immediately if the ECU is unknown, a session is already active
    /// for it, or secure mode is requested without a capable ECU and key
    /// service.
    pub fn start(
        &self,
        ecu: EcuId,
        image: impl Into<String>,
        secure: bool,
    ) -> Result<UpdateHandle, GatewayError> {
        let image = image.into();
        let record = self.registry.get(ecu)?;
        if secure {
            if self.ctx.keys.is_none() {
                return Err(GatewayError::Security(
                    "Secure update requires a key service".to_string(),
                ));
            }
            if !record.secure_capable {
                return Err(GatewayError::Security(format!(
                    "ECU {} does not support secure update",
                    ecu
                )));
            }
        }

        let (inbox_tx, inbox_rx) = mpsc::channel(self.ctx.config.session_queue.max(1));
        let slot = self.sessions.claim(ecu, inbox_tx)?;
        let prior = self.registry.set_status(ecu, EcuStatus::Updating)?;

        let session_id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let session = UpdateSession::new(
            session_id,
            ecu,
            record.interface,
            image.clone(),
            secure,
            self.ctx.clone(),
            inbox_rx,
            state_tx,
        );

        let registry = self.registry.clone();
        let storage = self.ctx.storage.clone();
        let task = tokio::spawn(async move {
            let finished = session.run().await;

            let status = outcome_status(&finished.progress, &finished.result, prior);
            let version = finished
                .result
                .as_ref()
                .ok()
                .and(finished.progress.header_version);
            let updated = registry.update(ecu, |r| {
                r.status = status;
                if let Some(version) = version {
                    r.firmware_version = version;
                }
            });
            if let Err(e) = updated {
                warn!(%ecu, error = %e, "Could not record update outcome");
            }
            drop(slot);

            if let Err(e) = registry.store_one(storage.as_ref(), ecu).await {
                warn!(%ecu, error = %e, "Could not persist ECU record after update");
            }
            info!(%ecu, ?status, "Update session closed");

            // Observers see the terminal state only once the slot is free
            let (progress, result) = finished.publish();

            result.map(|()| UpdateReport {
                session_id,
                ecu,
                image,
                secure,
                state: SessionState::Complete,
                chunks: progress.chunks,
                bytes: progress.bytes,
                padded: progress.padded,
                firmware_version: progress.header_version,
            })
        });

        Ok(UpdateHandle {
            session_id,
            ecu,
            state: state_rx,
            task,
        })
    }
}

/// ECU status after a session ends
///
/// Once chunk data has reached the ECU, or the image itself was rejected,
/// its firmware can no longer be trusted. A failure of this core's own
/// storage or key service before any transfer is a fault. Anything else
/// leaves the ECU as it was.
fn outcome_status(
    progress: &Progress,
    result: &Result<(), UpdateError>,
    prior: EcuStatus,
) -> EcuStatus {
    match result {
        Ok(()) => EcuStatus::Normal,
        Err(_) if progress.chunks > 0 || progress.header_invalid => EcuStatus::Corrupted,
        Err(e) if e.is_fatal() => EcuStatus::Fault,
        Err(_) => prior,
    }
}

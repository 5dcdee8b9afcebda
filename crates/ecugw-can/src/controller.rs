//! Gateway controller
//!
//! Owns the ECU registry. Applies command responses from ECUs to their
//! records and polls every ECU that is not updating for its status on a
//! fixed period. An ECU that never answers keeps its last known status.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ecugw_core::{
    CommandOpcode, Console, EcuId, EcuRecord, EcuRegistry, EcuStatus, GatewayError, MessageKind,
    Pdu, PduId, Storage,
};

use crate::config::{ControllerConfig, RouterConfig};
use crate::transport::{ChannelAdapter, TransportError};

pub struct GatewayController {
    registry: Arc<EcuRegistry>,
    channel: Arc<dyn ChannelAdapter>,
    storage: Option<Arc<dyn Storage>>,
    config: ControllerConfig,
    send_timeout: Duration,
}

/// Aborts the heartbeat task when the controller loop goes away
struct HeartbeatTask(JoinHandle<()>);

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl GatewayController {
    pub fn new(
        registry: Arc<EcuRegistry>,
        channel: Arc<dyn ChannelAdapter>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            registry,
            channel,
            storage: None,
            config,
            send_timeout: RouterConfig::default().send_timeout(),
        }
    }

    /// Bound every command transmission by `timeout`
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Persist changed records to `storage` when auto-persist is enabled
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn registry(&self) -> &Arc<EcuRegistry> {
        &self.registry
    }

    /// Apply one command response to the registry
    ///
    /// Returns the updated record. `Updating` belongs to the firmware
    /// session: responses never leave it, and a reported `Updating` is
    /// ignored for an ECU with no session running.
    pub async fn handle_inbound(&self, pdu: Pdu) -> Result<EcuRecord, GatewayError> {
        let (ecu, opcode) = match pdu.id().kind() {
            Ok(MessageKind::Command { ecu, opcode }) => (ecu, opcode),
            _ => {
                return Err(GatewayError::Protocol(format!(
                    "Not a command message: {}",
                    pdu.id()
                )))
            }
        };
        let opcode = CommandOpcode::try_from(opcode)
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;
        let payload = pdu.payload();
        let before = self.registry.get(ecu)?;

        let mut error = None;
        let updated = self.registry.update(ecu, |record| {
            let updating = record.status == EcuStatus::Updating;
            let result = match opcode {
                CommandOpcode::RequestAll => EcuRecord::from_report(payload).map(|mut report| {
                    if updating || report.status == EcuStatus::Updating {
                        report.status = record.status;
                    }
                    *record = report;
                }),
                CommandOpcode::RequestId => record.apply_identity(payload),
                CommandOpcode::RequestFirmwareVersion => match payload.get(..4) {
                    Some(bytes) => {
                        let bytes = [bytes[0], bytes[1], bytes[2], bytes[3]];
                        record.firmware_version = record.endianness.read_u32(bytes);
                        Ok(())
                    }
                    None => Err(ecugw_core::RecordError::Length(payload.len())),
                },
                CommandOpcode::RequestStatus => match payload.first() {
                    Some(&byte) => EcuStatus::try_from(byte).map(|status| {
                        if !updating && status != EcuStatus::Updating {
                            record.status = status;
                        }
                    }),
                    None => Err(ecugw_core::RecordError::Length(0)),
                },
                CommandOpcode::Reset => {
                    if !updating {
                        record.status = EcuStatus::Normal;
                    }
                    Ok(())
                }
                CommandOpcode::Sleep => {
                    if !updating {
                        record.status = EcuStatus::Sleeping;
                    }
                    Ok(())
                }
            };
            if let Err(e) = result {
                error = Some(e);
            }
        })?;

        if let Some(e) = error {
            warn!(%ecu, ?opcode, error = %e, "Malformed command response");
            return Err(GatewayError::Protocol(format!(
                "ECU {} {:?} response: {}",
                ecu, opcode, e
            )));
        }

        if updated != before {
            debug!(%ecu, ?opcode, status = ?updated.status, "ECU record updated");
            self.persist(ecu).await;
        }
        Ok(updated)
    }

    async fn persist(&self, ecu: EcuId) {
        if !self.config.auto_persist {
            return;
        }
        if let Some(storage) = &self.storage {
            if let Err(e) = self.registry.store_one(storage.as_ref(), ecu).await {
                warn!(%ecu, error = %e, "Failed to persist ECU record");
            }
        }
    }

    /// Send a command to one ECU on its interface
    pub async fn send_command(&self, ecu: EcuId, opcode: CommandOpcode) -> Result<(), GatewayError> {
        let record = self.registry.get(ecu)?;
        let id = PduId::command(ecu, opcode.into());
        tokio::time::timeout(
            self.send_timeout,
            self.channel.send(record.interface, id.raw(), &[]),
        )
        .await
        .map_err(|_| TransportError::Timeout(record.interface))??;
        Ok(())
    }

    /// Poll every ECU not currently updating for its status
    ///
    /// Returns the number of ECUs polled.
    pub async fn heartbeat(&self) -> usize {
        let delay = self.config.inter_ecu_delay();
        let mut polled = 0;
        for ecu in self.registry.ids() {
            match self.registry.status(ecu) {
                Ok(EcuStatus::Updating) | Err(_) => continue,
                Ok(_) => {}
            }
            if polled > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = self.send_command(ecu, CommandOpcode::RequestStatus).await {
                warn!(%ecu, error = %e, "Heartbeat request failed");
            }
            polled += 1;
        }
        polled
    }

    /// Dump the registry to a diagnostic console
    pub fn print_registry(&self, console: &dyn Console) {
        console.print_line("ECU  PROTOCOL  IF  STATUS        ENDIAN  SECURE  FIRMWARE");
        for (i, r) in self.registry.snapshot().iter().enumerate() {
            console.print_line(&format!(
                "{:<4} {:<9} {:<3} {:<13} {:<7} {:<7} 0x{:08X}",
                i,
                format!("{:?}", r.protocol),
                r.interface,
                format!("{:?}", r.status),
                format!("{:?}", r.endianness),
                if r.secure_capable { "yes" } else { "no" },
                r.firmware_version,
            ));
        }
    }

    /// Run the controller loop: inbound responses plus periodic heartbeat
    ///
    /// The heartbeat runs in its own task so responses keep draining while
    /// ECUs are polled. Ends when the inbound queue closes.
    pub fn spawn(self: Arc<Self>, mut inbound: mpsc::Receiver<Pdu>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.heartbeat_period().max(Duration::from_millis(1));
            info!(period_ms = period.as_millis() as u64, "Gateway controller started");
            let _heartbeat = HeartbeatTask(self.clone().spawn_heartbeat(period));
            while let Some(pdu) = inbound.recv().await {
                if let Err(e) = self.handle_inbound(pdu).await {
                    debug!(error = %e, "Inbound command rejected");
                }
            }
            info!("Gateway controller stopped");
        })
    }

    fn spawn_heartbeat(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let polled = self.heartbeat().await;
                debug!(polled, "Heartbeat sent");
            }
        })
    }
}

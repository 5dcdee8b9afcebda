//! Gateway assembly
//!
//! Wires the registry, routing table, controller, router, receiver and
//! firmware manager around one channel adapter and one storage backend.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ecugw_core::{Console, EcuId, EcuRegistry, GatewayError, Storage};
use ecugw_she::{KeyService, SoftSecureElement};

use crate::config::{ElementConfig, GatewayConfig, SheConfig};
use crate::controller::GatewayController;
use crate::error::ConfigError;
use crate::firmware::{FirmwareManager, SessionTable, UpdateHandle};
use crate::receiver::spawn_receiver;
use crate::router::{PduRouter, RouterHandle, RouterStatsSnapshot};
use crate::transport::ChannelAdapter;

/// A running gateway
pub struct Gateway {
    registry: Arc<EcuRegistry>,
    controller: Arc<GatewayController>,
    router: RouterHandle,
    firmware: FirmwareManager,
    storage: Arc<dyn Storage>,
    keys: Option<KeyService>,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Build every component and start the background tasks
    ///
    /// Stored ECU records replace the configured ones where present. An
    /// unreachable storage backend is logged and the configured records
    /// are used.
    pub async fn start(
        config: &GatewayConfig,
        channel: Arc<dyn ChannelAdapter>,
        storage: Arc<dyn Storage>,
        keys: Option<KeyService>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;

        let registry = Arc::new(config.build_registry());
        match registry.load_from(storage.as_ref()).await {
            Ok(summary) => info!(
                loaded = summary.loaded,
                missing = summary.missing,
                corrupted = summary.corrupted,
                "ECU registry restored"
            ),
            Err(e) => warn!(error = %e, "Storage unavailable, using configured ECU records"),
        }
        let routes = Arc::new(config.build_routing()?);
        let sessions = Arc::new(SessionTable::new());

        let (controller_tx, controller_rx) = mpsc::channel(config.controller.queue_depth.max(1));
        let controller = Arc::new(
            GatewayController::new(registry.clone(), channel.clone(), config.controller.clone())
                .with_storage(storage.clone())
                .with_send_timeout(config.router.send_timeout()),
        );
        let controller_task = controller.clone().spawn(controller_rx);

        let router = PduRouter::new(
            routes,
            registry.clone(),
            channel.clone(),
            controller_tx,
            sessions.clone(),
            &config.router,
        );
        let (router, router_task) = router.spawn(config.router.queue_depth.max(1));
        let receiver_task = spawn_receiver(channel.clone(), router.clone());

        let firmware = FirmwareManager::new(
            registry.clone(),
            sessions,
            channel,
            storage.clone(),
            keys.clone(),
            config.firmware.clone(),
        );

        info!(
            ecus = registry.len(),
            routes = config.routes.len(),
            secure = keys.is_some(),
            "Gateway started"
        );

        Ok(Self {
            registry,
            controller,
            router,
            firmware,
            storage,
            keys,
            tasks: vec![receiver_task, router_task, controller_task],
        })
    }

    pub fn registry(&self) -> &Arc<EcuRegistry> {
        &self.registry
    }

    pub fn controller(&self) -> &Arc<GatewayController> {
        &self.controller
    }

    /// Producer handle for injecting envelopes into the router
    pub fn router(&self) -> &RouterHandle {
        &self.router
    }

    pub fn firmware(&self) -> &FirmwareManager {
        &self.firmware
    }

    pub fn keys(&self) -> Option<&KeyService> {
        self.keys.as_ref()
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.router.stats()
    }

    /// Start a firmware update session for `ecu`
    pub fn start_update(
        &self,
        ecu: EcuId,
        image: &str,
        secure: bool,
    ) -> Result<UpdateHandle, GatewayError> {
        self.firmware.start(ecu, image, secure)
    }

    pub fn print_registry(&self, console: &dyn Console) {
        self.controller.print_registry(console);
    }

    /// Stop the background tasks and persist every ECU record
    pub async fn shutdown(self) -> Result<usize, GatewayError> {
        for task in &self.tasks {
            task.abort();
        }
        let stored = self.registry.store_to(self.storage.as_ref()).await?;
        info!(stored, "Gateway stopped");
        Ok(stored)
    }
}

/// Create the key service for the configured secure element
pub fn create_key_service(config: &SheConfig) -> Result<KeyService, ConfigError> {
    let element = match &config.element {
        ElementConfig::Emulated(e) => {
            SoftSecureElement::new(e.uid()?).with_latency(Duration::from_millis(e.latency_ms))
        }
    };
    Ok(KeyService::new(Arc::new(element), config.command_timeout()))
}

/// Load the configured master key and slot keys
///
/// Returns the number of slot keys loaded. Without a master key nothing
/// is provisioned.
pub async fn provision_keys(keys: &KeyService, config: &SheConfig) -> Result<usize, GatewayError> {
    let Some(master) = config.master_key()? else {
        return Ok(0);
    };
    let counter = keys.set_auth_key(&master).await?;
    info!(counter, "Master key loaded");

    for entry in &config.keys {
        let key = entry.key()?;
        keys.load_key_with_flags(entry.slot, &key, entry.counter, entry.flags)
            .await?;
        info!(slot = %entry.slot, counter = entry.counter, "Key provisioned");
    }
    Ok(config.keys.len())
}

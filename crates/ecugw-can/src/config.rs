//! Gateway configuration
//!
//! The ECU list and routing table that a firmware image would normally
//! bake into global tables are loaded from TOML at startup and passed to
//! each component explicitly.
//!
//! ```toml
//! [[ecus]]
//! protocol = "can-fd"
//! interface = 0
//! secure = true
//!
//! [[routes]]
//! index = 0
//! label = "wheel_speed"
//! destinations = [1, 2]
//!
//! [firmware]
//! ack_timeout_ms = 1000
//! update_key = "key_1"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ecugw_core::{EcuId, EcuRecord, EcuRegistry, Endianness, Protocol, RouteEntry, RoutingTable};
use ecugw_she::{Key128, KeyFlags, KeySlot, UID_LEN};

use crate::error::ConfigError;

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// ECUs in registry order; the position is the ECU id
    #[serde(default)]
    pub ecus: Vec<EcuConfig>,
    /// Data-message routing descriptors
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub firmware: FirmwareConfig,
    #[serde(default)]
    pub she: SheConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl GatewayConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ecus.is_empty() {
            return Err(ConfigError::Invalid("At least one ECU is required".into()));
        }
        if self.ecus.len() > usize::from(u8::MAX) + 1 {
            return Err(ConfigError::Invalid(format!(
                "Too many ECUs: {} (max 256)",
                self.ecus.len()
            )));
        }
        if self.router.queue_depth == 0
            || self.controller.queue_depth == 0
            || self.firmware.session_queue == 0
        {
            return Err(ConfigError::Invalid("Queue depths must be non-zero".into()));
        }
        if let TransportConfig::Mock(mock) = &self.transport {
            if let Some((id, ecu)) = self
                .ecus
                .iter()
                .enumerate()
                .find(|(_, e)| e.interface >= mock.interfaces)
            {
                return Err(ConfigError::Invalid(format!(
                    "ECU {} uses interface {} but only {} are configured",
                    id, ecu.interface, mock.interfaces
                )));
            }
        }
        self.build_routing()?;
        self.she.validate()?;
        Ok(())
    }

    /// Registry populated with the configured defaults
    pub fn build_registry(&self) -> EcuRegistry {
        EcuRegistry::new(self.ecus.iter().map(EcuConfig::to_record).collect())
    }

    /// Dense routing table; rejects gaps, duplicates and unknown ECUs
    pub fn build_routing(&self) -> Result<RoutingTable, ConfigError> {
        let indexed = self
            .routes
            .iter()
            .map(|r| {
                (
                    r.index,
                    RouteEntry {
                        label: r.label.clone(),
                        destinations: r.destinations.clone(),
                    },
                )
            })
            .collect();
        RoutingTable::from_indexed(indexed, self.ecus.len())
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// One ECU entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcuConfig {
    pub protocol: Protocol,
    pub interface: u8,
    #[serde(default)]
    pub endianness: Endianness,
    /// ECU supports secure (encrypted) firmware updates
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub firmware_version: u32,
}

impl EcuConfig {
    pub fn to_record(&self) -> EcuRecord {
        let mut record = EcuRecord::new(self.protocol, self.interface);
        record.endianness = self.endianness;
        record.secure_capable = self.secure;
        record.firmware_version = self.firmware_version;
        record
    }
}

/// One routing descriptor with its explicit index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub index: u32,
    pub label: String,
    #[serde(default)]
    pub destinations: Vec<EcuId>,
}

/// PDU router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Router inbound queue depth
    #[serde(default = "default_router_queue")]
    pub queue_depth: usize,
    /// Timeout for one forwarded frame
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_router_queue() -> usize {
    64
}

fn default_send_timeout_ms() -> u64 {
    100
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_router_queue(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl RouterConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Gateway controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_controller_queue")]
    pub queue_depth: usize,
    /// Status polling period
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Pause between two polled ECUs
    #[serde(default = "default_inter_ecu_delay_ms")]
    pub inter_ecu_delay_ms: u64,
    /// Persist a record whenever an ECU response changes it
    #[serde(default = "default_true")]
    pub auto_persist: bool,
}

fn default_controller_queue() -> usize {
    32
}

fn default_heartbeat_ms() -> u64 {
    1000
}

fn default_inter_ecu_delay_ms() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_controller_queue(),
            heartbeat_ms: default_heartbeat_ms(),
            inter_ecu_delay_ms: default_inter_ecu_delay_ms(),
            auto_persist: true,
        }
    }
}

impl ControllerConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn inter_ecu_delay(&self) -> Duration {
        Duration::from_millis(self.inter_ecu_delay_ms)
    }
}

/// Firmware update configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Wait for each handshake response / frame ACK
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Per-session inbound queue depth
    #[serde(default = "default_session_queue")]
    pub session_queue: usize,
    /// Key slot used to encrypt chunks and authenticate headers
    #[serde(default = "default_update_key")]
    pub update_key: KeySlot,
    /// Check the image header record before starting
    #[serde(default = "default_true")]
    pub verify_header: bool,
}

fn default_ack_timeout_ms() -> u64 {
    1000
}

fn default_session_queue() -> usize {
    8
}

fn default_update_key() -> KeySlot {
    KeySlot::User(1)
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            session_queue: default_session_queue(),
            update_key: default_update_key(),
            verify_header: true,
        }
    }
}

impl FirmwareConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Secure element and key provisioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheConfig {
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Master ECU key (hex), bootstrapped at startup when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,
    /// Keys provisioned at startup
    #[serde(default)]
    pub keys: Vec<ProvisionedKey>,
    #[serde(default)]
    pub element: ElementConfig,
}

fn default_command_timeout_ms() -> u64 {
    500
}

impl Default for SheConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            master_key: None,
            keys: Vec::new(),
            element: ElementConfig::default(),
        }
    }
}

impl SheConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn master_key(&self) -> Result<Option<Key128>, ConfigError> {
        self.master_key
            .as_deref()
            .map(|k| Key128::from_hex(k).map_err(|e| ConfigError::Invalid(format!("master_key: {}", e))))
            .transpose()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.master_key()?;
        if !self.keys.is_empty() && self.master_key.is_none() {
            return Err(ConfigError::Invalid(
                "Provisioned keys require she.master_key".into(),
            ));
        }
        for key in &self.keys {
            key.key()?;
            if key.slot == KeySlot::Master || key.slot == KeySlot::Ram {
                return Err(ConfigError::Invalid(format!(
                    "Slot {} cannot be provisioned from [[she.keys]]",
                    key.slot
                )));
            }
        }
        match &self.element {
            ElementConfig::Emulated(e) => {
                e.uid()?;
            }
        }
        Ok(())
    }
}

/// A key loaded into a slot at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedKey {
    pub slot: KeySlot,
    /// Key value (hex)
    pub key: String,
    pub counter: u32,
    #[serde(default)]
    pub flags: KeyFlags,
}

impl ProvisionedKey {
    pub fn key(&self) -> Result<Key128, ConfigError> {
        Key128::from_hex(&self.key).map_err(|e| ConfigError::Invalid(format!("{}: {}", self.slot, e)))
    }
}

/// Secure element selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ElementConfig {
    /// In-process software emulation
    Emulated(EmulatedElementConfig),
}

impl Default for ElementConfig {
    fn default() -> Self {
        Self::Emulated(EmulatedElementConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatedElementConfig {
    /// 15-byte UID (hex)
    #[serde(default = "default_uid")]
    pub uid: String,
    /// Simulated per-command latency
    #[serde(default)]
    pub latency_ms: u64,
}

fn default_uid() -> String {
    "000000000000000000000000000001".to_string()
}

impl Default for EmulatedElementConfig {
    fn default() -> Self {
        Self {
            uid: default_uid(),
            latency_ms: 0,
        }
    }
}

impl EmulatedElementConfig {
    pub fn uid(&self) -> Result<[u8; UID_LEN], ConfigError> {
        let bytes = hex::decode(&self.uid)
            .map_err(|e| ConfigError::Invalid(format!("Element UID: {}", e)))?;
        bytes
            .try_into()
            .map_err(|_| ConfigError::Invalid("Element UID must be 15 bytes".into()))
    }
}

/// Channel adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Raw CAN FD via SocketCAN (Linux only)
    SocketCan(SocketCanConfig),
    /// Mock channel for testing
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// SocketCAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// Interface names; the position is the physical interface index
    pub interfaces: Vec<String>,
    /// Receive broadcast buffer
    #[serde(default = "default_rx_buffer")]
    pub rx_buffer: usize,
}

fn default_rx_buffer() -> usize {
    1024
}

/// Mock channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockConfig {
    /// Number of simulated physical interfaces
    #[serde(default = "default_mock_interfaces")]
    pub interfaces: u8,
    /// Simulated send latency
    #[serde(default)]
    pub latency_ms: u64,
}

fn default_mock_interfaces() -> u8 {
    4
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            interfaces: default_mock_interfaces(),
            latency_ms: 0,
        }
    }
}

/// Persistent storage location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[ecus]]
        protocol = "can-fd"
        interface = 0
        secure = true

        [[ecus]]
        protocol = "lin"
        interface = 1
        endianness = "little"
        firmware_version = 7

        [[routes]]
        index = 1
        label = "door_state"
        destinations = [0]

        [[routes]]
        index = 0
        label = "wheel_speed"
        destinations = [0, 1]

        [firmware]
        ack_timeout_ms = 250
        update_key = "key_2"

        [she]
        master_key = "000102030405060708090a0b0c0d0e0f"

        [[she.keys]]
        slot = "key_2"
        key = "0f0e0d0c0b0a09080706050403020100"
        counter = 1
    "#;

    #[test]
    fn test_parse_sample() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.ecus.len(), 2);
        assert_eq!(config.router.queue_depth, 64);
        assert_eq!(config.controller.heartbeat_period(), Duration::from_secs(1));
        assert_eq!(config.firmware.ack_timeout(), Duration::from_millis(250));
        assert_eq!(config.firmware.update_key, KeySlot::User(2));
        assert!(matches!(config.transport, TransportConfig::Mock(_)));

        let routing = config.build_routing().unwrap();
        assert_eq!(routing.lookup(0).unwrap().label, "wheel_speed");

        let registry = config.build_registry();
        let lin = registry.get(EcuId(1)).unwrap();
        assert_eq!(lin.endianness, Endianness::Little);
        assert_eq!(lin.firmware_version, 7);
        assert!(registry.get(EcuId(0)).unwrap().secure_capable);
    }

    #[test]
    fn test_route_gap_rejected() {
        let text = r#"
            [[ecus]]
            protocol = "can"
            interface = 0

            [[routes]]
            index = 1
            label = "orphan"
        "#;
        assert!(matches!(
            GatewayConfig::from_toml_str(text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_destination_rejected() {
        let text = r#"
            [[ecus]]
            protocol = "can"
            interface = 0

            [[routes]]
            index = 0
            label = "x"
            destinations = [3]
        "#;
        assert!(GatewayConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_interface_out_of_range() {
        let text = r#"
            [[ecus]]
            protocol = "ethernet"
            interface = 9
        "#;
        assert!(GatewayConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_keys_need_master() {
        let text = r#"
            [[ecus]]
            protocol = "can"
            interface = 0

            [[she.keys]]
            slot = "key_1"
            key = "00000000000000000000000000000000"
            counter = 1
        "#;
        assert!(GatewayConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config =
            GatewayConfig::from_toml_str(include_str!("../../../config/gateway.toml")).unwrap();
        assert_eq!(config.ecus.len(), 4);
        assert_eq!(config.she.keys[0].slot, KeySlot::User(1));
        assert!(config.build_routing().unwrap().lookup(2).unwrap().destinations.is_empty());
    }

    #[test]
    fn test_socketcan_transport() {
        let text = r#"
            [[ecus]]
            protocol = "can"
            interface = 1

            [transport]
            type = "socketcan"
            interfaces = ["can0", "can1"]
        "#;
        let config = GatewayConfig::from_toml_str(text).unwrap();
        match config.transport {
            TransportConfig::SocketCan(c) => assert_eq!(c.interfaces, vec!["can0", "can1"]),
            other => panic!("unexpected transport {:?}", other),
        }
    }
}

//! ecugw-can - Gateway runtime for the ECU gateway
//!
//! - [`router`]: classifies every inbound envelope and dispatches it
//! - [`controller`]: keeps the ECU registry current and polls ECUs
//! - [`firmware`]: per-ECU firmware update sessions
//! - [`receiver`]: decodes adapter frames into the router queue
//! - [`transport`]: channel adapters (SocketCAN, mock)
//! - [`gateway`]: assembles the above from a [`GatewayConfig`]

pub mod config;
pub mod controller;
pub mod error;
pub mod firmware;
pub mod gateway;
pub mod receiver;
pub mod router;
pub mod transport;

pub use config::GatewayConfig;
pub use controller::GatewayController;
pub use error::{ConfigError, UpdateError};
pub use firmware::{FirmwareManager, SessionState, SessionTable, UpdateHandle, UpdateReport};
pub use gateway::{create_key_service, provision_keys, Gateway};
pub use receiver::spawn_receiver;
pub use router::{Delivery, DropReason, PduRouter, RouterHandle, RouterStats, RouterStatsSnapshot};
pub use transport::{create_channel, ChannelAdapter, RawFrame, TransportError};

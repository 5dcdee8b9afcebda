//! Channel adapter trait and raw frame type

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use super::TransportError;

/// Frame as seen on a physical interface, before decoding
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Physical interface index
    pub interface: u8,
    /// Extended (29-bit) identifier
    pub id: u32,
    pub data: Bytes,
    pub timestamp: Instant,
}

impl RawFrame {
    pub fn new(interface: u8, id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            interface,
            id,
            data: data.into(),
            timestamp: Instant::now(),
        }
    }
}

/// Interface to the vehicle networks
///
/// One adapter serves every physical interface; frames are addressed by
/// interface index and extended id.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Transmit one frame
    async fn send(&self, interface: u8, id: u32, data: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to received frames from all interfaces
    fn subscribe(&self) -> broadcast::Receiver<RawFrame>;

    /// Check if the adapter can still transmit
    async fn is_connected(&self) -> bool;
}

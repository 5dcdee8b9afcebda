//! Mock channel adapter for testing
//!
//! Records every transmitted frame and republishes it on an "outgoing"
//! broadcast so a test can script an ECU that reacts to gateway traffic.
//! Frames "from the bus" are pushed in with [`MockChannel::inject`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{ChannelAdapter, RawFrame, TransportError};
use crate::config::MockConfig;
use ecugw_core::MAX_PAYLOAD;

pub struct MockChannel {
    config: MockConfig,
    connected: AtomicBool,
    incoming_tx: broadcast::Sender<RawFrame>,
    outgoing_tx: broadcast::Sender<RawFrame>,
    sent: Mutex<Vec<RawFrame>>,
}

impl MockChannel {
    pub fn new(config: &MockConfig) -> Self {
        let (incoming_tx, _) = broadcast::channel(1024);
        let (outgoing_tx, _) = broadcast::channel(1024);
        Self {
            config: config.clone(),
            connected: AtomicBool::new(true),
            incoming_tx,
            outgoing_tx,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Simulate a frame arriving on `interface`
    pub fn inject(&self, interface: u8, id: u32, data: &[u8]) {
        let _ = self
            .incoming_tx
            .send(RawFrame::new(interface, id, data.to_vec()));
    }

    /// Frames transmitted by the gateway, in order
    pub fn sent(&self) -> Vec<RawFrame> {
        self.sent.lock().clone()
    }

    /// Frames transmitted with a given id
    pub fn sent_with_id(&self, id: u32) -> Vec<RawFrame> {
        self.sent.lock().iter().filter(|f| f.id == id).cloned().collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Subscribe to frames as the gateway transmits them
    pub fn subscribe_sent(&self) -> broadcast::Receiver<RawFrame> {
        self.outgoing_tx.subscribe()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelAdapter for MockChannel {
    async fn send(&self, interface: u8, id: u32, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if interface >= self.config.interfaces {
            return Err(TransportError::UnknownInterface(interface));
        }
        if data.len() > MAX_PAYLOAD {
            return Err(TransportError::FrameTooLong(data.len()));
        }

        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        let frame = RawFrame::new(interface, id, data.to_vec());
        tracing::debug!(interface, id = format_args!("0x{:08X}", id), len = data.len(), "Mock channel: sent frame");
        self.sent.lock().push(frame.clone());
        let _ = self.outgoing_tx.send(frame);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RawFrame> {
        self.incoming_tx.subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_is_recorded_and_published() {
        let mock = MockChannel::new(&MockConfig::default());
        let mut out = mock.subscribe_sent();
        mock.send(1, 0x0100_0002, &[9, 8]).await.unwrap();

        let frame = out.recv().await.unwrap();
        assert_eq!(frame.interface, 1);
        assert_eq!(&frame.data[..], &[9, 8]);
        assert_eq!(mock.sent_with_id(0x0100_0002).len(), 1);
    }

    #[tokio::test]
    async fn test_send_rejects_unknown_interface_and_disconnect() {
        let mock = MockChannel::new(&MockConfig {
            interfaces: 2,
            latency_ms: 0,
        });
        assert_eq!(
            mock.send(2, 1, &[]).await,
            Err(TransportError::UnknownInterface(2))
        );
        mock.set_connected(false);
        assert_eq!(mock.send(0, 1, &[]).await, Err(TransportError::ConnectionClosed));
        assert!(mock.sent().is_empty());
    }

    #[tokio::test]
    async fn test_inject_reaches_subscribers() {
        let mock = MockChannel::new(&MockConfig::default());
        let mut rx = mock.subscribe();
        mock.inject(0, 0x0100_0000, &[1]);
        assert_eq!(rx.recv().await.unwrap().id, 0x0100_0000);
    }
}

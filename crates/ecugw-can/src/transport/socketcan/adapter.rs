//! Raw CAN FD sockets, one per physical interface

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socketcan::{CanAnyFrame, CanFdFrame, CanFdSocket, EmbeddedFrame, ExtendedId, Frame, Socket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SocketCanConfig;
use crate::transport::{ChannelAdapter, RawFrame, TransportError};

struct Interface {
    name: String,
    socket: Arc<Mutex<CanFdSocket>>,
}

/// SocketCAN adapter carrying 29-bit CAN FD frames
pub struct SocketCanChannel {
    interfaces: Vec<Interface>,
    connected: Arc<AtomicBool>,
    incoming_tx: broadcast::Sender<RawFrame>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketCanChannel {
    pub fn open(config: &SocketCanConfig) -> Result<Self, TransportError> {
        if config.interfaces.is_empty() {
            return Err(TransportError::InvalidConfig(
                "No CAN interfaces configured".to_string(),
            ));
        }

        let mut interfaces = Vec::with_capacity(config.interfaces.len());
        for name in &config.interfaces {
            let socket = CanFdSocket::open(name).map_err(|e| {
                TransportError::ConnectionFailed(format!(
                    "Failed to open CAN FD socket on {}: {}",
                    name, e
                ))
            })?;
            socket.set_nonblocking(true).map_err(|e| {
                TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e))
            })?;
            interfaces.push(Interface {
                name: name.clone(),
                socket: Arc::new(Mutex::new(socket)),
            });
        }

        let (incoming_tx, _) = broadcast::channel(config.rx_buffer);
        let channel = Self {
            interfaces,
            connected: Arc::new(AtomicBool::new(true)),
            incoming_tx,
            listeners: Mutex::new(Vec::new()),
        };
        channel.start_listeners();
        Ok(channel)
    }

    fn start_listeners(&self) {
        let mut listeners = self.listeners.lock();
        for (index, iface) in self.interfaces.iter().enumerate() {
            let socket = iface.socket.clone();
            let incoming_tx = self.incoming_tx.clone();
            let connected = self.connected.clone();
            let name = iface.name.clone();
            let interface = index as u8;

            let handle = tokio::task::spawn_blocking(move || {
                while connected.load(Ordering::SeqCst) {
                    let result = socket.lock().read_frame();
                    match result {
                        Ok(frame) => {
                            let (id, data) = match &frame {
                                CanAnyFrame::Normal(f) => (f.raw_id(), f.data().to_vec()),
                                CanAnyFrame::Fd(f) => (f.raw_id(), f.data().to_vec()),
                                _ => continue,
                            };
                            let _ = incoming_tx.send(RawFrame::new(interface, id, data));
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        Err(e) => {
                            tracing::error!(interface = %name, ?e, "SocketCAN read error");
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
                tracing::debug!(interface = %name, "SocketCAN listener stopped");
            });
            listeners.push(handle);
        }
    }
}

impl Drop for SocketCanChannel {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelAdapter for SocketCanChannel {
    async fn send(&self, interface: u8, id: u32, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        let iface = self
            .interfaces
            .get(usize::from(interface))
            .ok_or(TransportError::UnknownInterface(interface))?;

        let ext_id = ExtendedId::new(id).ok_or_else(|| {
            TransportError::SendFailed(format!("Invalid extended CAN ID: 0x{:X}", id))
        })?;
        let frame =
            CanFdFrame::new(ext_id, data).ok_or(TransportError::FrameTooLong(data.len()))?;

        iface.socket.lock().write_frame(&frame).map_err(|e| {
            TransportError::SendFailed(format!("Write on {} failed: {}", iface.name, e))
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<RawFrame> {
        self.incoming_tx.subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

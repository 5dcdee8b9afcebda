//! Channel adapters between the gateway and its physical interfaces
//!
//! Frames are addressed by interface index and 29-bit id. Two adapters
//! exist: raw CAN FD over SocketCAN (Linux, `socketcan` feature) and an
//! in-process mock used by tests and the demo setup.
//!
//! ```ignore
//! let channel = create_channel(&TransportConfig::Mock(MockConfig::default())).await?;
//! let mut frames = channel.subscribe();
//! channel.send(1, PduId::command(EcuId(2), 4).raw(), &[]).await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::{ChannelAdapter, RawFrame};
pub use error::TransportError;

use std::sync::Arc;

use tracing::info;

use crate::config::TransportConfig;

/// Open the adapter selected in `[transport]`
pub async fn create_channel(
    config: &TransportConfig,
) -> Result<Arc<dyn ChannelAdapter>, TransportError> {
    let channel: Arc<dyn ChannelAdapter> = match config {
        TransportConfig::Mock(mock) => Arc::new(mock::MockChannel::new(mock)),
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(can) => Arc::new(socketcan::SocketCanChannel::open(can)?),
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(can) => {
            return Err(TransportError::Unsupported(format!(
                "Cannot open {:?}: built without SocketCAN support",
                can.interfaces
            )))
        }
    };
    info!(transport = config_kind(config), "Channel adapter ready");
    Ok(channel)
}

fn config_kind(config: &TransportConfig) -> &'static str {
    match config {
        TransportConfig::Mock(_) => "mock",
        TransportConfig::SocketCan(_) => "socketcan",
    }
}

//! Inbound frame pump
//!
//! Decodes frames from the channel adapter into envelopes and hands them to
//! the router queue without waiting. Undecodable frames are counted and
//! dropped here.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ecugw_core::Pdu;

use crate::router::RouterHandle;
use crate::transport::ChannelAdapter;

/// Spawn the task feeding received frames into the router
///
/// The task ends when the adapter closes its frame stream.
pub fn spawn_receiver(channel: Arc<dyn ChannelAdapter>, router: RouterHandle) -> JoinHandle<()> {
    let mut frames = channel.subscribe();
    tokio::spawn(async move {
        loop {
            let frame = match frames.recv().await {
                Ok(frame) => frame,
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "Receiver lagging, frames lost");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let pdu = match Pdu::from_frame(frame.interface, frame.id, &frame.data) {
                Ok(pdu) => pdu,
                Err(e) => {
                    debug!(interface = frame.interface, id = frame.id, error = %e, "Undecodable frame");
                    router.stats_ref().record_malformed();
                    continue;
                }
            };

            // A full queue is counted by the handle
            let _ = router.try_submit(pdu);
        }
        info!("Channel closed, receiver stopped");
    })
}

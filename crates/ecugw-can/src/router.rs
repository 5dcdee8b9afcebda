//! PDU router
//!
//! Every envelope that enters the gateway takes exactly one path:
//!
//! - data: the index selects a routing table entry and the payload is sent
//!   to every listed destination ECU on that ECU's interface
//! - command: handed to the gateway controller's queue
//! - firmware: handed to the queue of the target ECU's active session
//!
//! Queues are bounded and never waited on. A full queue drops the
//! envelope and counts it; retrying is left to higher layers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use ecugw_core::{EcuId, EcuRegistry, GatewayError, MessageKind, Pdu, RoutingTable};

use crate::config::RouterConfig;
use crate::firmware::SessionTable;
use crate::transport::ChannelAdapter;

/// Why an envelope was not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Data index without a table entry, or entry without destinations
    Unrouted,
    /// Id could not be decoded or names an unknown ECU
    Malformed,
    /// Consumer queue full
    QueueFull,
    /// Firmware message for an ECU without an active session
    NoSession,
    /// Every destination send failed
    SendFailed,
}

/// Result of routing one envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Payload sent to this many destinations
    Forwarded { destinations: usize },
    ToController,
    ToSession(EcuId),
    Dropped(DropReason),
}

/// Router counters
#[derive(Debug, Default)]
pub struct RouterStats {
    received: AtomicU64,
    forwarded: AtomicU64,
    to_controller: AtomicU64,
    to_session: AtomicU64,
    unrouted: AtomicU64,
    malformed: AtomicU64,
    queue_full: AtomicU64,
    no_session: AtomicU64,
    send_failed: AtomicU64,
}

/// Point-in-time copy of [`RouterStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStatsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub to_controller: u64,
    pub to_session: u64,
    pub unrouted: u64,
    pub malformed: u64,
    pub queue_full: u64,
    pub no_session: u64,
    pub send_failed: u64,
}

impl RouterStatsSnapshot {
    /// Envelopes dropped for any reason
    pub fn dropped(&self) -> u64 {
        self.unrouted + self.malformed + self.queue_full + self.no_session + self.send_failed
    }
}

impl RouterStats {
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            to_controller: self.to_controller.load(Ordering::Relaxed),
            to_session: self.to_session.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            no_session: self.no_session.load(Ordering::Relaxed),
            send_failed: self.send_failed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, delivery: Delivery) {
        let counter = match delivery {
            Delivery::Forwarded { .. } => &self.forwarded,
            Delivery::ToController => &self.to_controller,
            Delivery::ToSession(_) => &self.to_session,
            Delivery::Dropped(DropReason::Unrouted) => &self.unrouted,
            Delivery::Dropped(DropReason::Malformed) => &self.malformed,
            Delivery::Dropped(DropReason::QueueFull) => &self.queue_full,
            Delivery::Dropped(DropReason::NoSession) => &self.no_session,
            Delivery::Dropped(DropReason::SendFailed) => &self.send_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Producer side of the router queue
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<Pdu>,
    stats: Arc<RouterStats>,
}

impl RouterHandle {
    /// Queue an envelope without waiting
    ///
    /// On a full queue the envelope is dropped here and counted.
    pub fn try_submit(&self, pdu: Pdu) -> Result<(), GatewayError> {
        match self.tx.try_send(pdu) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(pdu)) => {
                self.stats.record_queue_full();
                warn!(id = %pdu.id(), "Router queue full, dropping envelope");
                Err(GatewayError::Resource("Router queue full".into()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(GatewayError::Resource("Router stopped".into()))
            }
        }
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_ref(&self) -> &Arc<RouterStats> {
        &self.stats
    }
}

/// Classifies and dispatches envelopes
pub struct PduRouter {
    routes: Arc<RoutingTable>,
    registry: Arc<EcuRegistry>,
    channel: Arc<dyn ChannelAdapter>,
    controller_tx: mpsc::Sender<Pdu>,
    sessions: Arc<SessionTable>,
    stats: Arc<RouterStats>,
    send_timeout: Duration,
}

impl PduRouter {
    pub fn new(
        routes: Arc<RoutingTable>,
        registry: Arc<EcuRegistry>,
        channel: Arc<dyn ChannelAdapter>,
        controller_tx: mpsc::Sender<Pdu>,
        sessions: Arc<SessionTable>,
        config: &RouterConfig,
    ) -> Self {
        Self {
            routes,
            registry,
            channel,
            controller_tx,
            sessions,
            stats: Arc::new(RouterStats::default()),
            send_timeout: config.send_timeout(),
        }
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Route one envelope, consuming it
    pub async fn submit(&self, pdu: Pdu) -> Delivery {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let delivery = match pdu.id().kind() {
            Err(e) => {
                debug!(error = %e, "Dropping undecodable envelope");
                Delivery::Dropped(DropReason::Malformed)
            }
            Ok(MessageKind::Data { index }) => self.forward_data(index, pdu).await,
            Ok(MessageKind::Command { ecu, .. }) => {
                if !self.registry.contains(ecu) {
                    debug!(%ecu, "Command for unknown ECU dropped");
                    Delivery::Dropped(DropReason::Malformed)
                } else {
                    Self::enqueue(&self.controller_tx, pdu, Delivery::ToController)
                }
            }
            Ok(MessageKind::Firmware { ecu, .. }) => self.to_session(ecu, pdu),
        };
        self.stats.record(delivery);
        delivery
    }

    async fn forward_data(&self, index: usize, pdu: Pdu) -> Delivery {
        let Some(entry) = self.routes.lookup(index) else {
            debug!(index, "No route for data message");
            return Delivery::Dropped(DropReason::Unrouted);
        };
        if entry.destinations.is_empty() {
            return Delivery::Dropped(DropReason::Unrouted);
        }

        let id = pdu.id().raw();
        let payload = pdu.into_payload();
        let mut delivered = 0;
        for &ecu in &entry.destinations {
            let interface = match self.registry.get(ecu) {
                Ok(record) => record.interface,
                Err(e) => {
                    warn!(route = %entry.label, error = %e, "Route destination missing");
                    continue;
                }
            };
            match tokio::time::timeout(self.send_timeout, self.channel.send(interface, id, &payload))
                .await
            {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(route = %entry.label, %ecu, error = %e, "Forward failed");
                }
                Err(_) => {
                    warn!(route = %entry.label, %ecu, "Forward timed out");
                }
            }
        }

        if delivered == 0 {
            Delivery::Dropped(DropReason::SendFailed)
        } else {
            Delivery::Forwarded {
                destinations: delivered,
            }
        }
    }

    fn to_session(&self, ecu: EcuId, pdu: Pdu) -> Delivery {
        match self.sessions.sender(ecu) {
            Some(tx) => Self::enqueue(&tx, pdu, Delivery::ToSession(ecu)),
            None => {
                error!(%ecu, id = %pdu.id(), "Firmware message without an active session");
                Delivery::Dropped(DropReason::NoSession)
            }
        }
    }

    fn enqueue(tx: &mpsc::Sender<Pdu>, pdu: Pdu, delivered: Delivery) -> Delivery {
        match tx.try_send(pdu) {
            Ok(()) => delivered,
            Err(TrySendError::Full(pdu)) => {
                warn!(id = %pdu.id(), "Consumer queue full, dropping envelope");
                Delivery::Dropped(DropReason::QueueFull)
            }
            Err(TrySendError::Closed(pdu)) => {
                warn!(id = %pdu.id(), "Consumer gone, dropping envelope");
                Delivery::Dropped(DropReason::NoSession)
            }
        }
    }

    /// Run the router loop on its own task
    pub fn spawn(self, queue_depth: usize) -> (RouterHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Pdu>(queue_depth);
        let handle = RouterHandle {
            tx,
            stats: self.stats.clone(),
        };
        let task = tokio::spawn(async move {
            while let Some(pdu) = rx.recv().await {
                self.submit(pdu).await;
            }
            debug!("Router queue closed, router stopped");
        });
        (handle, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::MockChannel;
    use ecugw_core::{EcuRecord, PduId, Protocol, RouteEntry};

    struct Fixture {
        router: PduRouter,
        channel: Arc<MockChannel>,
        controller_rx: mpsc::Receiver<Pdu>,
        sessions: Arc<SessionTable>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(EcuRegistry::new(vec![
            EcuRecord::new(Protocol::Can, 0),
            EcuRecord::new(Protocol::CanFd, 1),
            EcuRecord::new(Protocol::Lin, 2),
        ]));
        let routes = Arc::new(RoutingTable::new(vec![
            RouteEntry {
                label: "wheel_speed".into(),
                destinations: vec![EcuId(1), EcuId(2)],
            },
            RouteEntry {
                label: "unused".into(),
                destinations: vec![],
            },
        ]));
        let channel = Arc::new(MockChannel::new(&MockConfig::default()));
        let (controller_tx, controller_rx) = mpsc::channel(1);
        let sessions = Arc::new(SessionTable::new());
        let router = PduRouter::new(
            routes,
            registry,
            channel.clone(),
            controller_tx,
            sessions.clone(),
            &RouterConfig::default(),
        );
        Fixture {
            router,
            channel,
            controller_rx,
            sessions,
        }
    }

    #[tokio::test]
    async fn test_data_fan_out_exact_payload() {
        let fx = fixture();
        let id = PduId::data(0).unwrap();
        let pdu = Pdu::new(id, vec![1, 2, 3, 4]).unwrap();

        assert_eq!(
            fx.router.submit(pdu).await,
            Delivery::Forwarded { destinations: 2 }
        );
        let sent = fx.channel.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].interface, 1);
        assert_eq!(sent[1].interface, 2);
        for frame in &sent {
            assert_eq!(frame.id, id.raw());
            assert_eq!(&frame.data[..], &[1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn test_unrouted_data_forwards_nothing() {
        let fx = fixture();
        for index in [1, 5] {
            let pdu = Pdu::new(PduId::data(index).unwrap(), vec![9]).unwrap();
            assert_eq!(
                fx.router.submit(pdu).await,
                Delivery::Dropped(DropReason::Unrouted)
            );
        }
        assert!(fx.channel.sent().is_empty());
        assert_eq!(fx.router.stats().unrouted, 2);
    }

    #[tokio::test]
    async fn test_command_goes_to_controller_until_full() {
        let mut fx = fixture();
        let id = PduId::command(EcuId(0), 4);

        let first = Pdu::new(id, vec![0]).unwrap();
        assert_eq!(fx.router.submit(first).await, Delivery::ToController);
        let second = Pdu::new(id, vec![1]).unwrap();
        assert_eq!(
            fx.router.submit(second).await,
            Delivery::Dropped(DropReason::QueueFull)
        );
        assert_eq!(fx.controller_rx.recv().await.unwrap().payload(), &[0]);
        assert_eq!(fx.router.stats().queue_full, 1);
    }

    #[tokio::test]
    async fn test_command_for_unknown_ecu_is_malformed() {
        let fx = fixture();
        let pdu = Pdu::new(PduId::command(EcuId(9), 4), vec![]).unwrap();
        assert_eq!(
            fx.router.submit(pdu).await,
            Delivery::Dropped(DropReason::Malformed)
        );
    }

    #[tokio::test]
    async fn test_firmware_requires_session() {
        let fx = fixture();
        let id = PduId::firmware(EcuId(1), 0x80);
        let pdu = Pdu::new(id, vec![0xA1]).unwrap();
        assert_eq!(
            fx.router.submit(pdu).await,
            Delivery::Dropped(DropReason::NoSession)
        );

        let (tx, mut rx) = mpsc::channel(2);
        let _slot = fx.sessions.claim(EcuId(1), tx).unwrap();
        let pdu = Pdu::new(id, vec![0xA1]).unwrap();
        assert_eq!(fx.router.submit(pdu).await, Delivery::ToSession(EcuId(1)));
        assert_eq!(rx.recv().await.unwrap().payload(), &[0xA1]);
    }

    #[tokio::test]
    async fn test_malformed_id_dropped_silently() {
        let fx = fixture();
        let pdu = Pdu::new(PduId::from_raw(0x0300_0000), vec![]).unwrap();
        assert_eq!(
            fx.router.submit(pdu).await,
            Delivery::Dropped(DropReason::Malformed)
        );
        assert_eq!(fx.router.stats().malformed, 1);
    }

    #[tokio::test]
    async fn test_spawned_router_handle() {
        let fx = fixture();
        let channel = fx.channel.clone();
        let (handle, _task) = fx.router.spawn(4);
        handle
            .try_submit(Pdu::new(PduId::data(0).unwrap(), vec![5]).unwrap())
            .unwrap();

        for _ in 0..100 {
            if handle.stats().forwarded == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.stats().forwarded, 1);
        assert_eq!(channel.sent().len(), 2);
    }
}

//! Frames injected on the mock bus flowing through receiver, router and
//! controller

use std::sync::Arc;
use std::time::Duration;

use ecugw_can::config::MockConfig;
use ecugw_can::transport::mock::MockChannel;
use ecugw_can::{ChannelAdapter, Gateway, GatewayConfig, RouterStatsSnapshot, SessionState};
use ecugw_core::firmware::{handshake, subtype};
use ecugw_core::{
    CommandOpcode, EcuId, EcuStatus, MemoryConsole, MemoryStorage, PduId, Storage,
};

const CONFIG: &str = r#"
[[ecus]]
protocol = "can"
interface = 0

[[ecus]]
protocol = "can-fd"
interface = 1

[[ecus]]
protocol = "can-fd"
interface = 2

[[routes]]
index = 0
label = "wheel_speed"
destinations = [1, 2]

[[routes]]
index = 1
label = "unused"

[controller]
heartbeat_ms = 60000

[firmware]
ack_timeout_ms = 100

[transport]
type = "mock"
"#;

async fn start() -> (Gateway, Arc<MockChannel>, Arc<MemoryStorage>) {
    start_with(CONFIG, MockConfig::default()).await
}

async fn start_with(
    config: &str,
    mock: MockConfig,
) -> (Gateway, Arc<MockChannel>, Arc<MemoryStorage>) {
    let config = GatewayConfig::from_toml_str(config).unwrap();
    let channel = Arc::new(MockChannel::new(&mock));
    let storage = Arc::new(MemoryStorage::new());
    let gateway = Gateway::start(
        &config,
        channel.clone() as Arc<dyn ChannelAdapter>,
        storage.clone() as Arc<dyn Storage>,
        None,
    )
    .await
    .unwrap();
    (gateway, channel, storage)
}

async fn wait_for_stats<F>(gateway: &Gateway, done: F) -> RouterStatsSnapshot
where
    F: Fn(&RouterStatsSnapshot) -> bool,
{
    for _ in 0..100 {
        let stats = gateway.stats();
        if done(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("router stats never settled: {:?}", gateway.stats());
}

#[tokio::test]
async fn data_frame_is_forwarded_to_each_destination() {
    let (gateway, channel, _) = start().await;
    let id = PduId::data(0).unwrap().raw();
    let before = channel.sent_with_id(id).len();

    channel.inject(0, id, &[0x12, 0x34]);
    wait_for_stats(&gateway, |s| s.forwarded == 1).await;

    let sent = channel.sent_with_id(id);
    assert_eq!(sent.len() - before, 2);
    let mut interfaces: Vec<u8> = sent.iter().map(|f| f.interface).collect();
    interfaces.sort_unstable();
    assert_eq!(interfaces, vec![1, 2]);
    assert!(sent.iter().all(|f| &f.data[..] == [0x12, 0x34]));
}

#[tokio::test]
async fn unroutable_and_malformed_frames_are_counted() {
    let (gateway, channel, _) = start().await;

    channel.inject(0, PduId::data(1).unwrap().raw(), &[1]);
    channel.inject(0, PduId::data(7).unwrap().raw(), &[1]);
    channel.inject(0, 0x0300_0000, &[1]);
    channel.inject(0, PduId::firmware(EcuId(1), subtype::RESPONSE).raw(), &[0xA1]);

    let stats = wait_for_stats(&gateway, |s| s.dropped() == 4).await;
    assert_eq!(stats.unrouted, 2);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.no_session, 1);
    assert_eq!(stats.forwarded, 0);
}

#[tokio::test]
async fn firmware_responses_only_reach_a_running_session() {
    let (gateway, channel, storage) = start().await;
    storage.add_image("app.bin", vec![0xAB; 48]);
    let response = |ecu: u8| PduId::firmware(EcuId(ecu), subtype::RESPONSE).raw();

    let handle = gateway.start_update(EcuId(1), "app.bin", false).unwrap();
    let mut states = handle.subscribe();
    tokio::time::timeout(
        Duration::from_secs(1),
        states.wait_for(|s| *s == SessionState::ResetSent),
    )
    .await
    .unwrap()
    .unwrap();

    channel.inject(2, response(2), &[handshake::RESET_ACK]);
    channel.inject(1, response(1), &[handshake::RESET_ACK]);
    wait_for_stats(&gateway, |s| s.to_session == 1 && s.no_session == 1).await;

    // Nobody answers BEGIN, so the session times out
    handle.wait().await.unwrap_err();
    channel.inject(1, response(1), &[handshake::BEGIN_ACK]);
    let stats = wait_for_stats(&gateway, |s| s.no_session == 2).await;
    assert_eq!(stats.to_session, 1);
    assert_eq!(stats.forwarded, 0);
}

#[tokio::test]
async fn slow_bus_overflows_router_queue() {
    let config = format!("{}\n[router]\nqueue_depth = 1\n", CONFIG);
    let (gateway, channel, _) = start_with(
        &config,
        MockConfig {
            latency_ms: 40,
            ..MockConfig::default()
        },
    )
    .await;
    let id = PduId::data(0).unwrap().raw();

    for i in 0..10u8 {
        channel.inject(0, id, &[i]);
    }
    let stats = wait_for_stats(&gateway, |s| s.forwarded + s.queue_full == 10).await;

    assert!(stats.queue_full >= 7, "{:?}", stats);
    assert!(stats.forwarded >= 1);
    assert_eq!(stats.dropped(), stats.queue_full);
    // Each forwarded envelope reaches both destinations
    assert_eq!(channel.sent_with_id(id).len() as u64, stats.forwarded * 2);
    // The first frame is never the one dropped
    assert!(channel.sent_with_id(id).iter().any(|f| &f.data[..] == [0]));
}

#[tokio::test]
async fn command_response_reaches_registry_and_storage() {
    let (gateway, channel, storage) = start().await;

    let id = PduId::command(EcuId(2), CommandOpcode::RequestStatus.into()).raw();
    channel.inject(2, id, &[1]);
    wait_for_stats(&gateway, |s| s.to_controller == 1).await;

    for _ in 0..100 {
        if gateway.registry().status(EcuId(2)).unwrap() == EcuStatus::Sleeping {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let record = gateway.registry().get(EcuId(2)).unwrap();
    assert_eq!(record.status, EcuStatus::Sleeping);
    assert_eq!(storage.record(EcuId(2)), Some(record.encode().to_vec()));

    let console = MemoryConsole::new();
    gateway.print_registry(&console);
    assert!(console.lines().iter().any(|l| l.contains("Sleeping")));
}

#[tokio::test]
async fn shutdown_persists_every_record() {
    let (gateway, _, storage) = start().await;
    gateway
        .registry()
        .set_status(EcuId(0), EcuStatus::Unresponsive)
        .unwrap();

    assert_eq!(gateway.shutdown().await.unwrap(), 3);
    assert!(storage.record(EcuId(1)).is_some());

    // A restarted gateway restores the stored records
    let config = GatewayConfig::from_toml_str(CONFIG).unwrap();
    let channel = Arc::new(MockChannel::new(&Default::default()));
    let restarted = Gateway::start(
        &config,
        channel as Arc<dyn ChannelAdapter>,
        storage.clone() as Arc<dyn Storage>,
        None,
    )
    .await
    .unwrap();
    assert_eq!(
        restarted.registry().status(EcuId(0)).unwrap(),
        EcuStatus::Unresponsive
    );
}

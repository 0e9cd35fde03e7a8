pub mod test_utils;

use std::time::Duration;

use esp32nav_core::config::NavConfig;
use esp32nav_core::network::NetworkHandle;
use esp32nav_core::protocol::{DeviceMessage, GpsUpdate, NavStatus, VectorFrame};
use esp32nav_core::transport::{DeviceTransport, LinkState};
use esp32nav_core::Position;
use test_utils::*;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;

const WAIT: Duration = Duration::from_secs(3);

fn transport_for(device_url: &str, connect_timeout_ms: u64) -> DeviceTransport {
    DeviceTransport::new(&NavConfig {
        device_url: device_url.to_string(),
        device_connect_timeout_ms: connect_timeout_ms,
        ..NavConfig::default()
    })
}

fn wifi() -> NetworkHandle {
    NetworkHandle::default_route("device-wifi")
}

fn gps(lat: f64) -> DeviceMessage {
    DeviceMessage::Gps(GpsUpdate::from_position(&Position::new(lat, -58.3712)))
}

fn frame(heading: i32) -> DeviceMessage {
    DeviceMessage::VectorFrame(VectorFrame {
        roads: vec![],
        route: vec![],
        labels: vec![],
        position: (160, 360),
        heading,
    })
}

async fn wait_for_state(states: &mut watch::Receiver<LinkState>, state: LinkState) {
    let reached = tokio::time::timeout(WAIT, states.wait_for(|s| *s == state))
        .await
        .map(|r| r.is_ok());
    if !matches!(reached, Ok(true)) {
        panic!("link never reached {state}, stuck at {}", *states.borrow());
    }
}

fn alive_tasks() -> usize {
    tokio::runtime::Handle::current().metrics().num_alive_tasks()
}

/// A device that finishes the handshake and then never reads again.
async fn stalled_device() -> (String, JoinHandle<WebSocketStream<TcpStream>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    });
    (url, accept)
}

fn big_payload() -> Vec<u8> {
    vec![0x5a; 256 * 1024]
}

#[tokio::test]
async fn sending_while_disconnected_is_dropped() {
    init_logging();
    let mut device = MockDevice::start().await;
    let transport = transport_for(&device.url(), 2_000);
    let mut states = transport.state_changes();

    assert_eq!(transport.state(), LinkState::Disconnected);
    assert!(!transport.send(&gps(-34.0)));
    assert!(!transport.send(&frame(45)));
    assert!(!transport.send_binary(vec![1, 2, 3]));

    transport.connect(&wifi());
    wait_for_state(&mut states, LinkState::Connected).await;
    assert!(transport.send(&gps(-34.5)));

    // the first thing the device sees is what was sent after connecting
    let first: serde_json::Value =
        serde_json::from_str(&device.next_message(WAIT).await.unwrap()).unwrap();
    assert_eq!(first["type"], "gps");
    assert_eq!(first["lat"], -34.5);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(device.drain().is_empty());
}

#[tokio::test]
async fn status_messages_keep_their_order() {
    init_logging();
    let mut device = MockDevice::start().await;
    let transport = transport_for(&device.url(), 2_000);
    let mut states = transport.state_changes();
    transport.connect(&wifi());
    wait_for_state(&mut states, LinkState::Connected).await;

    assert!(transport.send(&DeviceMessage::Nav(NavStatus::new("Turn left", 120, 4))));
    assert!(transport.send(&gps(-34.1)));
    assert!(transport.send(&DeviceMessage::Nav(NavStatus::arrived())));

    let mut types = Vec::new();
    for _ in 0..3 {
        let text = device.next_message(WAIT).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        types.push(value["type"].as_str().unwrap().to_string());
    }
    assert_eq!(types, vec!["nav", "gps", "nav"]);
}

#[tokio::test]
async fn newest_frame_wins() {
    init_logging();
    let mut device = MockDevice::start().await;
    let transport = transport_for(&device.url(), 2_000);
    let mut states = transport.state_changes();
    transport.connect(&wifi());
    wait_for_state(&mut states, LinkState::Connected).await;

    for heading in 0..50 {
        assert!(transport.send(&frame(heading)));
    }

    let mut last_heading = -1;
    while let Some(value) = device.next_of_type("vector-frame", Duration::from_millis(500)).await {
        let heading = value["heading"].as_i64().unwrap();
        assert!(heading > last_heading, "frames arrived out of order");
        last_heading = heading;
    }
    assert_eq!(last_heading, 49);
}

#[tokio::test]
async fn device_text_reaches_subscribers() {
    init_logging();
    let device = MockDevice::start().await;
    let transport = transport_for(&device.url(), 2_000);
    let mut inbound = transport.inbound();
    let mut states = transport.state_changes();
    transport.connect(&wifi());
    wait_for_state(&mut states, LinkState::Connected).await;

    device.push(r#"{"type":"media-cmd","action":"next"}"#);
    let text = tokio::time::timeout(WAIT, inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text, r#"{"type":"media-cmd","action":"next"}"#);
}

#[tokio::test]
async fn refused_connection_is_an_error_state() {
    init_logging();
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let transport = transport_for(&format!("ws://{addr}/ws"), 2_000);
    let mut states = transport.state_changes();
    transport.connect(&wifi());
    assert_eq!(transport.state(), LinkState::Connecting);
    wait_for_state(&mut states, LinkState::Error).await;
    assert!(!transport.send(&gps(-34.0)));
}

#[tokio::test]
async fn silent_device_times_out() {
    init_logging();
    // accepts TCP in the kernel backlog but never answers the handshake
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let transport = transport_for(&format!("ws://{addr}/ws"), 300);
    let mut states = transport.state_changes();

    let started = std::time::Instant::now();
    transport.connect(&wifi());
    wait_for_state(&mut states, LinkState::Error).await;
    assert!(started.elapsed() >= Duration::from_millis(300));
    drop(listener);
}

#[tokio::test]
async fn lost_link_and_explicit_disconnect() {
    init_logging();
    let device = MockDevice::start().await;
    let transport = transport_for(&device.url(), 2_000);
    let mut states = transport.state_changes();

    transport.connect(&wifi());
    wait_for_state(&mut states, LinkState::Connected).await;
    device.drop_connections();
    wait_for_state(&mut states, LinkState::Error).await;
    assert!(!transport.send(&gps(-34.0)));

    // a new connect replaces the failed link
    transport.connect(&wifi());
    wait_for_state(&mut states, LinkState::Connected).await;
    assert!(transport.send(&gps(-34.0)));

    transport.disconnect();
    assert_eq!(transport.state(), LinkState::Disconnected);
    assert!(!transport.send(&gps(-34.0)));
    // the old worker must not flip the state back after closing
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn device_that_stops_reading_fails_the_link() {
    init_logging();
    let (url, accept) = stalled_device().await;
    let transport = transport_for(&url, 300);
    let mut states = transport.state_changes();
    transport.connect(&wifi());
    wait_for_state(&mut states, LinkState::Connected).await;
    let _peer = accept.await.unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while transport.state() == LinkState::Connected && std::time::Instant::now() < deadline {
        transport.send_binary(big_payload());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(transport.state(), LinkState::Error);
    assert!(!transport.send(&gps(-34.0)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alive_tasks(), 0, "link worker still running");
}

#[tokio::test]
async fn disconnect_stops_a_stalled_worker() {
    init_logging();
    let (url, accept) = stalled_device().await;
    // long enough that only disconnect can end the stuck write
    let transport = transport_for(&url, 30_000);
    let mut states = transport.state_changes();
    transport.connect(&wifi());
    wait_for_state(&mut states, LinkState::Connected).await;
    let _peer = accept.await.unwrap();

    // the queue only fills up once the worker is stuck writing
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while transport.send_binary(big_payload()) {
        assert!(std::time::Instant::now() < deadline, "device never stalled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(transport.state(), LinkState::Connected);
    assert_eq!(alive_tasks(), 1);

    transport.disconnect();
    assert_eq!(transport.state(), LinkState::Disconnected);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(alive_tasks(), 0, "link worker outlived disconnect");
    assert_eq!(transport.state(), LinkState::Disconnected);
}

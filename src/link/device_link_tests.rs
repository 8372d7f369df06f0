use super::*;
use crate::link::simulated::SimulatedTransport;
use futures::StreamExt;

fn sensor() -> Device {
    Device {
        id: DeviceId::new("AA:BB:CC:01"),
        name: "eyeDrops".to_string(),
        rssi: -52,
    }
}

fn fast_config() -> LinkConfig {
    LinkConfig {
        connect_timeout_ms: 200,
        scan_timeout_ms: 50,
        reconnect_base_ms: 10,
        reconnect_cap_ms: 40,
        max_reconnect_attempts: 3,
        jitter: false,
        auto_connect: false,
    }
}

fn setup(config: LinkConfig) -> (Arc<SimulatedTransport>, DeviceLink, EventBus) {
    let transport = Arc::new(SimulatedTransport::with_device(sensor()));
    let events = EventBus::new(64);
    let link = DeviceLink::new(
        transport.clone(),
        config,
        QueueConfig::default(),
        events.clone(),
    );
    (transport, link, events)
}

async fn wait_for_state(link: &DeviceLink, expected: LinkState) {
    let mut rx = link.subscribe_state();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|state| *state == expected))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}, at {:?}", expected, link.state()))
        .unwrap();
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn connect_moves_through_connecting_to_connected() {
    let (_transport, link, events) = setup(fast_config());
    let mut rx = events.subscribe();

    let device = link.connect(&sensor().id).await.unwrap();
    assert_eq!(device, sensor());
    assert_eq!(link.state(), LinkState::Connected);
    assert_eq!(link.last_known_device(), Some(sensor().id));

    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CoreEvent::DeviceStateChanged { state, device_id } = event {
            assert_eq!(device_id, Some(sensor().id));
            states.push(state);
        }
    }
    assert_eq!(states, vec![LinkState::Connecting, LinkState::Connected]);
}

#[tokio::test]
async fn connect_to_missing_device_fails_with_not_found() {
    let (_transport, link, _events) = setup(fast_config());
    let err = link.connect(&DeviceId::new("gone")).await.unwrap_err();
    assert!(matches!(err, LinkError::NotFound { .. }));
    assert_eq!(link.state(), LinkState::Idle);
}

#[tokio::test]
async fn connect_times_out_when_handshake_hangs() {
    let (transport, link, _events) = setup(fast_config());
    transport.set_hang_connects(true);

    let err = link.connect(&sensor().id).await.unwrap_err();
    assert_eq!(err, LinkError::Timeout { timeout_ms: 200 });
    assert_eq!(link.state(), LinkState::Idle);
}

#[tokio::test]
async fn connect_while_streaming_is_rejected_without_state_change() {
    let (transport, link, _events) = setup(fast_config());
    link.connect(&sensor().id).await.unwrap();
    let _subscription = link.subscribe().await.unwrap();
    assert_eq!(link.state(), LinkState::Streaming);

    let err = link.connect(&sensor().id).await.unwrap_err();
    assert_eq!(err, LinkError::AlreadyConnected);
    assert_eq!(link.state(), LinkState::Streaming);
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn only_one_subscriber_at_a_time() {
    let (_transport, link, _events) = setup(fast_config());
    assert_eq!(link.subscribe().await.err(), Some(LinkError::NotConnected));

    link.connect(&sensor().id).await.unwrap();
    let first = link.subscribe().await.unwrap();
    assert_eq!(link.subscribe().await.err(), Some(LinkError::AlreadyStreaming));

    drop(first);
    wait_for_state(&link, LinkState::Connected).await;
    assert!(link.subscribe().await.is_ok());
}

#[tokio::test]
async fn samples_arrive_with_device_timestamps() {
    let (transport, link, _events) = setup(fast_config());
    link.connect(&sensor().id).await.unwrap();
    let subscription = link.subscribe().await.unwrap();

    transport.push_samples(1_000, 1_000, &[3, 4, 5]);
    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(subscription.recv().await.unwrap());
    }
    assert_eq!(
        received,
        vec![
            Sample::single(1_000, 3),
            Sample::single(2_000, 4),
            Sample::single(3_000, 5),
        ]
    );
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let (transport, link, _events) = setup(fast_config());
    link.connect(&sensor().id).await.unwrap();
    let subscription = link.subscribe().await.unwrap();

    transport.push_frame(vec![0x02, 0x01]);
    transport.push_frame(vec![0x42]);
    transport.push_sample(10, 9);

    assert_eq!(subscription.recv().await, Some(Sample::single(10, 9)));
}

#[tokio::test]
async fn write_requires_connection_and_surfaces_naks() {
    let (transport, link, _events) = setup(fast_config());
    assert_eq!(
        link.write_characteristic(&[0x00]).await,
        Err(LinkError::NotConnected)
    );

    link.connect(&sensor().id).await.unwrap();
    link.send_command(&Command::StartCalibration).await.unwrap();
    assert_eq!(transport.written(), vec![vec![0x01]]);

    transport.set_reject_writes(true);
    assert!(matches!(
        link.write_characteristic(&[0x00]).await,
        Err(LinkError::WriteRejected { .. })
    ));
}

#[tokio::test]
async fn disconnect_is_idempotent_and_ends_the_stream() {
    let (transport, link, _events) = setup(fast_config());
    link.disconnect().await;
    assert_eq!(
        link.state(),
        LinkState::Disconnected(DisconnectReason::UserRequested)
    );

    link.connect(&sensor().id).await.unwrap();
    let subscription = link.subscribe().await.unwrap();
    link.disconnect().await;
    link.disconnect().await;

    assert_eq!(
        link.state(),
        LinkState::Disconnected(DisconnectReason::UserRequested)
    );
    assert_eq!(subscription.recv().await, None);
    assert_eq!(subscription.close_reason(), None);
    assert!(!transport.is_connected());
    assert!(link.current_device().is_none());

    link.reset().unwrap();
    assert_eq!(link.state(), LinkState::Idle);
}

#[tokio::test]
async fn transient_drop_reconnects_and_resumes_streaming() {
    let (transport, link, _events) = setup(fast_config());
    link.connect(&sensor().id).await.unwrap();
    let subscription = link.subscribe().await.unwrap();

    transport.push_samples(1_000, 1_000, &[1, 2]);
    assert_eq!(subscription.recv().await.map(|s| s.timestamp_us), Some(1_000));
    assert_eq!(subscription.recv().await.map(|s| s.timestamp_us), Some(2_000));

    transport.drop_link("out of range");
    eventually(|| transport.connect_count() == 2 && link.state() == LinkState::Streaming).await;
    assert!(transport.is_subscribed());

    // The sensor restarted its clock; timestamps keep increasing anyway
    transport.push_sample(100, 7);
    let resumed = subscription.recv().await.unwrap();
    assert_eq!(resumed, Sample::single(2_001, 7));
}

#[tokio::test]
async fn exhausted_reconnects_surface_link_lost() {
    let config = LinkConfig {
        max_reconnect_attempts: 2,
        ..fast_config()
    };
    let (transport, link, _events) = setup(config);
    link.connect(&sensor().id).await.unwrap();
    let subscription = link.subscribe().await.unwrap();

    transport.fail_next_connects(10);
    transport.drop_link("battery pulled");

    wait_for_state(&link, LinkState::Disconnected(DisconnectReason::LinkLost)).await;
    assert_eq!(subscription.recv().await, None);
    assert_eq!(subscription.close_reason(), Some(LinkError::LinkLost));
    assert_eq!(transport.connect_count(), 3);

    link.reset().unwrap();
    assert_eq!(link.state(), LinkState::Idle);
}

#[tokio::test]
async fn user_takeover_cancels_pending_reconnect() {
    let config = LinkConfig {
        reconnect_base_ms: 2_000,
        reconnect_cap_ms: 2_000,
        ..fast_config()
    };
    let (transport, link, _events) = setup(config);
    link.connect(&sensor().id).await.unwrap();

    transport.drop_link("out of range");
    wait_for_state(&link, LinkState::Disconnected(DisconnectReason::Transient)).await;

    // Taking over while the supervisor sleeps through its backoff
    link.disconnect().await;
    link.connect(&sensor().id).await.unwrap();
    assert_eq!(link.state(), LinkState::Connected);

    // A second drop is noticed right away, not after the old backoff
    transport.drop_link("out of range again");
    let mut rx = link.subscribe_state();
    tokio::time::timeout(
        Duration::from_millis(500),
        rx.wait_for(|state| state.is_disconnected()),
    )
    .await
    .unwrap_or_else(|_| panic!("drop went unnoticed, link is {:?}", link.state()))
    .unwrap();
    assert_eq!(
        link.state(),
        LinkState::Disconnected(DisconnectReason::Transient)
    );
    link.disconnect().await;
}

#[tokio::test]
async fn scan_yields_each_device_once_and_returns_to_idle() {
    let (transport, link, _events) = setup(fast_config());
    let other = Device {
        id: DeviceId::new("AA:BB:CC:02"),
        name: "eyeDrops 2".to_string(),
        rssi: -70,
    };
    transport.advertise(other.clone());

    let scan = link.scan(Some(Duration::from_millis(50))).await.unwrap();
    assert_eq!(link.state(), LinkState::Scanning);
    transport.advertise(sensor());

    let found: Vec<Device> = scan.collect().await;
    let mut ids: Vec<DeviceId> = found.into_iter().map(|device| device.id).collect();
    ids.sort();
    assert_eq!(ids, vec![sensor().id, other.id]);

    wait_for_state(&link, LinkState::Idle).await;
}

#[tokio::test]
async fn connect_during_scan_takes_over() {
    let (_transport, link, _events) = setup(fast_config());
    let _scan = link.scan(Some(Duration::from_secs(5))).await.unwrap();

    link.connect(&sensor().id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(link.state(), LinkState::Connected);
}

#[tokio::test]
async fn profile_is_sent_on_connect_and_after_sensor_reset() {
    let (transport, link, _events) = setup(fast_config());
    let profile = Profile::new("default", 100, -80, 0);
    let apply = RfduinoCodec.encode(&profile.apply_command());

    link.activate_profile(&profile).await.unwrap();
    assert!(transport.written().is_empty());

    link.connect(&sensor().id).await.unwrap();
    assert_eq!(transport.written(), vec![apply.clone()]);

    let _subscription = link.subscribe().await.unwrap();
    transport.push_frame(vec![0xFF]);
    eventually(|| transport.written().len() == 3).await;
    assert_eq!(transport.written()[1], vec![0xFF]);
    assert_eq!(transport.written()[2], apply);
}

#[tokio::test]
async fn battery_reports_are_cached_and_published() {
    let (transport, link, events) = setup(fast_config());
    let mut rx = events.subscribe();
    link.connect(&sensor().id).await.unwrap();
    let _subscription = link.subscribe().await.unwrap();

    link.request_battery_level().await.unwrap();
    assert_eq!(transport.written(), vec![vec![0x10]]);

    transport.push_frame(vec![0x10, 64]);
    eventually(|| link.battery_level() == Some(64)).await;

    let mut saw_battery = false;
    while let Ok(event) = rx.try_recv() {
        saw_battery |= event == CoreEvent::BatteryLevel(64);
    }
    assert!(saw_battery);
}

#[tokio::test]
async fn reconnect_last_uses_remembered_device() {
    let (_transport, link, _events) = setup(fast_config());
    assert!(matches!(
        link.reconnect_last().await,
        Err(LinkError::NotFound { .. })
    ));

    link.set_last_known_device(Some(sensor().id));
    link.reconnect_last().await.unwrap();
    assert_eq!(link.state(), LinkState::Connected);
}

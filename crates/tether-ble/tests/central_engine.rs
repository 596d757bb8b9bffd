//! Central engine behaviour against a recording radio

use std::time::Duration;

use futures::poll;
use tokio_test::{assert_err, assert_ok};

use tether_ble::testing::{CallLog, RadioCall, RecordingCentral};
use tether_ble::{BleConfig, CentralEngine, CentralHandle, CentralInput};
use tether_core::{
    BleEvent, DeviceId, ErrorCode, EventSink, LinkState, RadioState, HANDSHAKE_CHARACTERISTIC_UUID,
    PROFILE_CHARACTERISTIC_UUID,
};

use test_utils::{discovered, eventually, next_event, payload, sighting};

struct Harness {
    handle: CentralHandle,
    log: CallLog,
    events: EventSink,
}

fn harness(config: BleConfig) -> Harness {
    let radio = RecordingCentral::default();
    let log = radio.log.clone();
    let events = EventSink::default();
    let handle = CentralEngine::spawn(radio, events.clone(), &config);
    Harness {
        handle,
        log,
        events,
    }
}

impl Harness {
    fn input(&self, input: CentralInput) {
        self.handle.input_sender().send(input).unwrap();
    }

    async fn powered_on(&self) {
        self.input(CentralInput::StateChanged(RadioState::PoweredOn));
        eventually("radio powered on", || async {
            self.handle.status().await.unwrap().radio_state == RadioState::PoweredOn
        })
        .await;
    }

    async fn scanning(&self) {
        self.powered_on().await;
        assert_ok!(self.handle.start_scan().await);
    }

    /// Inject a sighting and wait until the engine has accepted it
    async fn sight(&self, device: &str, rssi: i16) {
        let mut events = self.events.subscribe();
        let advertised = payload(device, rssi.unsigned_abs() as u8);
        self.input(sighting(device, rssi, Some(&advertised)));
        next_event(&mut events, |e| discovered(e, device)).await;
    }

    /// Discover `device` and bring a link up to it
    async fn connected(&self, device: &str) -> DeviceId {
        self.sight(device, -50).await;
        let device_id = DeviceId::new(device);
        let connect = self.handle.connect(&device_id, None);
        tokio::pin!(connect);
        assert!(poll!(&mut connect).is_pending());
        self.wait_for_call(RadioCall::Connect(device_id.clone())).await;
        self.input(CentralInput::Connected {
            device_id: device_id.clone(),
        });
        assert_ok!(connect.await);
        device_id
    }

    async fn wait_for_call(&self, call: RadioCall) {
        eventually("radio call", || async { self.log.calls().contains(&call) }).await;
    }

    async fn wait_for_calls(&self, call: RadioCall, count: usize) {
        eventually("radio calls", || async {
            self.log.count(|c| c == &call) == count
        })
        .await;
    }
}

fn link_event(event: &BleEvent, device: &DeviceId, expected: LinkState) -> bool {
    matches!(
        event,
        BleEvent::ConnectionStateChanged { device_id, state } if device_id == device && *state == expected
    )
}

// ----------------------------------------------------------------------------
// Scanning
// ----------------------------------------------------------------------------

#[tokio::test]
async fn proximity_threshold_is_inclusive() {
    let h = harness(BleConfig::default());
    h.scanning().await;
    let mut events = h.events.subscribe();

    let near = payload("near", 1);
    let far = payload("far", 2);
    h.input(sighting("near", -70, Some(&near)));
    h.input(sighting("far", -71, Some(&far)));
    h.input(sighting("marker", -40, Some(&payload("marker", 3))));

    // Inputs are processed in order: the marker's event proves the rest were seen
    let first = next_event(&mut events, |e| matches!(e, BleEvent::DeviceDiscovered { .. })).await;
    assert!(discovered(&first, "near"));
    let second = next_event(&mut events, |e| matches!(e, BleEvent::DeviceDiscovered { .. })).await;
    assert!(discovered(&second, "marker"));

    let devices = h.handle.discovered_devices().await.unwrap();
    let ids: Vec<&str> = devices.iter().map(|d| d.device_id.as_str()).collect();
    assert_eq!(ids, vec!["marker", "near"]);
}

#[tokio::test]
async fn resightings_update_in_place() {
    let h = harness(BleConfig::default());
    h.scanning().await;
    let mut events = h.events.subscribe();
    let advertised = payload("alice", 5);

    h.input(sighting("alice", -65, Some(&advertised)));
    next_event(&mut events, |e| discovered(e, "alice")).await;
    h.input(sighting("alice", -52, None));
    let event = next_event(&mut events, |e| discovered(e, "alice")).await;

    match event {
        BleEvent::DeviceDiscovered { rssi, payload, .. } => {
            assert_eq!(rssi, -52);
            assert_eq!(payload, advertised);
        }
        other => panic!("unexpected event {other:?}"),
    }
    let devices = h.handle.discovered_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].rssi, -52);

    let found = h.handle.find_by_user_hash(advertised.user_hash).await.unwrap();
    assert_eq!(found.map(|d| d.device_id), Some(DeviceId::new("alice")));
}

#[tokio::test]
async fn sightings_are_ignored_while_not_scanning() {
    let h = harness(BleConfig::default());
    h.powered_on().await;
    h.input(sighting("alice", -40, Some(&payload("alice", 1))));

    h.scanning().await;
    h.sight("marker", -40).await;
    let devices = h.handle.discovered_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id.as_str(), "marker");
}

#[tokio::test]
async fn new_session_forgets_previous_devices() {
    let h = harness(BleConfig::default());
    h.scanning().await;
    h.sight("alice", -50).await;
    assert_eq!(h.handle.status().await.unwrap().discovered, 1);

    assert_ok!(h.handle.stop_scan().await);
    assert_ok!(h.handle.start_scan().await);
    let status = h.handle.status().await.unwrap();
    assert_eq!(status.scan_session, 2);
    assert_eq!(status.discovered, 0);
}

#[tokio::test]
async fn scan_waits_for_the_radio() {
    let h = harness(BleConfig::default());
    let start = h.handle.start_scan();
    tokio::pin!(start);
    assert!(poll!(&mut start).is_pending());

    h.input(CentralInput::StateChanged(RadioState::PoweredOn));
    assert_ok!(start.await);
    assert_eq!(h.log.count(|c| c == &RadioCall::StartScan), 1);
}

#[tokio::test]
async fn scan_fails_while_powered_off() {
    let h = harness(BleConfig::default());
    h.input(CentralInput::StateChanged(RadioState::PoweredOff));
    eventually("radio powered off", || async {
        h.handle.status().await.unwrap().radio_state == RadioState::PoweredOff
    })
    .await;

    let err = assert_err!(h.handle.start_scan().await);
    assert_eq!(err.code(), ErrorCode::PoweredOff);
    assert_eq!(h.log.count(|c| c == &RadioCall::StartScan), 0);
}

#[tokio::test(start_paused = true)]
async fn scan_stops_after_configured_duration() {
    let h = harness(BleConfig::default().with_scan_duration(Some(Duration::from_secs(10))));
    let mut events = h.events.subscribe();
    h.scanning().await;

    next_event(&mut events, |e| matches!(e, BleEvent::ScanStopped)).await;
    assert!(!h.handle.status().await.unwrap().scanning);
    assert_eq!(h.log.count(|c| c == &RadioCall::StopScan), 1);
}

#[tokio::test]
async fn radio_loss_stops_scan_and_drops_links() {
    let h = harness(BleConfig::default());
    h.scanning().await;
    let device_id = h.connected("alice").await;
    let mut events = h.events.subscribe();

    h.input(CentralInput::StateChanged(RadioState::Unauthorized));
    next_event(&mut events, |e| matches!(e, BleEvent::ScanStopped)).await;
    next_event(&mut events, |e| link_event(e, &device_id, LinkState::Disconnected)).await;
    let error = next_event(&mut events, |e| matches!(e, BleEvent::Error { .. })).await;
    match error {
        BleEvent::Error { code, .. } => assert_eq!(code, Some(ErrorCode::Unauthorized)),
        other => panic!("unexpected event {other:?}"),
    }

    let status = h.handle.status().await.unwrap();
    assert!(!status.scanning);
    assert!(status.connected.is_empty());
}

#[tokio::test]
async fn radio_reset_fails_pending_gatt_and_drops_links() {
    let h = harness(BleConfig::default());
    h.scanning().await;
    let device_id = h.connected("alice").await;

    let read = h.handle.read(&device_id, PROFILE_CHARACTERISTIC_UUID);
    tokio::pin!(read);
    assert!(poll!(&mut read).is_pending());
    h.wait_for_call(RadioCall::DiscoverServices(device_id.clone())).await;
    h.input(CentralInput::ServicesDiscovered {
        device_id: device_id.clone(),
        result: Ok(vec![PROFILE_CHARACTERISTIC_UUID, HANDSHAKE_CHARACTERISTIC_UUID]),
    });
    h.wait_for_call(RadioCall::Read(device_id.clone(), PROFILE_CHARACTERISTIC_UUID))
        .await;

    // The platform never reports the link or the read again after a reset
    let mut events = h.events.subscribe();
    h.input(CentralInput::StateChanged(RadioState::Resetting));
    assert_eq!(assert_err!(read.await).code(), ErrorCode::Disconnected);
    next_event(&mut events, |e| link_event(e, &device_id, LinkState::Disconnected)).await;

    let status = h.handle.status().await.unwrap();
    assert!(status.connected.is_empty());
    assert!(!status.scanning);

    h.input(CentralInput::StateChanged(RadioState::PoweredOn));
    h.wait_for_calls(RadioCall::StartScan, 2).await;
}

// ----------------------------------------------------------------------------
// Links
// ----------------------------------------------------------------------------

#[tokio::test]
async fn connect_requires_a_discovered_device() {
    let h = harness(BleConfig::default());
    h.scanning().await;

    let err = assert_err!(h.handle.connect(&DeviceId::new("ghost"), None).await);
    assert_eq!(err.code(), ErrorCode::DeviceNotFound);
    assert_eq!(h.log.count(|c| matches!(c, RadioCall::Connect(_))), 0);
}

#[tokio::test]
async fn connect_reports_link_states() {
    let h = harness(BleConfig::default());
    h.scanning().await;
    let mut events = h.events.subscribe();
    let device_id = h.connected("alice").await;

    next_event(&mut events, |e| link_event(e, &device_id, LinkState::Connecting)).await;
    next_event(&mut events, |e| link_event(e, &device_id, LinkState::Connected)).await;
    assert_eq!(h.handle.status().await.unwrap().connected, vec![device_id.clone()]);

    // Already connected: no second radio call
    assert_ok!(h.handle.connect(&device_id, None).await);
    assert_eq!(h.log.count(|c| matches!(c, RadioCall::Connect(_))), 1);

    let disconnect = h.handle.disconnect(&device_id);
    tokio::pin!(disconnect);
    assert!(poll!(&mut disconnect).is_pending());
    h.wait_for_call(RadioCall::Disconnect(device_id.clone())).await;
    h.input(CentralInput::Disconnected {
        device_id: device_id.clone(),
    });
    assert_ok!(disconnect.await);
    next_event(&mut events, |e| link_event(e, &device_id, LinkState::Disconnected)).await;

    // Nothing left to tear down
    assert_ok!(h.handle.disconnect(&device_id).await);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_fails_and_cancels_the_attempt() {
    let h = harness(BleConfig::default());
    h.scanning().await;
    h.sight("alice", -50).await;
    let mut events = h.events.subscribe();
    let device_id = DeviceId::new("alice");

    let err = assert_err!(
        h.handle
            .connect(&device_id, Some(Duration::from_secs(3)))
            .await
    );
    assert_eq!(err.code(), ErrorCode::Timeout);
    next_event(&mut events, |e| link_event(e, &device_id, LinkState::Failed)).await;
    h.wait_for_call(RadioCall::Disconnect(device_id.clone())).await;

    // A late confirmation for the abandoned attempt changes nothing
    h.input(CentralInput::Connected {
        device_id: device_id.clone(),
    });
    assert!(h.handle.status().await.unwrap().connected.is_empty());
}

#[tokio::test]
async fn connect_failure_is_reported() {
    let h = harness(BleConfig::default());
    h.scanning().await;
    h.sight("alice", -50).await;
    let mut events = h.events.subscribe();
    let device_id = DeviceId::new("alice");

    let connect = h.handle.connect(&device_id, None);
    tokio::pin!(connect);
    assert!(poll!(&mut connect).is_pending());
    h.wait_for_call(RadioCall::Connect(device_id.clone())).await;
    h.input(CentralInput::ConnectFailed {
        device_id: device_id.clone(),
        reason: "le-connection-abort-by-local".into(),
    });

    assert_err!(connect.await);
    next_event(&mut events, |e| link_event(e, &device_id, LinkState::Failed)).await;
}

// ----------------------------------------------------------------------------
// GATT Client
// ----------------------------------------------------------------------------

#[tokio::test]
async fn gatt_requires_a_link() {
    let h = harness(BleConfig::default());
    h.scanning().await;
    h.sight("alice", -50).await;

    let err = assert_err!(
        h.handle
            .read(&DeviceId::new("alice"), PROFILE_CHARACTERISTIC_UUID)
            .await
    );
    assert_eq!(err.code(), ErrorCode::NotConnected);
}

#[tokio::test]
async fn completions_route_by_device_and_characteristic() {
    let h = harness(BleConfig::default());
    h.scanning().await;
    let alice = h.connected("alice").await;
    let bob = h.connected("bob").await;

    let alice_read = h.handle.read(&alice, PROFILE_CHARACTERISTIC_UUID);
    tokio::pin!(alice_read);
    assert!(poll!(&mut alice_read).is_pending());
    let alice_write = h
        .handle
        .write(&alice, HANDSHAKE_CHARACTERISTIC_UUID, b"hello".to_vec());
    tokio::pin!(alice_write);
    assert!(poll!(&mut alice_write).is_pending());
    let bob_read = h.handle.read(&bob, PROFILE_CHARACTERISTIC_UUID);
    tokio::pin!(bob_read);
    assert!(poll!(&mut bob_read).is_pending());

    // First operation on each link triggers one discovery; the rest wait for it
    h.wait_for_call(RadioCall::DiscoverServices(alice.clone())).await;
    h.wait_for_call(RadioCall::DiscoverServices(bob.clone())).await;
    assert_eq!(
        h.log.count(|c| matches!(c, RadioCall::DiscoverServices(_))),
        2
    );
    for device_id in [&alice, &bob] {
        h.input(CentralInput::ServicesDiscovered {
            device_id: device_id.clone(),
            result: Ok(vec![PROFILE_CHARACTERISTIC_UUID, HANDSHAKE_CHARACTERISTIC_UUID]),
        });
    }
    h.wait_for_call(RadioCall::Read(alice.clone(), PROFILE_CHARACTERISTIC_UUID))
        .await;
    h.wait_for_call(RadioCall::Read(bob.clone(), PROFILE_CHARACTERISTIC_UUID))
        .await;
    h.wait_for_call(RadioCall::Write(
        alice.clone(),
        HANDSHAKE_CHARACTERISTIC_UUID,
        b"hello".to_vec(),
    ))
    .await;

    // Complete in the opposite order of submission
    h.input(CentralInput::ReadComplete {
        device_id: bob.clone(),
        characteristic: PROFILE_CHARACTERISTIC_UUID,
        result: Ok(b"bob".to_vec()),
    });
    h.input(CentralInput::WriteComplete {
        device_id: alice.clone(),
        characteristic: HANDSHAKE_CHARACTERISTIC_UUID,
        result: Ok(()),
    });
    h.input(CentralInput::ReadComplete {
        device_id: alice.clone(),
        characteristic: PROFILE_CHARACTERISTIC_UUID,
        result: Ok(b"alice".to_vec()),
    });

    assert_eq!(bob_read.await.unwrap(), b"bob");
    assert_ok!(alice_write.await);
    assert_eq!(alice_read.await.unwrap(), b"alice");

    // Discovery is cached for the lifetime of the link
    let again = h.handle.read(&alice, PROFILE_CHARACTERISTIC_UUID);
    tokio::pin!(again);
    assert!(poll!(&mut again).is_pending());
    h.wait_for_calls(RadioCall::Read(alice.clone(), PROFILE_CHARACTERISTIC_UUID), 2)
        .await;
    assert_eq!(
        h.log.count(|c| matches!(c, RadioCall::DiscoverServices(_))),
        2
    );
}

#[tokio::test]
async fn missing_characteristic_is_reported_after_discovery() {
    let h = harness(BleConfig::default());
    h.scanning().await;
    let alice = h.connected("alice").await;

    let write = h
        .handle
        .write(&alice, HANDSHAKE_CHARACTERISTIC_UUID, b"{}".to_vec());
    tokio::pin!(write);
    assert!(poll!(&mut write).is_pending());
    h.wait_for_call(RadioCall::DiscoverServices(alice.clone())).await;
    h.input(CentralInput::ServicesDiscovered {
        device_id: alice.clone(),
        result: Ok(vec![PROFILE_CHARACTERISTIC_UUID]),
    });

    let err = assert_err!(write.await);
    assert_eq!(err.code(), ErrorCode::CharacteristicNotFound);
}

#[tokio::test]
async fn failed_discovery_is_retried_by_the_next_operation() {
    let h = harness(BleConfig::default());
    h.scanning().await;
    let alice = h.connected("alice").await;

    let first = h.handle.read(&alice, PROFILE_CHARACTERISTIC_UUID);
    tokio::pin!(first);
    assert!(poll!(&mut first).is_pending());
    h.wait_for_call(RadioCall::DiscoverServices(alice.clone())).await;
    h.input(CentralInput::ServicesDiscovered {
        device_id: alice.clone(),
        result: Err(tether_core::TetherError::platform("gatt cache busy")),
    });
    assert_err!(first.await);

    let second = h.handle.read(&alice, PROFILE_CHARACTERISTIC_UUID);
    tokio::pin!(second);
    assert!(poll!(&mut second).is_pending());
    h.wait_for_calls(RadioCall::DiscoverServices(alice.clone()), 2)
        .await;
}

#[tokio::test]
async fn disconnect_fails_everything_pending_on_the_link() {
    let h = harness(BleConfig::default());
    h.scanning().await;
    let alice = h.connected("alice").await;
    let bob = h.connected("bob").await;

    // Alice: a read submitted to the radio
    let submitted = h.handle.read(&alice, PROFILE_CHARACTERISTIC_UUID);
    tokio::pin!(submitted);
    assert!(poll!(&mut submitted).is_pending());
    h.wait_for_call(RadioCall::DiscoverServices(alice.clone())).await;
    h.input(CentralInput::ServicesDiscovered {
        device_id: alice.clone(),
        result: Ok(vec![PROFILE_CHARACTERISTIC_UUID, HANDSHAKE_CHARACTERISTIC_UUID]),
    });
    h.wait_for_call(RadioCall::Read(alice.clone(), PROFILE_CHARACTERISTIC_UUID))
        .await;

    // Alice: a write still waiting on nothing but the radio
    let written = h
        .handle
        .write(&alice, HANDSHAKE_CHARACTERISTIC_UUID, b"{}".to_vec());
    tokio::pin!(written);
    assert!(poll!(&mut written).is_pending());
    h.wait_for_call(RadioCall::Write(
        alice.clone(),
        HANDSHAKE_CHARACTERISTIC_UUID,
        b"{}".to_vec(),
    ))
    .await;

    // Bob: a read deferred behind discovery
    let deferred = h.handle.read(&bob, PROFILE_CHARACTERISTIC_UUID);
    tokio::pin!(deferred);
    assert!(poll!(&mut deferred).is_pending());
    h.wait_for_call(RadioCall::DiscoverServices(bob.clone())).await;

    h.input(CentralInput::Disconnected {
        device_id: alice.clone(),
    });
    assert_eq!(assert_err!(submitted.await).code(), ErrorCode::Disconnected);
    assert_eq!(assert_err!(written.await).code(), ErrorCode::Disconnected);
    assert!(poll!(&mut deferred).is_pending());

    h.input(CentralInput::Disconnected {
        device_id: bob.clone(),
    });
    assert_eq!(assert_err!(deferred.await).code(), ErrorCode::Disconnected);
    assert!(h.handle.status().await.unwrap().connected.is_empty());
}

//! Follow handshake between two nodes sharing an in-memory radio medium

use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;

use tether_ble::testing::RadioMedium;
use tether_ble::{BleConfig, ProximityNode};
use tether_core::{
    ConnectionStatus, DeviceId, ErrorCode, HandshakePolicy, LocalKeyStore, MemoryStore, Profile,
    UserId,
};

use test_utils::eventually;

/// Long enough that no rotation happens during a test
const NO_ROTATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn node(medium: &RadioMedium, name: &str, auto_accept: bool) -> ProximityNode {
    let keys = Arc::new(LocalKeyStore::generate().unwrap());
    let profile = Profile::for_identity(keys.as_ref(), name, None);
    let config = BleConfig::default()
        .with_follow_token_interval(NO_ROTATION)
        .with_handshake(HandshakePolicy::default().with_auto_accept(auto_accept));

    ProximityNode::new(
        keys,
        Arc::new(MemoryStore::new()),
        profile,
        medium.peripheral(name, -50),
        medium.central(name),
        config,
    )
}

/// Start both nodes and wait until each sees the other
async fn pair(auto_accept: bool) -> (RadioMedium, ProximityNode, ProximityNode) {
    let medium = RadioMedium::new();
    let alice = node(&medium, "alice", true);
    let bob = node(&medium, "bob", auto_accept);
    assert_ok!(alice.start().await);
    assert_ok!(bob.start().await);

    for (node, peer) in [(&alice, "bob"), (&bob, "alice")] {
        eventually("peer in range", || async {
            node.nearby()
                .await
                .unwrap()
                .iter()
                .any(|device| device.device_id.as_str() == peer)
        })
        .await;
    }
    (medium, alice, bob)
}

fn status_of(node: &ProximityNode, peer: &UserId) -> Option<ConnectionStatus> {
    node.manager()
        .get(peer)
        .unwrap()
        .map(|connection| connection.status)
}

async fn wait_for_status(node: &ProximityNode, peer: &UserId, expected: Option<ConnectionStatus>) {
    eventually("connection status", || async {
        status_of(node, peer) == expected
    })
    .await;
}

/// Wait until `node` holds no links, so its next delivery opens a fresh one
async fn settled(node: &ProximityNode) {
    eventually("links closed", || async {
        node.central().status().await.unwrap().connected.is_empty()
    })
    .await;
}

#[tokio::test]
async fn follow_with_auto_accept_is_mutual_on_both_sides() {
    let (_medium, alice, bob) = pair(true).await;

    let connection = alice.follow(&DeviceId::new("bob")).await.unwrap().unwrap();
    assert_eq!(&connection.user_id, bob.user_id());
    assert_eq!(connection.status, ConnectionStatus::Mutual);
    assert_eq!(connection.display_name, "bob");

    wait_for_status(&bob, alice.user_id(), Some(ConnectionStatus::Mutual)).await;

    // Both sides derive the same shared secret
    let ours = alice.manager().shared_secret_for(bob.user_id()).unwrap();
    let theirs = bob.manager().shared_secret_for(alice.user_id()).unwrap();
    assert_eq!(ours.as_bytes(), theirs.as_bytes());
}

#[tokio::test]
async fn manual_approval_completes_on_accept() {
    let (_medium, alice, bob) = pair(false).await;

    let connection = alice.follow(&DeviceId::new("bob")).await.unwrap().unwrap();
    assert_eq!(connection.status, ConnectionStatus::PendingSent);
    wait_for_status(&bob, alice.user_id(), Some(ConnectionStatus::PendingReceived)).await;
    settled(&bob).await;

    let accepted = bob.accept(alice.user_id()).await.unwrap();
    assert_eq!(accepted.status, ConnectionStatus::Mutual);
    wait_for_status(&alice, bob.user_id(), Some(ConnectionStatus::Mutual)).await;
}

#[tokio::test]
async fn rejection_removes_the_requesters_record() {
    let (_medium, alice, bob) = pair(false).await;

    alice.follow(&DeviceId::new("bob")).await.unwrap();
    wait_for_status(&bob, alice.user_id(), Some(ConnectionStatus::PendingReceived)).await;
    settled(&bob).await;

    assert_ok!(bob.reject(alice.user_id()).await);
    assert_eq!(status_of(&bob, alice.user_id()), None);
    wait_for_status(&alice, bob.user_id(), None).await;
}

#[tokio::test]
async fn re_sighting_upgrades_pending_sent() {
    let (medium, alice, bob) = pair(false).await;

    alice.follow(&DeviceId::new("bob")).await.unwrap();
    assert_eq!(
        status_of(&alice, bob.user_id()),
        Some(ConnectionStatus::PendingSent)
    );

    medium.announce("bob");
    wait_for_status(&alice, bob.user_id(), Some(ConnectionStatus::Mutual)).await;
}

#[tokio::test]
async fn unreachable_peer_times_out() {
    let (medium, alice, _bob) = pair(true).await;
    medium.set_unresponsive("bob", true);

    let err = alice
        .central()
        .connect(&DeviceId::new("bob"), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert!(alice.connections().unwrap().is_empty());
}

#[tokio::test]
async fn unfollow_forgets_the_peer() {
    let (_medium, alice, bob) = pair(true).await;
    alice.follow(&DeviceId::new("bob")).await.unwrap();

    assert!(alice.unfollow(bob.user_id()).unwrap());
    assert!(!alice.unfollow(bob.user_id()).unwrap());
    assert!(alice.connections().unwrap().is_empty());
}

#[tokio::test]
async fn stopped_node_stops_radiating() {
    let (medium, alice, _bob) = pair(true).await;
    assert!(medium.advertisement("alice").is_some());

    assert_ok!(alice.stop().await);
    assert!(medium.advertisement("alice").is_none());
    assert!(!alice.central().status().await.unwrap().scanning);
    alice.shutdown().await;
}

//! End-to-end follow handshake scenarios driven through the wire payloads
//!
//! Each scenario serializes the handshake envelopes the way they travel over
//! GATT, so both sides only ever see bytes.

use std::sync::Arc;

use tether_core::{
    ConnectionManager, ConnectionStatus, ConnectionStore, HandshakeMessage, HandshakePolicy,
    KeyStore, LocalKeyStore, MemoryStore, Profile, ResponseStatus,
};

struct Device {
    keys: Arc<LocalKeyStore>,
    store: Arc<MemoryStore>,
    manager: ConnectionManager,
}

impl Device {
    fn new(name: &str, auto_accept: bool) -> Self {
        let keys = Arc::new(LocalKeyStore::generate().unwrap());
        let store = Arc::new(MemoryStore::new());
        let profile = Profile::for_identity(keys.as_ref(), name, None);
        let manager = ConnectionManager::new(
            keys.clone(),
            store.clone(),
            profile,
            HandshakePolicy::default().with_auto_accept(auto_accept),
        );
        Self {
            keys,
            store,
            manager,
        }
    }

    /// Profile bytes as served by the GATT server
    fn served_profile(&self) -> Vec<u8> {
        self.manager.local_profile().to_bytes().unwrap()
    }

    fn status_of(&self, other: &Device) -> Option<ConnectionStatus> {
        self.store
            .get_connection_by_user_id(other.keys.user_id())
            .unwrap()
            .map(|c| c.status)
    }
}

/// Requester reads the profile, writes a request, and applies the inline response
fn follow(requester: &Device, responder: &Device) -> HandshakeMessage {
    let peer = Profile::from_bytes(&responder.served_profile()).unwrap();
    requester.manager.on_profile_read(&peer).unwrap();

    let written = HandshakeMessage::Request(requester.manager.outgoing_request())
        .to_bytes()
        .unwrap();
    requester.manager.record_outgoing_request(&peer).unwrap();

    let HandshakeMessage::Request(request) = HandshakeMessage::from_bytes(&written).unwrap() else {
        panic!("expected a request");
    };
    let (_, response) = responder.manager.handle_incoming_request(&request).unwrap();

    let reply = HandshakeMessage::Response(response).to_bytes().unwrap();
    let parsed = HandshakeMessage::from_bytes(&reply).unwrap();
    if let HandshakeMessage::Response(response) = &parsed {
        requester.manager.handle_response(response).unwrap();
    }
    parsed
}

#[test]
fn auto_accept_makes_both_sides_mutual() {
    let alice = Device::new("Alice", true);
    let bob = Device::new("Bob", true);

    let reply = follow(&alice, &bob);
    let HandshakeMessage::Response(response) = reply else {
        panic!("expected a response");
    };
    assert_eq!(response.status, ResponseStatus::Accepted);
    assert_eq!(alice.status_of(&bob), Some(ConnectionStatus::Mutual));
    assert_eq!(bob.status_of(&alice), Some(ConnectionStatus::Mutual));

    // Both ends derive the same secret once the relationship exists
    let ab = alice.manager.shared_secret_for(bob.keys.user_id()).unwrap();
    let ba = bob.manager.shared_secret_for(alice.keys.user_id()).unwrap();
    assert_eq!(ab, ba);
}

#[test]
fn manual_approval_then_rediscovery_syncs() {
    let alice = Device::new("Alice", true);
    let bob = Device::new("Bob", false);

    let HandshakeMessage::Response(response) = follow(&alice, &bob) else {
        panic!("expected a response");
    };
    assert_eq!(response.status, ResponseStatus::Pending);
    assert_eq!(alice.status_of(&bob), Some(ConnectionStatus::PendingSent));
    assert_eq!(bob.status_of(&alice), Some(ConnectionStatus::PendingReceived));

    // Bob approves later; the accepted response never reaches Alice
    let (_, accepted) = bob.manager.accept_request(alice.keys.user_id()).unwrap();
    assert_eq!(accepted.status, ResponseStatus::Accepted);
    assert_eq!(bob.status_of(&alice), Some(ConnectionStatus::Mutual));
    assert_eq!(alice.status_of(&bob), Some(ConnectionStatus::PendingSent));

    // Alice sees Bob again and re-reads his profile
    let peer = Profile::from_bytes(&bob.served_profile()).unwrap();
    alice.manager.on_profile_read(&peer).unwrap();
    assert_eq!(alice.status_of(&bob), Some(ConnectionStatus::Mutual));
}

#[test]
fn late_rejection_removes_the_pending_request() {
    let alice = Device::new("Alice", true);
    let bob = Device::new("Bob", false);
    follow(&alice, &bob);

    let rejection = bob.manager.reject_request(alice.keys.user_id()).unwrap();
    let delivered = HandshakeMessage::from_bytes(
        &HandshakeMessage::Response(rejection).to_bytes().unwrap(),
    )
    .unwrap();
    let HandshakeMessage::Response(rejection) = delivered else {
        panic!("expected a response");
    };
    alice.manager.handle_response(&rejection).unwrap();

    assert_eq!(alice.status_of(&bob), None);
    assert_eq!(bob.status_of(&alice), None);
}

#[test]
fn replayed_follow_is_idempotent() {
    let alice = Device::new("Alice", true);
    let bob = Device::new("Bob", true);
    follow(&alice, &bob);
    follow(&alice, &bob);
    follow(&bob, &alice);

    assert_eq!(alice.store.list_connections().unwrap().len(), 1);
    assert_eq!(bob.store.list_connections().unwrap().len(), 1);
    assert_eq!(alice.status_of(&bob), Some(ConnectionStatus::Mutual));
}

#[test]
fn unfollow_deletes_only_the_local_record() {
    let alice = Device::new("Alice", true);
    let bob = Device::new("Bob", true);
    follow(&alice, &bob);

    assert!(alice.manager.remove(bob.keys.user_id()).unwrap());
    assert_eq!(alice.status_of(&bob), None);
    assert_eq!(bob.status_of(&alice), Some(ConnectionStatus::Mutual));
}

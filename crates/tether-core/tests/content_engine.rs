//! Content engine tests over real handshakes and an in-memory relay

use std::sync::Arc;

use tether_core::{
    ConnectionManager, ContentEngine, EncryptedPost, HandshakePolicy, KeyStore, LocalKeyStore,
    MemoryStore, PostStore, Profile,
};

struct Device {
    keys: Arc<LocalKeyStore>,
    store: Arc<MemoryStore>,
    manager: ConnectionManager,
    content: ContentEngine<MemoryStore>,
}

fn device(name: &str, auto_accept: bool) -> Device {
    let keys = Arc::new(LocalKeyStore::generate().unwrap());
    let store = Arc::new(MemoryStore::new());
    let manager = ConnectionManager::new(
        keys.clone(),
        store.clone(),
        Profile::for_identity(keys.as_ref(), name, None),
        HandshakePolicy::default().with_auto_accept(auto_accept),
    );
    let content = ContentEngine::new(keys.clone(), store.clone());
    Device {
        keys,
        store,
        manager,
        content,
    }
}

fn befriend(a: &Device, b: &Device) {
    a.manager
        .record_outgoing_request(b.manager.local_profile())
        .unwrap();
    let (_, response) = b
        .manager
        .handle_incoming_request(&a.manager.outgoing_request())
        .unwrap();
    a.manager.handle_response(&response).unwrap();
}

/// What a relay would hand back: the JSON it stored
fn relay(post: &EncryptedPost) -> EncryptedPost {
    EncryptedPost::from_json(&post.to_json().unwrap()).unwrap()
}

#[test]
fn mutual_connections_read_and_strangers_do_not() {
    let author = device("author", false);
    let friend = device("friend", true);
    let stranger = device("stranger", true);

    // Pending-received records are not recipients
    befriend(&friend, &author);
    assert_eq!(author.content.publish(b"early".to_vec()).unwrap().recipient_count(), 0);

    author.manager.accept_request(friend.keys.user_id()).unwrap();
    let sealed = author.content.publish(b"hello friends".to_vec()).unwrap();
    assert_eq!(sealed.recipient_count(), 1);

    // Friend only learns of the acceptance on a later profile read
    friend
        .manager
        .on_profile_read(author.manager.local_profile())
        .unwrap();

    let received = relay(&sealed);
    let opened = friend.content.open(&received).unwrap().unwrap();
    assert_eq!(opened.content, b"hello friends");
    assert_eq!(&opened.author_id, author.keys.user_id());

    assert!(stranger.content.open(&received).unwrap().is_none());
}

#[test]
fn lookup_ids_reveal_nothing_about_recipients() {
    let author = device("author", true);
    let friends: Vec<Device> = (0..3).map(|i| device(&format!("f{i}"), true)).collect();
    for friend in &friends {
        befriend(friend, &author);
    }

    let sealed = author.content.publish(b"x".to_vec()).unwrap();
    let json = sealed.to_json().unwrap();
    for friend in &friends {
        assert!(!json.contains(friend.keys.user_id().as_str()));
        assert!(!json.contains(&friend.keys.public_key().to_base64()));
    }

    // Same recipients, different post: unlinkable lookup ids
    let other = author.content.publish(b"y".to_vec()).unwrap();
    for lookup in sealed.wrapped_keys.keys() {
        assert!(!other.wrapped_keys.contains_key(lookup));
    }
}

#[test]
fn readable_posts_skips_foreign_posts() {
    let author = device("author", true);
    let friend = device("friend", true);
    let outsider = device("outsider", true);
    befriend(&friend, &author);

    let mine = author.content.publish(b"for friend".to_vec()).unwrap();
    let theirs = outsider.content.publish(b"for nobody".to_vec()).unwrap();
    friend.store.save_post(relay(&mine)).unwrap();
    friend.store.save_post(relay(&theirs)).unwrap();

    let posts = friend.content.readable_posts().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].content, b"for friend");
}

#[test]
fn tampered_post_does_not_hide_the_others() {
    let author = device("author", true);
    let friend = device("friend", true);
    befriend(&friend, &author);

    let good = author.content.publish(b"intact".to_vec()).unwrap();
    let mut tampered = relay(&author.content.publish(b"altered".to_vec()).unwrap());
    tampered.encrypted_content[0] ^= 0xff;
    friend.store.save_post(relay(&good)).unwrap();
    friend.store.save_post(tampered.clone()).unwrap();

    // Addressed to the friend, but fails authentication on its own
    assert!(friend.content.open(&tampered).is_err());

    let posts = friend.content.readable_posts().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].content, b"intact");
    assert_eq!(posts[0].post_id, good.post_id);
}

#[test]
fn secrets_are_cached_in_connection_records() {
    let author = device("author", true);
    let friend = device("friend", true);
    befriend(&friend, &author);

    author.content.publish(b"x".to_vec()).unwrap();
    let record = author
        .manager
        .get(friend.keys.user_id())
        .unwrap()
        .unwrap();
    assert!(record.shared_secret.is_some());
}

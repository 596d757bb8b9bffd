//! Multi-recipient content sealing
//!
//! A post is encrypted exactly once. Recipients are addressed only through
//! `wrappedKeys`, whose keys are HMAC lookup ids a relay cannot link to users.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionStatus;
use crate::crypto::{self, ContentKey, LookupId};
use crate::identity::{KeyStore, SharedSecret};
use crate::storage::{ConnectionStore, PostStore};
use crate::types::{Timestamp, UserId};
use crate::Result;

// ----------------------------------------------------------------------------
// Post Types
// ----------------------------------------------------------------------------

/// Plaintext post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub post_id: Uuid,
    pub author_id: UserId,
    pub timestamp: Timestamp,
    pub content: Vec<u8>,
}

impl Post {
    pub fn new(author_id: UserId, content: impl Into<Vec<u8>>) -> Self {
        Self {
            post_id: Uuid::new_v4(),
            author_id,
            timestamp: Utc::now(),
            content: content.into(),
        }
    }

    /// Associated data binding the ciphertext to its metadata
    fn associated_data(post_id: &Uuid, author_id: &UserId, timestamp: &Timestamp) -> Vec<u8> {
        format!(
            "{}|{}|{}",
            post_id.hyphenated(),
            author_id,
            timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
        )
        .into_bytes()
    }
}

/// Content key sealed for one recipient: `nonce || ciphertext || tag`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey(pub Vec<u8>);

impl Serialize for WrappedKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        base64_bytes::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for WrappedKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        base64_bytes::deserialize(deserializer).map(WrappedKey)
    }
}

/// Sealed post as stored locally and by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPost {
    pub post_id: Uuid,
    pub author_id: UserId,
    pub timestamp: Timestamp,
    #[serde(with = "base64_bytes")]
    pub encrypted_content: Vec<u8>,
    pub wrapped_keys: BTreeMap<LookupId, WrappedKey>,
}

impl EncryptedPost {
    pub fn recipient_count(&self) -> usize {
        self.wrapped_keys.len()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// Hybrid Encryption
// ----------------------------------------------------------------------------

/// Seal `post` once and wrap its content key for every recipient secret
pub fn encrypt_post(post: &Post, recipients: &[SharedSecret]) -> Result<EncryptedPost> {
    let content_key = ContentKey::generate();
    let aad = Post::associated_data(&post.post_id, &post.author_id, &post.timestamp);
    let encrypted_content = crypto::seal(content_key.as_bytes(), &post.content, &aad)?;

    let mut wrapped_keys = BTreeMap::new();
    for secret in recipients {
        let lookup_id = LookupId::derive(secret, &post.post_id)?;
        let wrapped = crypto::wrap_content_key(secret, &post.post_id, &content_key)?;
        wrapped_keys.insert(lookup_id, WrappedKey(wrapped));
    }

    Ok(EncryptedPost {
        post_id: post.post_id,
        author_id: post.author_id.clone(),
        timestamp: post.timestamp,
        encrypted_content,
        wrapped_keys,
    })
}

/// Open `encrypted` with the first secret whose lookup id is present
///
/// Returns `Ok(None)` when the post is not addressed to any of `secrets`.
/// A matching entry that fails to authenticate is an error.
pub fn decrypt_post(encrypted: &EncryptedPost, secrets: &[SharedSecret]) -> Result<Option<Post>> {
    for secret in secrets {
        let lookup_id = LookupId::derive(secret, &encrypted.post_id)?;
        let Some(wrapped) = encrypted.wrapped_keys.get(&lookup_id) else {
            continue;
        };

        let content_key = crypto::unwrap_content_key(secret, &encrypted.post_id, &wrapped.0)?;
        let aad = Post::associated_data(
            &encrypted.post_id,
            &encrypted.author_id,
            &encrypted.timestamp,
        );
        let content = crypto::open(content_key.as_bytes(), &encrypted.encrypted_content, &aad)?;
        return Ok(Some(Post {
            post_id: encrypted.post_id,
            author_id: encrypted.author_id.clone(),
            timestamp: encrypted.timestamp,
            content,
        }));
    }

    debug!(post_id = %encrypted.post_id, "Post not addressed to any known secret");
    Ok(None)
}

// ----------------------------------------------------------------------------
// Content Engine
// ----------------------------------------------------------------------------

/// Publishes posts to every mutual connection and opens received ones
pub struct ContentEngine<S> {
    keys: Arc<dyn KeyStore>,
    store: Arc<S>,
}

impl<S: ConnectionStore + PostStore> ContentEngine<S> {
    pub fn new(keys: Arc<dyn KeyStore>, store: Arc<S>) -> Self {
        Self { keys, store }
    }

    /// Shared secrets of all mutual connections, caching newly derived ones
    fn recipient_secrets(&self) -> Result<Vec<SharedSecret>> {
        let mut secrets = Vec::new();
        for mut connection in self.store.list_connections()? {
            if connection.status != ConnectionStatus::Mutual {
                continue;
            }
            let (secret, derived) = connection.shared_secret(self.keys.as_ref())?;
            if derived {
                self.store.save_connection(connection)?;
            }
            secrets.push(secret);
        }
        Ok(secrets)
    }

    /// Seal `content` for every mutual connection and store it
    pub fn publish(&self, content: impl Into<Vec<u8>>) -> Result<EncryptedPost> {
        let post = Post::new(self.keys.user_id().clone(), content);
        let recipients = self.recipient_secrets()?;
        let encrypted = encrypt_post(&post, &recipients)?;

        info!(
            post_id = %encrypted.post_id,
            recipients = encrypted.recipient_count(),
            "Published post"
        );
        self.store.save_post(encrypted.clone())?;
        Ok(encrypted)
    }

    /// Open a single post; `None` when it is not addressed to this device
    pub fn open(&self, encrypted: &EncryptedPost) -> Result<Option<Post>> {
        decrypt_post(encrypted, &self.recipient_secrets()?)
    }

    /// Decrypt every stored post addressed to this device
    ///
    /// Posts that fail authentication are logged and skipped.
    pub fn readable_posts(&self) -> Result<Vec<Post>> {
        let secrets = self.recipient_secrets()?;
        let mut posts = Vec::new();
        for encrypted in self.store.get_encrypted_posts()? {
            match decrypt_post(&encrypted, &secrets) {
                Ok(Some(post)) => posts.push(post),
                Ok(None) => {}
                Err(e) => {
                    warn!(post_id = %encrypted.post_id, "Skipping unreadable post: {}", e);
                }
            }
        }
        Ok(posts)
    }
}

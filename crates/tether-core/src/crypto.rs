//! Cryptographic primitives for recipient-hiding content
//!
//! Content is sealed once under a random content key with XChaCha20-Poly1305.
//! Each recipient gets the content key wrapped under a key derived from the
//! pairwise shared secret, filed under an HMAC lookup id that only the two
//! parties can compute. Post ids enter HMAC and HKDF as their canonical
//! hyphenated lowercase string.

use core::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::CryptographicError;
use crate::identity::SharedSecret;
use crate::Result;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Content and wrap key length
pub const KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length, prepended to every sealed blob
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length
pub const TAG_LEN: usize = 16;

const KEY_WRAP_INFO: &[u8] = b"tether-key-wrap-v1";

type HmacSha256 = Hmac<Sha256>;

// ----------------------------------------------------------------------------
// Content Key
// ----------------------------------------------------------------------------

/// Random per-post symmetric key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ContentKey([u8; KEY_LEN]);

impl ContentKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentKey(<redacted>)")
    }
}

// ----------------------------------------------------------------------------
// Lookup Id
// ----------------------------------------------------------------------------

/// Opaque per-recipient index into a post's wrapped keys (base64 of an HMAC)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LookupId(String);

impl LookupId {
    /// `HMAC-SHA256(sharedSecret, postId)`
    pub fn derive(secret: &SharedSecret, post_id: &Uuid) -> Result<Self> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
            .map_err(|_| CryptographicError::KeyDerivationFailed)?;
        mac.update(post_id_bytes(post_id).as_bytes());
        Ok(Self(BASE64.encode(mac.finalize().into_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LookupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn post_id_bytes(post_id: &Uuid) -> String {
    post_id.hyphenated().to_string()
}

// ----------------------------------------------------------------------------
// AEAD Helpers
// ----------------------------------------------------------------------------

/// Seal `plaintext` under `key`; output is `nonce || ciphertext || tag`
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptographicError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a blob produced by [`seal`]
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptographicError::DecryptionFailed.into());
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptographicError::DecryptionFailed.into())
}

// ----------------------------------------------------------------------------
// Key Wrapping
// ----------------------------------------------------------------------------

/// `HKDF-SHA256(ikm = sharedSecret, salt = postId, info = "tether-key-wrap-v1")`
fn derive_wrap_key(secret: &SharedSecret, post_id: &Uuid) -> Result<[u8; KEY_LEN]> {
    let salt = post_id_bytes(post_id);
    let mut wrap_key = [0u8; KEY_LEN];
    Hkdf::<Sha256>::new(Some(salt.as_bytes()), secret.as_bytes())
        .expand(KEY_WRAP_INFO, &mut wrap_key)
        .map_err(|_| CryptographicError::KeyDerivationFailed)?;
    Ok(wrap_key)
}

/// Wrap `content_key` for the holder of `secret`
pub fn wrap_content_key(
    secret: &SharedSecret,
    post_id: &Uuid,
    content_key: &ContentKey,
) -> Result<Vec<u8>> {
    let mut wrap_key = derive_wrap_key(secret, post_id)?;
    let wrapped = seal(&wrap_key, content_key.as_bytes(), &[]);
    wrap_key.zeroize();
    wrapped
}

/// Recover a content key wrapped by [`wrap_content_key`]
pub fn unwrap_content_key(
    secret: &SharedSecret,
    post_id: &Uuid,
    wrapped: &[u8],
) -> Result<ContentKey> {
    let mut wrap_key = derive_wrap_key(secret, post_id)?;
    let opened = open(&wrap_key, wrapped, &[]);
    wrap_key.zeroize();

    let mut bytes = opened.map_err(|_| CryptographicError::KeyUnwrapFailed)?;
    let key: [u8; KEY_LEN] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptographicError::KeyUnwrapFailed)?;
    bytes.zeroize();
    Ok(ContentKey(key))
}

//! Long-term identity and key store
//!
//! The key store is the only holder of private key material. It exposes signing
//! and shared-secret derivation, never the raw keys. `LocalKeyStore` derives an
//! Ed25519 signing key and an X25519 agreement key from one 32-byte seed.

use core::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand_core::{CryptoRng, OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::CryptographicError;
use crate::types::UserId;
use crate::Result;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

const AGREEMENT_KEY_INFO: &[u8] = b"tether-agreement-key-v1";
const SHARED_SECRET_INFO: &[u8] = b"tether-shared-secret-v1";

// ----------------------------------------------------------------------------
// Public Key
// ----------------------------------------------------------------------------

/// X25519 agreement public key, carried as base64 on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| CryptographicError::InvalidKeyFormat)?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptographicError::InvalidKeyFormat)?;
        Ok(Self(key))
    }

    /// User id derived from this key
    pub fn user_id(&self) -> UserId {
        UserId::from_public_key(&self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        PublicKey::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// Shared Secret
// ----------------------------------------------------------------------------

/// 32-byte per-connection secret. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

impl Serialize for SharedSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for SharedSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(encoded).map_err(serde::de::Error::custom)?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("shared secret must be 32 bytes"))?;
        Ok(Self(secret))
    }
}

// ----------------------------------------------------------------------------
// Key Store Trait
// ----------------------------------------------------------------------------

/// Holder of the long-term keypair
pub trait KeyStore: Send + Sync {
    /// Identifier derived from the public key
    fn user_id(&self) -> &UserId;

    /// Agreement public key published in the profile
    fn public_key(&self) -> PublicKey;

    /// Ed25519 verifying key for signatures produced by [`KeyStore::sign`]
    fn verifying_key(&self) -> [u8; 32];

    /// Deterministic Ed25519 signature
    fn sign(&self, message: &[u8]) -> [u8; 64];

    /// Derive the secret shared with the owner of `peer`
    fn derive_shared_secret(&self, peer: &PublicKey) -> Result<SharedSecret>;
}

/// Verify a signature produced by some key store
pub fn verify_signature(verifying_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<()> {
    let key = VerifyingKey::from_bytes(verifying_key)
        .map_err(|_| CryptographicError::InvalidKeyFormat)?;
    key.verify(message, &Signature::from_bytes(signature))
        .map_err(|_| CryptographicError::SignatureVerificationFailed.into())
}

// ----------------------------------------------------------------------------
// Local Key Store
// ----------------------------------------------------------------------------

/// In-process key store backed by a single 32-byte seed
pub struct LocalKeyStore {
    seed: [u8; 32],
    signing_key: SigningKey,
    agreement_key: StaticSecret,
    public_key: PublicKey,
    user_id: UserId,
}

impl LocalKeyStore {
    /// Generate a new random identity
    pub fn generate() -> Result<Self> {
        Self::generate_with_rng(&mut OsRng)
    }

    /// Generate a new identity with a custom RNG
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self> {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        let store = Self::from_seed(seed);
        seed.zeroize();
        store
    }

    /// Restore an identity from its seed
    pub fn from_seed(seed: [u8; 32]) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(&seed);

        let mut agreement_bytes = [0u8; 32];
        Hkdf::<Sha256>::new(None, &seed)
            .expand(AGREEMENT_KEY_INFO, &mut agreement_bytes)
            .map_err(|_| CryptographicError::KeyDerivationFailed)?;
        let agreement_key = StaticSecret::from(agreement_bytes);
        agreement_bytes.zeroize();

        let public_key = PublicKey(X25519Public::from(&agreement_key).to_bytes());
        let user_id = public_key.user_id();

        Ok(Self {
            seed,
            signing_key,
            agreement_key,
            public_key,
            user_id,
        })
    }

    /// Export the seed for persistence by the identity owner
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.seed
    }
}

impl Drop for LocalKeyStore {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

impl fmt::Debug for LocalKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyStore")
            .field("user_id", &self.user_id)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl KeyStore for LocalKeyStore {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn verifying_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    fn derive_shared_secret(&self, peer: &PublicKey) -> Result<SharedSecret> {
        let dh = self
            .agreement_key
            .diffie_hellman(&X25519Public::from(*peer.as_bytes()));
        if !dh.was_contributory() {
            return Err(CryptographicError::KeyDerivationFailed.into());
        }

        // Bind both public keys in a canonical order so each side derives the same secret
        let (first, second) = if self.public_key.as_bytes() <= peer.as_bytes() {
            (self.public_key.as_bytes(), peer.as_bytes())
        } else {
            (peer.as_bytes(), self.public_key.as_bytes())
        };
        let mut info = Vec::with_capacity(SHARED_SECRET_INFO.len() + 64);
        info.extend_from_slice(SHARED_SECRET_INFO);
        info.extend_from_slice(first);
        info.extend_from_slice(second);

        let mut secret = [0u8; 32];
        Hkdf::<Sha256>::new(None, dh.as_bytes())
            .expand(&info, &mut secret)
            .map_err(|_| CryptographicError::KeyDerivationFailed)?;
        Ok(SharedSecret(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_secret() {
        let alice = LocalKeyStore::generate().unwrap();
        let bob = LocalKeyStore::generate().unwrap();

        let ab = alice.derive_shared_secret(&bob.public_key()).unwrap();
        let ba = bob.derive_shared_secret(&alice.public_key()).unwrap();
        assert_eq!(ab, ba);

        let carol = LocalKeyStore::generate().unwrap();
        let ac = alice.derive_shared_secret(&carol.public_key()).unwrap();
        assert_ne!(ab, ac);
    }

    #[test]
    fn seed_restores_identity() {
        let original = LocalKeyStore::generate().unwrap();
        let restored = LocalKeyStore::from_seed(original.seed_bytes()).unwrap();
        assert_eq!(original.user_id(), restored.user_id());
        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn signatures_verify() {
        let store = LocalKeyStore::generate().unwrap();
        let sig = store.sign(b"epoch-42");
        assert!(verify_signature(&store.verifying_key(), b"epoch-42", &sig).is_ok());
        assert!(verify_signature(&store.verifying_key(), b"epoch-43", &sig).is_err());
    }

    #[test]
    fn low_order_peer_key_is_rejected() {
        let store = LocalKeyStore::generate().unwrap();
        let zero = PublicKey::from_bytes([0u8; 32]);
        assert!(store.derive_shared_secret(&zero).is_err());
    }

    #[test]
    fn public_key_base64_round_trip() {
        let store = LocalKeyStore::generate().unwrap();
        let encoded = store.public_key().to_base64();
        assert_eq!(PublicKey::from_base64(&encoded).unwrap(), store.public_key());
        assert!(PublicKey::from_base64("AAAA").is_err());
    }
}

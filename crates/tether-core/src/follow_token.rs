//! Rotating follow tokens
//!
//! The advertised token is the first four bytes of `SHA-256(sign(epoch))`, so
//! only the key holder can produce it and it changes every rotation window.

use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::identity::KeyStore;
use crate::types::{FollowToken, Timestamp};

/// Default rotation window
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(45);

const FOLLOW_TOKEN_CONTEXT: &[u8] = b"tether-follow-token-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowTokenSchedule {
    interval_ms: u64,
}

impl FollowTokenSchedule {
    /// A zero interval is treated as one millisecond
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: (interval.as_millis() as u64).max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Rotation window containing `now`
    pub fn epoch(&self, now: Timestamp) -> u64 {
        now.timestamp_millis().max(0) as u64 / self.interval_ms
    }

    pub fn token_for_epoch<K: KeyStore + ?Sized>(&self, keys: &K, epoch: u64) -> FollowToken {
        let mut message = Vec::with_capacity(FOLLOW_TOKEN_CONTEXT.len() + 8);
        message.extend_from_slice(FOLLOW_TOKEN_CONTEXT);
        message.extend_from_slice(&epoch.to_be_bytes());
        let signature = keys.sign(&message);
        FollowToken::from_slice_lossy(&Sha256::digest(signature)[..FollowToken::LEN])
    }

    pub fn current<K: KeyStore + ?Sized>(&self, keys: &K, now: Timestamp) -> FollowToken {
        self.token_for_epoch(keys, self.epoch(now))
    }

    /// Time left until the next window starts
    pub fn until_next_rotation(&self, now: Timestamp) -> Duration {
        let elapsed = now.timestamp_millis().max(0) as u64 % self.interval_ms;
        Duration::from_millis(self.interval_ms - elapsed)
    }
}

impl Default for FollowTokenSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_ROTATION_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::identity::LocalKeyStore;

    #[test]
    fn token_is_stable_within_a_window_and_rotates_across() {
        let keys = LocalKeyStore::from_seed([5u8; 32]).unwrap();
        let schedule = FollowTokenSchedule::default();
        let start = Utc.timestamp_opt(45 * 1_000, 0).unwrap();

        let first = schedule.current(&keys, start);
        assert_eq!(
            first,
            schedule.current(&keys, start + chrono::Duration::seconds(44))
        );
        assert_ne!(
            first,
            schedule.current(&keys, start + chrono::Duration::seconds(45))
        );
    }

    #[test]
    fn tokens_differ_between_identities() {
        let a = LocalKeyStore::from_seed([1u8; 32]).unwrap();
        let b = LocalKeyStore::from_seed([2u8; 32]).unwrap();
        let schedule = FollowTokenSchedule::default();
        assert_ne!(schedule.token_for_epoch(&a, 7), schedule.token_for_epoch(&b, 7));
    }

    #[test]
    fn rotation_delay_counts_down_to_the_boundary() {
        let schedule = FollowTokenSchedule::new(Duration::from_secs(45));
        let now = Utc.timestamp_opt(45 * 10 + 40, 0).unwrap();
        assert_eq!(schedule.until_next_rotation(now), Duration::from_secs(5));
    }
}

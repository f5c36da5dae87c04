//! Bounded, time-windowed memory of nonces already accepted.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::verify::ReplayCache;

/// Sweep expired entries once per this many accepted nonces.
const SWEEP_EVERY: u64 = 1024;

type NonceKey = [u8; 24];

/// In-memory [`ReplayCache`] with a TTL and an entry cap.
///
/// A `(machine, nonce)` pair is burned for `ttl` after it is first seen.
/// Past `max_entries` some other entry is dropped to make room. The victim
/// is arbitrary, not least recently used, so under sustained flooding an
/// older nonce's window can end before `ttl`. The nonce just accepted is
/// never the one dropped.
///
/// Keys are truncated SHA-256 digests: nonces are client-chosen and may be
/// any length.
///
/// ```
/// use klefki_auth::authn::{BoundedReplayCache, ReplayCache};
/// use std::time::Duration;
///
/// let cache = BoundedReplayCache::new(Duration::from_secs(3600), 10_000);
/// assert!(cache.check_and_insert("SHA256:abc", "nonce-1"));
/// assert!(!cache.check_and_insert("SHA256:abc", "nonce-1"));
/// ```
pub struct BoundedReplayCache {
    seen: DashMap<NonceKey, Instant>,
    ttl: Duration,
    max_entries: usize,
    accepted: AtomicU64,
}

impl BoundedReplayCache {
    /// `ttl` should be at least the accepted clock skew window, otherwise a
    /// nonce can be replayed while its timestamp still passes.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen: DashMap::with_capacity(max_entries.min(4096)),
            ttl,
            max_entries,
            accepted: AtomicU64::new(0),
        }
    }

    /// Drop entries older than the TTL. Lookups already ignore them; this
    /// only reclaims memory.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.seen.retain(|_, first_seen| now.duration_since(*first_seen) < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn key(machine_id: &str, nonce: &str) -> NonceKey {
        let machine = Sha256::digest(machine_id.as_bytes());
        let nonce = Sha256::digest(nonce.as_bytes());

        let mut key = [0u8; 24];
        key[..8].copy_from_slice(&machine[..8]);
        key[8..].copy_from_slice(&nonce[..16]);
        key
    }

    /// Shrink back to `max_entries`, sparing `keep`.
    fn make_room(&self, keep: &NonceKey) {
        while self.seen.len() > self.max_entries {
            // The iterator's shard guard must be gone before `remove`
            let victim = self
                .seen
                .iter()
                .map(|entry| *entry.key())
                .find(|key| key != keep);
            match victim {
                Some(key) => {
                    self.seen.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl ReplayCache for BoundedReplayCache {
    fn check_and_insert(&self, machine_id: &str, nonce: &str) -> bool {
        let key = Self::key(machine_id, nonce);
        let now = Instant::now();

        // The entry guard holds the shard lock, so two racing callers
        // cannot both see the slot as free.
        let fresh = match self.seen.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            Entry::Occupied(mut slot) if now.duration_since(*slot.get()) >= self.ttl => {
                slot.insert(now);
                true
            }
            Entry::Occupied(_) => false,
        };

        if fresh {
            if self.accepted.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == 0 {
                self.cleanup_expired();
            }
            self.make_room(&key);
        }

        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const WEB1: &str = "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU";
    const DB1: &str = "SHA256:ypeBEsobvcr6wjGzmiPcTaeG7/gUfE5yuYB3ha/uSLs";

    fn cache(ttl: Duration) -> BoundedReplayCache {
        BoundedReplayCache::new(ttl, 1000)
    }

    #[test]
    fn second_presentation_is_a_replay() {
        let cache = cache(Duration::from_secs(60));

        assert!(cache.check_and_insert(WEB1, "n-1"));
        assert!(!cache.check_and_insert(WEB1, "n-1"));
        assert!(cache.check_and_insert(WEB1, "n-2"));
    }

    #[test]
    fn nonces_are_scoped_per_machine() {
        let cache = cache(Duration::from_secs(60));

        assert!(cache.check_and_insert(WEB1, "n-1"));
        assert!(cache.check_and_insert(DB1, "n-1"));
    }

    #[test]
    fn long_nonces_are_fine() {
        let cache = cache(Duration::from_secs(60));
        let long = "x".repeat(64 * 1024);

        assert!(cache.check_and_insert(WEB1, &long));
        assert!(!cache.check_and_insert(WEB1, &long));
    }

    #[test]
    fn capacity_is_respected() {
        let cache = BoundedReplayCache::new(Duration::from_secs(60), 8);

        for i in 0..50 {
            cache.check_and_insert(WEB1, &format!("n-{i}"));
        }

        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn full_cache_still_rejects_the_nonce_just_accepted() {
        let cache = BoundedReplayCache::new(Duration::from_secs(3600), 2);

        for i in 0..200 {
            assert!(cache.check_and_insert(WEB1, &format!("a-{i}")));
            assert!(cache.check_and_insert(DB1, &format!("b-{i}")));
            assert!(!cache.check_and_insert(DB1, &format!("b-{i}")), "round {i}");
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn racing_threads_accept_a_nonce_once() {
        let cache = Arc::new(cache(Duration::from_secs(60)));

        let accepted = (0..12)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.check_and_insert(WEB1, "boot-1"))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|fresh| *fresh)
            .count();

        assert_eq!(accepted, 1);
    }

    #[test]
    fn expired_nonce_may_be_reused_and_swept() {
        let cache = cache(Duration::from_millis(10));

        assert!(cache.check_and_insert(WEB1, "n-1"));
        thread::sleep(Duration::from_millis(25));

        assert!(cache.check_and_insert(WEB1, "n-1"));
        thread::sleep(Duration::from_millis(25));

        cache.cleanup_expired();
        assert!(cache.is_empty());
    }
}

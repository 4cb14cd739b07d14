//! The in-process near tier: a bounded key-to-bytes map.
//!
//! Entries carry unit weight; when the population exceeds `max_size` the
//! least-recently-accessed entry is evicted, ties broken by insertion
//! order. Per-entry expiration honors the absolute and sliding forms, the
//! earlier deadline winning. An eviction callback lets the owner clean up
//! sidecar state; callbacks run while holding no locks.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::expiration::Effective;

/// Why an entry left the near tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Displaced by the size bound.
    Capacity,
    /// Its deadline elapsed.
    Expired,
    /// Explicitly removed.
    Removed,
    /// Dropped by a received invalidation event.
    Invalidated,
    /// The store was cleared.
    Cleared,
}

/// Callback invoked after an entry leaves the store.
pub type EvictionCallback = Arc<dyn Fn(&str, EvictionReason) + Send + Sync>;

#[derive(Debug, Clone)]
struct NearEntry {
    value: Arc<Vec<u8>>,
    /// Hard absolute cap; sliding bumps never pass it.
    deadline: Option<Instant>,
    sliding: Option<Duration>,
    /// Current effective expiry.
    expires_at: Option<Instant>,
}

impl NearEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Re-arm the sliding window, clamped to the absolute budget.
    fn touch(&mut self, now: Instant) {
        if let Some(window) = self.sliding {
            let bumped = now + window;
            self.expires_at = Some(match self.deadline {
                Some(cap) => bumped.min(cap),
                None => bumped,
            });
        }
    }
}

enum Lookup {
    Missing,
    Expired,
    Live,
}

struct Inner {
    entries: HashMap<String, NearEntry>,
    /// Access order, front = least recently used.
    access_order: VecDeque<String>,
}

impl Inner {
    fn lookup(&self, key: &str, now: Instant) -> Lookup {
        match self.entries.get(key) {
            None => Lookup::Missing,
            Some(entry) if entry.is_expired(now) => Lookup::Expired,
            Some(_) => Lookup::Live,
        }
    }

    fn mark_used(&mut self, key: &str) {
        self.access_order.retain(|k| k != key);
        self.access_order.push_back(key.to_string());
    }

    fn forget(&mut self, key: &str) {
        self.access_order.retain(|k| k != key);
    }
}

/// Bounded in-memory cache with LRU eviction and per-entry expiration.
pub struct NearCache {
    inner: Mutex<Inner>,
    max_size: usize,
    default_ttl: Duration,
    on_evict: Option<EvictionCallback>,
}

impl NearCache {
    /// Create a near cache bounded at `max_size` entries, applying
    /// `default_ttl` to entries stored without an explicit policy.
    #[must_use]
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                access_order: VecDeque::new(),
            }),
            max_size,
            default_ttl,
            on_evict: None,
        }
    }

    /// Install the eviction callback.
    #[must_use]
    pub fn with_eviction_callback(mut self, callback: EvictionCallback) -> Self {
        self.on_evict = Some(callback);
        self
    }

    /// Look up `key`, bumping its recency and sliding window on a hit.
    /// Expired entries are removed on the way.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let now = Instant::now();
        let (result, evicted) = {
            let mut inner = self.inner.lock().expect("near cache lock poisoned");
            match inner.lookup(key, now) {
                Lookup::Missing => (None, None),
                Lookup::Expired => {
                    inner.entries.remove(key);
                    inner.forget(key);
                    (None, Some((key.to_string(), EvictionReason::Expired)))
                }
                Lookup::Live => {
                    let value = inner.entries.get_mut(key).map(|entry| {
                        entry.touch(now);
                        Arc::clone(&entry.value)
                    });
                    inner.mark_used(key);
                    (value, None)
                }
            }
        };
        self.notify(evicted);
        result
    }

    /// Check for a live entry without bumping recency or sliding state.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock().expect("near cache lock poisoned");
        inner
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Insert or overwrite `key`. `effective` comes from
    /// [`Expiration::resolve`](crate::Expiration::resolve); when it carries
    /// no TTL at all the configured default absolute TTL applies.
    pub fn set(&self, key: &str, value: Arc<Vec<u8>>, effective: Effective) {
        let now = Instant::now();
        let deadline = effective.absolute.map(|d| now + d);
        let expires_at = match effective.initial_ttl {
            Some(ttl) => Some(now + ttl),
            None => Some(now + self.default_ttl),
        };
        let entry = NearEntry {
            value,
            deadline: if effective.absolute.is_some() || effective.sliding.is_some() {
                deadline
            } else {
                expires_at
            },
            sliding: effective.sliding,
            expires_at,
        };

        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock().expect("near cache lock poisoned");
            inner.entries.insert(key.to_string(), entry);
            inner.mark_used(key);

            while inner.entries.len() > self.max_size {
                let Some(victim) = inner.access_order.pop_front() else {
                    break;
                };
                inner.entries.remove(&victim);
                evicted.push((victim, EvictionReason::Capacity));
            }
        }
        for (victim, reason) in evicted {
            if let Some(cb) = &self.on_evict {
                cb(&victim, reason);
            }
        }
    }

    /// Remove `key`, returning whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.take(key, EvictionReason::Removed)
    }

    /// Remove `key` in response to a received invalidation event.
    pub fn invalidate(&self, key: &str) -> bool {
        self.take(key, EvictionReason::Invalidated)
    }

    fn take(&self, key: &str, reason: EvictionReason) -> bool {
        let removed = {
            let mut inner = self.inner.lock().expect("near cache lock poisoned");
            let removed = inner.entries.remove(key).is_some();
            if removed {
                inner.forget(key);
            }
            removed
        };
        if removed {
            self.notify(Some((key.to_string(), reason)));
        }
        removed
    }

    /// Re-arm the sliding window of `key` without reading its value.
    /// Returns `false` when the entry is absent or expired.
    pub fn refresh(&self, key: &str) -> bool {
        let now = Instant::now();
        let (refreshed, evicted) = {
            let mut inner = self.inner.lock().expect("near cache lock poisoned");
            match inner.lookup(key, now) {
                Lookup::Missing => (false, None),
                Lookup::Expired => {
                    inner.entries.remove(key);
                    inner.forget(key);
                    (false, Some((key.to_string(), EvictionReason::Expired)))
                }
                Lookup::Live => {
                    if let Some(entry) = inner.entries.get_mut(key) {
                        entry.touch(now);
                    }
                    inner.mark_used(key);
                    (true, None)
                }
            }
        };
        self.notify(evicted);
        refreshed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let keys: Vec<String> = {
            let mut inner = self.inner.lock().expect("near cache lock poisoned");
            inner.access_order.clear();
            inner.entries.drain().map(|(k, _)| k).collect()
        };
        for key in keys {
            if let Some(cb) = &self.on_evict {
                cb(&key, EvictionReason::Cleared);
            }
        }
    }

    /// Number of entries currently held, expired-but-unreaped included.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("near cache lock poisoned")
            .entries
            .len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, evicted: Option<(String, EvictionReason)>) {
        if let (Some(cb), Some((key, reason))) = (&self.on_evict, evicted) {
            cb(&key, reason);
        }
    }
}

impl std::fmt::Debug for NearCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NearCache")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiration::Expiration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::OffsetDateTime;

    fn effective(expiration: Expiration) -> Effective {
        expiration.resolve(OffsetDateTime::now_utc()).unwrap()
    }

    fn bytes(data: &[u8]) -> Arc<Vec<u8>> {
        Arc::new(data.to_vec())
    }

    #[test]
    fn test_set_get_roundtrip() {
        let cache = NearCache::new(10, Duration::from_secs(60));
        cache.set("a", bytes(b"alpha"), effective(Expiration::none()));
        assert_eq!(cache.get("a"), Some(bytes(b"alpha")));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_remove_is_terminal() {
        let cache = NearCache::new(10, Duration::from_secs(60));
        cache.set("a", bytes(b"alpha"), effective(Expiration::none()));
        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_absolute_expiration() {
        let cache = NearCache::new(10, Duration::from_secs(60));
        cache.set(
            "a",
            bytes(b"alpha"),
            effective(Expiration::after(Duration::from_millis(30))),
        );
        assert!(cache.get("a").is_some());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get("a"), None);
        // The expired read reaped the entry.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_sliding_bump_extends_life() {
        let cache = NearCache::new(10, Duration::from_secs(60));
        cache.set(
            "a",
            bytes(b"alpha"),
            effective(Expiration::sliding(Duration::from_millis(80))),
        );
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(40));
            assert!(cache.get("a").is_some(), "read inside window must hit");
        }
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_sliding_never_exceeds_absolute_budget() {
        let cache = NearCache::new(10, Duration::from_secs(60));
        cache.set(
            "a",
            bytes(b"alpha"),
            effective(
                Expiration::after(Duration::from_millis(100))
                    .with_sliding(Duration::from_millis(80)),
            ),
        );
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("a").is_some());
        // The bump may not pass the absolute deadline.
        std::thread::sleep(Duration::from_millis(70));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = NearCache::new(2, Duration::from_secs(60));
        cache.set("a", bytes(b"1"), effective(Expiration::none()));
        cache.set("b", bytes(b"2"), effective(Expiration::none()));
        // Touch `a` so `b` becomes the eviction victim.
        assert!(cache.get("a").is_some());
        cache.set("c", bytes(b"3"), effective(Expiration::none()));

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_size_bound_holds() {
        let cache = NearCache::new(3, Duration::from_secs(60));
        for i in 0..50 {
            cache.set(&format!("k{i}"), bytes(b"v"), effective(Expiration::none()));
            assert!(cache.len() <= 3);
        }
    }

    #[test]
    fn test_eviction_callback_fires() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evictions);
        let cache = NearCache::new(1, Duration::from_secs(60)).with_eviction_callback(Arc::new(
            move |_key, reason| {
                assert_eq!(reason, EvictionReason::Capacity);
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ));
        cache.set("a", bytes(b"1"), effective(Expiration::none()));
        cache.set("b", bytes(b"2"), effective(Expiration::none()));
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refresh_rearms_sliding() {
        let cache = NearCache::new(10, Duration::from_secs(60));
        cache.set(
            "a",
            bytes(b"alpha"),
            effective(Expiration::sliding(Duration::from_millis(80))),
        );
        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.refresh("a"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get("a").is_some());
        assert!(!cache.refresh("missing"));
    }

    #[test]
    fn test_clear() {
        let cache = NearCache::new(10, Duration::from_secs(60));
        cache.set("a", bytes(b"1"), effective(Expiration::none()));
        cache.set("b", bytes(b"2"), effective(Expiration::none()));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_reports_reason() {
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        let cache = NearCache::new(10, Duration::from_secs(60)).with_eviction_callback(Arc::new(
            move |key, reason| {
                sink.lock().unwrap().push((key.to_string(), reason));
            },
        ));
        cache.set("a", bytes(b"1"), effective(Expiration::none()));
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        let seen = reasons.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[("a".to_string(), EvictionReason::Invalidated)]
        );
    }
}

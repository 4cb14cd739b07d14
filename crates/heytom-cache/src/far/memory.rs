//! In-process implementation of the far-tier contract.
//!
//! Backs the core test-suite and single-process deployments that want the
//! coordinator's semantics without a remote server. Values expire lazily:
//! a dead entry is reaped by the next operation that touches it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{FarStore, MessageHandler, Subscription};
use crate::error::{CacheError, Result};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct ValueEntry {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn new(bytes: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            bytes,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-memory far store: a mutex-guarded K/V map with lazy TTL,
/// dashmap-backed data-structure namespaces, broadcast pub/sub, and
/// atomic compare-and-act primitives.
///
/// The K/V namespace sits behind one mutex so multi-key removal and the
/// compare-and-act operations are single critical sections: no observer
/// sees a primary key gone while its sibling still lingers.
#[derive(Default)]
pub struct MemoryFarStore {
    kv: Mutex<HashMap<String, ValueEntry>>,
    hashes: DashMap<String, HashMap<String, Vec<u8>>>,
    lists: DashMap<String, VecDeque<Vec<u8>>>,
    sets: DashMap<String, HashSet<Vec<u8>>>,
    zsets: DashMap<String, Vec<(Vec<u8>, f64)>>,
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryFarStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::connection("memory far store is closed"))
        } else {
            Ok(())
        }
    }

    /// Reap-and-read: removes the entry when expired.
    fn live_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut kv = self.kv.lock().expect("far kv lock poisoned");
        if let Some(entry) = kv.get(key) {
            if entry.is_live(now) {
                return Some(entry.bytes.clone());
            }
            kv.remove(key);
        }
        None
    }
}

#[async_trait]
impl FarStore for MemoryFarStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.live_bytes(key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.ensure_open()?;
        self.kv
            .lock()
            .expect("far kv lock poisoned")
            .insert(key.to_string(), ValueEntry::new(value.to_vec(), ttl));
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<u64> {
        self.ensure_open()?;
        let now = Instant::now();
        // One critical section for the whole batch: a concurrent reader
        // never observes some of the listed keys gone and others not.
        let mut kv = self.kv.lock().expect("far kv lock poisoned");
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = kv.remove(*key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut kv = self.kv.lock().expect("far kv lock poisoned");
        match kv.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_vec());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        self.ensure_open()?;
        Ok(self
            .hashes
            .get(key)
            .map(|hash| hash.value().clone())
            .unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        self.ensure_open()?;
        let Some(mut hash) = self.hashes.get_mut(key) else {
            return Ok(false);
        };
        Ok(hash.remove(field).is_some())
    }

    async fn list_push(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.ensure_open()?;
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_vec());
        Ok(list.len() as u64)
    }

    async fn list_pop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let popped = match self.lists.get_mut(key) {
            Some(mut list) => list.pop_front(),
            None => None,
        };
        self.lists.remove_if(key, |_, list| list.is_empty());
        Ok(popped)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn set_add(&self, key: &str, member: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_vec()))
    }

    async fn set_remove(&self, key: &str, member: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        let Some(mut set) = self.sets.get_mut(key) else {
            return Ok(false);
        };
        Ok(set.remove(member))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sorted_add(&self, key: &str, member: &[u8], score: f64) -> Result<bool> {
        self.ensure_open()?;
        let mut zset = self.zsets.entry(key.to_string()).or_default();
        match zset.iter_mut().find(|(m, _)| m == member) {
            Some((_, existing)) => {
                *existing = score;
                Ok(false)
            }
            None => {
                zset.push((member.to_vec(), score));
                Ok(true)
            }
        }
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        let Some(zset) = self.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut matching: Vec<(Vec<u8>, f64)> = zset
            .iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .cloned()
            .collect();
        // Ascending by score, ties by member bytes.
        matching.sort_by(|(ma, sa), (mb, sb)| {
            sa.partial_cmp(sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ma.cmp(mb))
        });
        Ok(matching.into_iter().map(|(member, _)| member).collect())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64> {
        self.ensure_open()?;
        match self.channels.get(channel) {
            Some(sender) => Ok(sender.send(payload.to_vec()).unwrap_or(0) as u64),
            None => Ok(0),
        }
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>> {
        self.ensure_open()?;
        let sender = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let mut receiver = sender.subscribe();
        let active = Arc::new(AtomicBool::new(true));
        let task_active = Arc::clone(&active);
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => handler(payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "memory pub/sub receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            task_active.store(false, Ordering::Release);
        });
        Ok(Box::new(MemorySubscription {
            handle: Some(handle),
            active,
        }))
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut kv = self.kv.lock().expect("far kv lock poisoned");
        if kv.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        kv.insert(key.to_string(), ValueEntry::new(value.to_vec(), Some(ttl)));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut kv = self.kv.lock().expect("far kv lock poisoned");
        let owns = kv
            .get(key)
            .is_some_and(|entry| entry.is_live(now) && entry.bytes == expected);
        if owns {
            kv.remove(key);
        }
        Ok(owns)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut kv = self.kv.lock().expect("far kv lock poisoned");
        match kv.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.bytes == expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.channels.clear();
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySubscription {
    handle: Option<JoinHandle<()>>,
    active: Arc<AtomicBool>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.active.store(false, Ordering::Release);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

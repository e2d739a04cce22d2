//! Counter store: atomic increment-and-read with per-key expiry.
//!
//! The store is the only component touching shared mutable state, and its
//! atomicity is the sole correctness mechanism across process instances — no
//! lock spans an admission decision. A clustered deployment implements
//! [`CounterStore`] over a backend with INCR + conditional-EXPIRE semantics;
//! [`MemoryStore`] provides the same contract in-process for single-instance
//! deployments and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::StoreError;

/// Atomic counter storage shared by all admission controller instances.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` by 1 and return the post-increment value.
    ///
    /// A key created by this call gets `ttl`; increments on an existing key
    /// must NOT refresh it, otherwise a steady request stream would keep a
    /// bucket alive past its boundary.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Current value, 0 when absent. Never touches expiry.
    async fn get(&self, key: &str) -> Result<u64, StoreError>;

    /// Batched read with `get` semantics, one value per input key in order.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<u64>, StoreError>;

    /// Last-admitted-event timestamp for a tenant (cooldown marker).
    async fn marker(&self, tenant: &str) -> Result<Option<u64>, StoreError>;

    /// Upsert the cooldown marker. Last-write-wins is acceptable: cooldown is
    /// a spacing guarantee, not an accounting one.
    async fn set_marker(&self, tenant: &str, ts: u64) -> Result<(), StoreError>;
}

#[derive(Debug)]
struct Entry {
    count: u64,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct Inner {
    counters: HashMap<String, Entry>,
    markers: HashMap<String, u64>,
}

/// In-process [`CounterStore`] backed by a mutex-guarded map.
///
/// Expiry is lazy: an entry past its deadline is treated as absent and purged
/// on the next access to its key. Time comes from the injected [`Clock`], so
/// tests drive expiry deterministically.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, inner: Arc::new(Mutex::new(Inner::default())) }
    }

    /// Number of live (unexpired) counters; diagnostics only.
    pub fn live_counters(&self) -> usize {
        let now = self.clock.now_unix();
        let inner = self.inner.lock().unwrap();
        inner.counters.values().filter(|e| e.expires_at > now).count()
    }

    fn purge_if_expired(inner: &mut Inner, key: &str, now: u64) {
        let expired = matches!(inner.counters.get(key), Some(e) if e.expires_at <= now);
        if expired {
            inner.counters.remove(key);
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now_unix();
        let mut inner = self.inner.lock().unwrap();
        Self::purge_if_expired(&mut inner, key, now);
        let entry = inner
            .counters
            .entry(key.to_string())
            .or_insert(Entry { count: 0, expires_at: now + ttl.as_secs() });
        entry.count += 1;
        Ok(entry.count)
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_unix();
        let mut inner = self.inner.lock().unwrap();
        Self::purge_if_expired(&mut inner, key, now);
        Ok(inner.counters.get(key).map_or(0, |e| e.count))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<u64>, StoreError> {
        let now = self.clock.now_unix();
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            Self::purge_if_expired(&mut inner, key, now);
            out.push(inner.counters.get(key.as_str()).map_or(0, |e| e.count));
        }
        Ok(out)
    }

    async fn marker(&self, tenant: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.inner.lock().unwrap().markers.get(tenant).copied())
    }

    async fn set_marker(&self, tenant: &str, ts: u64) -> Result<(), StoreError> {
        self.inner.lock().unwrap().markers.insert(tenant.to_string(), ts);
        Ok(())
    }
}

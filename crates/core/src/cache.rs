//! Per-node result cache.
//!
//! Keys are SHA-256 digests of the resolved input mapping. Each key owns one slot; filling a
//! slot is serialized so that overlapping callers compute a given (node, key) pair at most once.
//! Failed computations never fill a slot.

use crate::types::NodeInputs;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Content-addressed key of one resolved input mapping
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    pub fn from_inputs(inputs: &NodeInputs) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((inputs.len() as u64).to_le_bytes());
        for (name, value) in inputs.iter() {
            feed_str(&mut hasher, name);
            feed_value(&mut hasher, value);
        }
        Self(hex::encode(hasher.finalize()))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

fn feed_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

// Object keys are visited sorted so the digest does not depend on map ordering.
fn feed_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1u8, *b as u8]),
        Value::Number(n) => {
            hasher.update([2u8]);
            feed_str(hasher, &n.to_string());
        }
        Value::String(s) => {
            hasher.update([3u8]);
            feed_str(hasher, s);
        }
        Value::Array(items) => {
            hasher.update([4u8]);
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                feed_value(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.update([5u8]);
            hasher.update((map.len() as u64).to_le_bytes());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                feed_str(hasher, key);
                feed_value(hasher, &map[key.as_str()]);
            }
        }
    }
}

/// Counters for one node's cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct Slot {
    value: once_cell::sync::OnceCell<Value>,
    // Serializes async fills; blocking fills go through the OnceCell itself.
    gate: tokio::sync::Mutex<()>,
}

impl Slot {
    fn new() -> Self {
        Self {
            value: once_cell::sync::OnceCell::new(),
            gate: tokio::sync::Mutex::new(()),
        }
    }
}

#[derive(Default)]
pub(crate) struct CacheStore {
    slots: Mutex<HashMap<CacheKey, Arc<Slot>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: CacheKey) -> Arc<Slot> {
        self.slots
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    fn hit(&self, value: &Value) -> Value {
        self.hits.fetch_add(1, Ordering::Relaxed);
        value.clone()
    }

    /// Return the cached value for `key`, or run `compute` and store its result.
    ///
    /// Blocks other threads entering the same key until the first computation finishes.
    pub(crate) fn get_or_compute<F, E>(&self, key: CacheKey, compute: F) -> Result<Value, E>
    where
        F: FnOnce() -> Result<Value, E>,
    {
        let slot = self.slot(key);
        if let Some(value) = slot.value.get() {
            return Ok(self.hit(value));
        }

        let mut computed = false;
        let value = slot.value.get_or_try_init(|| {
            computed = true;
            compute()
        })?;

        if computed {
            self.misses.fetch_add(1, Ordering::Relaxed);
            Ok(value.clone())
        } else {
            Ok(self.hit(value))
        }
    }

    /// Async counterpart of [`CacheStore::get_or_compute`] using double-checked locking.
    pub(crate) async fn get_or_compute_async<F, Fut, E>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        let slot = self.slot(key);
        if let Some(value) = slot.value.get() {
            return Ok(self.hit(value));
        }

        let _guard = slot.gate.lock().await;
        if let Some(value) = slot.value.get() {
            return Ok(self.hit(value));
        }

        let value = compute().await?;
        self.misses.fetch_add(1, Ordering::Relaxed);
        // Only the gate holder fills the slot, so this cannot race.
        let _ = slot.value.set(value.clone());
        Ok(value)
    }

    pub(crate) fn stats(&self) -> CacheStats {
        let entries = self
            .slots
            .lock()
            .values()
            .filter(|slot| slot.value.get().is_some())
            .count();

        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }

    pub(crate) fn clear(&self) {
        self.slots.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cache_key_is_content_addressed() {
        let a = NodeInputs::new().with("x", 1).with("y", json!({"b": 2, "a": 1}));
        let b = NodeInputs::new().with("y", json!({"a": 1, "b": 2})).with("x", 1);
        let c = NodeInputs::new().with("x", 2).with("y", json!({"a": 1, "b": 2}));

        assert_eq!(CacheKey::from_inputs(&a), CacheKey::from_inputs(&b));
        assert_ne!(CacheKey::from_inputs(&a), CacheKey::from_inputs(&c));
        // "1" and 1 must not collide
        assert_ne!(
            CacheKey::from_inputs(&NodeInputs::new().with("x", "1")),
            CacheKey::from_inputs(&NodeInputs::new().with("x", 1)),
        );
    }

    #[test]
    fn test_get_or_compute_reuses_value() {
        let store = CacheStore::new();
        let key = CacheKey::from_inputs(&NodeInputs::new().with("x", 1));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = store
                .get_or_compute::<_, ()>(key.clone(), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(42))
                })
                .unwrap();
            assert_eq!(value, json!(42));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.stats(),
            CacheStats {
                hits: 2,
                misses: 1,
                entries: 1
            }
        );
    }

    #[test]
    fn test_failures_are_not_cached() {
        let store = CacheStore::new();
        let key = CacheKey::from_inputs(&NodeInputs::new());

        let first: Result<Value, &str> = store.get_or_compute(key.clone(), || Err("boom"));
        assert_eq!(first.unwrap_err(), "boom");
        assert_eq!(store.stats().entries, 0);

        let second: Result<Value, &str> = store.get_or_compute(key, || Ok(json!("ok")));
        assert_eq!(second.unwrap(), json!("ok"));
        assert_eq!(store.stats().entries, 1);
    }

    #[test]
    fn test_clear_drops_entries() {
        let store = CacheStore::new();
        let key = CacheKey::from_inputs(&NodeInputs::new());
        store
            .get_or_compute::<_, ()>(key.clone(), || Ok(json!(1)))
            .unwrap();
        store.clear();
        assert_eq!(store.stats().entries, 0);

        let value = store.get_or_compute::<_, ()>(key, || Ok(json!(2))).unwrap();
        assert_eq!(value, json!(2));
    }

    #[test]
    fn test_blocking_callers_on_threads_compute_once() {
        let store = CacheStore::new();
        let calls = AtomicUsize::new(0);
        let key = CacheKey::from_inputs(&NodeInputs::new().with("n", 3));
        let start = std::sync::Barrier::new(8);

        let values: Vec<Value> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        start.wait();
                        store
                            .get_or_compute::<_, ()>(key.clone(), || {
                                calls.fetch_add(1, Ordering::SeqCst);
                                std::thread::sleep(std::time::Duration::from_millis(50));
                                Ok(json!(9))
                            })
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(values.iter().all(|v| *v == json!(9)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.stats(),
            CacheStats {
                hits: 7,
                misses: 1,
                entries: 1
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_compute_once() {
        let store = Arc::new(CacheStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::from_inputs(&NodeInputs::new().with("n", 7));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let calls = calls.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .get_or_compute_async::<_, _, ()>(key, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(json!(49))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!(49));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

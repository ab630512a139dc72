//! In-flight request deduplication.
//!
//! Concurrent callers presenting the same signature share one execution and
//! all receive its result. Each caller registers as a waiter; the entry is
//! removed when the last waiter leaves, whether it finished or was dropped.
//! Nothing is cached beyond the lifetime of the request, and an execution
//! nobody waits for any more is dropped with its entry.

use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use crate::error::Result;

type SharedResult<V> = Shared<BoxFuture<'static, Result<V>>>;

struct Entry<V> {
    future: SharedResult<V>,
    waiters: usize,
}

type InflightMap<V> = Mutex<HashMap<String, Entry<V>>>;

pub struct RequestDeduplicator<V: Clone> {
    inflight: InflightMap<V>,
}

/// Deregisters one waiter on drop, including when its future is cancelled.
struct Waiter<'a, V> {
    inflight: &'a InflightMap<V>,
    key: &'a str,
}

impl<V> Drop for Waiter<'_, V> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        let last = match inflight.get_mut(self.key) {
            Some(entry) => {
                entry.waiters = entry.waiters.saturating_sub(1);
                entry.waiters == 0
            }
            None => false,
        };
        if last {
            inflight.remove(self.key);
        }
    }
}

impl<V> Default for RequestDeduplicator<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RequestDeduplicator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `make()` under `key`, or join an execution already in flight.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            let entry = inflight.entry(key.to_string()).or_insert_with(|| Entry {
                future: make().boxed().shared(),
                waiters: 0,
            });
            entry.waiters += 1;
            entry.future.clone()
        };
        let _waiter = Waiter {
            inflight: &self.inflight,
            key,
        };

        shared.await
    }

    /// Number of executions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// SHA-256 hex digest over the request parts.
pub fn signature(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

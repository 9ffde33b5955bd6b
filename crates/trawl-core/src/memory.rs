//! In-process [`SharedStore`] used by tests and single-process deployments.
//!
//! All state lives behind one mutex, so every primitive is atomic with
//! respect to every other. Blocked [`blpop`](SharedStore::blpop) callers are
//! woken through a [`Notify`] on each push.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::AppError;
use crate::store::SharedStore;

#[derive(Debug, Default)]
struct MemoryState {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl MemoryState {
    fn pop_first(&mut self, keys: &[String]) -> Option<(String, String)> {
        for key in keys {
            if let Some(list) = self.lists.get_mut(key) {
                if let Some(value) = list.pop_front() {
                    return Some((key.clone(), value));
                }
            }
        }
        None
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MemoryState>,
    pushed: Notify,
}

/// Thread-safe in-memory store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the state lock, recovering from poison if necessary.
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.shared.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned memory store mutex");
            poisoned.into_inner()
        })
    }
}

impl SharedStore for MemoryStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), AppError> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, AppError> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, AppError> {
        Ok(self
            .lock()
            .hashes
            .get_mut(key)
            .is_some_and(|h| h.remove(field).is_some()))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, AppError> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        self.shared.pushed.notify_waiters();
        Ok(())
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<u64, AppError> {
        let mut state = self.lock();
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|v| v != value);
        Ok((before - list.len()) as u64)
    }

    async fn llen(&self, key: &str) -> Result<u64, AppError> {
        Ok(self.lock().lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, AppError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.shared.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(popped) = self.lock().pop_first(keys) {
                return Ok(Some(popped));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), AppError> {
        self.lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, AppError> {
        Ok(self
            .lock()
            .sets
            .get_mut(key)
            .is_some_and(|s| s.remove(member)))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, AppError> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn hash_operations() {
        let store = MemoryStore::new();
        store.hset("h", "a", "1").await.unwrap();
        store.hset("h", "b", "2").await.unwrap();
        assert_eq!(store.hget("h", "a").await.unwrap().as_deref(), Some("1"));
        assert!(store.hdel("h", "a").await.unwrap());
        assert!(!store.hdel("h", "a").await.unwrap());
        assert_eq!(store.hgetall("h").await.unwrap(), vec![("b".into(), "2".into())]);
        assert!(store.hgetall("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blpop_checks_keys_in_order() {
        let store = MemoryStore::new();
        store.rpush("low", "l1").await.unwrap();
        store.rpush("high", "h1").await.unwrap();
        store.rpush("high", "h2").await.unwrap();

        let order = keys(&["high", "low"]);
        let mut popped = Vec::new();
        while let Some((_, v)) = store.blpop(&order, Duration::ZERO).await.unwrap() {
            popped.push(v);
        }
        assert_eq!(popped, vec!["h1", "h2", "l1"]);
    }

    #[tokio::test]
    async fn blpop_times_out_when_empty() {
        let store = MemoryStore::new();
        let start = std::time::Instant::now();
        let popped = store
            .blpop(&keys(&["q"]), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(popped.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn blpop_wakes_on_push() {
        let store = MemoryStore::new();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.blpop(&keys(&["q"]), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.rpush("q", "job-1").await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped, Some(("q".to_string(), "job-1".to_string())));
    }

    #[tokio::test]
    async fn lrem_removes_every_occurrence() {
        let store = MemoryStore::new();
        for v in ["a", "b", "a"] {
            store.rpush("q", v).await.unwrap();
        }
        assert_eq!(store.lrem("q", "a").await.unwrap(), 2);
        assert_eq!(store.llen("q").await.unwrap(), 1);
        assert_eq!(store.lrem("missing", "a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn set_operations() {
        let store = MemoryStore::new();
        store.sadd("s", "w1").await.unwrap();
        store.sadd("s", "w1").await.unwrap();
        store.sadd("s", "w2").await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap(), vec!["w1", "w2"]);
        assert!(store.srem("s", "w1").await.unwrap());
        assert!(!store.srem("s", "w1").await.unwrap());
    }
}

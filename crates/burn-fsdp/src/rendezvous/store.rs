use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::{DistError, Result};

/// Key-value store shared by all ranks during bootstrap.
pub trait Store: Send + Sync {
    /// Sets `key` to `value`, waking up any waiter.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Returns the value of `key`, waiting up to the store timeout for it to appear.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Atomically adds `delta` to the integer stored at `key` (0 when missing)
    /// and returns the new value.
    fn add(&self, key: &str, delta: i64) -> Result<i64>;

    /// Waits until every key exists or `timeout` expires.
    fn wait(&self, keys: &[&str], timeout: Duration) -> Result<()>;

    /// Whether every key exists, without waiting.
    fn check(&self, keys: &[&str]) -> Result<bool>;

    /// Default timeout applied by [`Store::get`].
    fn timeout(&self) -> Duration;
}

/// In-memory [`Store`] for ranks living in the same process.
#[derive(Debug)]
pub struct HashStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
    cond: Condvar,
    timeout: Duration,
}

impl HashStore {
    /// Creates an empty store whose `get` waits at most `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.data
            .lock()
            .map_err(|_| DistError::Store("store mutex poisoned".to_string()))
    }

    fn wait_for<'a>(
        &'a self,
        mut data: MutexGuard<'a, HashMap<String, Vec<u8>>>,
        keys: &[&str],
        timeout: Duration,
    ) -> Result<MutexGuard<'a, HashMap<String, Vec<u8>>>> {
        let deadline = Instant::now() + timeout;
        while !keys.iter().all(|key| data.contains_key(*key)) {
            let now = Instant::now();
            if now >= deadline {
                return Err(DistError::Timeout {
                    what: format!("store keys {keys:?}"),
                    timeout_ms: timeout.as_millis(),
                });
            }
            data = self
                .cond
                .wait_timeout(data, deadline - now)
                .map_err(|_| DistError::Store("store mutex poisoned".to_string()))?
                .0;
        }
        Ok(data)
    }
}

impl Store for HashStore {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.lock()?.insert(key.to_string(), value);
        self.cond.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let data = self.wait_for(self.lock()?, &[key], self.timeout)?;
        data.get(key)
            .cloned()
            .ok_or_else(|| DistError::Store(format!("key {key} vanished")))
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64> {
        let mut data = self.lock()?;
        let current = match data.get(key) {
            Some(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| DistError::Store(format!("key {key} does not hold an integer")))?,
            None => 0,
        };
        let value = current + delta;
        data.insert(key.to_string(), value.to_string().into_bytes());
        self.cond.notify_all();
        Ok(value)
    }

    fn wait(&self, keys: &[&str], timeout: Duration) -> Result<()> {
        self.wait_for(self.lock()?, keys, timeout).map(|_| ())
    }

    fn check(&self, keys: &[&str]) -> Result<bool> {
        let data = self.lock()?;
        Ok(keys.iter().all(|key| data.contains_key(*key)))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Blocks until `world_size` ranks reached the barrier named `prefix`.
///
/// Every rank increments an arrival counter; the last one to arrive publishes
/// a completion key everyone waits on.
pub fn store_barrier(
    store: &dyn Store,
    rank: usize,
    world_size: usize,
    prefix: &str,
    timeout: Duration,
) -> Result<()> {
    let arrived_key = format!("{prefix}/arrived");
    let done_key = format!("{prefix}/done");

    let arrived = store.add(&arrived_key, 1)?;
    log::debug!("rank {rank} reached barrier {prefix} ({arrived}/{world_size})");
    if arrived as usize == world_size {
        store.set(&done_key, Vec::new())?;
    }
    store.wait(&[done_key.as_str()], timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_get_add() {
        let store = HashStore::new(Duration::from_millis(100));

        store.set("a", b"hello".to_vec()).unwrap();
        assert_eq!(store.get("a").unwrap(), b"hello".to_vec());
        assert_eq!(store.add("n", 2).unwrap(), 2);
        assert_eq!(store.add("n", 3).unwrap(), 5);
        assert!(store.check(&["a", "n"]).unwrap());
        assert!(!store.check(&["missing"]).unwrap());
    }

    #[test]
    fn test_get_waits_for_writer() {
        let store = Arc::new(HashStore::new(Duration::from_secs(5)));
        let writer = store.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.set("late", vec![7]).unwrap();
        });

        assert_eq!(store.get("late").unwrap(), vec![7]);
        handle.join().unwrap();
    }

    #[test]
    fn test_get_times_out() {
        let store = HashStore::new(Duration::from_millis(10));

        assert!(matches!(
            store.get("never"),
            Err(DistError::Timeout { .. })
        ));
    }

    #[test]
    fn test_store_barrier() {
        let store = Arc::new(HashStore::new(Duration::from_secs(5)));
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let store = store.clone();
                thread::spawn(move || {
                    store_barrier(store.as_ref(), rank, 4, "b", Duration::from_secs(5))
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(store.add("b/arrived", 0).unwrap(), 4);
    }

    #[test]
    fn test_store_barrier_times_out_when_a_rank_is_missing() {
        let store = HashStore::new(Duration::from_millis(10));
        let result = store_barrier(&store, 0, 2, "b", Duration::from_millis(10));

        assert!(matches!(result, Err(DistError::Timeout { .. })));
    }
}

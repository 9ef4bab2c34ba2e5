// session_map.rs — Sharded, lock-guarded map of per-session state.
//
// Multiple sessions may be active on the host at once. Every piece of
// per-session state lives behind one of a fixed number of shard locks,
// chosen by hashing the session key, so unrelated sessions rarely contend
// and no session can observe another's entry.
//
// A poisoned shard is recovered rather than propagated: a panic in one
// handler must not take enforcement down for every session that hashes to
// the same shard.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

const DEFAULT_SHARDS: usize = 16;

/// A map from session key to `T`, sharded across independent mutexes.
#[derive(Debug)]
pub struct SessionMap<T> {
    shards: Vec<Mutex<HashMap<String, T>>>,
}

impl<T> SessionMap<T> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let shards = (0..count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    /// Run `f` against the session's entry, creating it with `Default` if absent.
    pub fn with_entry<R>(&self, session_key: &str, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Default,
    {
        let mut shard = self.shard(session_key);
        let entry = shard.entry(session_key.to_string()).or_default();
        f(entry)
    }

    /// Run `f` against the session's entry only if it exists.
    pub fn with_existing<R>(&self, session_key: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut shard = self.shard(session_key);
        shard.get_mut(session_key).map(f)
    }

    pub fn insert(&self, session_key: &str, value: T) -> Option<T> {
        self.shard(session_key).insert(session_key.to_string(), value)
    }

    pub fn remove(&self, session_key: &str) -> Option<T> {
        self.shard(session_key).remove(session_key)
    }

    /// Remove the session's entry if `f` says so, under a single lock.
    pub fn remove_if(&self, session_key: &str, f: impl FnOnce(&mut T) -> bool) -> Option<T> {
        let mut shard = self.shard(session_key);
        if shard.get_mut(session_key).map_or(false, f) {
            shard.remove(session_key)
        } else {
            None
        }
    }

    /// Keep only the entries `keep` accepts, one shard at a time. Returns the
    /// removed keys, sorted.
    pub fn retain(&self, mut keep: impl FnMut(&str, &mut T) -> bool) -> Vec<String> {
        let mut removed = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            shard.retain(|key, value| {
                let kept = keep(key, value);
                if !kept {
                    removed.push(key.clone());
                }
                kept
            });
        }
        removed.sort();
        removed
    }

    pub fn contains(&self, session_key: &str) -> bool {
        self.shard(session_key).contains_key(session_key)
    }

    /// All session keys currently present, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, session_key: &str) -> MutexGuard<'_, HashMap<String, T>> {
        let mut hasher = DefaultHasher::new();
        session_key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for SessionMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn entries_are_isolated_by_key() {
        let map: SessionMap<Vec<u32>> = SessionMap::new();
        map.with_entry("a", |v| v.push(1));
        map.with_entry("b", |v| v.push(2));
        map.with_entry("a", |v| v.push(3));

        assert_eq!(map.with_existing("a", |v| v.clone()), Some(vec![1, 3]));
        assert_eq!(map.with_existing("b", |v| v.clone()), Some(vec![2]));
        assert_eq!(map.with_existing("c", |v| v.clone()), None);
        assert_eq!(map.keys(), vec!["a", "b"]);
    }

    #[test]
    fn concurrent_sessions_do_not_interfere() {
        let map: Arc<SessionMap<u64>> = Arc::new(SessionMap::with_shards(4));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    let key = format!("session-{}", i);
                    for _ in 0..1000 {
                        map.with_entry(&key, |count| *count += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.len(), 8);
        for i in 0..8 {
            let key = format!("session-{}", i);
            assert_eq!(map.with_existing(&key, |c| *c), Some(1000));
        }
    }

    #[test]
    fn retain_and_remove_if() {
        let map: SessionMap<u32> = SessionMap::with_shards(3);
        for (key, value) in [("a", 1), ("b", 20), ("c", 3), ("d", 40)] {
            map.insert(key, value);
        }
        assert_eq!(map.retain(|_, v| *v >= 10), vec!["a", "c"]);
        assert_eq!(map.keys(), vec!["b", "d"]);

        assert_eq!(map.remove_if("b", |v| *v > 30), None);
        assert_eq!(map.remove_if("d", |v| *v > 30), Some(40));
        assert_eq!(map.remove_if("missing", |_| true), None);
        assert_eq!(map.keys(), vec!["b"]);
    }

    #[test]
    fn remove_drops_entry() {
        let map: SessionMap<u32> = SessionMap::new();
        map.insert("a", 7);
        assert!(map.contains("a"));
        assert_eq!(map.remove("a"), Some(7));
        assert!(map.is_empty());
    }
}

use parking_lot::Mutex;
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Outcome of [`Cache::add_with`].
pub(crate) enum Added<V> {
    /// No live entry existed; this value was stored.
    Inserted(V),
    /// A live entry was already present; nothing was stored.
    Existing(V),
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Internal Cache
///
/// Entries live for a fixed time from insertion. Reading an entry never extends its life, and an
/// expired entry is treated as absent whether or not it has been purged yet.
pub(crate) struct Cache<V: Clone> {
    inner: Mutex<HashMap<String, Entry<V>>>,
    ttl: Duration,
}

impl<V> Cache<V>
where
    V: Clone,
{
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Insert the value built by `make` unless `key` has a live entry.
    ///
    /// This is the only place entries are created, so exactly one of many concurrent callers
    /// for the same key sees [`Added::Inserted`].
    pub(crate) fn add_with<F>(&self, key: &str, make: F) -> Added<V>
    where
        F: FnOnce() -> V,
    {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    let value = make();
                    occupied.insert(Entry {
                        value: value.clone(),
                        expires_at: now + self.ttl,
                    });
                    Added::Inserted(value)
                } else {
                    Added::Existing(occupied.get().value.clone())
                }
            }
            MapEntry::Vacant(vacant) => {
                let value = make();
                vacant.insert(Entry {
                    value: value.clone(),
                    expires_at: now + self.ttl,
                });
                Added::Inserted(value)
            }
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.inner
            .lock()
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Remove the entry for `key` if `predicate` holds for its value, checked under the map lock.
    pub(crate) fn remove_if<P>(&self, key: &str, predicate: P) -> bool
    where
        P: FnOnce(&V) -> bool,
    {
        let mut inner = self.inner.lock();
        let matched = inner
            .get(key)
            .is_some_and(|entry| predicate(&entry.value));
        if matched {
            inner.remove(key);
        }
        matched
    }

    /// Remove every entry, handing back the values.
    pub(crate) fn clear(&self) -> Vec<V> {
        self.inner
            .lock()
            .drain()
            .map(|(_, entry)| entry.value)
            .collect()
    }

    /// Drop every expired entry, returning how many went.
    pub(crate) fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, entry| !entry.is_expired(now));
        before - inner.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub(crate) fn count(&self) -> usize {
        self.inner.lock().len()
    }
}

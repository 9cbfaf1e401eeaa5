//! # Keyspace
//!
//! Purpose: In-memory string keyspace with millisecond expirations, shared
//! by every node of one simulated deployment.
//!
//! ## Design Principles
//! 1. **TTL Fast Path**: Expiration is checked on access; no sweeper thread.
//! 2. **Single Lock**: One `RwLock` over the map keeps the node simple; the
//!    dev node is not a throughput target.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// TTL state reported for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    Missing,
    NoExpiry,
    ExpiresIn(Duration),
}

/// Keyspace failures that map to error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The stored value is not a base-10 i64, or the result overflowed.
    NotAnInteger,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Keyspace {
    entries: RwLock<HashMap<Vec<u8>, Entry>>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop it under the write lock.
        self.remove_expired(key, now);
        None
    }

    /// Stores `value`, replacing any previous value and expiry.
    pub fn set(&self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.write().insert(key, Entry { value, expires_at });
    }

    /// Stores `value` only when the key's presence equals `must_exist`
    /// (`XX` when true, `NX` when false). Returns whether it stored.
    pub fn set_when(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Option<Duration>,
        must_exist: bool,
    ) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let live = matches!(entries.get(&key), Some(entry) if !entry.is_expired(now));
        if live != must_exist {
            return false;
        }
        let expires_at = ttl.map(|ttl| now + ttl);
        entries.insert(key, Entry { value, expires_at });
        true
    }

    /// Removes `key`; true when a live entry was removed.
    pub fn delete(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        match self.entries.write().remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Sets a timeout on an existing key; false when the key is missing.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn ttl(&self, key: &[u8]) -> TtlStatus {
        let now = Instant::now();
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => TtlStatus::Missing,
            Some(Entry {
                expires_at: Some(deadline),
                ..
            }) => TtlStatus::ExpiresIn(deadline.saturating_duration_since(now)),
            Some(_) => TtlStatus::NoExpiry,
            None => TtlStatus::Missing,
        }
    }

    /// Adds `delta` to the integer stored at `key`, creating it at 0.
    ///
    /// An existing expiry is kept.
    pub fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let (current, expires_at) = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => (parse_i64(&entry.value)?, entry.expires_at),
            _ => (0, None),
        };
        let next = current.checked_add(delta).ok_or(StoreError::NotAnInteger)?;
        entries.insert(
            key.to_vec(),
            Entry {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_expired(&self, key: &[u8], now: Instant) {
        let mut entries = self.entries.write();
        if entries.get(key).map_or(false, |entry| entry.is_expired(now)) {
            entries.remove(key);
        }
    }
}

fn parse_i64(value: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or(StoreError::NotAnInteger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn set_get_delete() {
        let keyspace = Keyspace::new();
        keyspace.set(b"a".to_vec(), b"1".to_vec(), None);
        assert_eq!(keyspace.get(b"a"), Some(b"1".to_vec()));
        assert!(keyspace.exists(b"a"));
        assert!(keyspace.delete(b"a"));
        assert!(!keyspace.delete(b"a"));
        assert_eq!(keyspace.get(b"a"), None);
    }

    #[test]
    fn entries_expire_on_access() {
        let keyspace = Keyspace::new();
        keyspace.set(b"a".to_vec(), b"1".to_vec(), Some(Duration::from_millis(20)));
        assert!(matches!(keyspace.ttl(b"a"), TtlStatus::ExpiresIn(_)));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(keyspace.get(b"a"), None);
        assert_eq!(keyspace.ttl(b"a"), TtlStatus::Missing);
        assert!(keyspace.is_empty());
    }

    #[test]
    fn expire_and_ttl() {
        let keyspace = Keyspace::new();
        assert!(!keyspace.expire(b"missing", Duration::from_secs(5)));
        keyspace.set(b"a".to_vec(), b"1".to_vec(), None);
        assert_eq!(keyspace.ttl(b"a"), TtlStatus::NoExpiry);
        assert!(keyspace.expire(b"a", Duration::from_secs(5)));
        match keyspace.ttl(b"a") {
            TtlStatus::ExpiresIn(left) => assert!(left <= Duration::from_secs(5)),
            other => panic!("unexpected ttl {:?}", other),
        }
    }

    #[test]
    fn counters() {
        let keyspace = Keyspace::new();
        assert_eq!(keyspace.incr_by(b"n", 1), Ok(1));
        assert_eq!(keyspace.incr_by(b"n", -3), Ok(-2));
        keyspace.set(b"s".to_vec(), b"abc".to_vec(), None);
        assert_eq!(keyspace.incr_by(b"s", 1), Err(StoreError::NotAnInteger));
        keyspace.set(b"max".to_vec(), i64::MAX.to_string().into_bytes(), None);
        assert_eq!(keyspace.incr_by(b"max", 1), Err(StoreError::NotAnInteger));
    }

    #[test]
    fn conditional_set_respects_presence() {
        let keyspace = Keyspace::new();
        assert!(!keyspace.set_when(b"k".to_vec(), b"1".to_vec(), None, true));
        assert!(keyspace.set_when(b"k".to_vec(), b"1".to_vec(), None, false));
        assert!(!keyspace.set_when(b"k".to_vec(), b"2".to_vec(), None, false));
        assert_eq!(keyspace.get(b"k"), Some(b"1".to_vec()));
        assert!(keyspace.set_when(b"k".to_vec(), b"3".to_vec(), None, true));
        assert_eq!(keyspace.get(b"k"), Some(b"3".to_vec()));
    }
}

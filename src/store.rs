// Licensed under the MIT and Apache-2.0 licenses.

//! Per-replica versioned storage with read and write lock flags.
//!
//! Locking discipline is enforced with assertions rather than errors: the
//! protocol layer is the only caller, and a violated precondition here means
//! a protocol bug, not a runtime condition to recover from. A key is created
//! lazily the first time anything touches it, with the null value and the
//! sentinel version -1.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type Key = String;

/// A value together with the version it was written at. Travels in read
/// replies and epoch patches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Value,
    pub version: i64,
}

impl VersionedValue {
    pub fn absent() -> Self {
        VersionedValue {
            value: Value::Null,
            version: -1,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    version: i64,
    readable: bool,
    writable: bool,
}

/// Store notifications, surfaced by the engine as events.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    NewKey {
        key: Key,
        value: Value,
        version: i64,
    },
    Changed {
        key: Key,
        value: Value,
        version: i64,
    },
}

#[derive(Debug, Default)]
pub struct Store {
    entries: BTreeMap<Key, Entry>,
    events: Vec<StoreEvent>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Writes a key under an already-held write lock. The lock stays held;
    /// unlocking is a separate step of the commit.
    pub fn write(&mut self, key: &str, value: Value, version: i64) {
        match self.entries.get_mut(key) {
            Some(entry) => {
                assert!(
                    !entry.writable,
                    "write to {:?} without holding the write lock",
                    key
                );
                assert!(
                    version > entry.version,
                    "write to {:?} with version {} not above stored {}",
                    key,
                    version,
                    entry.version
                );
                entry.value = value.clone();
                entry.version = version;
                self.events.push(StoreEvent::Changed {
                    key: key.to_string(),
                    value,
                    version,
                });
            }
            None => {
                // Created still locked; the committing protocol unlocks it.
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.clone(),
                        version,
                        readable: false,
                        writable: false,
                    },
                );
                self.events.push(StoreEvent::NewKey {
                    key: key.to_string(),
                    value,
                    version,
                });
            }
        }
    }

    /// Reads a key under an already-held read lock.
    pub fn read(&self, key: &str) -> VersionedValue {
        match self.entries.get(key) {
            Some(entry) => {
                assert!(
                    !entry.readable,
                    "read of {:?} without holding the read lock",
                    key
                );
                VersionedValue {
                    value: entry.value.clone(),
                    version: entry.version,
                }
            }
            None => VersionedValue::absent(),
        }
    }

    pub fn multi_read(&self, keys: &[Key]) -> BTreeMap<Key, VersionedValue> {
        keys.iter()
            .map(|k| (k.clone(), self.read(k)))
            .collect()
    }

    /// Applies a patch of key, value, version triples, each under the normal
    /// write rules.
    pub fn patch(&mut self, patch: &BTreeMap<Key, VersionedValue>) {
        for (key, vv) in patch {
            self.write(key, vv.value.clone(), vv.version);
        }
    }

    pub fn lock_write(&mut self, key: &str) {
        match self.entries.get_mut(key) {
            Some(entry) => {
                assert!(entry.writable, "write lock on {:?} is not available", key);
                entry.writable = false;
            }
            None => self.create_locked(key, true, false),
        }
    }

    pub fn unlock_write(&mut self, key: &str) {
        match self.entries.get_mut(key) {
            Some(entry) => entry.writable = true,
            None => self.create_locked(key, true, true),
        }
    }

    pub fn lock_read(&mut self, key: &str) {
        match self.entries.get_mut(key) {
            Some(entry) => {
                assert!(entry.readable, "read lock on {:?} is not available", key);
                entry.readable = false;
            }
            None => self.create_locked(key, false, true),
        }
    }

    pub fn unlock_read(&mut self, key: &str) {
        match self.entries.get_mut(key) {
            Some(entry) => entry.readable = true,
            None => self.create_locked(key, true, true),
        }
    }

    fn create_locked(&mut self, key: &str, readable: bool, writable: bool) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Null,
                version: -1,
                readable,
                writable,
            },
        );
        self.events.push(StoreEvent::NewKey {
            key: key.to_string(),
            value: Value::Null,
            version: -1,
        });
    }

    /// Both locks free. Unknown keys count as free.
    pub fn can_write(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(e) => e.readable && e.writable,
            None => true,
        }
    }

    pub fn can_read(&self, key: &str) -> bool {
        self.can_write(key)
    }

    pub fn any_locked(&self) -> bool {
        self.entries.values().any(|e| !(e.readable && e.writable))
    }

    pub fn all_locked(&self) -> bool {
        self.entries.values().all(|e| !e.readable && !e.writable)
    }

    pub fn lock_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.readable = false;
            entry.writable = false;
        }
    }

    pub fn unlock_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.readable = true;
            entry.writable = true;
        }
    }

    pub fn version(&self, key: &str) -> i64 {
        self.entries.get(key).map_or(-1, |e| e.version)
    }

    pub fn key_versions(&self) -> BTreeMap<Key, i64> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.version))
            .collect()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.entries.keys().cloned().collect()
    }

    pub fn take_events(&mut self) -> Vec<StoreEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_requires_lock_and_higher_version() {
        let mut s = Store::new();
        s.lock_write("a");
        s.write("a", json!(1), 0);
        s.unlock_write("a");
        s.unlock_read("a");
        assert_eq!(s.version("a"), 0);
        s.lock_write("a");
        s.write("a", json!(2), 1);
        s.unlock_write("a");
        assert_eq!(s.version("a"), 1);
    }

    #[test]
    #[should_panic(expected = "without holding the write lock")]
    fn unlocked_write_panics() {
        let mut s = Store::new();
        s.lock_write("a");
        s.write("a", json!(1), 0);
        s.unlock_write("a");
        s.unlock_read("a");
        s.write("a", json!(2), 1);
    }

    #[test]
    #[should_panic(expected = "not above stored")]
    fn stale_version_panics() {
        let mut s = Store::new();
        s.lock_write("a");
        s.write("a", json!(1), 5);
        s.write("a", json!(2), 5);
    }

    #[test]
    fn fresh_key_is_created_locked_by_write() {
        let mut s = Store::new();
        s.write("a", json!(1), 0);
        assert!(!s.can_read("a"));
        assert!(!s.can_write("a"));
        let events = s.take_events();
        assert!(matches!(events[0], StoreEvent::NewKey { .. }));
    }

    #[test]
    fn read_requires_lock() {
        let mut s = Store::new();
        // write-created entries start read-locked, so read is legal here
        s.write("a", json!("x"), 0);
        let vv = s.read("a");
        assert_eq!(vv.value, json!("x"));
        assert_eq!(vv.version, 0);
    }

    #[test]
    #[should_panic(expected = "without holding the read lock")]
    fn unlocked_read_panics() {
        let mut s = Store::new();
        s.unlock_read("a");
        s.read("a");
    }

    #[test]
    fn absent_key_reads_as_null_sentinel() {
        let s = Store::new();
        assert_eq!(s.read("nope"), VersionedValue::absent());
        assert_eq!(s.version("nope"), -1);
    }

    #[test]
    fn lock_conflicts_are_visible() {
        let mut s = Store::new();
        s.lock_write("a");
        assert!(!s.can_write("a"));
        assert!(!s.can_read("a"));
        assert!(s.any_locked());
        s.unlock_write("a");
        assert!(s.can_write("a"));
        assert!(!s.any_locked());
    }

    #[test]
    fn lock_all_and_unlock_all() {
        let mut s = Store::new();
        s.unlock_read("a");
        s.unlock_read("b");
        s.take_events();
        s.lock_all();
        assert!(s.all_locked());
        s.unlock_all();
        assert!(!s.any_locked());
    }

    #[test]
    fn patch_applies_under_locks() {
        let mut s = Store::new();
        let mut p = BTreeMap::new();
        p.insert(
            "a".to_string(),
            VersionedValue {
                value: json!(1),
                version: 3,
            },
        );
        p.insert(
            "b".to_string(),
            VersionedValue {
                value: json!([1, 2]),
                version: 0,
            },
        );
        s.patch(&p);
        s.unlock_all();
        assert_eq!(s.version("a"), 3);
        assert_eq!(s.version("b"), 0);
        assert_eq!(s.key_versions().len(), 2);
    }
}

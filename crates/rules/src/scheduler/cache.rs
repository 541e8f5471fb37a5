//! Mutex-guarded lookup tables shared between the manager and its groups.
//!
//! Readers always get copies, never references into the guarded maps.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use cadence_core::{AlertRuleGroupKey, FolderKey, ScheduleKey};

use super::group::Group;

/// A map replaced wholesale by its writer and read by many.
#[derive(Debug)]
pub struct SnapshotMap<K, V> {
    inner: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for SnapshotMap<K, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> SnapshotMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().expect("cache lock poisoned").get(key).cloned()
    }

    pub fn replace(&self, entries: HashMap<K, V>) {
        *self.inner.lock().expect("cache lock poisoned") = entries;
    }

    pub fn snapshot(&self) -> HashMap<K, V> {
        self.inner.lock().expect("cache lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Folder titles by folder key.
pub type FolderCache = SnapshotMap<FolderKey, String>;

/// The published group registry, for status queries from other tasks.
pub type GroupCache = SnapshotMap<AlertRuleGroupKey, Arc<Group>>;

/// Last seen set of schedule keys, used to skip full fetches when nothing
/// changed.
#[derive(Debug, Default)]
pub struct RuleCache {
    keys: Mutex<HashSet<ScheduleKey>>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `keys` and report whether they differ from the previous set.
    /// Order and duplicates are ignored.
    pub fn update(&self, keys: &[ScheduleKey]) -> bool {
        let next: HashSet<ScheduleKey> = keys.iter().cloned().collect();
        let mut current = self.keys.lock().expect("cache lock poisoned");
        if *current == next {
            return false;
        }
        *current = next;
        true
    }

    /// Forget the stored set so the next `update` reports a change.
    pub fn invalidate(&self) {
        self.keys.lock().expect("cache lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.keys.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! In-memory [`KvStore`] with optimistic conflict detection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::error::StorageError;
use crate::kv::{KvStore, KvTransaction};

#[derive(Default)]
struct MemState {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Commit version that last wrote each key, deletions included.
    versions: HashMap<Vec<u8>, u64>,
    clock: u64,
}

/// A process-local store used by tests and ephemeral nodes.
#[derive(Default)]
pub struct MemKvStore {
    state: Mutex<MemState>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".into()))
    }

    /// Number of committed keys.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemKvStore {
    fn begin(&self) -> Result<Box<dyn KvTransaction + '_>, StorageError> {
        let start = self.lock()?.clock;
        Ok(Box::new(MemTransaction {
            store: self,
            start,
            reads: BTreeSet::new(),
            scans: Vec::new(),
            writes: BTreeMap::new(),
        }))
    }
}

struct MemTransaction<'a> {
    store: &'a MemKvStore,
    start: u64,
    reads: BTreeSet<Vec<u8>>,
    scans: Vec<Vec<u8>>,
    /// Buffered writes; `None` is a delete.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl KvTransaction for MemTransaction<'_> {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        self.reads.insert(key.to_vec());
        Ok(self.store.lock()?.data.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.writes.insert(key.to_vec(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn scan_prefix(&mut self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.scans.push(prefix.to_vec());
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = {
            let state = self.store.lock()?;
            state
                .data
                .range(prefix.to_vec()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (key, value) in self.writes.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(v) => merged.insert(key.clone(), v.clone()),
                None => merged.remove(key),
            };
        }
        Ok(merged.into_iter().collect())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let store = self.store;
        let mut state = store.lock()?;
        let changed_since_start = |key: &[u8]| {
            state
                .versions
                .get(key)
                .is_some_and(|version| *version > self.start)
        };
        let touched_conflict = self
            .reads
            .iter()
            .chain(self.writes.keys())
            .any(|k| changed_since_start(k));
        let scan_conflict = !self.scans.is_empty()
            && state.versions.iter().any(|(k, version)| {
                *version > self.start && self.scans.iter().any(|p| k.starts_with(p))
            });
        if touched_conflict || scan_conflict {
            return Err(StorageError::Conflict);
        }

        if self.writes.is_empty() {
            return Ok(());
        }
        state.clock += 1;
        let version = state.clock;
        for (key, value) in self.writes {
            match value {
                Some(v) => {
                    state.data.insert(key.clone(), v);
                }
                None => {
                    state.data.remove(&key);
                }
            }
            state.versions.insert(key, version);
        }
        Ok(())
    }

    fn discard(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(store: &MemKvStore, key: &[u8], value: &[u8]) {
        let mut tx = store.begin().unwrap();
        tx.put(key, value.to_vec()).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_read_your_writes() {
        let store = MemKvStore::new();
        let mut tx = store.begin().unwrap();
        tx.put(b"a", b"1".to_vec()).unwrap();
        assert_eq!(tx.get(b"a").unwrap(), Some(b"1".to_vec()));
        tx.delete(b"a").unwrap();
        assert_eq!(tx.get(b"a").unwrap(), None);
        tx.commit().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_discard_leaves_no_trace() {
        let store = MemKvStore::new();
        let mut tx = store.begin().unwrap();
        tx.put(b"a", b"1".to_vec()).unwrap();
        tx.discard();
        assert!(store.is_empty());
    }

    #[test]
    fn test_write_write_conflict() {
        let store = MemKvStore::new();
        put(&store, b"k", b"0");

        let mut t1 = store.begin().unwrap();
        let mut t2 = store.begin().unwrap();
        t1.get(b"k").unwrap();
        t2.get(b"k").unwrap();
        t1.put(b"k", b"1".to_vec()).unwrap();
        t2.put(b"k", b"2".to_vec()).unwrap();
        t1.commit().unwrap();
        assert_eq!(t2.commit(), Err(StorageError::Conflict));

        let mut check = store.begin().unwrap();
        assert_eq!(check.get(b"k").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_disjoint_keys_do_not_conflict() {
        let store = MemKvStore::new();
        let mut t1 = store.begin().unwrap();
        let mut t2 = store.begin().unwrap();
        t1.put(b"a", b"1".to_vec()).unwrap();
        t2.put(b"b", b"2".to_vec()).unwrap();
        t1.commit().unwrap();
        t2.commit().unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_scan_prefix_merges_pending_writes() {
        let store = MemKvStore::new();
        put(&store, b"p/1", b"a");
        put(&store, b"p/2", b"b");
        put(&store, b"q/1", b"c");

        let mut tx = store.begin().unwrap();
        tx.delete(b"p/1").unwrap();
        tx.put(b"p/3", b"d".to_vec()).unwrap();
        let got = tx.scan_prefix(b"p/").unwrap();
        assert_eq!(
            got,
            vec![(b"p/2".to_vec(), b"b".to_vec()), (b"p/3".to_vec(), b"d".to_vec())]
        );
    }

    #[test]
    fn test_scan_conflicts_with_new_key_in_range() {
        let store = MemKvStore::new();
        let mut t1 = store.begin().unwrap();
        t1.scan_prefix(b"p/").unwrap();
        t1.put(b"x", b"1".to_vec()).unwrap();
        put(&store, b"p/9", b"z");
        assert_eq!(t1.commit(), Err(StorageError::Conflict));
    }
}

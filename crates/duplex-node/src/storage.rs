//! RocksDB storage backend for the Duplex node.

use anyhow::Result;
use duplex_storage::{KvStore, KvTransaction, StorageError};
use rocksdb::{
    Direction, ErrorKind, IteratorMode, OptimisticTransactionDB, Options, Transaction,
};
use std::path::Path;

/// [`KvStore`] over a RocksDB optimistic transaction database.
///
/// Reads go through `get_for_update` so RocksDB validates them at commit.
/// Keys inserted into a scanned range by a concurrent commit are not
/// detected.
pub struct RocksKvStore {
    db: OptimisticTransactionDB,
}

impl RocksKvStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = OptimisticTransactionDB::open(&opts, path)?;
        Ok(Self { db })
    }
}

fn map_err(e: rocksdb::Error) -> StorageError {
    match e.kind() {
        ErrorKind::Busy | ErrorKind::TryAgain => StorageError::Conflict,
        _ => StorageError::Backend(e.to_string()),
    }
}

impl KvStore for RocksKvStore {
    fn begin(&self) -> Result<Box<dyn KvTransaction + '_>, StorageError> {
        Ok(Box::new(RocksTransaction {
            txn: self.db.transaction(),
        }))
    }
}

struct RocksTransaction<'db> {
    txn: Transaction<'db, OptimisticTransactionDB>,
}

impl KvTransaction for RocksTransaction<'_> {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.txn.get_for_update(key, true).map_err(map_err)
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.txn.put(key, value).map_err(map_err)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        self.txn.delete(key).map_err(map_err)
    }

    fn scan_prefix(&mut self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut entries = Vec::new();
        for item in self
            .txn
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(map_err)?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.into_vec(), value.into_vec()));
        }
        for (key, _) in &entries {
            self.txn.get_for_update(key, true).map_err(map_err)?;
        }
        Ok(entries)
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.txn.commit().map_err(map_err)
    }

    fn discard(self: Box<Self>) {
        if let Err(e) = self.txn.rollback() {
            tracing::warn!(error = %e, "rollback failed");
        }
    }
}

use crate::error::StorageError;

/// A key-value store with optimistic transactions.
pub trait KvStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn KvTransaction + '_>, StorageError>;
}

/// One optimistic transaction.
///
/// Reads see the transaction's own writes. `commit` fails with
/// [`StorageError::Conflict`] when a key read or written here was committed
/// by another transaction in the meantime.
pub trait KvTransaction {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError>;

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&mut self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    fn discard(self: Box<Self>);
}

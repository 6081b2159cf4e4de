/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Another transaction committed a key this one touched.
    #[error("transaction conflict")]
    Conflict,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("transaction failed after {0} conflict retries")]
    RetriesExhausted(u32),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<prost::DecodeError> for StorageError {
    fn from(e: prost::DecodeError) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Errors a transaction body may return.
///
/// Conflicts are retried by [`crate::Dal::transactional`]; everything else
/// aborts immediately.
pub trait TxError: From<StorageError> {
    fn is_conflict(&self) -> bool;
}

impl TxError for StorageError {
    fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict)
    }
}

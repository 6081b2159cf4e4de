//! Time-bounded ownership of background jobs across redundant instances.

use chrono::{Duration, Utc};
use duplex_core::CoreError;

use crate::dal::{Dal, DalTx};
use crate::error::{StorageError, TxError};
use crate::records::LeaseRecord;

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl TxError for LeaseError {
    fn is_conflict(&self) -> bool {
        matches!(self, LeaseError::Storage(e) if e.is_conflict())
    }
}

/// Lease table operations.
#[derive(Clone)]
pub struct Lease {
    dal: Dal,
}

fn is_expired(record: &LeaseRecord, timeout: Duration) -> bool {
    Utc::now() - record.updated_at > timeout
}

fn write(tx: &mut DalTx<'_>, id: &str, owner: &str) -> Result<(), StorageError> {
    tx.put_lease(
        id,
        &LeaseRecord {
            owner: owner.to_string(),
            updated_at: Utc::now(),
        },
    )
}

impl Lease {
    pub fn new(dal: Dal) -> Self {
        Self { dal }
    }

    /// Take the lease `id` for `owner`.
    ///
    /// Succeeds when the lease is free, already held by `owner` (renewing
    /// it) or held by someone else for longer than `timeout`.
    pub async fn acquire(&self, id: &str, owner: &str, timeout: Duration) -> Result<(), LeaseError> {
        self.dal
            .transactional(|tx| -> Result<(), LeaseError> {
                if let Some(current) = tx.get_lease(id)? {
                    if current.owner != owner && !is_expired(&current, timeout) {
                        return Err(CoreError::LeaseAcquired.into());
                    }
                    if current.owner != owner {
                        tracing::info!(lease = id, from = %current.owner, to = owner, "lease taken over");
                    }
                }
                write(tx, id, owner)?;
                Ok(())
            })
            .await
    }

    /// Refresh the lease timestamp. Fails unless `owner` holds it.
    pub async fn renew(&self, id: &str, owner: &str) -> Result<(), LeaseError> {
        self.dal
            .transactional(|tx| -> Result<(), LeaseError> {
                match tx.get_lease(id)? {
                    Some(current) if current.owner == owner => Ok(write(tx, id, owner)?),
                    _ => Err(CoreError::LeaseAcquired.into()),
                }
            })
            .await
    }

    /// Give up the lease. Releasing a lease held by someone else is a no-op.
    pub async fn release(&self, id: &str, owner: &str) -> Result<(), LeaseError> {
        self.dal
            .transactional(|tx| -> Result<(), LeaseError> {
                if let Some(current) = tx.get_lease(id)? {
                    if current.owner == owner {
                        tx.delete_lease(id)?;
                    }
                }
                Ok(())
            })
            .await
    }

    pub async fn check_owner(&self, id: &str, owner: &str) -> Result<bool, LeaseError> {
        self.dal
            .transactional(|tx| -> Result<bool, LeaseError> {
                Ok(tx.get_lease(id)?.is_some_and(|l| l.owner == owner))
            })
            .await
    }
}

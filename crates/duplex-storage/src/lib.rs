//! Transactional storage for the protocol engine.
//!
//! [`KvStore`] is the backend contract, [`Dal`] the typed layer the engine
//! talks to. Every protocol step runs as one [`Dal::transactional`] call.

pub mod dal;
pub mod error;
pub mod kv;
pub mod lease;
pub mod memory;
pub mod records;

pub use dal::{Dal, DalTx};
pub use error::{StorageError, TxError};
pub use kv::{KvStore, KvTransaction};
pub use lease::{Lease, LeaseError};
pub use memory::MemKvStore;
pub use records::{
    ChannelInfo, DelegatedPayRecord, DelegatedPayStatus, LeaseRecord, PayStateRecord, SecretRecord,
    StoredPay,
};

//! State machines persisted through storage transactions.

pub mod channel;
pub mod payment;

pub mod engine;
pub mod error;
pub mod fsm;
pub mod ledger;
pub mod queue;
pub mod testing;
pub mod traits;

mod context;
mod delegate;
mod handler;
mod messager;

pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, TransportError};
pub use queue::{MsgQueue, QueueStatus};
pub use traits::{
    BlockOracle, NoRouter, NoopCallbacks, OfflineRegistry, PayRegistry, PaymentCallbacks, Router,
    Transport,
};

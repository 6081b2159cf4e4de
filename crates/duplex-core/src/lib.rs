pub mod balance;
pub mod channel_state;
pub mod config;
pub mod dag;
pub mod entity;
pub mod error;
pub mod hashlist;
pub mod message;
pub mod pay_state;
pub mod types;

pub use balance::{compute_balance, ChannelBalance, ChannelSeqNums, OnChainBalance, PendingWithdrawal};
pub use channel_state::{is_chan_state_change_valid, ChannelState};
pub use config::{EngineConfig, RuntimeConfig};
pub use entity::{
    Condition, ConditionalPay, DelegationProof, PayNote, PayOriginNote, SignedSimplexState,
    SimplexPaymentChannel,
};
pub use error::CoreError;
pub use message::{
    Envelope, ErrorCode, Message, PathHop, RoutingUpdate, SettleReason, SettledPayment, WireError,
};
pub use pay_state::{PayDirection, PayEvent, PayState, PayStateMachine};
pub use types::{Addr, Amount, BlockNumber, ChannelId, PayId};

use crate::channel_state::ChannelState;
use crate::pay_state::PayState;
use crate::types::{ChannelId, PayId};

/// Core protocol errors.
///
/// Each protocol outcome has its own variant so callers can branch on the
/// outcome with `matches!` instead of comparing messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid message type")]
    InvalidMsgType,

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("payment not found: {0}")]
    PayNotFound(PayId),

    #[error("cannot parse simplex state")]
    SimplexParse,

    #[error("cannot decode {0}")]
    Decode(String),

    #[error("invalid signature")]
    InvalidSig,

    #[error("invalid sequence number")]
    InvalidSeqNum,

    #[error("invalid pending pays")]
    InvalidPendingPays,

    #[error("invalid channel id")]
    InvalidChannelId,

    #[error("invalid channel peer from")]
    InvalidChannelPeerFrom,

    #[error("invalid transfer amount")]
    InvalidTransferAmt,

    #[error("invalid pending amount")]
    InvalidPendingAmt,

    #[error("invalid pay deadline")]
    InvalidPayDeadline,

    #[error("invalid last pay resolve deadline")]
    InvalidLastPayDeadline,

    #[error("invalid pay settle reason")]
    InvalidSettleReason,

    #[error("too many pending pays")]
    TooManyPendingPays,

    #[error("not enough balance: need {needed}, free {free}")]
    NoEnoughBalance { needed: u128, free: u128 },

    #[error("balance underflow: {0}")]
    BalanceUnderflow(String),

    #[error("invalid pay resolver")]
    InvalidPayResolver,

    #[error("pay already paid on egress")]
    EgressPayPaid,

    #[error("pay already resolved on chain")]
    PayOnChainResolved,

    #[error("pay already pending")]
    PayAlreadyPending,

    #[error("pay route loop")]
    PayRouteLoop,

    #[error("invalid pay source")]
    InvalidPaySrc,

    #[error("invalid pay destination")]
    InvalidPayDst,

    #[error("hash lock verification failed for pay {0}")]
    HashLockMismatch(PayId),

    #[error("route not found")]
    RouteNotFound,

    #[error("peer not found")]
    PeerNotFound,

    #[error("simplex state not found")]
    SimplexStateNotFound,

    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("channel {cid} already exists")]
    ChannelExists { cid: ChannelId },

    #[error("invalid channel state {state} for {operation}")]
    InvalidChannelState {
        state: ChannelState,
        operation: &'static str,
    },

    #[error("invalid pay state transition from {from} on {event}")]
    InvalidPayStateTransition { from: PayState, event: &'static str },

    #[error("no pay state to apply {event} to")]
    MissingPayState { event: &'static str },

    #[error("pay already off-chain resolved")]
    PayOffChainResolved,

    #[error("pay {0} is already bound to a different channel")]
    PayChannelMismatch(PayId),

    #[error("invalid delegation proof: {0}")]
    InvalidDelegation(String),

    #[error("lease already acquired by another owner")]
    LeaseAcquired,

    #[error("unknown message sequence")]
    UnknownSeq,
}

impl From<prost::DecodeError> for CoreError {
    fn from(e: prost::DecodeError) -> Self {
        CoreError::Decode(e.to_string())
    }
}

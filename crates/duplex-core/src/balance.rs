//! Channel balance model.
//!
//! Balances are derived from the two simplex views and the on-chain
//! snapshot; they are never stored.

use serde::{Deserialize, Serialize};

use crate::entity::SimplexPaymentChannel;
use crate::error::CoreError;
use crate::types::{Addr, Amount, BlockNumber};

/// A withdrawal requested on chain but not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    pub receiver: Addr,
    pub amount: Amount,
    pub deadline: BlockNumber,
}

/// Deposits and withdrawals of both sides as last observed on chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainBalance {
    pub my_deposit: Amount,
    pub my_withdrawal: Amount,
    pub peer_deposit: Amount,
    pub peer_withdrawal: Amount,
    #[serde(default)]
    pub pending_withdrawal: Option<PendingWithdrawal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBalance {
    pub my_addr: Addr,
    pub my_free: Amount,
    pub my_locked: Amount,
    pub peer_addr: Addr,
    pub peer_free: Amount,
    pub peer_locked: Amount,
}

/// Sequence counters of the simplex this node signs.
///
/// `base` is the sequence the next request builds on, `last_used` the
/// highest sequence handed out, `last_acked` the highest sequence the peer
/// co-signed and `last_nacked` the highest sequence invalidated by a nack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSeqNums {
    pub base: u64,
    pub last_used: u64,
    pub last_acked: u64,
    pub last_nacked: u64,
}

impl ChannelSeqNums {
    /// Counters for a channel whose latest co-signed simplex has `seq`.
    pub fn from_simplex_seq(seq: u64) -> Self {
        Self {
            base: seq,
            last_used: seq,
            last_acked: seq,
            last_nacked: 0,
        }
    }

    /// The sequence the queue has effectively delivered up to.
    pub fn delivered(&self) -> u64 {
        self.last_acked.max(self.last_nacked)
    }
}

fn sub(lhs: Amount, rhs: Amount, what: &str) -> Result<Amount, CoreError> {
    lhs.checked_sub(rhs)
        .ok_or_else(|| CoreError::BalanceUnderflow(format!("{what}: {lhs} - {rhs}")))
}

fn add(lhs: Amount, rhs: Amount, what: &str) -> Result<Amount, CoreError> {
    lhs.checked_add(rhs)
        .ok_or_else(|| CoreError::InvalidAmount(format!("{what}: {lhs} + {rhs} overflows")))
}

/// Compute free and locked balances of both channel sides.
///
/// `my_simplex` is the simplex this node signs as `peer_from` (the base
/// state, including requests not yet acked) and `peer_simplex` the one the
/// peer signs. A pending withdrawal is reserved from its receiver's side
/// until `withdraw_safe_margin` blocks after its deadline.
pub fn compute_balance(
    my_addr: Addr,
    peer_addr: Addr,
    my_simplex: &SimplexPaymentChannel,
    peer_simplex: &SimplexPaymentChannel,
    on_chain: &OnChainBalance,
    block: BlockNumber,
    withdraw_safe_margin: u64,
) -> Result<ChannelBalance, CoreError> {
    let my_locked = my_simplex.total_pending()?;
    let to_peer = my_simplex.transfer()?;
    let peer_locked = peer_simplex.total_pending()?;
    let from_peer = peer_simplex.transfer()?;

    let mut my_free = add(on_chain.my_deposit, from_peer, "my free")?;
    my_free = sub(my_free, on_chain.my_withdrawal, "my withdrawal")?;
    my_free = sub(my_free, to_peer, "sent to peer")?;
    my_free = sub(my_free, my_locked, "my locked")?;

    let mut peer_free = add(on_chain.peer_deposit, to_peer, "peer free")?;
    peer_free = sub(peer_free, on_chain.peer_withdrawal, "peer withdrawal")?;
    peer_free = sub(peer_free, from_peer, "received from peer")?;
    peer_free = sub(peer_free, peer_locked, "peer locked")?;

    if let Some(pending) = &on_chain.pending_withdrawal {
        if block <= pending.deadline.saturating_add(withdraw_safe_margin) {
            if pending.receiver == my_addr {
                my_free = sub(my_free, pending.amount, "my pending withdrawal")?;
            } else {
                peer_free = sub(peer_free, pending.amount, "peer pending withdrawal")?;
            }
        }
    }

    Ok(ChannelBalance {
        my_addr,
        my_free,
        my_locked,
        peer_addr,
        peer_free,
        peer_locked,
    })
}

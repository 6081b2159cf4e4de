//! Channel bookkeeping shared by the send path and the handlers.

use duplex_core::{
    compute_balance, Addr, Amount, BlockNumber, ChannelBalance, ChannelId, ChannelSeqNums, ConditionalPay,
    CoreError, PayId, PayNote, SignedSimplexState, SimplexPaymentChannel,
};
use duplex_storage::{ChannelInfo, DalTx, StoredPay};
use prost::Message as _;

use crate::error::EngineError;

/// A stored pay decoded next to its original bytes.
#[derive(Debug, Clone)]
pub struct LoadedPay {
    pub id: PayId,
    pub pay: ConditionalPay,
    pub bytes: Vec<u8>,
    pub note: Option<PayNote>,
}

impl LoadedPay {
    pub fn from_stored(id: PayId, stored: StoredPay) -> Result<Self, EngineError> {
        let pay = ConditionalPay::from_bytes(&stored.pay)?;
        Ok(Self {
            id,
            pay,
            bytes: stored.pay,
            note: decode_note(&stored.note)?,
        })
    }
}

pub fn encode_note(note: Option<&PayNote>) -> Vec<u8> {
    note.map(|n| n.encode_to_vec()).unwrap_or_default()
}

pub fn decode_note(bytes: &[u8]) -> Result<Option<PayNote>, EngineError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(PayNote::decode(bytes).map_err(CoreError::from)?))
}

pub fn channel(tx: &mut DalTx<'_>, cid: &ChannelId) -> Result<ChannelInfo, EngineError> {
    tx.get_channel(cid)?
        .ok_or_else(|| CoreError::ChannelNotFound(*cid).into())
}

pub fn load_pay(tx: &mut DalTx<'_>, pay_id: &PayId) -> Result<LoadedPay, EngineError> {
    let stored = tx
        .get_pay(pay_id)?
        .ok_or(CoreError::PayNotFound(*pay_id))?;
    LoadedPay::from_stored(*pay_id, stored)
}

pub fn stored_simplex(
    tx: &mut DalTx<'_>,
    cid: &ChannelId,
    peer_from: &Addr,
) -> Result<SignedSimplexState, EngineError> {
    tx.get_simplex_state(cid, peer_from)?
        .ok_or_else(|| CoreError::SimplexStateNotFound.into())
}

/// Sequence numbers of my simplex, initialised from the co-signed state when
/// the channel has never sent anything.
pub fn seq_nums(
    tx: &mut DalTx<'_>,
    cid: &ChannelId,
    me: &Addr,
) -> Result<ChannelSeqNums, EngineError> {
    if let Some(seq_nums) = tx.get_seq_nums(cid)? {
        return Ok(seq_nums);
    }
    let simplex = stored_simplex(tx, cid, me)?.simplex()?;
    Ok(ChannelSeqNums::from_simplex_seq(simplex.seq_num))
}

/// The simplex the next outgoing update builds on.
///
/// While requests are in flight the base is the state offered by the newest
/// one; otherwise it is the last co-signed state.
pub fn base_simplex(
    tx: &mut DalTx<'_>,
    cid: &ChannelId,
    me: &Addr,
    seq_nums: &ChannelSeqNums,
) -> Result<SimplexPaymentChannel, EngineError> {
    if seq_nums.base > seq_nums.last_acked {
        let envelope = tx.get_message(cid, seq_nums.base)?.ok_or_else(|| {
            EngineError::MessageNotFound {
                cid: *cid,
                seq: seq_nums.base,
            }
        })?;
        let offered = envelope
            .message
            .offered_state()
            .ok_or(CoreError::InvalidMsgType)?;
        return Ok(offered.simplex()?);
    }
    Ok(stored_simplex(tx, cid, me)?.simplex()?)
}

/// Free and locked amounts of both sides of a channel.
pub fn balance(
    tx: &mut DalTx<'_>,
    cid: &ChannelId,
    me: &Addr,
    block: BlockNumber,
    withdraw_margin: u64,
) -> Result<ChannelBalance, EngineError> {
    let info = channel(tx, cid)?;
    let seq_nums = seq_nums(tx, cid, me)?;
    let mine = base_simplex(tx, cid, me, &seq_nums)?;
    let theirs = stored_simplex(tx, cid, &info.peer)?.simplex()?;
    let on_chain = tx.get_on_chain_balance(cid)?.unwrap_or_default();
    Ok(compute_balance(
        *me,
        info.peer,
        &mine,
        &theirs,
        &on_chain,
        block,
        withdraw_margin,
    )?)
}

pub fn add_amount(lhs: Amount, rhs: Amount) -> Result<Amount, CoreError> {
    lhs.checked_add(rhs)
        .ok_or_else(|| CoreError::InvalidAmount(format!("{lhs} + {rhs} overflows")))
}

pub fn sub_amount(lhs: Amount, rhs: Amount) -> Result<Amount, CoreError> {
    lhs.checked_sub(rhs)
        .ok_or_else(|| CoreError::BalanceUnderflow(format!("{lhs} - {rhs}")))
}

/// A received sequence number is valid when it builds on the stored state
/// and moves forward.
pub fn check_seq(stored: u64, base: u64, recvd: u64) -> Result<(), CoreError> {
    if stored == base && recvd > stored {
        Ok(())
    } else {
        tracing::debug!(stored, base, recvd, "sequence number rejected");
        Err(CoreError::InvalidSeqNum)
    }
}

//! Persisted payment state transitions.
//!
//! Each pay has an ingress and an egress leg, each with its own state record
//! bound to the channel the leg travels on.

use duplex_core::{ChannelId, CoreError, PayDirection, PayEvent, PayId, PayState, PayStateMachine};
use duplex_storage::DalTx;

use crate::error::EngineError;

/// Apply `event` to one leg of a pay and persist the result.
///
/// `cid` binds a newly created record to its channel and, for an existing
/// record, must match the channel it was created on. Returns the channel of
/// the leg and its new state.
pub fn apply(
    tx: &mut DalTx<'_>,
    pay_id: &PayId,
    dir: PayDirection,
    event: PayEvent,
    cid: Option<&ChannelId>,
) -> Result<(ChannelId, PayState), EngineError> {
    let record = tx.get_pay_state(pay_id, dir)?;
    let (current, bound) = match &record {
        Some(r) => {
            if let Some(cid) = cid {
                if *cid != r.cid {
                    tracing::warn!(
                        pay_id = %pay_id,
                        dir = %dir,
                        stored = %r.cid,
                        given = %cid,
                        "pay state channel mismatch"
                    );
                    return Err(CoreError::PayChannelMismatch(*pay_id).into());
                }
            }
            (Some(r.state), r.cid)
        }
        None => {
            let cid = cid.ok_or(CoreError::MissingPayState {
                event: event.as_str(),
            })?;
            (None, *cid)
        }
    };

    let next = PayStateMachine::transition(current, event)?;
    if current != Some(next) {
        tx.put_pay_state(pay_id, dir, &bound, next)?;
        tracing::debug!(
            pay_id = %pay_id,
            dir = %dir,
            event = %event,
            from = current.map(|s| s.as_str()).unwrap_or("NONE"),
            to = %next,
            "pay state transition"
        );
    }
    Ok((bound, next))
}

pub fn ingress(
    tx: &mut DalTx<'_>,
    pay_id: &PayId,
    event: PayEvent,
    cid: Option<&ChannelId>,
) -> Result<(ChannelId, PayState), EngineError> {
    apply(tx, pay_id, PayDirection::Ingress, event, cid)
}

pub fn egress(
    tx: &mut DalTx<'_>,
    pay_id: &PayId,
    event: PayEvent,
    cid: Option<&ChannelId>,
) -> Result<(ChannelId, PayState), EngineError> {
    apply(tx, pay_id, PayDirection::Egress, event, cid)
}

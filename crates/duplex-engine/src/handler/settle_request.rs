use duplex_core::hashlist;
use duplex_core::{
    Addr, Amount, CoreError, Envelope, Message, PayDirection, PayEvent, PayId, PayState,
    SettleReason, SettledPayment, SignedSimplexState, SimplexPaymentChannel,
};
use duplex_storage::DelegatedPayStatus;

use super::wire_error;
use crate::context::Context;
use crate::error::EngineError;
use crate::fsm;
use crate::ledger::{self, LoadedPay};

struct Settled {
    pays: Vec<LoadedPay>,
    amounts: Vec<Amount>,
    reason: SettleReason,
    paid: bool,
    delegated: Vec<PayId>,
}

/// Batched settlements must share one reason that allows batching.
fn check_reasons(settled_pays: &[SettledPayment]) -> Result<SettleReason, CoreError> {
    let first = settled_pays
        .first()
        .ok_or_else(|| CoreError::InvalidArg("empty settle request".into()))?
        .reason;
    if settled_pays.len() > 1
        && (!first.allows_batch() || settled_pays.iter().any(|p| p.reason != first))
    {
        return Err(CoreError::InvalidSettleReason);
    }
    Ok(first)
}

impl Context {
    pub(super) async fn handle_pay_settle_request(
        &self,
        peer: &Addr,
        settled_pays: Vec<SettledPayment>,
        base_seq: u64,
        state: SignedSimplexState,
    ) -> Result<(), EngineError> {
        let cosigned = self.cosign(&state);
        let recvd = state.simplex();
        let seq = recvd.as_ref().map(|s| s.seq_num).unwrap_or_default();

        let result = match &recvd {
            Ok(recvd) => {
                self.accept_settle(peer, &settled_pays, base_seq, &state, recvd, &cosigned)
                    .await
            }
            Err(e) => Err(e.clone().into()),
        };

        let (state_cosigned, error) = match &result {
            Ok(_) => (Some(cosigned), None),
            Err(e) => {
                let cid = recvd.as_ref().ok().and_then(|s| s.cid().ok());
                (self.last_cosigned(peer, cid).await, Some(wire_error(seq, e)))
            }
        };
        let response = Envelope::new(Message::PaymentSettleResponse {
            state_cosigned,
            error,
        });
        // write_direct logs the failure.
        let _ = self.write_direct(peer, response).await;

        let settled = match result {
            Ok(settled) => settled,
            Err(e) => {
                tracing::warn!(peer = %peer, seq, error = %e, "pay settle request rejected");
                return Err(e);
            }
        };

        for (loaded, amount) in settled.pays.iter().zip(&settled.amounts) {
            let dest = loaded.pay.dest_addr()?;
            if dest == self.me {
                tracing::info!(pay_id = %loaded.id, reason = %settled.reason, amount = %amount, "pay receiving done");
                self.callbacks.handle_receiving_done(
                    loaded.id,
                    &loaded.pay,
                    loaded.note.as_ref(),
                    settled.reason,
                );
                continue;
            }
            if settled.delegated.contains(&loaded.id) {
                tracing::info!(pay_id = %loaded.id, dest = %dest, paid = settled.paid, "delegated pay settled");
                continue;
            }
            if settled.reason == SettleReason::PayPaidMax {
                if let Err(e) = self
                    .send_one_pay_settle_request(loaded, *amount, SettleReason::PayPaidMax)
                    .await
                {
                    tracing::warn!(pay_id = %loaded.id, error = %e, "cannot settle pay downstream");
                }
            }
        }
        Ok(())
    }

    async fn accept_settle(
        &self,
        peer: &Addr,
        settled_pays: &[SettledPayment],
        base_seq: u64,
        state: &SignedSimplexState,
        recvd: &SimplexPaymentChannel,
        cosigned: &SignedSimplexState,
    ) -> Result<Settled, EngineError> {
        let reason = check_reasons(settled_pays)?;
        self.verify_sig(peer, &state.simplex_state, &state.sig_of_peer_from)?;
        let cid = recvd.cid()?;
        let me = self.me;
        let block = self.block();
        let recv_margin = self.config.pay_recv_timeout_safe_margin();

        let settled = self
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                let info = fsm::channel::on_update_simplex(tx, &cid)?;
                if info.peer != *peer {
                    return Err(CoreError::InvalidChannelId.into());
                }
                let stored = ledger::stored_simplex(tx, &cid, peer)?.simplex()?;
                if recvd.peer_from_addr()? != stored.peer_from_addr()? {
                    return Err(CoreError::InvalidChannelPeerFrom.into());
                }
                ledger::check_seq(stored.seq_num, base_seq, recvd.seq_num)?;

                let (mut removed, added) =
                    hashlist::symmetric_difference(&stored.pending_ids()?, &recvd.pending_ids()?)?;
                if !added.is_empty() || removed.is_empty() {
                    return Err(CoreError::InvalidPendingPays.into());
                }
                let mut requested: Vec<PayId> =
                    settled_pays.iter().map(|p| p.settled_pay_id).collect();
                removed.sort();
                requested.sort();
                if removed != requested {
                    return Err(CoreError::InvalidPendingPays.into());
                }

                let mut pays = Vec::with_capacity(settled_pays.len());
                let mut resolved: Amount = 0;
                for settled in settled_pays {
                    let loaded = ledger::load_pay(tx, &settled.settled_pay_id)?;
                    resolved = ledger::add_amount(resolved, loaded.pay.amount()?)?;
                    pays.push(loaded);
                }
                let delta = ledger::sub_amount(recvd.transfer()?, stored.transfer()?)
                    .map_err(|_| CoreError::InvalidTransferAmt)?;
                let paid = delta == resolved;
                if !paid && delta != 0 {
                    return Err(CoreError::InvalidTransferAmt.into());
                }
                let claimed = settled_pays
                    .iter()
                    .try_fold(0, |acc: Amount, p| ledger::add_amount(acc, p.amount))?;
                if claimed != delta {
                    return Err(CoreError::InvalidTransferAmt.into());
                }
                if ledger::add_amount(recvd.total_pending()?, resolved)? != stored.total_pending()? {
                    return Err(CoreError::InvalidPendingAmt.into());
                }
                if recvd.last_pay_resolve_deadline != stored.last_pay_resolve_deadline {
                    return Err(CoreError::InvalidLastPayDeadline.into());
                }
                if matches!(reason, SettleReason::PayPaidMax | SettleReason::PayResolvedOnchain)
                    && !paid
                {
                    return Err(CoreError::InvalidSettleReason.into());
                }

                let mut loops = Vec::new();
                for loaded in &pays {
                    let ingress = tx.get_pay_state(&loaded.id, PayDirection::Ingress)?;
                    let route_loop = loaded.pay.src_addr()? == me
                        || ingress.as_ref().is_some_and(|r| r.cid != cid);
                    let rejected = ingress
                        .as_ref()
                        .is_some_and(|r| r.state == PayState::IngressRejected);
                    match reason {
                        SettleReason::PayExpired if !route_loop && !rejected => {
                            let deadline = loaded.pay.deadline();
                            if block < deadline.saturating_add(recv_margin) {
                                return Err(CoreError::InvalidSettleReason.into());
                            }
                            let egress = tx
                                .get_pay_state(&loaded.id, PayDirection::Egress)?
                                .map(|r| r.state);
                            if egress == Some(PayState::CoSignedPaid) {
                                return Err(CoreError::EgressPayPaid.into());
                            }
                            if egress != Some(PayState::CoSignedCanceled)
                                && self.registry.resolved_amount(&loaded.id)? > 0
                            {
                                return Err(CoreError::PayOnChainResolved.into());
                            }
                        }
                        SettleReason::PayRejected | SettleReason::PayDestUnreachable
                            if !route_loop && !rejected =>
                        {
                            return Err(CoreError::InvalidSettleReason.into());
                        }
                        _ => {}
                    }
                    loops.push(route_loop);
                }

                let event = if paid {
                    PayEvent::CoSignedPaid
                } else {
                    PayEvent::CoSignedCanceled
                };
                let mut delegated = Vec::new();
                for (loaded, route_loop) in pays.iter().zip(loops) {
                    if !route_loop {
                        fsm::payment::ingress(tx, &loaded.id, event, Some(&cid))?;
                    }
                    if let Some(mut record) = tx.get_delegated_pay(&loaded.id)? {
                        if paid {
                            record.status = DelegatedPayStatus::Received;
                            tx.put_delegated_pay(&loaded.id, &record)?;
                        } else {
                            tx.delete_delegated_pay(&loaded.id)?;
                        }
                        delegated.push(loaded.id);
                    }
                }
                tx.put_simplex_state(&cid, peer, cosigned)?;

                let amounts = settled_pays.iter().map(|p| p.amount).collect();
                Ok(Settled {
                    pays,
                    amounts,
                    reason,
                    paid,
                    delegated,
                })
            })
            .await?;

        tracing::info!(
            cid = %cid,
            peer = %peer,
            seq = recvd.seq_num,
            reason = %reason,
            count = settled.pays.len(),
            paid = settled.paid,
            "pay settle request accepted"
        );
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settled(reason: SettleReason) -> SettledPayment {
        SettledPayment {
            settled_pay_id: PayId([1; 32]),
            reason,
            amount: 0,
        }
    }

    #[test]
    fn test_single_reason_accepted() {
        for reason in [
            SettleReason::PayPaidMax,
            SettleReason::PayRejected,
            SettleReason::PayDestUnreachable,
            SettleReason::PayExpired,
            SettleReason::PayResolvedOnchain,
        ] {
            assert_eq!(check_reasons(&[settled(reason)]).ok(), Some(reason));
        }
    }

    #[test]
    fn test_batch_reasons() {
        let expired = vec![settled(SettleReason::PayExpired); 3];
        assert_eq!(check_reasons(&expired).ok(), Some(SettleReason::PayExpired));

        let rejected = vec![settled(SettleReason::PayRejected); 2];
        assert!(matches!(
            check_reasons(&rejected),
            Err(CoreError::InvalidSettleReason)
        ));

        let mixed = vec![
            settled(SettleReason::PayExpired),
            settled(SettleReason::PayResolvedOnchain),
        ];
        assert!(matches!(
            check_reasons(&mixed),
            Err(CoreError::InvalidSettleReason)
        ));
        assert!(check_reasons(&[]).is_err());
    }
}

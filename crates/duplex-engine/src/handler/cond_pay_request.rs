use duplex_core::hashlist;
use duplex_core::{
    Addr, ConditionalPay, CoreError, Envelope, Message, PayDirection, PayEvent, PayId, PayNote,
    SettleReason, SignedSimplexState, SimplexPaymentChannel,
};
use duplex_storage::StoredPay;

use super::wire_error;
use crate::context::{active_delegation, Context};
use crate::error::EngineError;
use crate::fsm;
use crate::ledger;

pub(crate) struct CondPayRequest {
    pub pay_bytes: Vec<u8>,
    pub note: Option<PayNote>,
    pub direct: bool,
    pub base_seq: u64,
    pub state: SignedSimplexState,
}

impl Context {
    pub(super) async fn handle_cond_pay_request(
        &self,
        peer: &Addr,
        req: CondPayRequest,
    ) -> Result<(), EngineError> {
        let pay_id = PayId::from_pay_bytes(&req.pay_bytes);
        let cosigned = self.cosign(&req.state);
        let parsed = ConditionalPay::from_bytes(&req.pay_bytes)
            .and_then(|pay| Ok((pay, req.state.simplex()?)));

        let result = match &parsed {
            Ok((pay, recvd)) => {
                self.accept_cond_pay(peer, pay_id, pay, recvd, &req, &cosigned)
                    .await
            }
            Err(e) => Err(e.clone().into()),
        };

        let recvd = parsed.as_ref().ok().map(|(_, s)| s);
        let seq = recvd.map(|s| s.seq_num).unwrap_or_default();
        let (state_cosigned, error) = match &result {
            Ok(()) => (Some(cosigned), None),
            Err(e) if e.is_core(&CoreError::PayRouteLoop) => (Some(cosigned), Some(wire_error(seq, e))),
            Err(e) => {
                let cid = recvd.and_then(|s| s.cid().ok());
                (self.last_cosigned(peer, cid).await, Some(wire_error(seq, e)))
            }
        };
        let response = Envelope::new(Message::CondPayResponse {
            state_cosigned,
            error,
        });
        // write_direct logs the failure; a lost response is recovered by the
        // peer's resend.
        let _ = self.write_direct(peer, response).await;

        if let Err(e) = result {
            tracing::warn!(peer = %peer, pay_id = %pay_id, seq, error = %e, "conditional pay request rejected");
            return Err(e);
        }
        let Ok((pay, _)) = parsed else {
            return Err(CoreError::InvalidMsgType.into());
        };

        if req.direct {
            tracing::info!(pay_id = %pay_id, peer = %peer, "direct pay received");
            self.callbacks.handle_receiving_done(
                pay_id,
                &pay,
                req.note.as_ref(),
                SettleReason::PayPaidMax,
            );
            return Ok(());
        }
        if let Err(e) = self
            .route_cond_pay(peer, pay_id, &pay, &req.pay_bytes, req.note.as_ref())
            .await
        {
            tracing::warn!(pay_id = %pay_id, error = %e, "conditional pay outbound step failed");
        }
        Ok(())
    }

    /// Validate an offered pay against the stored peer state and record it.
    ///
    /// The peer's free balance is checked against the on-chain balance last
    /// pushed through [`Engine::update_on_chain_balance`]; nothing is read
    /// from the chain here, so a stale deposit surfaces as
    /// [`CoreError::NoEnoughBalance`] until the owner refreshes it.
    ///
    /// [`Engine::update_on_chain_balance`]: crate::Engine::update_on_chain_balance
    async fn accept_cond_pay(
        &self,
        peer: &Addr,
        pay_id: PayId,
        pay: &ConditionalPay,
        recvd: &SimplexPaymentChannel,
        req: &CondPayRequest,
        cosigned: &SignedSimplexState,
    ) -> Result<(), EngineError> {
        let cid = recvd.cid()?;
        let token = pay.token_addr()?;
        let src = pay.src_addr()?;
        let dest = pay.dest_addr()?;
        let amount = pay.amount()?;
        self.verify_sig(peer, &req.state.simplex_state, &req.state.sig_of_peer_from)?;

        let me = self.me;
        let block = self.block();
        let deadline_ok =
            pay.deadline() <= block.saturating_add(self.config.max_payment_timeout());
        let margin = self.config.withdraw_timeout_safe_margin();
        let max_pending = self.config.max_num_pending_pays();
        let resolver = self.config.pay_resolver();
        let note = ledger::encode_note(req.note.as_ref());

        let route_loop = self
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                if tx.get_cid_by_peer_token(peer, &token)? != Some(cid) {
                    return Err(CoreError::InvalidChannelId.into());
                }
                fsm::channel::on_update_simplex(tx, &cid)?;
                let stored = ledger::stored_simplex(tx, &cid, peer)?.simplex()?;
                let seq_check = ledger::check_seq(stored.seq_num, req.base_seq, recvd.seq_num);
                // A bad sequence number wins so the sender realigns first.
                if src == me {
                    seq_check?;
                    return Err(CoreError::InvalidPaySrc.into());
                }
                if !deadline_ok {
                    seq_check?;
                    return Err(CoreError::InvalidPayDeadline.into());
                }
                if recvd.peer_from_addr()? != stored.peer_from_addr()? {
                    return Err(CoreError::InvalidChannelPeerFrom.into());
                }
                seq_check?;
                let peer_free = ledger::balance(tx, &cid, &me, block, margin)?.peer_free;
                if amount > peer_free {
                    return Err(CoreError::NoEnoughBalance {
                        needed: amount,
                        free: peer_free,
                    }
                    .into());
                }

                let route_loop = tx.has_pay_state(&pay_id, PayDirection::Egress)?;
                if req.direct {
                    if dest != me || !pay.is_unconditional() {
                        return Err(CoreError::InvalidPayDst.into());
                    }
                    let delta = ledger::sub_amount(recvd.transfer()?, stored.transfer()?)
                        .map_err(|_| CoreError::InvalidTransferAmt)?;
                    if delta != amount {
                        return Err(CoreError::InvalidTransferAmt.into());
                    }
                    if recvd.pending_ids()? != stored.pending_ids()? {
                        return Err(CoreError::InvalidPendingPays.into());
                    }
                    if recvd.total_pending()? != stored.total_pending()? {
                        return Err(CoreError::InvalidPendingAmt.into());
                    }
                    fsm::payment::ingress(tx, &pay_id, PayEvent::DirectCoSignedPaid, Some(&cid))?;
                } else {
                    if recvd.transfer()? != stored.transfer()? {
                        return Err(CoreError::InvalidTransferAmt.into());
                    }
                    let recvd_pending = recvd.pending_ids()?;
                    if recvd_pending.len() > max_pending {
                        return Err(CoreError::TooManyPendingPays.into());
                    }
                    let (removed, added) =
                        hashlist::symmetric_difference(&stored.pending_ids()?, &recvd_pending)?;
                    if !removed.is_empty() || added != [pay_id] {
                        return Err(CoreError::InvalidPendingPays.into());
                    }
                    let last_deadline = stored.last_pay_resolve_deadline.max(pay.deadline());
                    if recvd.last_pay_resolve_deadline != last_deadline {
                        return Err(CoreError::InvalidLastPayDeadline.into());
                    }
                    if pay.resolver_addr()? != resolver {
                        return Err(CoreError::InvalidPayResolver.into());
                    }
                    if ledger::add_amount(stored.total_pending()?, amount)? != recvd.total_pending()? {
                        return Err(CoreError::InvalidPendingAmt.into());
                    }
                    if !route_loop {
                        fsm::payment::ingress(tx, &pay_id, PayEvent::CoSignedPending, Some(&cid))?;
                    }
                }

                tx.put_simplex_state(&cid, peer, cosigned)?;
                if !route_loop {
                    tx.put_pay(
                        &pay_id,
                        &StoredPay {
                            pay: req.pay_bytes.clone(),
                            note: note.clone(),
                        },
                    )?;
                }
                Ok(route_loop)
            })
            .await?;

        if route_loop {
            tracing::warn!(pay_id = %pay_id, cid = %cid, peer = %peer, "pay route loop detected");
            return Err(CoreError::PayRouteLoop.into());
        }
        tracing::debug!(pay_id = %pay_id, cid = %cid, seq = recvd.seq_num, "conditional pay accepted");
        Ok(())
    }

    /// Deliver a receipt when the pay is mine, otherwise pass it on.
    async fn route_cond_pay(
        &self,
        peer: &Addr,
        pay_id: PayId,
        pay: &ConditionalPay,
        pay_bytes: &[u8],
        note: Option<&PayNote>,
    ) -> Result<(), EngineError> {
        let dest = pay.dest_addr()?;
        if dest == self.me {
            tracing::info!(pay_id = %pay_id, peer = %peer, "conditional pay received");
            let receipt = Envelope::new(Message::CondPayReceipt {
                pay_id,
                pay_dest_sig: self.signer.sign(pay_bytes),
                delegation: None,
            })
            .to(pay.src_addr()?);
            return self.write_direct(peer, receipt).await;
        }

        let token = pay.token_addr()?;
        let me = self.me;
        let block = self.block();
        let delegation = self
            .dal
            .transactional(|tx| active_delegation(tx, &me, &dest, &token, block))
            .await?;
        if let Some(proof) = &delegation {
            if !self.transport.is_connected(&dest) {
                return self
                    .receive_delegated(peer, pay_id, pay, pay_bytes, proof.clone())
                    .await;
            }
        }

        match self.send_cond_pay_request(pay_bytes, note).await {
            Ok(_) => Ok(()),
            Err(e) => match delegation {
                Some(proof) => {
                    tracing::info!(pay_id = %pay_id, error = %e, "forward failed, receiving as delegatee");
                    self.receive_delegated(peer, pay_id, pay, pay_bytes, proof)
                        .await
                }
                None => {
                    tracing::warn!(pay_id = %pay_id, dest = %dest, error = %e, "cannot forward pay");
                    self.send_pays_settle_proof(&[pay_id], SettleReason::PayDestUnreachable)
                        .await
                }
            },
        }
    }
}

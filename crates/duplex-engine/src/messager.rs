//! Outgoing state updates: every request that offers a new simplex state to a
//! peer is built, signed, logged and queued here in one transaction.

use duplex_core::hashlist;
use duplex_core::{
    Addr, Amount, ChannelId, ConditionalPay, CoreError, Envelope, Message, PathHop, PayDirection,
    PayEvent, PayId, PayNote, SettleReason, SettledPayment,
};
use duplex_storage::StoredPay;

use crate::context::Context;
use crate::error::EngineError;
use crate::fsm;
use crate::ledger::{self, LoadedPay};

impl Context {
    /// Channel and peer of the next hop toward `dest`: the direct channel
    /// when one is open, otherwise whatever the router picks.
    pub(crate) async fn next_hop(
        &self,
        dest: &Addr,
        token: &Addr,
    ) -> Result<(ChannelId, Addr), EngineError> {
        let direct = self
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                let Some(cid) = tx.get_cid_by_peer_token(dest, token)? else {
                    return Ok(None);
                };
                Ok(tx
                    .get_channel(&cid)?
                    .filter(|info| !info.state.is_final())
                    .map(|info| (cid, info.peer)))
            })
            .await?;
        direct
            .or_else(|| self.router.lookup_next_channel(dest, token))
            .ok_or_else(|| CoreError::RouteNotFound.into())
    }

    fn enqueue(&self, peer: &Addr, cid: &ChannelId, seq: u64, envelope: Envelope) {
        if let Err(e) = self.queue.add_msg(peer, cid, seq, envelope) {
            // Logged already; delivered when the peer reconnects.
            tracing::warn!(peer = %peer, cid = %cid, seq, error = %e, "message logged but not queued");
        }
    }

    /// Offer a pay to the next hop. `pay_bytes` are sent as received so the
    /// pay id stays stable along the route.
    pub(crate) async fn send_cond_pay_request(
        &self,
        pay_bytes: &[u8],
        note: Option<&PayNote>,
    ) -> Result<PayId, EngineError> {
        let pay = ConditionalPay::from_bytes(pay_bytes)?;
        let pay_id = PayId::from_pay_bytes(pay_bytes);
        let src = pay.src_addr()?;
        let dest = pay.dest_addr()?;
        let token = pay.token_addr()?;
        let amount = pay.amount()?;
        if dest == self.me {
            return Err(CoreError::InvalidPayDst.into());
        }
        let block = self.block();
        if pay.deadline() > block.saturating_add(self.config.max_payment_timeout()) {
            return Err(CoreError::InvalidPayDeadline.into());
        }

        let (cid, peer) = self.next_hop(&dest, &token).await?;
        let direct = pay.is_unconditional() && src == self.me && dest == peer;
        let me = self.me;
        let margin = self.config.withdraw_timeout_safe_margin();
        let max_pending = self.config.max_num_pending_pays();
        let note_bytes = ledger::encode_note(note);

        let (seq, envelope) = self
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                fsm::channel::on_update_simplex(tx, &cid)?;
                let event = if direct {
                    PayEvent::DirectOneSigPaid
                } else {
                    PayEvent::OneSigPending
                };
                fsm::payment::egress(tx, &pay_id, event, Some(&cid))?;

                let free = ledger::balance(tx, &cid, &me, block, margin)?.my_free;
                if amount > free {
                    return Err(CoreError::NoEnoughBalance {
                        needed: amount,
                        free,
                    }
                    .into());
                }

                let mut seq_nums = ledger::seq_nums(tx, &cid, &me)?;
                let mut simplex = ledger::base_simplex(tx, &cid, &me, &seq_nums)?;
                let base_seq = simplex.seq_num;
                let seq = seq_nums.last_used + 1;
                simplex.seq_num = seq;
                seq_nums.last_used = seq;
                seq_nums.base = seq;

                if direct {
                    simplex.set_transfer(ledger::add_amount(simplex.transfer()?, amount)?);
                } else {
                    let mut pending = simplex.pending_ids()?;
                    if hashlist::exist(&pending, &pay_id) {
                        return Err(CoreError::PayAlreadyPending.into());
                    }
                    pending.push(pay_id);
                    if pending.len() > max_pending {
                        return Err(CoreError::TooManyPendingPays.into());
                    }
                    simplex.set_pending_ids(&pending);
                    simplex.set_total_pending(ledger::add_amount(simplex.total_pending()?, amount)?);
                    simplex.last_pay_resolve_deadline =
                        simplex.last_pay_resolve_deadline.max(pay.deadline());
                }

                let envelope = Envelope::new(Message::CondPayRequest {
                    cond_pay: pay_bytes.to_vec(),
                    note: note.cloned(),
                    direct_pay: direct,
                    base_seq,
                    state_only_peer_from_sig: self.sign_simplex(&simplex),
                });
                tx.put_pay(
                    &pay_id,
                    &StoredPay {
                        pay: pay_bytes.to_vec(),
                        note: note_bytes.clone(),
                    },
                )?;
                tx.put_seq_nums(&cid, &seq_nums)?;
                tx.put_message(&cid, seq, &envelope)?;
                Ok((seq, envelope))
            })
            .await?;

        tracing::info!(
            pay_id = %pay_id,
            cid = %cid,
            peer = %peer,
            seq,
            amount = %amount,
            direct,
            "conditional pay request sent"
        );
        self.enqueue(&peer, &cid, seq, envelope);
        Ok(pay_id)
    }

    /// Remove pays from the pending list of their egress channel.
    ///
    /// All pays must travel on the same channel. When the settlement moves
    /// no value, pays that can no longer be canceled are skipped and
    /// returned instead of failing the whole batch.
    pub(crate) async fn send_pays_settle_request(
        &self,
        pays: &[LoadedPay],
        amounts: &[Amount],
        reason: SettleReason,
        path: Vec<PathHop>,
    ) -> Result<Vec<PayId>, EngineError> {
        if pays.is_empty() || pays.len() != amounts.len() {
            return Err(CoreError::InvalidArg(format!(
                "{} pays with {} amounts",
                pays.len(),
                amounts.len()
            ))
            .into());
        }
        let total = amounts
            .iter()
            .try_fold(0, |acc: Amount, a| ledger::add_amount(acc, *a))?;
        let paid = total != 0;
        let me = self.me;

        let (cid, peer, seq, envelope, skipped) = self
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                let cid = tx
                    .get_pay_state(&pays[0].id, PayDirection::Egress)?
                    .ok_or(CoreError::PayNotFound(pays[0].id))?
                    .cid;
                let peer = fsm::channel::on_update_simplex(tx, &cid)?.peer;

                let mut seq_nums = ledger::seq_nums(tx, &cid, &me)?;
                let mut simplex = ledger::base_simplex(tx, &cid, &me, &seq_nums)?;
                let base_seq = simplex.seq_num;
                let seq = seq_nums.last_used + 1;
                simplex.seq_num = seq;
                seq_nums.last_used = seq;
                seq_nums.base = seq;
                simplex.set_transfer(ledger::add_amount(simplex.transfer()?, total)?);

                let mut pending = simplex.pending_ids()?;
                let mut total_pending = simplex.total_pending()?;
                let mut settled = Vec::with_capacity(pays.len());
                let mut skipped = Vec::new();
                for (loaded, amount) in pays.iter().zip(amounts) {
                    let before = pending.clone();
                    if let Err(e) = hashlist::delete_hash(&mut pending, &loaded.id) {
                        if paid {
                            return Err(e.into());
                        }
                        tracing::warn!(pay_id = %loaded.id, cid = %cid, "pay not pending, skipping");
                        skipped.push(loaded.id);
                        continue;
                    }
                    let event = if paid {
                        PayEvent::OneSigPaid
                    } else {
                        PayEvent::OneSigCanceled
                    };
                    match fsm::payment::egress(tx, &loaded.id, event, Some(&cid)) {
                        Ok(_) => {}
                        Err(EngineError::Core(CoreError::PayChannelMismatch(id))) => {
                            return Err(CoreError::PayChannelMismatch(id).into())
                        }
                        Err(e) if !paid => {
                            tracing::warn!(pay_id = %loaded.id, error = %e, "pay cannot be canceled, skipping");
                            pending = before;
                            skipped.push(loaded.id);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                    total_pending = ledger::sub_amount(total_pending, loaded.pay.amount()?)?;
                    settled.push(SettledPayment {
                        settled_pay_id: loaded.id,
                        reason,
                        amount: *amount,
                    });
                }
                if settled.is_empty() {
                    return Err(CoreError::InvalidArg("no pay left to settle".into()).into());
                }
                simplex.set_pending_ids(&pending);
                simplex.set_total_pending(total_pending);

                let mut envelope = Envelope::new(Message::PaymentSettleRequest {
                    settled_pays: settled,
                    base_seq,
                    state_only_peer_from_sig: self.sign_simplex(&simplex),
                });
                envelope.path = path.clone();
                tx.put_seq_nums(&cid, &seq_nums)?;
                tx.put_message(&cid, seq, &envelope)?;
                Ok((cid, peer, seq, envelope, skipped))
            })
            .await?;

        tracing::info!(
            cid = %cid,
            peer = %peer,
            seq,
            reason = %reason,
            count = pays.len() - skipped.len(),
            amount = %total,
            "pay settle request sent"
        );
        self.enqueue(&peer, &cid, seq, envelope);
        Ok(skipped)
    }

    pub(crate) async fn send_one_pay_settle_request(
        &self,
        pay: &LoadedPay,
        amount: Amount,
        reason: SettleReason,
    ) -> Result<(), EngineError> {
        self.send_pays_settle_request(std::slice::from_ref(pay), &[amount], reason, Vec::new())
            .await
            .map(|_| ())
    }

    /// Ask the upstream peer to settle pays it sent me.
    ///
    /// Cancel reasons first mark the ingress leg rejected so the matching
    /// settle request passes.
    pub(crate) async fn send_pays_settle_proof(
        &self,
        pay_ids: &[PayId],
        reason: SettleReason,
    ) -> Result<(), EngineError> {
        let Some(first) = pay_ids.first() else {
            return Err(CoreError::InvalidArg("empty settle proof".into()).into());
        };
        let reject = matches!(
            reason,
            SettleReason::PayRejected | SettleReason::PayDestUnreachable | SettleReason::PayExpired
        );
        let (cid, peer) = self
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                let cid = tx
                    .get_pay_state(first, PayDirection::Ingress)?
                    .ok_or(CoreError::PayNotFound(*first))?
                    .cid;
                for pay_id in pay_ids {
                    let (leg, _) = if reject {
                        fsm::payment::ingress(tx, pay_id, PayEvent::IngressRejected, Some(&cid))?
                    } else {
                        let record = tx
                            .get_pay_state(pay_id, PayDirection::Ingress)?
                            .ok_or(CoreError::PayNotFound(*pay_id))?;
                        (record.cid, record.state)
                    };
                    if leg != cid {
                        return Err(CoreError::PayChannelMismatch(*pay_id).into());
                    }
                }
                Ok((cid, ledger::channel(tx, &cid)?.peer))
            })
            .await?;

        let settled_pays = pay_ids
            .iter()
            .map(|id| SettledPayment {
                settled_pay_id: *id,
                reason,
                amount: 0,
            })
            .collect();
        tracing::info!(cid = %cid, peer = %peer, reason = %reason, count = pay_ids.len(), "pay settle proof sent");
        self.write_direct(&peer, Envelope::new(Message::PaymentSettleProof { settled_pays }))
            .await
    }
}

//! Responses to my state-updating requests.
//!
//! The response co-signs the newest state the peer accepted. Everything up to
//! it is acked; an error names the request the peer refused, and for most
//! codes every request logged after it is re-offered on top of the acked
//! state.

use duplex_core::{
    Addr, ChannelId, ConditionalPay, CoreError, Envelope, ErrorCode, Message, PathHop, PayEvent,
    PayId, PayOriginNote, SettleReason, SignedSimplexState, WireError,
};
use duplex_storage::DalTx;

use crate::context::Context;
use crate::error::EngineError;
use crate::fsm;
use crate::ledger::{self, LoadedPay};

#[derive(Default)]
struct AckOutcome {
    acked: Vec<Envelope>,
    nacked: Option<Envelope>,
    in_flight: Vec<Envelope>,
    route_loop: Option<Envelope>,
    last_nacked: u64,
}

impl Context {
    pub(super) async fn handle_hop_ack(
        &self,
        peer: &Addr,
        state: Option<SignedSimplexState>,
        error: Option<WireError>,
    ) -> Result<(), EngineError> {
        let state = state.ok_or_else(|| EngineError::Protocol("hop ack without state".into()))?;
        let simplex = state.simplex()?;
        if let Err(e) = self.verify_sig(peer, &state.simplex_state, &state.sig_of_peer_to) {
            tracing::error!(peer = %peer, seq = simplex.seq_num, "hop ack with invalid peer signature");
            return Err(e.into());
        }
        let ack = simplex.seq_num;
        if ack > 0 {
            self.verify_sig(&self.me, &state.simplex_state, &state.sig_of_peer_from)?;
        }
        let cid = simplex.cid()?;
        if let Some(err) = &error {
            tracing::warn!(cid = %cid, peer = %peer, ack, nack = err.seq, code = %err.code, reason = %err.reason, "request refused by peer");
        }

        let me = self.me;
        let outcome = self
            .dal
            .transactional(|tx| self.apply_hop_ack(tx, &me, &cid, &state, ack, error.as_ref()))
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(cid = %cid, ack, error = %e, "hop ack not applied");
                return Err(e);
            }
        };

        if let Err(e) = self.queue.ack_msg(&cid, ack, outcome.last_nacked) {
            tracing::warn!(cid = %cid, ack, error = %e, "queue ack failed");
        }
        if let Some(err) = &error {
            let no_pending_nack = ack > outcome.last_nacked || outcome.last_nacked == 0;
            if err.code == ErrorCode::InvalidSeqNum && ack < err.seq && no_pending_nack {
                if let Err(e) = self.queue.resend(&cid, ack + 1) {
                    tracing::warn!(cid = %cid, seq = ack + 1, error = %e, "resend failed");
                }
            }
        }

        for envelope in &outcome.acked {
            self.on_acked(envelope).await;
        }
        if let Some(envelope) = &outcome.nacked {
            let reason = error.as_ref().map(|e| e.reason.as_str()).unwrap_or_default();
            self.on_nacked(envelope, reason).await;
        }
        for envelope in outcome.in_flight {
            self.resend_in_flight(envelope).await;
        }
        if let Some(envelope) = outcome.route_loop {
            self.cancel_route_loop(&cid, envelope).await?;
        }
        Ok(())
    }

    fn channel_message(
        &self,
        tx: &mut DalTx<'_>,
        cid: &ChannelId,
        seq: u64,
    ) -> Result<Option<Envelope>, EngineError> {
        if let Some(envelope) = self.queue.get_msg(cid, seq) {
            return Ok(Some(envelope));
        }
        let logged = tx.get_message(cid, seq)?;
        if logged.is_none() {
            tracing::warn!(cid = %cid, seq, "message not found in queue or log");
        }
        Ok(logged)
    }

    fn apply_hop_ack(
        &self,
        tx: &mut DalTx<'_>,
        me: &Addr,
        cid: &ChannelId,
        state: &SignedSimplexState,
        ack: u64,
        error: Option<&WireError>,
    ) -> Result<AckOutcome, EngineError> {
        fsm::channel::on_update_simplex(tx, cid)?;
        let mut seq_nums = ledger::seq_nums(tx, cid, me)?;
        let prev_nacked = seq_nums.last_nacked;
        let mut outcome = AckOutcome::default();

        match error {
            Some(err) if err.code == ErrorCode::PayRouteLoop => {
                outcome.route_loop = self.channel_message(tx, cid, err.seq)?;
            }
            Some(err) if err.code != ErrorCode::InvalidSeqNum => {
                let nacked = self.channel_message(tx, cid, err.seq)?;
                if let Some(Message::CondPayRequest { cond_pay, .. }) = nacked.as_ref().map(|e| &e.message) {
                    let pay_id = PayId::from_pay_bytes(cond_pay);
                    if let Err(e) = fsm::payment::egress(tx, &pay_id, PayEvent::EgressNacked, None) {
                        tracing::error!(pay_id = %pay_id, error = %e, "cannot mark pay nacked");
                    }
                }
                outcome.nacked = nacked;
                // Everything logged after the refused request is re-offered
                // with new sequence numbers on top of the acked state.
                seq_nums.base = ack;
                seq_nums.last_nacked = seq_nums.last_used;
                for seq in err.seq + 1..=seq_nums.last_nacked {
                    if let Some(envelope) = self.channel_message(tx, cid, seq)? {
                        outcome.in_flight.push(envelope);
                    }
                }
                tracing::warn!(cid = %cid, base = seq_nums.base, last_nacked = seq_nums.last_nacked, "sequence rewound after nack");
            }
            _ => {}
        }

        if ack > seq_nums.last_acked {
            let mut from = seq_nums.last_acked + 1;
            if prev_nacked > seq_nums.last_acked {
                for seq in from..=prev_nacked {
                    let Some(envelope) = self.channel_message(tx, cid, seq)? else {
                        continue;
                    };
                    if let Message::CondPayRequest { cond_pay, .. } = &envelope.message {
                        let pay_id = PayId::from_pay_bytes(cond_pay);
                        fsm::payment::egress(tx, &pay_id, PayEvent::EgressUpdateAfterNack, None)?;
                    }
                    tx.delete_message(cid, seq)?;
                }
                from = prev_nacked + 1;
            }

            for seq in from..=ack {
                let Some(envelope) = self.channel_message(tx, cid, seq)? else {
                    continue;
                };
                match &envelope.message {
                    Message::CondPayRequest {
                        cond_pay,
                        direct_pay,
                        ..
                    } => {
                        let pay_id = PayId::from_pay_bytes(cond_pay);
                        if *direct_pay {
                            fsm::payment::egress(tx, &pay_id, PayEvent::DirectCoSignedPaid, Some(cid))?;
                        } else {
                            fsm::payment::egress(tx, &pay_id, PayEvent::EgressDelivered, None)?;
                        }
                    }
                    Message::PaymentSettleRequest { settled_pays, .. } => {
                        let paid = settled_pays.iter().any(|p| p.amount != 0);
                        for settled in settled_pays {
                            let event = if paid {
                                PayEvent::CoSignedPaid
                            } else {
                                PayEvent::CoSignedCanceled
                            };
                            fsm::payment::egress(tx, &settled.settled_pay_id, event, None)?;
                        }
                    }
                    other => {
                        tracing::error!(cid = %cid, seq, kind = other.kind(), "unexpected message in channel log");
                        continue;
                    }
                }
                tx.delete_message(cid, seq)?;
                outcome.acked.push(envelope);
            }
            tx.put_simplex_state(cid, me, state)?;
        }

        seq_nums.last_acked = seq_nums.last_acked.max(ack);
        outcome.last_nacked = seq_nums.last_nacked;
        tx.put_seq_nums(cid, &seq_nums)?;
        Ok(outcome)
    }

    async fn load(&self, pay_id: &PayId) -> Result<LoadedPay, EngineError> {
        self.dal
            .transactional(|tx| ledger::load_pay(tx, pay_id))
            .await
    }

    async fn on_acked(&self, envelope: &Envelope) {
        match &envelope.message {
            Message::PaymentSettleRequest { settled_pays, .. } => {
                for settled in settled_pays {
                    let loaded = match self.load(&settled.settled_pay_id).await {
                        Ok(loaded) => loaded,
                        Err(e) => {
                            tracing::error!(pay_id = %settled.settled_pay_id, error = %e, "settled pay not found");
                            continue;
                        }
                    };
                    if loaded.pay.src_addr().ok() == Some(self.me) {
                        tracing::info!(pay_id = %loaded.id, reason = %settled.reason, "pay send complete");
                        self.callbacks.handle_send_complete(
                            loaded.id,
                            &loaded.pay,
                            loaded.note.as_ref(),
                            settled.reason,
                        );
                    } else if matches!(
                        settled.reason,
                        SettleReason::PayRejected | SettleReason::PayDestUnreachable
                    ) {
                        if let Err(e) = self.send_pays_settle_proof(&[loaded.id], settled.reason).await {
                            tracing::warn!(pay_id = %loaded.id, error = %e, "cannot pass cancel upstream");
                        }
                    }
                }
            }
            Message::CondPayRequest {
                cond_pay,
                note,
                direct_pay: true,
                ..
            } => {
                let pay_id = PayId::from_pay_bytes(cond_pay);
                let Ok(pay) = ConditionalPay::from_bytes(cond_pay) else {
                    tracing::error!(pay_id = %pay_id, "cannot decode acked direct pay");
                    return;
                };
                if let Some(origin) = note.as_ref().and_then(|n| PayOriginNote::from_note(n).ok()) {
                    self.notify_pay_send_finalize(&origin, true).await;
                    return;
                }
                tracing::info!(pay_id = %pay_id, "direct pay send complete");
                self.callbacks.handle_send_complete(
                    pay_id,
                    &pay,
                    note.as_ref(),
                    SettleReason::PayPaidMax,
                );
            }
            _ => {}
        }
    }

    async fn on_nacked(&self, envelope: &Envelope, reason: &str) {
        let pay_ids: Vec<PayId> = match &envelope.message {
            Message::CondPayRequest { cond_pay, .. } => vec![PayId::from_pay_bytes(cond_pay)],
            Message::PaymentSettleRequest { settled_pays, .. } => {
                settled_pays.iter().map(|p| p.settled_pay_id).collect()
            }
            _ => return,
        };
        for pay_id in pay_ids {
            match self.load(&pay_id).await {
                Ok(loaded) => self.notify_send_fail(&loaded, reason).await,
                Err(e) => tracing::error!(pay_id = %pay_id, error = %e, "nacked pay not found"),
            }
        }
    }

    async fn notify_send_fail(&self, loaded: &LoadedPay, reason: &str) {
        if loaded.pay.src_addr().ok() != Some(self.me) {
            return;
        }
        if let Some(origin) = loaded
            .note
            .as_ref()
            .and_then(|n| PayOriginNote::from_note(n).ok())
        {
            self.notify_pay_send_finalize(&origin, false).await;
            return;
        }
        tracing::warn!(pay_id = %loaded.id, reason, "pay send failed");
        self.callbacks
            .handle_send_fail(loaded.id, &loaded.pay, loaded.note.as_ref(), reason);
    }

    async fn resend_in_flight(&self, envelope: Envelope) {
        match envelope.message {
            Message::CondPayRequest { cond_pay, note, .. } => {
                let pay_id = PayId::from_pay_bytes(&cond_pay);
                tracing::debug!(pay_id = %pay_id, "re-offering pay after nack");
                if let Err(e) = self.send_cond_pay_request(&cond_pay, note.as_ref()).await {
                    match self.load(&pay_id).await {
                        Ok(loaded) => self.notify_send_fail(&loaded, &e.to_string()).await,
                        Err(load_err) => tracing::error!(pay_id = %pay_id, error = %load_err, "cannot resend pay"),
                    }
                }
            }
            Message::PaymentSettleRequest { settled_pays, .. } => {
                let mut pays = Vec::with_capacity(settled_pays.len());
                let mut amounts = Vec::with_capacity(settled_pays.len());
                let mut reason = SettleReason::PayPaidMax;
                for settled in settled_pays {
                    match self.load(&settled.settled_pay_id).await {
                        Ok(loaded) => {
                            pays.push(loaded);
                            amounts.push(settled.amount);
                            reason = settled.reason;
                        }
                        Err(e) => tracing::error!(pay_id = %settled.settled_pay_id, error = %e, "cannot resend settlement"),
                    }
                }
                if pays.is_empty() {
                    return;
                }
                if let Err(e) = self
                    .send_pays_settle_request(&pays, &amounts, reason, envelope.path)
                    .await
                {
                    let reason = e.to_string();
                    for loaded in &pays {
                        self.notify_send_fail(loaded, &reason).await;
                    }
                }
            }
            _ => {}
        }
    }

    /// Cancel a pay the next hop saw coming back around.
    async fn cancel_route_loop(&self, cid: &ChannelId, envelope: Envelope) -> Result<(), EngineError> {
        let Message::CondPayRequest { cond_pay, .. } = &envelope.message else {
            return Err(CoreError::InvalidMsgType.into());
        };
        let pay_id = PayId::from_pay_bytes(cond_pay);
        tracing::warn!(pay_id = %pay_id, cid = %cid, "canceling looping pay");
        let loaded = self.load(&pay_id).await?;
        let mut path = envelope.path.clone();
        path.push(PathHop {
            addr: self.me,
            code: Some(ErrorCode::PayRouteLoop),
        });
        self.send_pays_settle_request(
            std::slice::from_ref(&loaded),
            &[0],
            SettleReason::PayDestUnreachable,
            path,
        )
        .await
        .map(|_| ())
    }
}

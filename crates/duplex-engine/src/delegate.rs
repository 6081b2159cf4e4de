//! Receiving on behalf of offline nodes.
//!
//! A delegator signs a [`DelegationProof`] naming this node as delegatee for
//! one token. While the proof is valid, pays for the delegator that cannot
//! reach it are received here and, once settled, handed over as one direct
//! lump sum per token when the delegator reconnects.

use std::collections::BTreeMap;

use chrono::Utc;
use duplex_core::entity::OriginalPay;
use duplex_core::types::amount_to_bytes;
use duplex_core::{
    Addr, Amount, ConditionalPay, CoreError, DelegationProof, Envelope, Message,
    PayId, PayOriginNote,
};
use duplex_storage::{DelegatedPayRecord, DelegatedPayStatus};

use crate::context::Context;
use crate::error::EngineError;
use crate::ledger;

impl Context {
    /// Store a delegation naming me as delegatee.
    pub(crate) async fn accept_delegation(&self, proof: DelegationProof) -> Result<(), EngineError> {
        let delegator = proof.delegator_addr()?;
        let token = proof.token_addr()?;
        if proof.delegatee_addr()? != self.me {
            return Err(CoreError::InvalidDelegation("delegatee is not this node".into()).into());
        }
        self.verify_sig(&delegator, &proof.signing_bytes(), &proof.delegator_sig)
            .map_err(|_| CoreError::InvalidDelegation("bad delegator signature".into()))?;
        if self.block() > proof.expires_at_block {
            return Err(CoreError::InvalidDelegation("expired".into()).into());
        }
        self.dal
            .transactional(|tx| tx.put_delegation(&delegator, &token, &proof))
            .await?;
        tracing::info!(delegator = %delegator, token = %token, expires = proof.expires_at_block, "delegation accepted");
        Ok(())
    }

    /// Take a pay for its offline destination and answer with a receipt
    /// backed by the delegation.
    pub(crate) async fn receive_delegated(
        &self,
        peer: &Addr,
        pay_id: PayId,
        pay: &ConditionalPay,
        pay_bytes: &[u8],
        proof: DelegationProof,
    ) -> Result<(), EngineError> {
        let record = DelegatedPayRecord {
            dest: pay.dest_addr()?,
            token: pay.token_addr()?,
            amount: pay.amount()?,
            status: DelegatedPayStatus::Receiving,
        };
        self.dal
            .transactional(|tx| tx.put_delegated_pay(&pay_id, &record))
            .await?;
        tracing::info!(pay_id = %pay_id, dest = %record.dest, amount = %record.amount, "receiving pay as delegatee");

        let receipt = Envelope::new(Message::CondPayReceipt {
            pay_id,
            pay_dest_sig: self.signer.sign(pay_bytes),
            delegation: Some(proof),
        })
        .to(pay.src_addr()?);
        self.write_direct(peer, receipt).await
    }

    /// Hand settled delegated pays to a delegator that just reconnected.
    pub(crate) async fn notify_new_stream(&self, peer: &Addr) -> Result<(), EngineError> {
        let received = self
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                Ok(tx
                    .list_delegated_pays()?
                    .into_iter()
                    .filter(|(_, r)| r.dest == *peer && r.status == DelegatedPayStatus::Received)
                    .collect::<Vec<_>>())
            })
            .await?;
        if received.is_empty() {
            return Ok(());
        }

        let mut by_token: BTreeMap<Addr, Vec<(PayId, Amount)>> = BTreeMap::new();
        for (pay_id, record) in received {
            by_token
                .entry(record.token)
                .or_default()
                .push((pay_id, record.amount));
        }

        for (token, pays) in by_token {
            if let Err(e) = self.send_lump_sum(peer, token, &pays).await {
                tracing::warn!(peer = %peer, token = %token, count = pays.len(), error = %e, "cannot forward delegated pays");
            }
        }
        Ok(())
    }

    async fn send_lump_sum(
        &self,
        peer: &Addr,
        token: Addr,
        pays: &[(PayId, Amount)],
    ) -> Result<(), EngineError> {
        let total = pays
            .iter()
            .try_fold(0, |acc: Amount, (_, amount)| ledger::add_amount(acc, *amount))?;
        let origin = PayOriginNote {
            original_pays: pays
                .iter()
                .map(|(id, amount)| OriginalPay {
                    pay_id: id.to_vec(),
                    amount: amount_to_bytes(*amount),
                })
                .collect(),
        };
        let pay = ConditionalPay {
            pay_timestamp: u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default(),
            src: self.me.to_vec(),
            dest: peer.to_vec(),
            conditions: Vec::new(),
            token: token.to_vec(),
            amount: amount_to_bytes(total),
            resolve_deadline: self
                .block()
                .saturating_add(self.config.admin_send_token_timeout()),
            resolve_timeout: self.config.pay_resolve_timeout(),
            pay_resolver: self.config.pay_resolver().to_vec(),
        };
        let pay_id = self
            .send_cond_pay_request(&pay.to_bytes(), Some(&origin.to_note()))
            .await?;
        self.set_delegated_status(&origin, DelegatedPayStatus::Done)
            .await?;
        tracing::info!(pay_id = %pay_id, peer = %peer, token = %token, count = pays.len(), amount = %total, "delegated pays forwarded");
        Ok(())
    }

    /// Outcome of a lump sum. A failed one is retried on the next reconnect.
    pub(crate) async fn notify_pay_send_finalize(&self, origin: &PayOriginNote, success: bool) {
        if success {
            tracing::info!(count = origin.original_pays.len(), "delegated pays delivered");
            return;
        }
        tracing::warn!(count = origin.original_pays.len(), "delegated pay forward failed");
        if let Err(e) = self
            .set_delegated_status(origin, DelegatedPayStatus::Received)
            .await
        {
            tracing::error!(error = %e, "cannot restore delegated pays");
        }
    }

    async fn set_delegated_status(
        &self,
        origin: &PayOriginNote,
        status: DelegatedPayStatus,
    ) -> Result<(), EngineError> {
        let ids = origin
            .original_pays
            .iter()
            .map(|p| PayId::from_slice(&p.pay_id))
            .collect::<Result<Vec<_>, CoreError>>()?;
        self.dal
            .transactional(|tx| -> Result<_, EngineError> {
                for pay_id in &ids {
                    if let Some(mut record) = tx.get_delegated_pay(pay_id)? {
                        record.status = status;
                        tx.put_delegated_pay(pay_id, &record)?;
                    }
                }
                Ok(())
            })
            .await
    }
}

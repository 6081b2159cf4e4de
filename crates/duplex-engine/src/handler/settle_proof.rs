use duplex_core::{Addr, CoreError, PayDirection, SettleReason, SettledPayment};

use crate::context::Context;
use crate::error::EngineError;
use crate::ledger::{self, LoadedPay};

impl Context {
    /// A downstream peer asks me to settle pays I sent it.
    pub(super) async fn handle_pay_settle_proof(
        &self,
        peer: &Addr,
        settled_pays: Vec<SettledPayment>,
    ) -> Result<(), EngineError> {
        let Some(first) = settled_pays.first() else {
            return Err(CoreError::InvalidArg("empty settle proof".into()).into());
        };
        let reason = first.reason;
        tracing::debug!(peer = %peer, reason = %reason, count = settled_pays.len(), "pay settle proof received");

        if reason == SettleReason::PayExpired {
            if settled_pays.iter().any(|p| p.reason != SettleReason::PayExpired) {
                return Err(CoreError::InvalidSettleReason.into());
            }
            let mut pays = Vec::with_capacity(settled_pays.len());
            for settled in &settled_pays {
                pays.push(self.egress_pay_to(peer, settled).await?);
            }
            let zeros = vec![0; pays.len()];
            let skipped = self
                .send_pays_settle_request(&pays, &zeros, SettleReason::PayExpired, Vec::new())
                .await?;
            if !skipped.is_empty() {
                tracing::warn!(peer = %peer, skipped = skipped.len(), "some expired pays were not canceled");
            }
            return Ok(());
        }

        if settled_pays.len() != 1 {
            return Err(CoreError::InvalidSettleReason.into());
        }
        let loaded = self.egress_pay_to(peer, first).await?;
        let is_src = loaded.pay.src_addr()? == self.me;
        let amount = match reason {
            SettleReason::PayRejected => 0,
            SettleReason::PayResolvedOnchain => self.registry.resolved_amount(&loaded.id)?,
            SettleReason::PayDestUnreachable => {
                if is_src {
                    tracing::warn!(pay_id = %loaded.id, "pay destination unreachable");
                    self.callbacks.handle_destination_unreachable(
                        loaded.id,
                        &loaded.pay,
                        loaded.note.as_ref(),
                    );
                }
                0
            }
            SettleReason::PayPaidMax | SettleReason::PayExpired => {
                return Err(CoreError::InvalidSettleReason.into())
            }
        };
        self.send_one_pay_settle_request(&loaded, amount, reason)
            .await?;

        if reason == SettleReason::PayResolvedOnchain && !is_src {
            self.send_pays_settle_proof(&[loaded.id], reason).await?;
        }
        Ok(())
    }

    /// Load a pay whose egress leg runs to `peer`.
    async fn egress_pay_to(
        &self,
        peer: &Addr,
        settled: &SettledPayment,
    ) -> Result<LoadedPay, EngineError> {
        let pay_id = settled.settled_pay_id;
        let (_, egress_peer) = self.pay_peer(&pay_id, PayDirection::Egress).await?;
        if egress_peer != *peer {
            tracing::warn!(pay_id = %pay_id, peer = %peer, egress = %egress_peer, "settle proof from wrong peer");
            return Err(CoreError::PayChannelMismatch(pay_id).into());
        }
        self.dal
            .transactional(|tx| ledger::load_pay(tx, &pay_id))
            .await
    }
}

use duplex_core::{
    Addr, ConditionalPay, CoreError, DelegationProof, Envelope, Message, PathHop, PayDirection,
    PayId,
};

use crate::context::Context;
use crate::error::EngineError;
use crate::ledger;

impl Context {
    pub(super) async fn handle_cond_pay_receipt(
        &self,
        peer: &Addr,
        to_addr: Option<Addr>,
        path: Vec<PathHop>,
        pay_id: PayId,
        pay_dest_sig: Vec<u8>,
        delegation: Option<DelegationProof>,
    ) -> Result<(), EngineError> {
        if self.relayed_elsewhere(to_addr) {
            let envelope = Envelope {
                to_addr,
                path,
                message: Message::CondPayReceipt {
                    pay_id,
                    pay_dest_sig,
                    delegation,
                },
            };
            return self.forward(&pay_id, PayDirection::Ingress, envelope).await;
        }

        let loaded = self
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                match tx.get_pay(&pay_id)? {
                    Some(stored) => Ok(Some(ledger::LoadedPay::from_stored(pay_id, stored)?)),
                    None => Ok(None),
                }
            })
            .await?;
        let Some(loaded) = loaded else {
            tracing::warn!(pay_id = %pay_id, peer = %peer, "receipt for unknown pay");
            return Ok(());
        };
        if loaded.pay.src_addr()? != self.me {
            return Err(CoreError::InvalidPaySrc.into());
        }
        let dest = loaded.pay.dest_addr()?;

        let receipt_signer = match &delegation {
            None => {
                self.verify_sig(&dest, &loaded.bytes, &pay_dest_sig)?;
                None
            }
            Some(proof) => {
                let delegatee = self.verify_delegated_receipt(&loaded.pay, &loaded.bytes, &pay_dest_sig, proof)?;
                Some(delegatee)
            }
        };

        let hash_lock = loaded
            .pay
            .conditions
            .first()
            .map(|c| c.hash_lock.clone())
            .ok_or_else(|| CoreError::InvalidArg("receipt for unconditional pay".into()))?;
        let secret = self
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                if let Some(delegatee) = &receipt_signer {
                    tx.put_receipt_signer(&pay_id, delegatee)?;
                }
                Ok(tx.get_secret(&hash_lock)?)
            })
            .await?
            .ok_or_else(|| CoreError::InvalidArg(format!("no secret for pay {pay_id}")))?;

        tracing::info!(pay_id = %pay_id, dest = %dest, delegated = receipt_signer.is_some(), "receipt verified, revealing secret");
        let reveal = Envelope::new(Message::RevealSecret {
            pay_id,
            secret: secret.preimage,
        })
        .to(dest);
        self.write_direct(peer, reveal).await
    }

    /// Check a receipt signed by a delegatee. Returns the delegatee.
    fn verify_delegated_receipt(
        &self,
        pay: &ConditionalPay,
        pay_bytes: &[u8],
        sig: &[u8],
        proof: &DelegationProof,
    ) -> Result<Addr, EngineError> {
        let delegator = proof.delegator_addr()?;
        let delegatee = proof.delegatee_addr()?;
        let invalid = |reason: &str| -> EngineError {
            tracing::warn!(delegator = %delegator, delegatee = %delegatee, reason, "invalid delegation in receipt");
            CoreError::InvalidDelegation(reason.to_string()).into()
        };
        if delegator != pay.dest_addr()? {
            return Err(invalid("delegator is not the pay destination"));
        }
        if proof.token_addr()? != pay.token_addr()? {
            return Err(invalid("token mismatch"));
        }
        if self.block() > proof.expires_at_block {
            return Err(invalid("expired"));
        }
        self.verify_sig(&delegator, &proof.signing_bytes(), &proof.delegator_sig)
            .map_err(|_| invalid("bad delegator signature"))?;
        self.verify_sig(&delegatee, pay_bytes, sig)?;
        Ok(delegatee)
    }
}

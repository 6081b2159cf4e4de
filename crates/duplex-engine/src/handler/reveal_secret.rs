//! Secret reveal between a pay's source and destination.
//!
//! The source reveals the preimage toward the destination once it holds a
//! receipt; the destination acknowledges with a signature over the secret,
//! which lets the source settle the pay as paid.

use duplex_core::{
    Addr, CoreError, Envelope, Message, PathHop, PayDirection, PayEvent, PayId, SettleReason,
};

use crate::context::{active_delegation, Context};
use crate::error::EngineError;
use crate::fsm;
use crate::ledger;

impl Context {
    pub(super) async fn handle_reveal_secret(
        &self,
        peer: &Addr,
        to_addr: Option<Addr>,
        path: Vec<PathHop>,
        pay_id: PayId,
        secret: Vec<u8>,
    ) -> Result<(), EngineError> {
        let delegated = self
            .dal
            .transactional(|tx| Ok::<_, EngineError>(tx.get_delegated_pay(&pay_id)?.is_some()))
            .await?;
        if self.relayed_elsewhere(to_addr) && !delegated {
            let envelope = Envelope {
                to_addr,
                path,
                message: Message::RevealSecret { pay_id, secret },
            };
            return self.forward(&pay_id, PayDirection::Egress, envelope).await;
        }

        let me = self.me;
        let block = self.block();
        let hash = duplex_crypto::hash_lock(&secret);
        let loaded = self
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                let loaded = ledger::load_pay(tx, &pay_id)?;
                let dest = loaded.pay.dest_addr()?;
                if dest != me
                    && active_delegation(tx, &me, &dest, &loaded.pay.token_addr()?, block)?.is_none()
                {
                    return Err(CoreError::InvalidPayDst.into());
                }
                let Some(condition) = loaded.pay.conditions.first() else {
                    return Err(CoreError::InvalidArg("pay has no condition".into()).into());
                };
                if condition.hash_lock != hash {
                    return Err(CoreError::HashLockMismatch(pay_id).into());
                }
                tx.put_secret(&condition.hash_lock, &secret, &pay_id)?;
                fsm::payment::ingress(tx, &pay_id, PayEvent::SecretRevealed, None)?;
                Ok(loaded)
            })
            .await?;

        let ack = Envelope::new(Message::RevealSecretAck {
            pay_id,
            pay_dest_secret_sig: self.signer.sign(&secret),
        })
        .to(loaded.pay.src_addr()?);
        self.write_direct(peer, ack).await?;

        tracing::info!(pay_id = %pay_id, "secret revealed, receiving started");
        self.callbacks
            .handle_receiving_start(pay_id, &loaded.pay, loaded.note.as_ref());
        Ok(())
    }

    pub(super) async fn handle_reveal_secret_ack(
        &self,
        to_addr: Option<Addr>,
        path: Vec<PathHop>,
        pay_id: PayId,
        sig: Vec<u8>,
    ) -> Result<(), EngineError> {
        if self.relayed_elsewhere(to_addr) {
            let envelope = Envelope {
                to_addr,
                path,
                message: Message::RevealSecretAck {
                    pay_id,
                    pay_dest_secret_sig: sig,
                },
            };
            return self.forward(&pay_id, PayDirection::Ingress, envelope).await;
        }

        let (loaded, secret, signer) = self
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                let loaded = ledger::load_pay(tx, &pay_id)?;
                let hash_lock = loaded
                    .pay
                    .conditions
                    .first()
                    .map(|c| c.hash_lock.clone())
                    .ok_or_else(|| CoreError::InvalidArg("pay has no condition".into()))?;
                let secret = tx
                    .get_secret(&hash_lock)?
                    .ok_or_else(|| CoreError::InvalidArg(format!("no secret for pay {pay_id}")))?;
                let signer = match tx.get_receipt_signer(&pay_id)? {
                    Some(addr) => addr,
                    None => loaded.pay.dest_addr()?,
                };
                Ok((loaded, secret.preimage, signer))
            })
            .await?;
        if loaded.pay.src_addr()? != self.me {
            return Err(CoreError::InvalidPaySrc.into());
        }
        self.verify_sig(&signer, &secret, &sig)?;
        tracing::info!(pay_id = %pay_id, signer = %signer, "secret acknowledged by destination");

        if loaded.pay.single_hash_lock().is_some() {
            let amount = loaded.pay.amount()?;
            return self
                .send_one_pay_settle_request(&loaded, amount, SettleReason::PayPaidMax)
                .await;
        }
        self.dal
            .transactional(|tx| fsm::payment::egress(tx, &pay_id, PayEvent::SecretRevealed, None))
            .await?;
        Ok(())
    }
}

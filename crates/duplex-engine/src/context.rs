//! Shared state every protocol step runs against.

use std::sync::Arc;

use duplex_core::{
    Addr, BlockNumber, ChannelId, CoreError, DelegationProof, Envelope, PayDirection, PayId,
    RuntimeConfig, SignedSimplexState, SimplexPaymentChannel,
};
use duplex_crypto::Signer;
use duplex_storage::{Dal, DalTx};
use prost::Message as _;

use crate::error::EngineError;
use crate::ledger;
use crate::queue::MsgQueue;
use crate::traits::{BlockOracle, PayRegistry, PaymentCallbacks, Router, Transport};

pub(crate) struct Context {
    pub me: Addr,
    pub signer: Arc<dyn Signer>,
    pub dal: Dal,
    pub queue: Arc<MsgQueue>,
    pub transport: Arc<dyn Transport>,
    pub oracle: Arc<dyn BlockOracle>,
    pub registry: Arc<dyn PayRegistry>,
    pub router: Arc<dyn Router>,
    pub callbacks: Arc<dyn PaymentCallbacks>,
    pub config: Arc<dyn RuntimeConfig>,
}

impl Context {
    pub fn block(&self) -> BlockNumber {
        self.oracle.current_block()
    }

    /// Encode `simplex` and sign it as its sender.
    pub fn sign_simplex(&self, simplex: &SimplexPaymentChannel) -> SignedSimplexState {
        let bytes = simplex.encode_to_vec();
        SignedSimplexState {
            sig_of_peer_from: self.signer.sign(&bytes),
            simplex_state: bytes,
            sig_of_peer_to: Vec::new(),
        }
    }

    pub fn verify_sig(&self, addr: &Addr, data: &[u8], sig: &[u8]) -> Result<(), CoreError> {
        self.signer.verify(addr, data, sig).map_err(|e| {
            tracing::debug!(signer = %addr, error = %e, "signature check failed");
            CoreError::InvalidSig
        })
    }

    /// Write a message to a peer without sequencing it.
    pub async fn write_direct(&self, peer: &Addr, envelope: Envelope) -> Result<(), EngineError> {
        let kind = envelope.message.kind();
        self.transport.write_message(peer, envelope).await.map_err(|e| {
            tracing::warn!(peer = %peer, kind, error = %e, "direct write failed");
            EngineError::from(e)
        })
    }

    /// Peer on the channel of one leg of a pay.
    pub async fn pay_peer(
        &self,
        pay_id: &PayId,
        dir: PayDirection,
    ) -> Result<(ChannelId, Addr), EngineError> {
        self.dal
            .transactional(|tx| -> Result<_, EngineError> {
                let record = tx
                    .get_pay_state(pay_id, dir)?
                    .ok_or(CoreError::PayNotFound(*pay_id))?;
                let info = ledger::channel(tx, &record.cid)?;
                Ok((record.cid, info.peer))
            })
            .await
    }

    /// Relay a message one hop toward its final recipient.
    pub async fn forward(
        &self,
        pay_id: &PayId,
        dir: PayDirection,
        envelope: Envelope,
    ) -> Result<(), EngineError> {
        let (_, peer) = self.pay_peer(pay_id, dir).await?;
        tracing::debug!(pay_id = %pay_id, peer = %peer, kind = envelope.message.kind(), "relaying message");
        self.write_direct(&peer, envelope).await
    }
}

/// An unexpired delegation letting this node receive `token` for `dest`.
pub(crate) fn active_delegation(
    tx: &mut DalTx<'_>,
    me: &Addr,
    dest: &Addr,
    token: &Addr,
    block: BlockNumber,
) -> Result<Option<DelegationProof>, EngineError> {
    let Some(proof) = tx.get_delegation(dest, token)? else {
        return Ok(None);
    };
    if proof.delegatee_addr()? != *me || block > proof.expires_at_block {
        return Ok(None);
    }
    Ok(Some(proof))
}

//! Inbound message handling.
//!
//! Each handler verifies and applies a message in one storage transaction,
//! answers the sender, then acts on the outcome: forwarding, callbacks or
//! recovery.

mod cond_pay_request;
mod hop_ack;
mod receipt;
mod reveal_secret;
mod settle_proof;
mod settle_request;

use duplex_core::{Addr, ChannelId, Envelope, Message, SignedSimplexState, WireError};

use crate::context::Context;
use crate::error::EngineError;
use crate::ledger;

impl Context {
    pub(crate) async fn handle_message(
        &self,
        peer: &Addr,
        envelope: Envelope,
    ) -> Result<(), EngineError> {
        tracing::debug!(peer = %peer, kind = envelope.message.kind(), "message received");
        let Envelope {
            to_addr,
            path,
            message,
        } = envelope;
        match message {
            Message::CondPayRequest {
                cond_pay,
                note,
                direct_pay,
                base_seq,
                state_only_peer_from_sig,
            } => {
                self.handle_cond_pay_request(
                    peer,
                    cond_pay_request::CondPayRequest {
                        pay_bytes: cond_pay,
                        note,
                        direct: direct_pay,
                        base_seq,
                        state: state_only_peer_from_sig,
                    },
                )
                .await
            }
            Message::CondPayResponse {
                state_cosigned,
                error,
            }
            | Message::PaymentSettleResponse {
                state_cosigned,
                error,
            } => self.handle_hop_ack(peer, state_cosigned, error).await,
            Message::CondPayReceipt {
                pay_id,
                pay_dest_sig,
                delegation,
            } => {
                self.handle_cond_pay_receipt(peer, to_addr, path, pay_id, pay_dest_sig, delegation)
                    .await
            }
            Message::RevealSecret { pay_id, secret } => {
                self.handle_reveal_secret(peer, to_addr, path, pay_id, secret)
                    .await
            }
            Message::RevealSecretAck {
                pay_id,
                pay_dest_secret_sig,
            } => {
                self.handle_reveal_secret_ack(to_addr, path, pay_id, pay_dest_secret_sig)
                    .await
            }
            Message::PaymentSettleRequest {
                settled_pays,
                base_seq,
                state_only_peer_from_sig,
            } => {
                self.handle_pay_settle_request(peer, settled_pays, base_seq, state_only_peer_from_sig)
                    .await
            }
            Message::PaymentSettleProof { settled_pays } => {
                self.handle_pay_settle_proof(peer, settled_pays).await
            }
            Message::RoutingRequest { updates } => {
                self.router.handle_routing_request(peer, updates).await
            }
        }
    }

    /// A state I accept, countersigned for the response.
    fn cosign(&self, state: &SignedSimplexState) -> SignedSimplexState {
        SignedSimplexState {
            sig_of_peer_to: self.signer.sign(&state.simplex_state),
            ..state.clone()
        }
    }

    /// The peer's last co-signed state, returned with an error so the peer
    /// can realign its sequence numbers.
    async fn last_cosigned(&self, peer: &Addr, cid: Option<ChannelId>) -> Option<SignedSimplexState> {
        let cid = cid?;
        match self
            .dal
            .transactional(|tx| ledger::stored_simplex(tx, &cid, peer))
            .await
        {
            Ok(state) => Some(self.cosign(&state)),
            Err(e) => {
                tracing::warn!(cid = %cid, peer = %peer, error = %e, "no stored state for error response");
                None
            }
        }
    }

    /// Whether a relayed message is addressed to someone else.
    fn relayed_elsewhere(&self, to_addr: Option<Addr>) -> bool {
        matches!(to_addr, Some(addr) if addr != self.me)
    }
}

fn wire_error(seq: u64, err: &EngineError) -> WireError {
    WireError {
        seq,
        code: err.error_code(),
        reason: err.to_string(),
    }
}

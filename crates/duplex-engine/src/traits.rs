//! Collaborators the engine consumes.

use async_trait::async_trait;
use duplex_core::{
    Addr, Amount, BlockNumber, ChannelId, ConditionalPay, Envelope, PayId, PayNote, RoutingUpdate,
    SettleReason,
};

use crate::error::{EngineError, TransportError};

/// Writes messages to connected peers.
///
/// Delivery is at most once per call. Reliability is the queue's job.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn write_message(&self, peer: &Addr, envelope: Envelope) -> Result<(), TransportError>;

    fn is_connected(&self, peer: &Addr) -> bool;
}

/// Current block height of the settlement chain.
pub trait BlockOracle: Send + Sync {
    fn current_block(&self) -> BlockNumber;
}

/// On-chain payment registry lookup.
pub trait PayRegistry: Send + Sync {
    /// Amount resolved on chain for `pay_id`, zero if unresolved.
    fn resolved_amount(&self, pay_id: &PayId) -> Result<Amount, EngineError>;
}

/// Next-hop selection for pays that are not for a direct peer.
#[async_trait]
pub trait Router: Send + Sync {
    fn lookup_next_channel(&self, dest: &Addr, token: &Addr) -> Option<(ChannelId, Addr)>;

    async fn handle_routing_request(
        &self,
        from: &Addr,
        updates: Vec<RoutingUpdate>,
    ) -> Result<(), EngineError>;
}

/// Application hooks for terminal payment outcomes.
///
/// All methods default to doing nothing.
pub trait PaymentCallbacks: Send + Sync {
    fn handle_receiving_start(&self, _pay_id: PayId, _pay: &ConditionalPay, _note: Option<&PayNote>) {}

    fn handle_receiving_done(
        &self,
        _pay_id: PayId,
        _pay: &ConditionalPay,
        _note: Option<&PayNote>,
        _reason: SettleReason,
    ) {
    }

    fn handle_send_complete(
        &self,
        _pay_id: PayId,
        _pay: &ConditionalPay,
        _note: Option<&PayNote>,
        _reason: SettleReason,
    ) {
    }

    fn handle_send_fail(
        &self,
        _pay_id: PayId,
        _pay: &ConditionalPay,
        _note: Option<&PayNote>,
        _error: &str,
    ) {
    }

    fn handle_destination_unreachable(
        &self,
        _pay_id: PayId,
        _pay: &ConditionalPay,
        _note: Option<&PayNote>,
    ) {
    }
}

/// Callbacks that ignore every event.
pub struct NoopCallbacks;

impl PaymentCallbacks for NoopCallbacks {}

/// Router that only knows direct channels.
pub struct NoRouter;

#[async_trait]
impl Router for NoRouter {
    fn lookup_next_channel(&self, _dest: &Addr, _token: &Addr) -> Option<(ChannelId, Addr)> {
        None
    }

    async fn handle_routing_request(
        &self,
        from: &Addr,
        updates: Vec<RoutingUpdate>,
    ) -> Result<(), EngineError> {
        tracing::debug!(from = %from, count = updates.len(), "routing updates ignored");
        Ok(())
    }
}

/// Registry for nodes without a chain client: nothing is ever resolved on
/// chain.
pub struct OfflineRegistry;

impl PayRegistry for OfflineRegistry {
    fn resolved_amount(&self, pay_id: &PayId) -> Result<Amount, EngineError> {
        tracing::warn!(pay_id = %pay_id, "pay registry offline, assuming unresolved");
        Ok(0)
    }
}

//! In-process collaborators for driving engines in tests.
//!
//! [`MemTransport`] captures every outbound message instead of sending it,
//! so a test decides what gets delivered, dropped or reordered.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use duplex_core::{
    Addr, Amount, BlockNumber, ChannelId, ConditionalPay, Envelope, PayId, PayNote, RoutingUpdate,
    SettleReason,
};

use crate::error::{EngineError, TransportError};
use crate::traits::{BlockOracle, PayRegistry, PaymentCallbacks, Router, Transport};

#[derive(Default)]
pub struct MemTransport {
    connected: Mutex<HashSet<Addr>>,
    outbox: Mutex<Vec<(Addr, Envelope)>>,
}

impl MemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, peer: Addr) {
        self.connected
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(peer);
    }

    pub fn disconnect(&self, peer: &Addr) {
        self.connected
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(peer);
    }

    /// Everything written since the last call, oldest first.
    pub fn take(&self) -> Vec<(Addr, Envelope)> {
        std::mem::take(&mut *self.outbox.lock().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn pending(&self) -> usize {
        self.outbox.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn write_message(&self, peer: &Addr, envelope: Envelope) -> Result<(), TransportError> {
        if !self.is_connected(peer) {
            return Err(TransportError::NotConnected(*peer));
        }
        self.outbox
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((*peer, envelope));
        Ok(())
    }

    fn is_connected(&self, peer: &Addr) -> bool {
        self.connected
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(peer)
    }
}

/// Block height set by hand.
#[derive(Default)]
pub struct ManualBlockOracle {
    block: AtomicU64,
}

impl ManualBlockOracle {
    pub fn new(block: BlockNumber) -> Self {
        Self {
            block: AtomicU64::new(block),
        }
    }

    pub fn set(&self, block: BlockNumber) {
        self.block.store(block, Ordering::SeqCst);
    }

    pub fn advance(&self, blocks: u64) {
        self.block.fetch_add(blocks, Ordering::SeqCst);
    }
}

impl BlockOracle for ManualBlockOracle {
    fn current_block(&self) -> BlockNumber {
        self.block.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct StaticPayRegistry {
    resolved: DashMap<PayId, Amount>,
}

impl StaticPayRegistry {
    pub fn set_resolved(&self, pay_id: PayId, amount: Amount) {
        self.resolved.insert(pay_id, amount);
    }
}

impl PayRegistry for StaticPayRegistry {
    fn resolved_amount(&self, pay_id: &PayId) -> Result<Amount, EngineError> {
        Ok(self.resolved.get(pay_id).map(|a| *a).unwrap_or_default())
    }
}

/// Routes configured per destination and token.
#[derive(Default)]
pub struct StaticRouter {
    routes: DashMap<(Addr, Addr), (ChannelId, Addr)>,
}

impl StaticRouter {
    pub fn set_route(&self, dest: Addr, token: Addr, cid: ChannelId, next_hop: Addr) {
        self.routes.insert((dest, token), (cid, next_hop));
    }
}

#[async_trait]
impl Router for StaticRouter {
    fn lookup_next_channel(&self, dest: &Addr, token: &Addr) -> Option<(ChannelId, Addr)> {
        self.routes.get(&(*dest, *token)).map(|r| *r)
    }

    async fn handle_routing_request(
        &self,
        _from: &Addr,
        _updates: Vec<RoutingUpdate>,
    ) -> Result<(), EngineError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    ReceivingStart(PayId),
    ReceivingDone(PayId, SettleReason),
    SendComplete(PayId, SettleReason),
    SendFail(PayId, String),
    DestUnreachable(PayId),
}

#[derive(Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<CallbackEvent>>,
}

impl RecordingCallbacks {
    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn record(&self, event: CallbackEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}

impl PaymentCallbacks for RecordingCallbacks {
    fn handle_receiving_start(&self, pay_id: PayId, _pay: &ConditionalPay, _note: Option<&PayNote>) {
        self.record(CallbackEvent::ReceivingStart(pay_id));
    }

    fn handle_receiving_done(
        &self,
        pay_id: PayId,
        _pay: &ConditionalPay,
        _note: Option<&PayNote>,
        reason: SettleReason,
    ) {
        self.record(CallbackEvent::ReceivingDone(pay_id, reason));
    }

    fn handle_send_complete(
        &self,
        pay_id: PayId,
        _pay: &ConditionalPay,
        _note: Option<&PayNote>,
        reason: SettleReason,
    ) {
        self.record(CallbackEvent::SendComplete(pay_id, reason));
    }

    fn handle_send_fail(
        &self,
        pay_id: PayId,
        _pay: &ConditionalPay,
        _note: Option<&PayNote>,
        error: &str,
    ) {
        self.record(CallbackEvent::SendFail(pay_id, error.to_string()));
    }

    fn handle_destination_unreachable(
        &self,
        pay_id: PayId,
        _pay: &ConditionalPay,
        _note: Option<&PayNote>,
    ) {
        self.record(CallbackEvent::DestUnreachable(pay_id));
    }
}

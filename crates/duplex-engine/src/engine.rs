//! The engine facade.
//!
//! [`Engine`] owns the shared context and the queue dispatcher task. The
//! node feeds it inbound messages, peer connection events and chain events;
//! applications originate pays through it.

use std::sync::{Arc, Mutex};

use duplex_core::{
    Addr, Amount, BlockNumber, ChannelBalance, ChannelId, ChannelState, Condition,
    ConditionalPay, CoreError, DelegationProof, EngineConfig, Envelope, OnChainBalance,
    PayDirection, PayId, PayNote, PayState, RuntimeConfig, SettleReason, SignedSimplexState,
    SimplexPaymentChannel,
};
use duplex_crypto::Signer;
use duplex_storage::{Dal, KvStore};
use tokio::task::JoinHandle;

use crate::context::Context;
use crate::error::EngineError;
use crate::fsm;
use crate::ledger::{self, LoadedPay};
use crate::queue::{MsgQueue, QueueStatus};
use crate::traits::{
    BlockOracle, NoRouter, NoopCallbacks, OfflineRegistry, PayRegistry, PaymentCallbacks, Router,
    Transport,
};

pub struct EngineBuilder {
    signer: Arc<dyn Signer>,
    store: Arc<dyn KvStore>,
    transport: Arc<dyn Transport>,
    oracle: Arc<dyn BlockOracle>,
    registry: Arc<dyn PayRegistry>,
    router: Arc<dyn Router>,
    callbacks: Arc<dyn PaymentCallbacks>,
    config: Arc<dyn RuntimeConfig>,
}

impl EngineBuilder {
    pub fn registry(mut self, registry: Arc<dyn PayRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = router;
        self
    }

    pub fn callbacks(mut self, callbacks: Arc<dyn PaymentCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn config(mut self, config: Arc<dyn RuntimeConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Engine {
        let me = self.signer.addr();
        let dal = Dal::new(self.store)
            .with_retry(self.config.tx_max_retry(), self.config.tx_retry_delay());
        let queue = Arc::new(MsgQueue::new(
            dal.clone(),
            self.transport.clone(),
            me,
            self.config.queue_batch_size(),
            self.config.queue_retry_delay(),
        ));
        Engine {
            ctx: Arc::new(Context {
                me,
                signer: self.signer,
                dal,
                queue,
                transport: self.transport,
                oracle: self.oracle,
                registry: self.registry,
                router: self.router,
                callbacks: self.callbacks,
                config: self.config,
            }),
            dispatcher: Mutex::new(None),
        }
    }
}

pub struct Engine {
    ctx: Arc<Context>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Start building an engine. Registry, router, callbacks and config
    /// default to an offline registry, direct routes only, no-op callbacks
    /// and [`EngineConfig::default`].
    pub fn builder(
        signer: Arc<dyn Signer>,
        store: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
        oracle: Arc<dyn BlockOracle>,
    ) -> EngineBuilder {
        EngineBuilder {
            signer,
            store,
            transport,
            oracle,
            registry: Arc::new(OfflineRegistry),
            router: Arc::new(NoRouter),
            callbacks: Arc::new(NoopCallbacks),
            config: Arc::new(EngineConfig::default()),
        }
    }

    pub fn address(&self) -> Addr {
        self.ctx.me
    }

    pub fn current_block(&self) -> BlockNumber {
        self.ctx.block()
    }

    /// Spawn the queue dispatcher. Calling it again is a no-op.
    pub fn start_dispatcher(&self) {
        let mut slot = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(tokio::spawn(self.ctx.queue.clone().run_dispatcher()));
        }
    }

    pub fn shutdown(&self) {
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            tracing::info!("message queue dispatcher stopped");
        }
    }

    /// Process one message received from `peer`.
    pub async fn handle_message(&self, peer: &Addr, envelope: Envelope) -> Result<(), EngineError> {
        self.ctx.handle_message(peer, envelope).await
    }

    // channels

    /// Record a channel opened with `peer` and seed both simplex states.
    pub async fn open_channel(
        &self,
        peer: &Addr,
        token: &Addr,
        cid: &ChannelId,
        balance: OnChainBalance,
        state: ChannelState,
    ) -> Result<(), EngineError> {
        let me = self.ctx.me;
        self.ctx
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                fsm::channel::on_auth_open(tx, cid, peer, token, state)?;
                for from in [&me, peer] {
                    let empty = SimplexPaymentChannel::empty(*cid, *from);
                    tx.put_simplex_state(cid, from, &SignedSimplexState::unsigned(&empty))?;
                }
                tx.put_on_chain_balance(cid, &balance)?;
                Ok(())
            })
            .await?;
        tracing::info!(cid = %cid, peer = %peer, token = %token, state = %state, "channel opened");
        Ok(())
    }

    pub async fn on_instantiate(&self, cid: &ChannelId) -> Result<(), EngineError> {
        self.ctx
            .dal
            .transactional(|tx| fsm::channel::on_instantiate(tx, cid))
            .await
    }

    pub async fn on_instantiated(&self, cid: &ChannelId) -> Result<(), EngineError> {
        self.ctx
            .dal
            .transactional(|tx| fsm::channel::on_instantiated(tx, cid))
            .await?;
        tracing::info!(cid = %cid, "channel instantiated on chain");
        Ok(())
    }

    pub async fn intend_settle(&self, cid: &ChannelId) -> Result<(), EngineError> {
        self.ctx
            .dal
            .transactional(|tx| fsm::channel::on_intend_settle(tx, cid))
            .await?;
        tracing::info!(cid = %cid, "channel settling");
        Ok(())
    }

    pub async fn confirm_settle(&self, cid: &ChannelId) -> Result<(), EngineError> {
        self.ctx
            .dal
            .transactional(|tx| fsm::channel::on_confirm_settle(tx, cid))
            .await?;
        tracing::info!(cid = %cid, "channel closed");
        Ok(())
    }

    pub async fn update_on_chain_balance(
        &self,
        cid: &ChannelId,
        balance: OnChainBalance,
    ) -> Result<(), EngineError> {
        self.ctx
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                ledger::channel(tx, cid)?;
                tx.put_on_chain_balance(cid, &balance)?;
                Ok(())
            })
            .await?;
        tracing::debug!(cid = %cid, "on-chain balance updated");
        Ok(())
    }

    pub async fn channel_balance(&self, cid: &ChannelId) -> Result<ChannelBalance, EngineError> {
        let me = self.ctx.me;
        let block = self.ctx.block();
        let margin = self.ctx.config.withdraw_timeout_safe_margin();
        self.ctx
            .dal
            .transactional(|tx| ledger::balance(tx, cid, &me, block, margin))
            .await
    }

    pub fn queue_status(&self, cid: &ChannelId) -> Option<QueueStatus> {
        self.ctx.queue.status(cid)
    }

    pub async fn pay_state(
        &self,
        pay_id: &PayId,
        dir: PayDirection,
    ) -> Result<Option<PayState>, EngineError> {
        let record = self
            .ctx
            .dal
            .transactional(|tx| tx.get_pay_state(pay_id, dir))
            .await?;
        Ok(record.map(|r| r.state))
    }

    // peers

    /// Restore delivery to a connected peer, then hand over anything
    /// received on its behalf.
    pub async fn add_peer(&self, peer: &Addr) -> Result<(), EngineError> {
        self.ctx.queue.add_peer(peer).await?;
        if let Err(e) = self.ctx.notify_new_stream(peer).await {
            tracing::warn!(peer = %peer, error = %e, "delegated pay handover failed");
        }
        Ok(())
    }

    pub fn remove_peer(&self, peer: &Addr) -> Result<(), EngineError> {
        self.ctx.queue.remove_peer(peer)
    }

    // pays

    fn new_pay(
        &self,
        dest: &Addr,
        token: &Addr,
        amount: Amount,
        conditions: Vec<Condition>,
        timeout: u64,
    ) -> Result<ConditionalPay, EngineError> {
        if *dest == self.ctx.me {
            return Err(CoreError::InvalidPayDst.into());
        }
        if amount == 0 {
            return Err(CoreError::InvalidAmount("zero amount".into()).into());
        }
        let mut pay = ConditionalPay {
            pay_timestamp: u64::try_from(chrono::Utc::now().timestamp_millis())
                .unwrap_or_default(),
            src: self.ctx.me.to_vec(),
            dest: dest.to_vec(),
            conditions,
            token: token.to_vec(),
            resolve_deadline: self.ctx.block().saturating_add(timeout),
            resolve_timeout: self.ctx.config.pay_resolve_timeout(),
            pay_resolver: self.ctx.config.pay_resolver().to_vec(),
            ..Default::default()
        };
        pay.set_amount(amount);
        Ok(pay)
    }

    /// Pay a direct peer unconditionally.
    pub async fn send_direct_pay(
        &self,
        dest: &Addr,
        token: &Addr,
        amount: Amount,
        note: Option<PayNote>,
    ) -> Result<PayId, EngineError> {
        let direct = self
            .ctx
            .dal
            .transactional(|tx| tx.get_cid_by_peer_token(dest, token))
            .await?;
        if direct.is_none() {
            return Err(CoreError::RouteNotFound.into());
        }
        let timeout = self.ctx.config.admin_send_token_timeout();
        let pay = self.new_pay(dest, token, amount, Vec::new(), timeout)?;
        self.ctx
            .send_cond_pay_request(&pay.to_bytes(), note.as_ref())
            .await
    }

    /// Send a pay locked behind `secret`, resolvable for `timeout` blocks.
    pub async fn send_conditional_pay(
        &self,
        dest: &Addr,
        token: &Addr,
        amount: Amount,
        secret: &[u8],
        timeout: u64,
        note: Option<PayNote>,
    ) -> Result<PayId, EngineError> {
        let hash_lock = duplex_crypto::hash_lock(secret);
        let condition = Condition {
            hash_lock: hash_lock.to_vec(),
        };
        let pay = self.new_pay(dest, token, amount, vec![condition], timeout)?;
        let bytes = pay.to_bytes();
        let pay_id = PayId::from_pay_bytes(&bytes);
        self.ctx
            .dal
            .transactional(|tx| tx.put_secret(&hash_lock, secret, &pay_id))
            .await?;
        self.ctx.send_cond_pay_request(&bytes, note.as_ref()).await
    }

    async fn load_pay(&self, pay_id: &PayId) -> Result<LoadedPay, EngineError> {
        self.ctx
            .dal
            .transactional(|tx| ledger::load_pay(tx, pay_id))
            .await
    }

    /// Withdraw a pay I sent. The next hop only accepts it once it gave up
    /// on the pay itself.
    pub async fn cancel_pay(&self, pay_id: &PayId) -> Result<(), EngineError> {
        let loaded = self.load_pay(pay_id).await?;
        if loaded.pay.src_addr()? != self.ctx.me {
            return Err(CoreError::InvalidPaySrc.into());
        }
        tracing::info!(pay_id = %pay_id, "canceling pay");
        self.ctx
            .send_one_pay_settle_request(&loaded, 0, SettleReason::PayRejected)
            .await
    }

    /// Refuse a pay addressed to me.
    pub async fn reject_incoming_pay(&self, pay_id: &PayId) -> Result<(), EngineError> {
        let loaded = self.load_pay(pay_id).await?;
        if loaded.pay.dest_addr()? != self.ctx.me {
            return Err(CoreError::InvalidPayDst.into());
        }
        tracing::info!(pay_id = %pay_id, "rejecting incoming pay");
        self.ctx
            .send_pays_settle_proof(&[*pay_id], SettleReason::PayRejected)
            .await
    }

    /// Cancel every pay on my side of `cid` past its resolve deadline.
    /// Returns the ids that were settled.
    pub async fn settle_expired_pays(&self, cid: &ChannelId) -> Result<Vec<PayId>, EngineError> {
        let me = self.ctx.me;
        let block = self.ctx.block();
        let margin = self.ctx.config.pay_send_timeout_safe_margin();
        let expired = self
            .ctx
            .dal
            .transactional(|tx| -> Result<_, EngineError> {
                let seq_nums = ledger::seq_nums(tx, cid, &me)?;
                let simplex = ledger::base_simplex(tx, cid, &me, &seq_nums)?;
                let mut expired = Vec::new();
                for pay_id in simplex.pending_ids()? {
                    let loaded = ledger::load_pay(tx, &pay_id)?;
                    if loaded.pay.deadline().saturating_add(margin) < block {
                        expired.push(loaded);
                    }
                }
                Ok(expired)
            })
            .await?;
        if expired.is_empty() {
            return Ok(Vec::new());
        }
        let zeros = vec![0; expired.len()];
        let skipped = self
            .ctx
            .send_pays_settle_request(&expired, &zeros, SettleReason::PayExpired, Vec::new())
            .await?;
        Ok(expired
            .into_iter()
            .map(|p| p.id)
            .filter(|id| !skipped.contains(id))
            .collect())
    }

    pub async fn accept_delegation(&self, proof: DelegationProof) -> Result<(), EngineError> {
        self.ctx.accept_delegation(proof).await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

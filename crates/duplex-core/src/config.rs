use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Addr;

/// Blocks after a withdrawal deadline during which the amount stays reserved.
pub const WITHDRAW_TIMEOUT_SAFE_MARGIN: u64 = 6;
/// Blocks after a pay deadline before an incoming pay may be settled as expired.
pub const PAY_RECV_TIMEOUT_SAFE_MARGIN: u64 = 4;
/// Blocks after a pay deadline before an outgoing pay is settled as expired.
pub const PAY_SEND_TIMEOUT_SAFE_MARGIN: u64 = 6;
pub const PAY_RESOLVE_TIMEOUT: u64 = 10;
/// Resolve timeout of lump-sum pays sent by a delegatee.
pub const ADMIN_SEND_TOKEN_TIMEOUT: u64 = 50;
pub const MAX_PAYMENT_TIMEOUT: u64 = 10_000;
pub const MAX_NUM_PENDING_PAYS: usize = 200;
pub const QUEUE_BATCH_SIZE: usize = 64;

/// Tunables of the protocol engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on how far in the future a pay deadline may be (blocks).
    pub max_payment_timeout: u64,
    pub max_num_pending_pays: usize,
    /// Resolver every conditional pay must name.
    pub pay_resolver: Addr,
    /// Attempts per storage transaction on write conflicts.
    pub tx_max_retry: u32,
    pub tx_retry_delay_ms: u64,
    /// Channels handled per dispatcher wake-up.
    pub queue_batch_size: usize,
    /// Pause after a dispatcher batch where every send failed.
    pub queue_retry_delay_ms: u64,
    pub withdraw_timeout_safe_margin: u64,
    pub pay_recv_timeout_safe_margin: u64,
    pub pay_send_timeout_safe_margin: u64,
    pub pay_resolve_timeout: u64,
    pub admin_send_token_timeout: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_payment_timeout: MAX_PAYMENT_TIMEOUT,
            max_num_pending_pays: MAX_NUM_PENDING_PAYS,
            pay_resolver: Addr::ZERO,
            tx_max_retry: 10,
            tx_retry_delay_ms: 10,
            queue_batch_size: QUEUE_BATCH_SIZE,
            queue_retry_delay_ms: 500,
            withdraw_timeout_safe_margin: WITHDRAW_TIMEOUT_SAFE_MARGIN,
            pay_recv_timeout_safe_margin: PAY_RECV_TIMEOUT_SAFE_MARGIN,
            pay_send_timeout_safe_margin: PAY_SEND_TIMEOUT_SAFE_MARGIN,
            pay_resolve_timeout: PAY_RESOLVE_TIMEOUT,
            admin_send_token_timeout: ADMIN_SEND_TOKEN_TIMEOUT,
        }
    }
}

/// Read-only view of the engine tunables used on hot paths.
pub trait RuntimeConfig: Send + Sync {
    fn max_payment_timeout(&self) -> u64;
    fn max_num_pending_pays(&self) -> usize;
    fn pay_resolver(&self) -> Addr;
    fn tx_max_retry(&self) -> u32;
    fn tx_retry_delay(&self) -> Duration;
    fn queue_batch_size(&self) -> usize;
    fn queue_retry_delay(&self) -> Duration;
    fn withdraw_timeout_safe_margin(&self) -> u64;
    fn pay_recv_timeout_safe_margin(&self) -> u64;
    fn pay_send_timeout_safe_margin(&self) -> u64;
    fn pay_resolve_timeout(&self) -> u64;
    fn admin_send_token_timeout(&self) -> u64;
}

impl RuntimeConfig for EngineConfig {
    fn max_payment_timeout(&self) -> u64 {
        self.max_payment_timeout
    }

    fn max_num_pending_pays(&self) -> usize {
        self.max_num_pending_pays
    }

    fn pay_resolver(&self) -> Addr {
        self.pay_resolver
    }

    fn tx_max_retry(&self) -> u32 {
        self.tx_max_retry
    }

    fn tx_retry_delay(&self) -> Duration {
        Duration::from_millis(self.tx_retry_delay_ms)
    }

    fn queue_batch_size(&self) -> usize {
        self.queue_batch_size.max(1)
    }

    fn queue_retry_delay(&self) -> Duration {
        Duration::from_millis(self.queue_retry_delay_ms)
    }

    fn withdraw_timeout_safe_margin(&self) -> u64 {
        self.withdraw_timeout_safe_margin
    }

    fn pay_recv_timeout_safe_margin(&self) -> u64 {
        self.pay_recv_timeout_safe_margin
    }

    fn pay_send_timeout_safe_margin(&self) -> u64 {
        self.pay_send_timeout_safe_margin
    }

    fn pay_resolve_timeout(&self) -> u64 {
        self.pay_resolve_timeout
    }

    fn admin_send_token_timeout(&self) -> u64 {
        self.admin_send_token_timeout
    }
}

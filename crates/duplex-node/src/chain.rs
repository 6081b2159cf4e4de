//! Block height estimated from wall-clock time.

use chrono::{DateTime, Utc};
use duplex_core::BlockNumber;
use duplex_engine::BlockOracle;

use crate::config::ChainConfig;

/// Derives the block number from the genesis time and a fixed block
/// interval. Stands in for a chain client until one is wired in.
pub struct EstimatedBlockOracle {
    genesis_timestamp: i64,
    block_interval_secs: u64,
}

impl EstimatedBlockOracle {
    pub fn new(config: &ChainConfig) -> Self {
        Self {
            genesis_timestamp: config.genesis_timestamp,
            block_interval_secs: config.block_interval_secs.max(1),
        }
    }

    fn block_at(&self, now: DateTime<Utc>) -> BlockNumber {
        let elapsed = now.timestamp().saturating_sub(self.genesis_timestamp);
        u64::try_from(elapsed).unwrap_or(0) / self.block_interval_secs
    }
}

impl BlockOracle for EstimatedBlockOracle {
    fn current_block(&self) -> BlockNumber {
        self.block_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle(genesis: i64, interval: u64) -> EstimatedBlockOracle {
        EstimatedBlockOracle::new(&ChainConfig {
            genesis_timestamp: genesis,
            block_interval_secs: interval,
        })
    }

    #[test]
    fn test_block_from_elapsed_time() {
        let oracle = oracle(1_000, 12);
        let now = DateTime::from_timestamp(1_000 + 12 * 50 + 5, 0).unwrap();
        assert_eq!(oracle.block_at(now), 50);
    }

    #[test]
    fn test_before_genesis_is_block_zero() {
        let oracle = oracle(10_000, 12);
        let now = DateTime::from_timestamp(5_000, 0).unwrap();
        assert_eq!(oracle.block_at(now), 0);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let oracle = oracle(0, 0);
        let now = DateTime::from_timestamp(42, 0).unwrap();
        assert_eq!(oracle.block_at(now), 42);
    }
}

//! Fluent builder API for creating scanners.
//!
//! # Example
//!
//! ```rust,no_run
//! use chaintrace_evm::IndexerBuilder;
//!
//! let config = IndexerBuilder::new()
//!     .chain("hardhat")
//!     .watch_contract("0x5FbDB2315678afecb367f032d93F642f64180aa3")
//!     .start_block(0)
//!     .progress_interval(100)
//!     .build_config();
//! ```

use std::sync::Arc;
use std::time::Duration;

use chaintrace_core::indexer::IndexerConfig;
use chaintrace_core::ledger::Ledger;
use chaintrace_core::store::ProjectionStore;

use crate::index_loop::ChainScanner;
use crate::retry::RetryPolicy;

/// Fluent builder for `IndexerConfig` and [`ChainScanner`].
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    /// Start from an existing configuration (e.g. loaded from a file).
    pub fn from_config(config: IndexerConfig) -> Self {
        Self { config }
    }

    /// Set the indexer ID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set the chain slug used in logs.
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Add a contract whose transactions should be examined.
    pub fn watch_contract(mut self, address: impl Into<String>) -> Self {
        self.config.watched_contracts.push(address.into());
        self
    }

    /// Set the first block to scan when the store is empty.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Log backfill progress every N blocks.
    pub fn progress_interval(mut self, n: u64) -> Self {
        self.config.progress_interval = n;
        self
    }

    /// Set live mode polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Set RPC retry count and initial backoff.
    pub fn rpc_retry(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.config.rpc_max_retries = max_retries;
        self.config.rpc_backoff_ms = backoff_ms;
        self
    }

    /// Retry policy matching the configured RPC settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.rpc_max_retries,
            Duration::from_millis(self.config.rpc_backoff_ms),
        )
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Build a scanner over `ledger` and `store`.
    pub fn build<L, S>(self, ledger: Arc<L>, store: Arc<S>) -> ChainScanner<L, S>
    where
        L: Ledger + ?Sized,
        S: ProjectionStore + ?Sized,
    {
        ChainScanner::new(self.config, ledger, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = IndexerBuilder::new().build_config();
        assert_eq!(cfg.start_block, 0);
        assert_eq!(cfg.progress_interval, 100);
        assert!(cfg.watched_contracts.is_empty());
    }

    #[test]
    fn builder_custom() {
        let builder = IndexerBuilder::new()
            .id("observer")
            .chain("hardhat")
            .watch_contract("0xABC")
            .start_block(42)
            .rpc_retry(5, 50);
        assert_eq!(builder.retry_policy().max_retries, 5);

        let cfg = builder.build_config();
        assert_eq!(cfg.id, "observer");
        assert_eq!(cfg.chain, "hardhat");
        assert_eq!(cfg.start_block, 42);
        assert!(cfg.watches(Some("0xabc")));
        assert!(!cfg.watches(Some("0xdef")));
    }
}

//! Indexer configuration, runtime state, and the shared status probe.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::normalize_address;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Unique name for this indexer.
    pub id: String,
    /// Chain slug (e.g. `"hardhat"`), used in logs.
    pub chain: String,
    /// Contracts whose transactions are examined. Empty = every transaction.
    pub watched_contracts: Vec<String>,
    /// First block to scan when the store is empty.
    pub start_block: u64,
    /// Log backfill progress every N blocks.
    pub progress_interval: u64,
    /// Head polling interval for the live subscription (milliseconds).
    pub poll_interval_ms: u64,
    /// Retries for a transient RPC failure before the block is abandoned.
    pub rpc_max_retries: u32,
    /// Initial retry backoff (milliseconds), doubled per attempt.
    pub rpc_backoff_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            chain: "ethereum".into(),
            watched_contracts: vec![],
            start_block: 0,
            progress_interval: 100,
            poll_interval_ms: 2000,
            rpc_max_retries: 3,
            rpc_backoff_ms: 200,
        }
    }
}

impl IndexerConfig {
    /// Returns `true` if a transaction sent to `to` should be examined.
    ///
    /// Contract-creation transactions (`to == None`) are never examined.
    pub fn watches(&self, to: Option<&str>) -> bool {
        let Some(to) = to else {
            return false;
        };
        if self.watched_contracts.is_empty() {
            return true;
        }
        let to = normalize_address(to);
        self.watched_contracts
            .iter()
            .any(|c| normalize_address(c) == to)
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexerState {
    /// Not yet started.
    #[default]
    Idle,
    /// Catching up on historical blocks.
    Backfilling,
    /// Following new blocks as they are produced.
    Live,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Backfilling => write!(f, "backfilling"),
            Self::Live => write!(f, "live"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time view of the scanner, served by the health probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: IndexerState,
    pub cursor: Option<u64>,
    /// Last chain height observed from the ledger.
    pub head: Option<u64>,
    pub caught_up: bool,
    /// Most recent block-local failure, cleared on the next successful commit.
    pub last_error: Option<String>,
    pub last_commit_at: Option<DateTime<Utc>>,
}

/// Shared, thread-safe status written by the scanner and read by the API.
#[derive(Debug, Default)]
pub struct ScanStatus {
    inner: Mutex<StatusReport>,
}

impl ScanStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusReport {
        self.lock().clone()
    }

    pub fn set_state(&self, state: IndexerState) {
        self.lock().state = state;
    }

    pub fn set_cursor(&self, cursor: Option<u64>) {
        let mut report = self.lock();
        report.cursor = cursor;
        report.caught_up = caught_up(report.cursor, report.head);
    }

    pub fn set_head(&self, head: u64) {
        let mut report = self.lock();
        report.head = Some(head);
        report.caught_up = caught_up(report.cursor, report.head);
    }

    /// Record a successful block commit.
    pub fn committed(&self, height: u64) {
        let mut report = self.lock();
        if report.cursor.map_or(true, |c| c < height) {
            report.cursor = Some(height);
        }
        report.caught_up = caught_up(report.cursor, report.head);
        report.last_error = None;
        report.last_commit_at = Some(Utc::now());
    }

    pub fn failed(&self, error: impl Into<String>) {
        self.lock().last_error = Some(error.into());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatusReport> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn caught_up(cursor: Option<u64>, head: Option<u64>) -> bool {
    match (cursor, head) {
        (Some(c), Some(h)) => c >= h,
        _ => false,
    }
}

//! The chain scanner: orchestrates backfill and live phases.
//!
//! # Phase 1: BACKFILL
//! Scan `[cursor + 1, head]` in ascending order. For each block: fetch the
//! transactions addressed to a watched contract, fetch their logs, decode,
//! project into a [`BlockBatch`], then commit the batch and the cursor
//! advance atomically.
//!
//! # Phase 2: LIVE
//! Wait on the ledger's new-block subscription. The subscription is opened
//! before backfill starts, so heights announced while catching up queue up
//! and are applied afterwards, in order.
//!
//! Both phases take the same execution lock; a block is never scanned by two
//! passes at once. A block-local failure (fetch error, conservation
//! violation) stops the pass at that block without advancing the cursor; the
//! next pass retries it. A log whose integers do not fit the projection
//! rejects its block the same way. Store failures propagate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, trace, warn};

use chaintrace_core::batch::BlockBatch;
use chaintrace_core::cursor::Cursor;
use chaintrace_core::error::IndexerError;
use chaintrace_core::indexer::{IndexerConfig, IndexerState, ScanStatus};
use chaintrace_core::ledger::Ledger;
use chaintrace_core::projector::{Applied, Projector};
use chaintrace_core::store::{ProjectionStore, SnapshotKeys};
use chaintrace_core::types::{BlockRecord, DomainEvent, EventContext};

use crate::decoder::{Decoded, LogDecoder};

/// What one block scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockReport {
    pub height: u64,
    /// Logs examined (watched transactions only).
    pub logs: usize,
    /// Logs decoded into domain events.
    pub events: usize,
    pub unrecognized: usize,
    pub projected: usize,
    /// Events already reflected in the store.
    pub replayed: usize,
    /// Duplicate or conflicting item creations.
    pub ignored: usize,
}

/// Summary of one scan pass over a height range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// First height attempted.
    pub from: u64,
    pub target: u64,
    /// Blocks committed by this pass.
    pub committed: u64,
    pub events: usize,
    /// Cursor after the pass.
    pub cursor: Option<u64>,
    /// Height of the block that failed and stopped the pass.
    pub halted_at: Option<u64>,
    pub error: Option<String>,
    /// Stopped early by a shutdown request.
    pub interrupted: bool,
}

impl PassReport {
    /// Returns `true` if the pass reached its target.
    pub fn completed(&self) -> bool {
        self.halted_at.is_none() && !self.interrupted
    }
}

/// Drives the decode → project → commit pipeline over a [`Ledger`].
pub struct ChainScanner<L: Ledger + ?Sized, S: ProjectionStore + ?Sized> {
    config: IndexerConfig,
    ledger: Arc<L>,
    store: Arc<S>,
    decoder: LogDecoder,
    projector: Projector,
    status: Arc<ScanStatus>,
    exec: Mutex<()>,
}

enum Wake {
    Signal,
    Head(Option<u64>),
    Tick,
}

impl<L: Ledger + ?Sized, S: ProjectionStore + ?Sized> ChainScanner<L, S> {
    pub fn new(config: IndexerConfig, ledger: Arc<L>, store: Arc<S>) -> Self {
        Self {
            config,
            ledger,
            store,
            decoder: LogDecoder::default(),
            projector: Projector::new(),
            status: Arc::new(ScanStatus::new()),
            exec: Mutex::new(()),
        }
    }

    pub fn with_decoder(mut self, decoder: LogDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Shared status handle for the health probe.
    pub fn status(&self) -> Arc<ScanStatus> {
        self.status.clone()
    }

    async fn cursor(&self) -> Result<Cursor, IndexerError> {
        Ok(Cursor::new(self.store.cursor().await?, self.config.start_block))
    }

    /// Scan a single block, waiting for any running pass to finish first.
    pub async fn scan_block(&self, height: u64) -> Result<BlockReport, IndexerError> {
        let _guard = self.exec.lock().await;
        self.project_block(height).await
    }

    /// One bounded pass from the cursor to `min(to, head)`.
    pub async fn backfill(&self, to: Option<u64>) -> Result<PassReport, IndexerError> {
        let (_keep, shutdown) = watch::channel(false);
        self.backfill_until(to, &shutdown).await
    }

    /// Like [`backfill`](Self::backfill), stopping between blocks once
    /// `shutdown` turns `true`.
    pub async fn backfill_until(
        &self,
        to: Option<u64>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<PassReport, IndexerError> {
        let _guard = self.exec.lock().await;
        let head = self.ledger.chain_height().await?;
        self.status.set_head(head);
        let target = to.map_or(head, |t| t.min(head));

        let report = self.scan_range(target, shutdown, true).await?;
        if report.committed > 0 || !report.completed() {
            info!(
                from = report.from,
                target,
                committed = report.committed,
                events = report.events,
                cursor = ?report.cursor,
                completed = report.completed(),
                "backfill pass finished"
            );
        }
        Ok(report)
    }

    /// Backfill to head, then follow new blocks until `shutdown` turns `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), IndexerError> {
        let result = self.run_inner(&mut shutdown).await;
        self.status.set_state(IndexerState::Stopped);
        if let Err(e) = &result {
            error!(error = %e, "scanner stopped");
        } else {
            info!("scanner stopped");
        }
        result
    }

    async fn run_inner(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), IndexerError> {
        // Subscribe first so blocks produced during backfill are queued.
        let mut sub = self.ledger.subscribe_new_blocks().await?;

        self.status.set_state(IndexerState::Backfilling);
        let cursor = self.cursor().await?;
        self.status.set_cursor(cursor.height);
        info!(
            id = %self.config.id,
            chain = %self.config.chain,
            next_block = cursor.next_block(),
            "starting backfill"
        );
        match self.backfill_until(None, shutdown).await {
            Ok(_) => {}
            Err(e) if e.is_block_local() => {
                warn!(error = %e, "backfill pass failed, will retry");
                self.status.failed(e.to_string());
            }
            Err(e) => return Err(e),
        }

        self.status.set_state(IndexerState::Live);
        info!("following new blocks");

        let mut retry = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        retry.tick().await;
        let mut head = self.status.snapshot().head.unwrap_or(0);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let wake = tokio::select! {
                changed = shutdown.changed() => match changed {
                    Ok(()) => Wake::Signal,
                    Err(_) => break,
                },
                h = sub.recv() => Wake::Head(h),
                _ = retry.tick() => Wake::Tick,
            };

            match wake {
                Wake::Signal => continue,
                Wake::Head(Some(h)) => {
                    head = head.max(h).max(sub.drain_max().unwrap_or(0));
                }
                Wake::Head(None) => {
                    warn!("block subscription closed, resubscribing");
                    sub = self.ledger.subscribe_new_blocks().await?;
                    continue;
                }
                Wake::Tick => {
                    if self.status.snapshot().caught_up {
                        continue;
                    }
                }
            }
            self.follow(head, shutdown).await?;
        }

        sub.cancel();
        Ok(())
    }

    /// Catch up to `head` under the execution lock.
    async fn follow(&self, head: u64, shutdown: &watch::Receiver<bool>) -> Result<(), IndexerError> {
        let _guard = self.exec.lock().await;
        self.status.set_head(head);
        let report = self.scan_range(head, shutdown, false).await?;
        if report.committed > 0 {
            debug!(cursor = ?report.cursor, committed = report.committed, "live catch-up");
        }
        Ok(())
    }

    /// Scan `[cursor + 1, target]`. Caller holds the execution lock.
    async fn scan_range(
        &self,
        target: u64,
        shutdown: &watch::Receiver<bool>,
        log_progress: bool,
    ) -> Result<PassReport, IndexerError> {
        let mut cursor = self.cursor().await?;
        self.status.set_cursor(cursor.height);
        let mut report = PassReport {
            from: cursor.next_block(),
            target,
            cursor: cursor.height,
            ..Default::default()
        };
        if cursor.is_caught_up(target) {
            return Ok(report);
        }

        let interval = self.config.progress_interval.max(1);
        for height in report.from..=target {
            if *shutdown.borrow() {
                info!(block = height, "scan interrupted by shutdown");
                report.interrupted = true;
                break;
            }
            match self.project_block(height).await {
                Ok(block) => {
                    report.committed += 1;
                    report.events += block.events;
                    cursor.advance(height);
                    report.cursor = cursor.height;
                    if log_progress && height % interval == 0 {
                        info!(block = height, target, "backfill progress");
                    }
                }
                Err(e) if e.is_block_local() => {
                    if e.is_integrity() {
                        error!(block = height, error = %e, "block rejected");
                    } else {
                        warn!(block = height, error = %e, "block failed, will retry");
                    }
                    self.status.failed(e.to_string());
                    report.halted_at = Some(height);
                    report.error = Some(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Fetch, decode, project and commit one block.
    async fn project_block(&self, height: u64) -> Result<BlockReport, IndexerError> {
        let block = self
            .ledger
            .block(height)
            .await?
            .ok_or_else(|| IndexerError::Rpc(format!("block {height} not available")))?;
        if block.height != height {
            return Err(IndexerError::Rpc(format!(
                "asked for block {height}, ledger returned {}",
                block.height
            )));
        }

        let mut report = BlockReport {
            height,
            ..Default::default()
        };
        let mut events: Vec<(DomainEvent, EventContext)> = Vec::new();

        for tx in block
            .transactions
            .iter()
            .filter(|tx| self.config.watches(tx.to.as_deref()))
        {
            for log in self.ledger.transaction_logs(&tx.hash).await? {
                report.logs += 1;
                let log_index = log.log_index_u32().ok_or_else(|| {
                    IndexerError::Rpc(format!("malformed log index {:?} in {}", log.log_index, tx.hash))
                })?;
                match self.decoder.decode(&log)? {
                    Decoded::Event(event) => events.push((
                        event,
                        EventContext {
                            block_height: height,
                            block_hash: block.hash.clone(),
                            block_timestamp: block.timestamp,
                            tx_hash: tx.hash.clone(),
                            log_index,
                        },
                    )),
                    Decoded::Unrecognized => {
                        report.unrecognized += 1;
                        trace!(block = height, tx = %tx.hash, log_index, "unrecognized log skipped");
                    }
                }
            }
        }
        events.sort_by_key(|(_, ctx)| ctx.log_index);
        report.events = events.len();

        let keys = SnapshotKeys::for_events(height, events.iter().map(|(e, _)| e));
        let snapshot = self.store.snapshot(&keys).await?;
        let mut batch = BlockBatch::new(
            BlockRecord {
                height,
                hash: block.hash.clone(),
                timestamp: block.timestamp,
                processed: true,
            },
            snapshot,
        );

        for (event, ctx) in &events {
            match self.projector.apply(&mut batch, event, ctx)? {
                Applied::Projected => report.projected += 1,
                Applied::Replayed => report.replayed += 1,
                Applied::DuplicateIgnored | Applied::ConflictingCreation => report.ignored += 1,
            }
        }

        self.store.commit_block(batch).await?;
        self.status.committed(height);
        debug!(
            block = height,
            events = report.events,
            projected = report.projected,
            replayed = report.replayed,
            "block committed"
        );
        Ok(report)
    }
}

//! In-memory projection store.
//!
//! Keeps every collection in RAM behind one `RwLock`, so a block commit is a
//! single write-locked critical section and readers never see half of it.
//! All data is lost when the process exits.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use chaintrace_core::batch::BlockBatch;
use chaintrace_core::error::IndexerError;
use chaintrace_core::store::{ProjectionReader, ProjectionStore, SnapshotKeys, StateSnapshot};
use chaintrace_core::types::{BlockRecord, InventoryEntry, Item, Participant, TransactionRecord};

#[derive(Default)]
struct State {
    cursor: Option<u64>,
    blocks: BTreeMap<u64, BlockRecord>,
    participants: BTreeMap<String, Participant>,
    items: BTreeMap<String, Item>,
    /// Keyed by `(holder, barcode)`.
    inventory: BTreeMap<(String, String), InventoryEntry>,
    /// Keyed by `(block height, log index)`.
    transactions: BTreeMap<(u64, u32), TransactionRecord>,
}

/// In-memory projection store.
#[derive(Default)]
pub struct InMemoryStorage {
    state: RwLock<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, IndexerError> {
        self.state
            .read()
            .map_err(|_| IndexerError::Storage("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, IndexerError> {
        self.state
            .write()
            .map_err(|_| IndexerError::Storage("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl ProjectionReader for InMemoryStorage {
    async fn cursor(&self) -> Result<Option<u64>, IndexerError> {
        Ok(self.read()?.cursor)
    }

    async fn block(&self, height: u64) -> Result<Option<BlockRecord>, IndexerError> {
        Ok(self.read()?.blocks.get(&height).cloned())
    }

    async fn blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<BlockRecord>, IndexerError> {
        if from > to {
            return Ok(vec![]);
        }
        Ok(self.read()?.blocks.range(from..=to).map(|(_, b)| b.clone()).collect())
    }

    async fn participant(&self, address: &str) -> Result<Option<Participant>, IndexerError> {
        Ok(self.read()?.participants.get(address).cloned())
    }

    async fn participants(&self) -> Result<Vec<Participant>, IndexerError> {
        Ok(self.read()?.participants.values().cloned().collect())
    }

    async fn item(&self, barcode: &str) -> Result<Option<Item>, IndexerError> {
        Ok(self.read()?.items.get(barcode).cloned())
    }

    async fn inventory_of(&self, holder: &str) -> Result<Vec<InventoryEntry>, IndexerError> {
        Ok(self
            .read()?
            .inventory
            .values()
            .filter(|e| e.holder == holder)
            .cloned()
            .collect())
    }

    async fn holders_of(&self, barcode: &str) -> Result<Vec<InventoryEntry>, IndexerError> {
        Ok(self
            .read()?
            .inventory
            .values()
            .filter(|e| e.barcode == barcode)
            .cloned()
            .collect())
    }

    async fn history(&self, barcode: &str) -> Result<Vec<TransactionRecord>, IndexerError> {
        Ok(self
            .read()?
            .transactions
            .values()
            .filter(|t| t.barcode == barcode)
            .cloned()
            .collect())
    }

    async fn holder_transactions(
        &self,
        holder: &str,
        up_to: u64,
    ) -> Result<Vec<TransactionRecord>, IndexerError> {
        Ok(self
            .read()?
            .transactions
            .range(..=(up_to, u32::MAX))
            .map(|(_, t)| t)
            .filter(|t| t.to == holder || t.from.as_deref() == Some(holder))
            .cloned()
            .collect())
    }

    async fn transactions_in_block(
        &self,
        height: u64,
    ) -> Result<Vec<TransactionRecord>, IndexerError> {
        Ok(self
            .read()?
            .transactions
            .range((height, 0)..=(height, u32::MAX))
            .map(|(_, t)| t.clone())
            .collect())
    }

    async fn participant_count(&self) -> Result<u64, IndexerError> {
        Ok(self.read()?.participants.len() as u64)
    }

    async fn item_count(&self) -> Result<u64, IndexerError> {
        Ok(self.read()?.items.len() as u64)
    }

    async fn transaction_count(&self) -> Result<u64, IndexerError> {
        Ok(self.read()?.transactions.len() as u64)
    }

    async fn total_volume(&self) -> Result<u64, IndexerError> {
        self.read()?
            .inventory
            .values()
            .try_fold(0u64, |acc, e| acc.checked_add(e.volume))
            .ok_or_else(|| IndexerError::Storage("total inventory volume overflows u64".into()))
    }

    async fn active_participant_count(&self) -> Result<u64, IndexerError> {
        let state = self.read()?;
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for t in state.transactions.values() {
            seen.insert(t.to.as_str());
            if let Some(from) = &t.from {
                seen.insert(from.as_str());
            }
        }
        Ok(seen
            .into_iter()
            .filter(|a| state.participants.contains_key(*a))
            .count() as u64)
    }
}

#[async_trait]
impl ProjectionStore for InMemoryStorage {
    async fn snapshot(&self, keys: &SnapshotKeys) -> Result<StateSnapshot, IndexerError> {
        let state = self.read()?;
        let mut snapshot = StateSnapshot::default();
        for address in &keys.participants {
            if let Some(p) = state.participants.get(address) {
                snapshot.participants.insert(address.clone(), p.clone());
            }
        }
        for barcode in &keys.barcodes {
            if let Some(item) = state.items.get(barcode) {
                snapshot.items.insert(barcode.clone(), item.clone());
            }
        }
        for key in &keys.inventory {
            if let Some(entry) = state.inventory.get(key) {
                snapshot.inventory.insert(key.clone(), entry.volume);
            }
        }
        let h = keys.block_height;
        snapshot.recorded = state
            .transactions
            .range((h, 0)..=(h, u32::MAX))
            .map(|((_, idx), _)| *idx)
            .collect();
        Ok(snapshot)
    }

    async fn commit_block(&self, batch: BlockBatch) -> Result<(), IndexerError> {
        let writes = batch.into_writes();
        writes.check_volumes()?;
        let height = writes.block.height;
        let mut state = self.write()?;

        // Validate every compare-and-update before touching anything.
        for w in &writes.inventory {
            let key = (w.holder.clone(), w.barcode.clone());
            let actual = state.inventory.get(&key).map_or(0, |e| e.volume);
            if actual != w.expected {
                return Err(IndexerError::StaleInventory {
                    holder: w.holder.clone(),
                    barcode: w.barcode.clone(),
                    expected: w.expected,
                    actual,
                });
            }
        }

        for p in writes.participants {
            state.participants.insert(p.address.clone(), p);
        }
        for item in writes.items {
            state.items.entry(item.barcode.clone()).or_insert(item);
        }
        for w in writes.inventory {
            let key = (w.holder.clone(), w.barcode.clone());
            state.inventory.insert(
                key,
                InventoryEntry {
                    holder: w.holder,
                    barcode: w.barcode,
                    volume: w.volume,
                    last_updated_height: height,
                },
            );
        }
        let mut appended = 0usize;
        for t in writes.transactions {
            if let std::collections::btree_map::Entry::Vacant(slot) = state.transactions.entry(t.position()) {
                slot.insert(t);
                appended += 1;
            }
        }
        state.blocks.insert(height, writes.block);
        if state.cursor.map_or(true, |c| c < height) {
            state.cursor = Some(height);
        }

        debug!(block = height, appended, "block committed (memory)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaintrace_core::types::{EventKind, MAX_VOLUME};

    fn block(height: u64) -> BlockRecord {
        BlockRecord {
            height,
            hash: format!("0x{height:064x}"),
            timestamp: 1_700_000_000 + height as i64,
            processed: true,
        }
    }

    fn record(from: Option<&str>, to: &str, volume: u64, height: u64, log_index: u32) -> TransactionRecord {
        TransactionRecord {
            kind: if from.is_some() {
                EventKind::ItemTransferred
            } else {
                EventKind::ItemCreated
            },
            barcode: "B1".into(),
            from: from.map(Into::into),
            to: to.into(),
            volume,
            block_height: height,
            log_index,
            tx_hash: format!("0xt{height}"),
            timestamp: 0,
            transfer_time: None,
        }
    }

    async fn mint(store: &InMemoryStorage) {
        let mut batch = BlockBatch::new(block(10), StateSnapshot::default());
        batch.set_volume("0xm1", "B1", 100);
        batch.record(record(None, "0xm1", 100, 10, 0));
        store.commit_block(batch).await.unwrap();
    }

    #[tokio::test]
    async fn commit_advances_cursor_and_applies_writes() {
        let store = InMemoryStorage::new();
        assert_eq!(store.cursor().await.unwrap(), None);
        mint(&store).await;

        assert_eq!(store.cursor().await.unwrap(), Some(10));
        assert_eq!(store.inventory_of("0xm1").await.unwrap()[0].volume, 100);
        assert_eq!(store.history("B1").await.unwrap().len(), 1);
        assert!(store.block(10).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_inventory_rejects_whole_batch() {
        let store = InMemoryStorage::new();
        mint(&store).await;

        // Batch built from an empty snapshot expects 0 at (m1, B1), store holds 100.
        let mut batch = BlockBatch::new(block(11), StateSnapshot::default());
        batch.set_volume("0xm1", "B1", 60);
        batch.set_volume("0xs1", "B1", 40);
        batch.record(record(Some("0xm1"), "0xs1", 40, 11, 0));
        let err = store.commit_block(batch).await.unwrap_err();
        assert!(matches!(err, IndexerError::StaleInventory { actual: 100, .. }));

        assert_eq!(store.cursor().await.unwrap(), Some(10));
        assert!(store.inventory_of("0xs1").await.unwrap().is_empty());
        assert_eq!(store.transaction_count().await.unwrap(), 1);
        assert!(store.block(11).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recommit_does_not_duplicate_records_or_rewind_cursor() {
        let store = InMemoryStorage::new();
        mint(&store).await;
        let later = BlockBatch::new(block(12), StateSnapshot::default());
        store.commit_block(later).await.unwrap();

        let keys = SnapshotKeys {
            block_height: 10,
            ..Default::default()
        };
        let snapshot = store.snapshot(&keys).await.unwrap();
        assert!(snapshot.recorded.contains(&0));

        let mut again = BlockBatch::new(block(10), snapshot);
        again.record(record(None, "0xm1", 100, 10, 0));
        store.commit_block(again).await.unwrap();

        assert_eq!(store.transaction_count().await.unwrap(), 1);
        assert_eq!(store.cursor().await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn holder_transactions_respect_height() {
        let store = InMemoryStorage::new();
        mint(&store).await;
        let keys = SnapshotKeys::for_events(11, std::iter::empty());
        let mut snapshot = store.snapshot(&keys).await.unwrap();
        snapshot.inventory.insert(("0xm1".into(), "B1".into()), 100);
        let mut batch = BlockBatch::new(block(11), snapshot);
        batch.set_volume("0xm1", "B1", 60);
        batch.set_volume("0xs1", "B1", 40);
        batch.record(record(Some("0xm1"), "0xs1", 40, 11, 0));
        store.commit_block(batch).await.unwrap();

        assert!(store.holder_transactions("0xs1", 10).await.unwrap().is_empty());
        assert_eq!(store.holder_transactions("0xs1", 11).await.unwrap().len(), 1);
        assert_eq!(store.holder_transactions("0xm1", 11).await.unwrap().len(), 2);
        assert_eq!(store.transactions_in_block(11).await.unwrap().len(), 1);
        assert_eq!(store.total_volume().await.unwrap(), 100);
        assert_eq!(store.blocks_in_range(10, 11).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn oversized_volume_is_rejected_without_writing() {
        let store = InMemoryStorage::new();
        mint(&store).await;

        let mut batch = BlockBatch::new(block(11), StateSnapshot::default());
        batch.set_volume("0xm2", "B2", MAX_VOLUME + 1);
        batch.record(record(None, "0xm2", MAX_VOLUME + 1, 11, 0));
        let err = store.commit_block(batch).await.unwrap_err();
        assert!(matches!(err, IndexerError::VolumeOutOfRange { block: 11, .. }));
        assert!(err.is_block_local());

        assert_eq!(store.cursor().await.unwrap(), Some(10));
        assert!(store.inventory_of("0xm2").await.unwrap().is_empty());
        assert_eq!(store.transaction_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn total_volume_overflow_is_an_error() {
        let store = InMemoryStorage::new();
        let mut batch = BlockBatch::new(block(1), StateSnapshot::default());
        batch.set_volume("0xm1", "B1", MAX_VOLUME);
        batch.set_volume("0xm1", "B2", MAX_VOLUME);
        store.commit_block(batch).await.unwrap();
        assert_eq!(store.total_volume().await.unwrap(), 2 * MAX_VOLUME);

        let mut batch = BlockBatch::new(block(2), StateSnapshot::default());
        batch.set_volume("0xm1", "B3", MAX_VOLUME);
        store.commit_block(batch).await.unwrap();
        assert!(matches!(
            store.total_volume().await,
            Err(IndexerError::Storage(_))
        ));
    }
}

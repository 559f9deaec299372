//! Projection store traits.
//!
//! The store owns five keyed collections (blocks, participants, items,
//! inventory, transactions) plus the cursor. Writes happen only through
//! [`ProjectionStore::commit_block`], which applies one block's effects and
//! the cursor advance as a single atomic unit. Readers never observe a
//! partially applied block.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;

use crate::batch::BlockBatch;
use crate::error::IndexerError;
use crate::types::{
    normalize_address, BlockRecord, DomainEvent, InventoryEntry, Item, Participant,
    TransactionRecord,
};

/// Read side of the projection. All address arguments are normalised.
#[async_trait]
pub trait ProjectionReader: Send + Sync {
    /// Highest fully projected block, `None` if nothing was committed yet.
    async fn cursor(&self) -> Result<Option<u64>, IndexerError>;

    async fn block(&self, height: u64) -> Result<Option<BlockRecord>, IndexerError>;

    /// Blocks in `[from, to]`, ascending.
    async fn blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<BlockRecord>, IndexerError>;

    async fn participant(&self, address: &str) -> Result<Option<Participant>, IndexerError>;

    /// All participants, ordered by address.
    async fn participants(&self) -> Result<Vec<Participant>, IndexerError>;

    async fn item(&self, barcode: &str) -> Result<Option<Item>, IndexerError>;

    /// Every inventory entry of `holder` (zero-volume entries included).
    async fn inventory_of(&self, holder: &str) -> Result<Vec<InventoryEntry>, IndexerError>;

    /// Every inventory entry for `barcode` (zero-volume entries included).
    async fn holders_of(&self, barcode: &str) -> Result<Vec<InventoryEntry>, IndexerError>;

    /// Audit records for `barcode`, ordered by `(height, log index)`.
    async fn history(&self, barcode: &str) -> Result<Vec<TransactionRecord>, IndexerError>;

    /// Audit records where `holder` is sender or recipient, up to and
    /// including `up_to`, ordered by `(height, log index)`.
    async fn holder_transactions(
        &self,
        holder: &str,
        up_to: u64,
    ) -> Result<Vec<TransactionRecord>, IndexerError>;

    /// Audit records produced by block `height`, ordered by log index.
    async fn transactions_in_block(&self, height: u64)
        -> Result<Vec<TransactionRecord>, IndexerError>;

    async fn participant_count(&self) -> Result<u64, IndexerError>;

    async fn item_count(&self) -> Result<u64, IndexerError>;

    async fn transaction_count(&self) -> Result<u64, IndexerError>;

    /// Sum of all inventory volumes.
    async fn total_volume(&self) -> Result<u64, IndexerError>;

    /// Registered participants appearing in at least one audit record.
    async fn active_participant_count(&self) -> Result<u64, IndexerError>;
}

/// Write side of the projection.
#[async_trait]
pub trait ProjectionStore: ProjectionReader {
    /// Load the current committed state for the keys a block will touch.
    async fn snapshot(&self, keys: &SnapshotKeys) -> Result<StateSnapshot, IndexerError>;

    /// Atomically apply a block's write set and advance the cursor.
    ///
    /// Inventory writes are compare-and-update: each carries the volume the
    /// batch read, and the commit fails with [`IndexerError::StaleInventory`]
    /// without writing anything if the stored volume differs. Audit records
    /// whose `(height, log index)` already exist are skipped. The cursor
    /// becomes `max(cursor, batch height)`.
    async fn commit_block(&self, batch: BlockBatch) -> Result<(), IndexerError>;
}

// ─── Snapshot ─────────────────────────────────────────────────────────────────

/// The keys one block's events will read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotKeys {
    pub block_height: u64,
    pub participants: BTreeSet<String>,
    pub barcodes: BTreeSet<String>,
    /// `(holder, barcode)` pairs.
    pub inventory: BTreeSet<(String, String)>,
}

impl SnapshotKeys {
    /// Collect every key the given events touch.
    pub fn for_events<'a>(
        block_height: u64,
        events: impl IntoIterator<Item = &'a DomainEvent>,
    ) -> Self {
        let mut keys = Self {
            block_height,
            ..Default::default()
        };
        for event in events {
            match event {
                DomainEvent::ParticipantRegistered { address, .. } => {
                    keys.participants.insert(normalize_address(address));
                }
                DomainEvent::ItemCreated {
                    barcode, creator, ..
                } => {
                    keys.barcodes.insert(barcode.clone());
                    keys.inventory
                        .insert((normalize_address(creator), barcode.clone()));
                }
                DomainEvent::ItemTransferred {
                    barcode, from, to, ..
                } => {
                    keys.barcodes.insert(barcode.clone());
                    keys.inventory.insert((normalize_address(from), barcode.clone()));
                    keys.inventory.insert((normalize_address(to), barcode.clone()));
                }
            }
        }
        keys
    }
}

/// Committed state for a set of [`SnapshotKeys`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub participants: HashMap<String, Participant>,
    pub items: HashMap<String, Item>,
    /// `(holder, barcode)` → volume. Absent keys hold zero.
    pub inventory: HashMap<(String, String), u64>,
    /// Log indices already present in the audit ledger at the block height.
    pub recorded: BTreeSet<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_cover_all_touched_entries() {
        let events = vec![
            DomainEvent::ParticipantRegistered {
                address: "0xAA".into(),
                name: "M1".into(),
                role_code: 0,
                metadata: String::new(),
            },
            DomainEvent::ItemCreated {
                barcode: "B1".into(),
                name: "Widget".into(),
                manufacturer_name: "M1".into(),
                manufactured_label: "2024".into(),
                creator: "0xAA".into(),
                volume: 100,
            },
            DomainEvent::ItemTransferred {
                barcode: "B1".into(),
                from: "0xaa".into(),
                to: "0xBB".into(),
                volume: 40,
                transfer_time: 0,
            },
        ];
        let keys = SnapshotKeys::for_events(11, &events);
        assert_eq!(keys.block_height, 11);
        assert!(keys.participants.contains("0xaa"));
        assert_eq!(keys.barcodes.len(), 1);
        assert_eq!(keys.inventory.len(), 2);
        assert!(keys.inventory.contains(&("0xbb".to_string(), "B1".to_string())));
    }
}

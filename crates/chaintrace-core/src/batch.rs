//! Per-block write set.
//!
//! A [`BlockBatch`] layers one block's pending writes over a [`StateSnapshot`]
//! of the committed state. The projector reads and writes only through the
//! batch, so events later in a block see the effects of earlier ones, while
//! nothing reaches the store until the whole block commits.

use std::collections::BTreeMap;

use crate::error::IndexerError;
use crate::store::StateSnapshot;
use crate::types::{BlockRecord, Item, Participant, TransactionRecord, MAX_VOLUME};

/// A compare-and-update inventory write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryWrite {
    pub holder: String,
    pub barcode: String,
    /// Committed volume the batch started from.
    pub expected: u64,
    /// Volume after the block.
    pub volume: u64,
}

/// Everything a block commit writes, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWrites {
    pub block: BlockRecord,
    pub participants: Vec<Participant>,
    pub items: Vec<Item>,
    pub inventory: Vec<InventoryWrite>,
    /// Ordered by log index.
    pub transactions: Vec<TransactionRecord>,
}

impl BlockWrites {
    /// Reject any volume above [`MAX_VOLUME`] before a store writes it.
    pub fn check_volumes(&self) -> Result<(), IndexerError> {
        let volumes = self
            .items
            .iter()
            .map(|i| (i.barcode.as_str(), i.initial_volume))
            .chain(self.inventory.iter().map(|w| (w.barcode.as_str(), w.volume)))
            .chain(self.transactions.iter().map(|t| (t.barcode.as_str(), t.volume)));
        for (barcode, volume) in volumes {
            if volume > MAX_VOLUME {
                return Err(IndexerError::VolumeOutOfRange {
                    barcode: barcode.to_string(),
                    volume: volume as u128,
                    block: self.block.height,
                });
            }
        }
        Ok(())
    }
}

/// Pending effects of one block.
#[derive(Debug, Clone)]
pub struct BlockBatch {
    block: BlockRecord,
    snapshot: StateSnapshot,
    participants: BTreeMap<String, Participant>,
    items: BTreeMap<String, Item>,
    inventory: BTreeMap<(String, String), InventoryWrite>,
    transactions: Vec<TransactionRecord>,
}

impl BlockBatch {
    pub fn new(block: BlockRecord, snapshot: StateSnapshot) -> Self {
        Self {
            block,
            snapshot,
            participants: BTreeMap::new(),
            items: BTreeMap::new(),
            inventory: BTreeMap::new(),
            transactions: Vec::new(),
        }
    }

    pub fn block(&self) -> &BlockRecord {
        &self.block
    }

    pub fn height(&self) -> u64 {
        self.block.height
    }

    pub fn participant(&self, address: &str) -> Option<&Participant> {
        self.participants
            .get(address)
            .or_else(|| self.snapshot.participants.get(address))
    }

    pub fn item(&self, barcode: &str) -> Option<&Item> {
        self.items
            .get(barcode)
            .or_else(|| self.snapshot.items.get(barcode))
    }

    /// Current volume of `barcode` at `holder`, pending writes included.
    pub fn volume(&self, holder: &str, barcode: &str) -> u64 {
        let key = (holder.to_string(), barcode.to_string());
        match self.inventory.get(&key) {
            Some(write) => write.volume,
            None => self.snapshot.inventory.get(&key).copied().unwrap_or(0),
        }
    }

    /// Returns `true` if the audit ledger already holds `log_index` at this height.
    pub fn is_recorded(&self, log_index: u32) -> bool {
        self.snapshot.recorded.contains(&log_index)
            || self.transactions.iter().any(|t| t.log_index == log_index)
    }

    pub fn put_participant(&mut self, participant: Participant) {
        self.participants
            .insert(participant.address.clone(), participant);
    }

    pub fn insert_item(&mut self, item: Item) {
        self.items.insert(item.barcode.clone(), item);
    }

    pub fn set_volume(&mut self, holder: &str, barcode: &str, volume: u64) {
        let key = (holder.to_string(), barcode.to_string());
        let expected = self.snapshot.inventory.get(&key).copied().unwrap_or(0);
        self.inventory
            .entry(key)
            .and_modify(|w| w.volume = volume)
            .or_insert_with(|| InventoryWrite {
                holder: holder.to_string(),
                barcode: barcode.to_string(),
                expected,
                volume,
            });
    }

    pub fn record(&mut self, record: TransactionRecord) {
        self.transactions.push(record);
    }

    pub fn transactions(&self) -> &[TransactionRecord] {
        &self.transactions
    }

    /// Returns `true` if the block changes nothing but its own block record.
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
            && self.items.is_empty()
            && self.inventory.is_empty()
            && self.transactions.is_empty()
    }

    pub fn into_writes(self) -> BlockWrites {
        let mut transactions = self.transactions;
        transactions.sort_by_key(|t| t.log_index);
        BlockWrites {
            block: self.block,
            participants: self.participants.into_values().collect(),
            items: self.items.into_values().collect(),
            inventory: self.inventory.into_values().collect(),
            transactions,
        }
    }
}

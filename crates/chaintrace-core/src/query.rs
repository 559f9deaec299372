//! Read-only views over the projection.
//!
//! The engine never writes. Every method reads committed state only, so a
//! caller running alongside the scanner sees each block either fully applied
//! or not at all.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::IndexerError;
use crate::store::ProjectionReader;
use crate::types::{normalize_address, Item, Participant, TransactionRecord};

/// One line of a holder's inventory, joined with item metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub barcode: String,
    pub volume: u64,
    pub name: Option<String>,
    pub manufacturer_name: Option<String>,
    pub manufactured_label: Option<String>,
}

/// A transaction together with the block that contains it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionProof {
    pub block_height: u64,
    pub block_hash: String,
    pub block_timestamp: i64,
    pub tx_hash: String,
    /// Every audit record the transaction produced, by log index.
    pub records: Vec<TransactionRecord>,
}

/// A current holder of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderView {
    pub address: String,
    pub name: Option<String>,
    pub volume: u64,
}

/// Everything known about one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTrail {
    pub item: Item,
    pub history: Vec<TransactionRecord>,
    pub current_holders: Vec<HolderView>,
    pub total_transactions: u64,
    /// Sum of current holder volumes. Equals `item.initial_volume` while conservation holds.
    pub circulating_volume: u64,
}

/// Global counters. A field is `None` when its sub-query failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyStats {
    pub total_participants: Option<u64>,
    pub total_transactions: Option<u64>,
    pub total_items: Option<u64>,
    pub total_inventory_volume: Option<u64>,
    pub active_participants: Option<u64>,
}

/// Query layer over any [`ProjectionReader`].
pub struct QueryEngine<R: ProjectionReader + ?Sized> {
    reader: Arc<R>,
}

impl<R: ProjectionReader + ?Sized> Clone for QueryEngine<R> {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
        }
    }
}

impl<R: ProjectionReader + ?Sized> QueryEngine<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self { reader }
    }

    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }

    /// Non-empty holdings of `holder`.
    ///
    /// With `as_of`, the result is folded from the audit ledger up to and
    /// including that height; otherwise the live inventory table is used.
    pub async fn inventory(
        &self,
        holder: &str,
        as_of: Option<u64>,
    ) -> Result<Vec<Holding>, IndexerError> {
        let holder = normalize_address(holder);
        let volumes: BTreeMap<String, u64> = match as_of {
            Some(height) => {
                let records = self.reader.holder_transactions(&holder, height).await?;
                fold_holdings(&holder, &records)
            }
            None => self
                .reader
                .inventory_of(&holder)
                .await?
                .into_iter()
                .map(|e| (e.barcode, e.volume))
                .collect(),
        };

        let mut holdings = Vec::new();
        for (barcode, volume) in volumes.into_iter().filter(|(_, v)| *v > 0) {
            let item = self.reader.item(&barcode).await?;
            holdings.push(Holding {
                name: item.as_ref().map(|i| i.name.clone()),
                manufacturer_name: item.as_ref().map(|i| i.manufacturer_name.clone()),
                manufactured_label: item.as_ref().map(|i| i.manufactured_label.clone()),
                barcode,
                volume,
            });
        }
        Ok(holdings)
    }

    /// Audit records for `barcode`, ascending. Empty for unknown barcodes.
    pub async fn history(&self, barcode: &str) -> Result<Vec<TransactionRecord>, IndexerError> {
        self.reader.history(barcode).await
    }

    /// Proof for `tx_hash` in block `height`, `None` if either is unknown.
    pub async fn proof(
        &self,
        height: u64,
        tx_hash: &str,
    ) -> Result<Option<TransactionProof>, IndexerError> {
        let Some(block) = self.reader.block(height).await? else {
            return Ok(None);
        };
        let wanted = tx_hash.to_ascii_lowercase();
        let records: Vec<_> = self
            .reader
            .transactions_in_block(height)
            .await?
            .into_iter()
            .filter(|r| r.tx_hash.to_ascii_lowercase() == wanted)
            .collect();
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(TransactionProof {
            block_height: block.height,
            block_hash: block.hash,
            block_timestamp: block.timestamp,
            tx_hash: tx_hash.to_string(),
            records,
        }))
    }

    /// Item metadata, full history and current holders of `barcode`.
    pub async fn audit_trail(&self, barcode: &str) -> Result<Option<AuditTrail>, IndexerError> {
        let Some(item) = self.reader.item(barcode).await? else {
            return Ok(None);
        };
        let history = self.reader.history(barcode).await?;

        let mut current_holders = Vec::new();
        for entry in self.reader.holders_of(barcode).await? {
            if entry.volume == 0 {
                continue;
            }
            let name = self.reader.participant(&entry.holder).await?.map(|p| p.name);
            current_holders.push(HolderView {
                address: entry.holder,
                name,
                volume: entry.volume,
            });
        }
        let circulating_volume = current_holders.iter().map(|h| h.volume).sum();

        Ok(Some(AuditTrail {
            item,
            total_transactions: history.len() as u64,
            history,
            current_holders,
            circulating_volume,
        }))
    }

    /// Global counters, queried concurrently. Failed sub-queries are logged
    /// and left empty.
    pub async fn stats(&self) -> SupplyStats {
        let (participants, transactions, items, volume, active) = futures::join!(
            self.reader.participant_count(),
            self.reader.transaction_count(),
            self.reader.item_count(),
            self.reader.total_volume(),
            self.reader.active_participant_count(),
        );
        SupplyStats {
            total_participants: partial("participants", participants),
            total_transactions: partial("transactions", transactions),
            total_items: partial("items", items),
            total_inventory_volume: partial("volume", volume),
            active_participants: partial("active_participants", active),
        }
    }

    pub async fn participants(&self) -> Result<Vec<Participant>, IndexerError> {
        self.reader.participants().await
    }

    pub async fn participant(&self, address: &str) -> Result<Option<Participant>, IndexerError> {
        self.reader.participant(&normalize_address(address)).await
    }
}

fn partial(stat: &str, result: Result<u64, IndexerError>) -> Option<u64> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(stat, error = %e, "stats sub-query failed");
            None
        }
    }
}

/// Per-barcode balance of `holder` after `records` (already height-bounded).
fn fold_holdings(holder: &str, records: &[TransactionRecord]) -> BTreeMap<String, u64> {
    let mut volumes: BTreeMap<String, u64> = BTreeMap::new();
    for record in records {
        let sent = record.from.as_deref() == Some(holder);
        let received = record.to == holder;
        let balance = volumes.entry(record.barcode.clone()).or_default();
        match (sent, received) {
            (true, false) => *balance = balance.saturating_sub(record.volume),
            (false, true) => *balance = balance.saturating_add(record.volume),
            _ => {}
        }
    }
    volumes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockRecord, EventKind, InventoryEntry, Role};
    use async_trait::async_trait;

    /// Reader over fixed vectors.
    #[derive(Default)]
    struct Fixture {
        blocks: Vec<BlockRecord>,
        participants: Vec<Participant>,
        items: Vec<Item>,
        inventory: Vec<InventoryEntry>,
        transactions: Vec<TransactionRecord>,
        broken_counts: bool,
    }

    #[async_trait]
    impl ProjectionReader for Fixture {
        async fn cursor(&self) -> Result<Option<u64>, IndexerError> {
            Ok(self.blocks.iter().map(|b| b.height).max())
        }
        async fn block(&self, height: u64) -> Result<Option<BlockRecord>, IndexerError> {
            Ok(self.blocks.iter().find(|b| b.height == height).cloned())
        }
        async fn blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<BlockRecord>, IndexerError> {
            Ok(self
                .blocks
                .iter()
                .filter(|b| (from..=to).contains(&b.height))
                .cloned()
                .collect())
        }
        async fn participant(&self, address: &str) -> Result<Option<Participant>, IndexerError> {
            Ok(self.participants.iter().find(|p| p.address == address).cloned())
        }
        async fn participants(&self) -> Result<Vec<Participant>, IndexerError> {
            Ok(self.participants.clone())
        }
        async fn item(&self, barcode: &str) -> Result<Option<Item>, IndexerError> {
            Ok(self.items.iter().find(|i| i.barcode == barcode).cloned())
        }
        async fn inventory_of(&self, holder: &str) -> Result<Vec<InventoryEntry>, IndexerError> {
            Ok(self
                .inventory
                .iter()
                .filter(|e| e.holder == holder)
                .cloned()
                .collect())
        }
        async fn holders_of(&self, barcode: &str) -> Result<Vec<InventoryEntry>, IndexerError> {
            Ok(self
                .inventory
                .iter()
                .filter(|e| e.barcode == barcode)
                .cloned()
                .collect())
        }
        async fn history(&self, barcode: &str) -> Result<Vec<TransactionRecord>, IndexerError> {
            Ok(self
                .transactions
                .iter()
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
                .transactions
                .iter()
                .filter(|t| t.block_height <= up_to)
                .filter(|t| t.to == holder || t.from.as_deref() == Some(holder))
                .cloned()
                .collect())
        }
        async fn transactions_in_block(
            &self,
            height: u64,
        ) -> Result<Vec<TransactionRecord>, IndexerError> {
            Ok(self
                .transactions
                .iter()
                .filter(|t| t.block_height == height)
                .cloned()
                .collect())
        }
        async fn participant_count(&self) -> Result<u64, IndexerError> {
            Ok(self.participants.len() as u64)
        }
        async fn item_count(&self) -> Result<u64, IndexerError> {
            if self.broken_counts {
                return Err(IndexerError::Storage("disk on fire".into()));
            }
            Ok(self.items.len() as u64)
        }
        async fn transaction_count(&self) -> Result<u64, IndexerError> {
            Ok(self.transactions.len() as u64)
        }
        async fn total_volume(&self) -> Result<u64, IndexerError> {
            Ok(self.inventory.iter().map(|e| e.volume).sum())
        }
        async fn active_participant_count(&self) -> Result<u64, IndexerError> {
            Ok(self
                .participants
                .iter()
                .filter(|p| {
                    self.transactions
                        .iter()
                        .any(|t| t.to == p.address || t.from.as_deref() == Some(&p.address))
                })
                .count() as u64)
        }
    }

    fn record(
        kind: EventKind,
        from: Option<&str>,
        to: &str,
        volume: u64,
        height: u64,
        log_index: u32,
    ) -> TransactionRecord {
        TransactionRecord {
            kind,
            barcode: "B1".into(),
            from: from.map(Into::into),
            to: to.into(),
            volume,
            block_height: height,
            log_index,
            tx_hash: format!("0xT{height}"),
            timestamp: height as i64 * 12,
            transfer_time: None,
        }
    }

    /// Scenarios 1 and 2: creation at 10, transfer of 40 at 11.
    fn fixture() -> Fixture {
        let entry = |holder: &str, volume| InventoryEntry {
            holder: holder.into(),
            barcode: "B1".into(),
            volume,
            last_updated_height: 11,
        };
        Fixture {
            blocks: vec![
                BlockRecord { height: 10, hash: "0xh10".into(), timestamp: 120, processed: true },
                BlockRecord { height: 11, hash: "0xh11".into(), timestamp: 132, processed: true },
            ],
            participants: vec![
                Participant {
                    address: "0xm1".into(),
                    name: "Maker".into(),
                    role: Role::Manufacturer,
                    role_code: 0,
                    metadata: String::new(),
                    first_seen_height: 1,
                    last_updated_height: 1,
                },
                Participant {
                    address: "0xidle".into(),
                    name: "Idle".into(),
                    role: Role::Customer,
                    role_code: 3,
                    metadata: String::new(),
                    first_seen_height: 1,
                    last_updated_height: 1,
                },
            ],
            items: vec![Item {
                barcode: "B1".into(),
                name: "Widget".into(),
                manufacturer_name: "Acme".into(),
                manufactured_label: "2024".into(),
                creator: "0xm1".into(),
                initial_volume: 100,
                created_height: 10,
                created_log_index: 0,
                created_tx_hash: "0xT10".into(),
            }],
            inventory: vec![entry("0xm1", 60), entry("0xs1", 40), entry("0xgone", 0)],
            transactions: vec![
                record(EventKind::ItemCreated, None, "0xm1", 100, 10, 0),
                record(EventKind::ItemTransferred, Some("0xm1"), "0xs1", 40, 11, 0),
            ],
            broken_counts: false,
        }
    }

    #[tokio::test]
    async fn inventory_as_of_past_height() {
        let q = QueryEngine::new(Arc::new(fixture()));
        assert!(q.inventory("0xS1", Some(10)).await.unwrap().is_empty());

        let at_11 = q.inventory("0xs1", Some(11)).await.unwrap();
        assert_eq!(at_11.len(), 1);
        assert_eq!(at_11[0].volume, 40);
        assert_eq!(at_11[0].name.as_deref(), Some("Widget"));

        let m1_at_10 = q.inventory("0xm1", Some(10)).await.unwrap();
        assert_eq!(m1_at_10[0].volume, 100);
    }

    #[tokio::test]
    async fn fold_agrees_with_live_table() {
        let q = QueryEngine::new(Arc::new(fixture()));
        for holder in ["0xm1", "0xs1", "0xgone"] {
            let live = q.inventory(holder, None).await.unwrap();
            let folded = q.inventory(holder, Some(11)).await.unwrap();
            assert_eq!(live, folded, "holder {holder}");
        }
    }

    #[tokio::test]
    async fn proof_returns_block_hash_and_records() {
        let q = QueryEngine::new(Arc::new(fixture()));
        let proof = q.proof(11, "0xt11").await.unwrap().unwrap();
        assert_eq!(proof.block_hash, "0xh11");
        assert_eq!(proof.records.len(), 1);
        assert!(q.proof(11, "0xnope").await.unwrap().is_none());
        assert!(q.proof(99, "0xT11").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn audit_trail_lists_nonzero_holders() {
        let q = QueryEngine::new(Arc::new(fixture()));
        let trail = q.audit_trail("B1").await.unwrap().unwrap();
        assert_eq!(trail.total_transactions, 2);
        assert_eq!(trail.circulating_volume, 100);
        assert_eq!(trail.current_holders.len(), 2);
        assert_eq!(trail.current_holders[0].name.as_deref(), Some("Maker"));
        assert!(trail.current_holders[1].name.is_none());
        assert!(q.audit_trail("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_survive_failed_subquery() {
        let mut f = fixture();
        f.broken_counts = true;
        let stats = QueryEngine::new(Arc::new(f)).stats().await;
        assert_eq!(stats.total_items, None);
        assert_eq!(stats.total_participants, Some(2));
        assert_eq!(stats.total_transactions, Some(2));
        assert_eq!(stats.total_inventory_volume, Some(100));
        assert_eq!(stats.active_participants, Some(1));
    }

    #[test]
    fn self_transfer_nets_zero() {
        let records = vec![
            record(EventKind::ItemCreated, None, "0xa", 5, 1, 0),
            record(EventKind::ItemTransferred, Some("0xa"), "0xa", 5, 2, 0),
        ];
        assert_eq!(fold_holdings("0xa", &records).get("B1"), Some(&5));
    }
}

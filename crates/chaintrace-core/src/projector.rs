//! Event projector: folds decoded domain events into a block batch.
//!
//! One call per event, strictly in ledger order. Every rule here is
//! idempotent: an event already present in the audit ledger (same height and
//! log index) is a no-op, so a block re-scanned after a crash converges to
//! the same state.

use tracing::{debug, warn};

use crate::batch::BlockBatch;
use crate::error::IndexerError;
use crate::types::{
    normalize_address, DomainEvent, EventContext, EventKind, Item, Participant, Role,
    TransactionRecord, MAX_VOLUME,
};

/// What applying one event did to the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// New effects were written.
    Projected,
    /// The event was already reflected in the store; nothing changed.
    Replayed,
    /// A second creation of a known barcode with identical attributes.
    DuplicateIgnored,
    /// A second creation of a known barcode with different attributes; rejected.
    ConflictingCreation,
}

/// Applies domain events to a [`BlockBatch`].
#[derive(Debug, Default, Clone)]
pub struct Projector;

impl Projector {
    pub fn new() -> Self {
        Self
    }

    /// Apply one event.
    ///
    /// Fails with [`IndexerError::ConservationViolation`] or
    /// [`IndexerError::UnknownItem`] when a transfer cannot be honoured, and
    /// with [`IndexerError::VolumeOutOfRange`] when a balance would pass
    /// [`MAX_VOLUME`]; the caller must then discard the whole batch.
    pub fn apply(
        &self,
        batch: &mut BlockBatch,
        event: &DomainEvent,
        ctx: &EventContext,
    ) -> Result<Applied, IndexerError> {
        if ctx.block_height != batch.height() {
            return Err(IndexerError::Other(format!(
                "event from block {} applied to batch for block {}",
                ctx.block_height,
                batch.height()
            )));
        }

        match event {
            DomainEvent::ParticipantRegistered {
                address,
                name,
                role_code,
                metadata,
            } => Ok(self.register(batch, address, name, *role_code, metadata, ctx)),
            DomainEvent::ItemCreated { .. } => self.create(batch, event, ctx),
            DomainEvent::ItemTransferred {
                barcode,
                from,
                to,
                volume,
                transfer_time,
            } => self.transfer(batch, barcode, from, to, *volume, *transfer_time, ctx),
        }
    }

    fn register(
        &self,
        batch: &mut BlockBatch,
        address: &str,
        name: &str,
        role_code: u8,
        metadata: &str,
        ctx: &EventContext,
    ) -> Applied {
        let address = normalize_address(address);
        let height = ctx.block_height;
        let existing = batch.participant(&address).cloned();

        let first_seen_height = existing
            .as_ref()
            .map_or(height, |p| p.first_seen_height.min(height));

        // An older registration replayed after a newer one only refreshes first-seen.
        if let Some(current) = existing.as_ref().filter(|p| p.last_updated_height > height) {
            if current.first_seen_height == first_seen_height {
                return Applied::Replayed;
            }
            let mut updated = current.clone();
            updated.first_seen_height = first_seen_height;
            batch.put_participant(updated);
            return Applied::Projected;
        }

        let participant = Participant {
            address,
            name: name.to_string(),
            role: Role::from_code(role_code),
            role_code,
            metadata: metadata.to_string(),
            first_seen_height,
            last_updated_height: height,
        };
        if existing.as_ref() == Some(&participant) {
            return Applied::Replayed;
        }
        debug!(address = %participant.address, role = %participant.role, block = height, "participant registered");
        batch.put_participant(participant);
        Applied::Projected
    }

    fn create(
        &self,
        batch: &mut BlockBatch,
        event: &DomainEvent,
        ctx: &EventContext,
    ) -> Result<Applied, IndexerError> {
        let DomainEvent::ItemCreated {
            barcode,
            name,
            manufacturer_name,
            manufactured_label,
            creator,
            volume,
        } = event
        else {
            return Ok(Applied::Replayed);
        };

        if batch.is_recorded(ctx.log_index) {
            return Ok(Applied::Replayed);
        }

        if let Some(existing) = batch.item(barcode) {
            if existing.created_height == ctx.block_height
                && existing.created_log_index == ctx.log_index
            {
                return Ok(Applied::Replayed);
            }
            if existing.same_attributes(event) {
                debug!(barcode = %barcode, block = ctx.block_height, "duplicate item creation ignored");
                return Ok(Applied::DuplicateIgnored);
            }
            warn!(
                barcode = %barcode,
                block = ctx.block_height,
                log_index = ctx.log_index,
                created_at = existing.created_height,
                "conflicting re-creation of existing barcode rejected"
            );
            return Ok(Applied::ConflictingCreation);
        }

        let creator = normalize_address(creator);
        let held = batch.volume(&creator, barcode);
        let credited = credit(barcode, held, *volume, ctx)?;
        batch.insert_item(Item {
            barcode: barcode.clone(),
            name: name.clone(),
            manufacturer_name: manufacturer_name.clone(),
            manufactured_label: manufactured_label.clone(),
            creator: creator.clone(),
            initial_volume: *volume,
            created_height: ctx.block_height,
            created_log_index: ctx.log_index,
            created_tx_hash: ctx.tx_hash.clone(),
        });

        batch.set_volume(&creator, barcode, credited);

        batch.record(TransactionRecord {
            kind: EventKind::ItemCreated,
            barcode: barcode.clone(),
            from: None,
            to: creator,
            volume: *volume,
            block_height: ctx.block_height,
            log_index: ctx.log_index,
            tx_hash: ctx.tx_hash.clone(),
            timestamp: ctx.block_timestamp,
            transfer_time: None,
        });
        debug!(barcode = %barcode, volume, block = ctx.block_height, "item created");
        Ok(Applied::Projected)
    }

    #[allow(clippy::too_many_arguments)]
    fn transfer(
        &self,
        batch: &mut BlockBatch,
        barcode: &str,
        from: &str,
        to: &str,
        volume: u64,
        transfer_time: u64,
        ctx: &EventContext,
    ) -> Result<Applied, IndexerError> {
        if batch.is_recorded(ctx.log_index) {
            return Ok(Applied::Replayed);
        }
        if batch.item(barcode).is_none() {
            return Err(IndexerError::UnknownItem {
                barcode: barcode.to_string(),
                block: ctx.block_height,
                log_index: ctx.log_index,
            });
        }

        let from = normalize_address(from);
        let to = normalize_address(to);

        let available = batch.volume(&from, barcode);
        if available < volume {
            return Err(IndexerError::ConservationViolation {
                barcode: barcode.to_string(),
                holder: from,
                available,
                requested: volume,
                block: ctx.block_height,
                log_index: ctx.log_index,
            });
        }

        let received = if from == to {
            available - volume
        } else {
            batch.volume(&to, barcode)
        };
        let credited = credit(barcode, received, volume, ctx)?;
        batch.set_volume(&from, barcode, available - volume);
        batch.set_volume(&to, barcode, credited);

        batch.record(TransactionRecord {
            kind: EventKind::ItemTransferred,
            barcode: barcode.to_string(),
            from: Some(from),
            to,
            volume,
            block_height: ctx.block_height,
            log_index: ctx.log_index,
            tx_hash: ctx.tx_hash.clone(),
            timestamp: ctx.block_timestamp,
            transfer_time: Some(transfer_time),
        });
        debug!(barcode = %barcode, volume, block = ctx.block_height, "item transferred");
        Ok(Applied::Projected)
    }
}

/// `held + volume`, or an error if the result would pass [`MAX_VOLUME`].
fn credit(barcode: &str, held: u64, volume: u64, ctx: &EventContext) -> Result<u64, IndexerError> {
    let total = held as u128 + volume as u128;
    if total > MAX_VOLUME as u128 {
        return Err(IndexerError::VolumeOutOfRange {
            barcode: barcode.to_string(),
            volume: total,
            block: ctx.block_height,
        });
    }
    Ok(total as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateSnapshot;
    use crate::types::BlockRecord;

    fn batch(height: u64, snapshot: StateSnapshot) -> BlockBatch {
        BlockBatch::new(
            BlockRecord {
                height,
                hash: format!("0xb{height}"),
                timestamp: 1_700_000_000 + height as i64,
                processed: true,
            },
            snapshot,
        )
    }

    fn ctx(height: u64, log_index: u32) -> EventContext {
        EventContext {
            block_height: height,
            block_hash: format!("0xb{height}"),
            block_timestamp: 1_700_000_000 + height as i64,
            tx_hash: format!("0xt{height}{log_index}"),
            log_index,
        }
    }

    fn item(barcode: &str) -> Item {
        Item {
            barcode: barcode.into(),
            name: "Widget".into(),
            manufacturer_name: "Acme".into(),
            manufactured_label: "2024-01-01".into(),
            creator: "0xm1".into(),
            initial_volume: 100,
            created_height: 10,
            created_log_index: 0,
            created_tx_hash: "0xt100".into(),
        }
    }

    fn created(barcode: &str, creator: &str, volume: u64) -> DomainEvent {
        DomainEvent::ItemCreated {
            barcode: barcode.into(),
            name: "Widget".into(),
            manufacturer_name: "Acme".into(),
            manufactured_label: "2024-01-01".into(),
            creator: creator.into(),
            volume,
        }
    }

    fn transferred(barcode: &str, from: &str, to: &str, volume: u64) -> DomainEvent {
        DomainEvent::ItemTransferred {
            barcode: barcode.into(),
            from: from.into(),
            to: to.into(),
            volume,
            transfer_time: 1_700_000_100,
        }
    }

    #[test]
    fn creation_credits_creator() {
        let p = Projector::new();
        let mut b = batch(10, StateSnapshot::default());
        let applied = p.apply(&mut b, &created("B1", "0xM1", 100), &ctx(10, 0)).unwrap();
        assert_eq!(applied, Applied::Projected);
        assert_eq!(b.volume("0xm1", "B1"), 100);
        assert_eq!(b.transactions().len(), 1);
        assert!(b.transactions()[0].from.is_none());
    }

    #[test]
    fn transfer_within_same_block_sees_creation() {
        let p = Projector::new();
        let mut b = batch(10, StateSnapshot::default());
        p.apply(&mut b, &created("B1", "0xm1", 100), &ctx(10, 0)).unwrap();
        p.apply(&mut b, &transferred("B1", "0xm1", "0xs1", 40), &ctx(10, 1)).unwrap();
        assert_eq!(b.volume("0xm1", "B1"), 60);
        assert_eq!(b.volume("0xs1", "B1"), 40);
    }

    #[test]
    fn same_event_twice_is_a_noop() {
        let p = Projector::new();
        let mut b = batch(10, StateSnapshot::default());
        p.apply(&mut b, &created("B1", "0xm1", 100), &ctx(10, 0)).unwrap();
        p.apply(&mut b, &transferred("B1", "0xm1", "0xs1", 40), &ctx(10, 1)).unwrap();

        let again = p.apply(&mut b, &transferred("B1", "0xm1", "0xs1", 40), &ctx(10, 1)).unwrap();
        assert_eq!(again, Applied::Replayed);
        let again = p.apply(&mut b, &created("B1", "0xm1", 100), &ctx(10, 0)).unwrap();
        assert_eq!(again, Applied::Replayed);

        assert_eq!(b.volume("0xm1", "B1"), 60);
        assert_eq!(b.transactions().len(), 2);
    }

    #[test]
    fn already_recorded_log_is_skipped() {
        let mut snapshot = StateSnapshot::default();
        snapshot.recorded.insert(0);
        snapshot.inventory.insert(("0xm1".into(), "B1".into()), 60);
        snapshot.inventory.insert(("0xs1".into(), "B1".into()), 40);
        snapshot.items.insert("B1".into(), item("B1"));
        let p = Projector::new();
        let mut b = batch(11, snapshot);

        let applied = p.apply(&mut b, &transferred("B1", "0xm1", "0xs1", 40), &ctx(11, 0)).unwrap();
        assert_eq!(applied, Applied::Replayed);
        assert!(b.is_empty());
    }

    #[test]
    fn overdraw_is_a_conservation_violation() {
        let p = Projector::new();
        let mut b = batch(10, StateSnapshot::default());
        p.apply(&mut b, &created("B1", "0xm1", 100), &ctx(10, 0)).unwrap();
        p.apply(&mut b, &transferred("B1", "0xm1", "0xs1", 40), &ctx(10, 1)).unwrap();

        let err = p
            .apply(&mut b, &transferred("B1", "0xs1", "0xv1", 200), &ctx(10, 2))
            .unwrap_err();
        match err {
            IndexerError::ConservationViolation {
                available,
                requested,
                ..
            } => {
                assert_eq!(available, 40);
                assert_eq!(requested, 200);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn transfer_of_unknown_item_fails() {
        let p = Projector::new();
        let mut b = batch(10, StateSnapshot::default());
        let err = p
            .apply(&mut b, &transferred("NOPE", "0xm1", "0xs1", 1), &ctx(10, 0))
            .unwrap_err();
        assert!(matches!(err, IndexerError::UnknownItem { .. }));
    }

    #[test]
    fn creation_above_storable_maximum_is_rejected() {
        let p = Projector::new();
        let mut b = batch(10, StateSnapshot::default());
        let err = p
            .apply(&mut b, &created("B1", "0xm1", MAX_VOLUME + 1), &ctx(10, 0))
            .unwrap_err();
        assert!(matches!(err, IndexerError::VolumeOutOfRange { block: 10, .. }));
        assert!(err.is_block_local());
        assert!(b.is_empty());

        let applied = p.apply(&mut b, &created("B1", "0xm1", MAX_VOLUME), &ctx(10, 1)).unwrap();
        assert_eq!(applied, Applied::Projected);
        assert_eq!(b.volume("0xm1", "B1"), MAX_VOLUME);
    }

    #[test]
    fn transfer_that_overflows_recipient_is_rejected() {
        let mut snapshot = StateSnapshot::default();
        snapshot.items.insert("B1".into(), item("B1"));
        snapshot.inventory.insert(("0xm1".into(), "B1".into()), MAX_VOLUME);
        snapshot.inventory.insert(("0xs1".into(), "B1".into()), 10);
        let p = Projector::new();
        let mut b = batch(11, snapshot);

        let err = p
            .apply(&mut b, &transferred("B1", "0xs1", "0xm1", 10), &ctx(11, 0))
            .unwrap_err();
        assert!(matches!(err, IndexerError::VolumeOutOfRange { .. }));
        assert!(b.is_empty());
    }

    #[test]
    fn self_transfer_keeps_balance() {
        let p = Projector::new();
        let mut b = batch(10, StateSnapshot::default());
        p.apply(&mut b, &created("B1", "0xm1", 100), &ctx(10, 0)).unwrap();
        p.apply(&mut b, &transferred("B1", "0xm1", "0xM1", 30), &ctx(10, 1)).unwrap();
        assert_eq!(b.volume("0xm1", "B1"), 100);
    }

    #[test]
    fn duplicate_creation_never_double_credits() {
        let p = Projector::new();
        let mut b = batch(10, StateSnapshot::default());
        p.apply(&mut b, &created("B1", "0xm1", 100), &ctx(10, 0)).unwrap();

        let dup = p.apply(&mut b, &created("B1", "0xm1", 100), &ctx(10, 1)).unwrap();
        assert_eq!(dup, Applied::DuplicateIgnored);

        let conflict = p.apply(&mut b, &created("B1", "0xm2", 5), &ctx(10, 2)).unwrap();
        assert_eq!(conflict, Applied::ConflictingCreation);

        assert_eq!(b.volume("0xm1", "B1"), 100);
        assert_eq!(b.volume("0xm2", "B1"), 0);
        assert_eq!(b.transactions().len(), 1);
    }

    #[test]
    fn registration_keeps_earliest_first_seen() {
        let p = Projector::new();
        let register = |name: &str, role| DomainEvent::ParticipantRegistered {
            address: "0xAA".into(),
            name: name.into(),
            role_code: role,
            metadata: "pk".into(),
        };

        let mut b = batch(5, StateSnapshot::default());
        p.apply(&mut b, &register("Maker", 0), &ctx(5, 0)).unwrap();
        let mut snapshot = StateSnapshot::default();
        snapshot
            .participants
            .insert("0xaa".into(), b.participant("0xaa").unwrap().clone());

        let mut b = batch(9, snapshot);
        p.apply(&mut b, &register("Maker & Sons", 1), &ctx(9, 0)).unwrap();
        let participant = b.participant("0xaa").unwrap();
        assert_eq!(participant.first_seen_height, 5);
        assert_eq!(participant.last_updated_height, 9);
        assert_eq!(participant.name, "Maker & Sons");
        assert_eq!(participant.role, Role::Supplier);

        let replay = p.apply(&mut b, &register("Maker & Sons", 1), &ctx(9, 0)).unwrap();
        assert_eq!(replay, Applied::Replayed);
    }
}

//! chaintrace-core: foundation for the supply-chain projection engine.
//!
//! # Architecture
//!
//! ```text
//! ChainScanner (chaintrace-evm)
//!      ├── Ledger            (height-addressed fetch + new-block subscription)
//!      ├── LogDecoder        (raw log → DomainEvent)
//!      ├── Projector         (DomainEvent → BlockBatch write set)
//!      └── ProjectionStore   (atomic per-block commit, cursor)
//!                 │
//!                 └── QueryEngine (read-only views: inventory, history, proofs, stats)
//! ```

pub mod batch;
pub mod cursor;
pub mod error;
pub mod indexer;
pub mod ledger;
pub mod projector;
pub mod query;
pub mod store;
pub mod types;

pub use batch::{BlockBatch, BlockWrites, InventoryWrite};
pub use cursor::Cursor;
pub use error::IndexerError;
pub use indexer::{IndexerConfig, IndexerState, ScanStatus, StatusReport};
pub use ledger::{BlockSubscription, Ledger};
pub use projector::{Applied, Projector};
pub use query::{AuditTrail, Holding, HolderView, QueryEngine, SupplyStats, TransactionProof};
pub use store::{ProjectionReader, ProjectionStore, SnapshotKeys, StateSnapshot};
pub use types::{
    BlockRecord, DomainEvent, EventContext, EventKind, InventoryEntry, Item, LedgerBlock,
    LedgerTransaction, Participant, RawLog, Role, TransactionRecord,
};

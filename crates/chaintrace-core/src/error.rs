//! Error types for the chaintrace pipeline.

use thiserror::Error;

/// Errors that can occur during scanning, projection, or querying.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(
        "Conservation violation at block {block} log {log_index}: \
         {holder} holds {available} of '{barcode}', transfer requested {requested}"
    )]
    ConservationViolation {
        barcode: String,
        holder: String,
        available: u64,
        requested: u64,
        block: u64,
        log_index: u32,
    },

    #[error("Transfer of unknown item '{barcode}' at block {block} log {log_index}")]
    UnknownItem {
        barcode: String,
        block: u64,
        log_index: u32,
    },

    #[error("{event} in {tx_hash}: field '{field}' does not fit in 64 bits")]
    ValueOutOfRange {
        event: String,
        field: String,
        tx_hash: String,
    },

    #[error("Volume {volume} of '{barcode}' at block {block} exceeds the storable maximum")]
    VolumeOutOfRange {
        barcode: String,
        volume: u128,
        block: u64,
    },

    #[error(
        "Inventory of '{barcode}' at {holder} changed underneath the batch: \
         expected {expected}, found {actual}"
    )]
    StaleInventory {
        holder: String,
        barcode: String,
        expected: u64,
        actual: u64,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error only aborts the current block.
    ///
    /// The cursor is left untouched and the block is retried on the next pass.
    pub fn is_block_local(&self) -> bool {
        matches!(
            self,
            Self::Rpc(_)
                | Self::ConservationViolation { .. }
                | Self::UnknownItem { .. }
                | Self::ValueOutOfRange { .. }
                | Self::VolumeOutOfRange { .. }
                | Self::StaleInventory { .. }
        )
    }

    /// Returns `true` for data-integrity failures that will not go away by
    /// simply re-fetching the block.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::ConservationViolation { .. }
                | Self::UnknownItem { .. }
                | Self::ValueOutOfRange { .. }
                | Self::VolumeOutOfRange { .. }
        )
    }
}

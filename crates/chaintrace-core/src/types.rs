//! Shared types for the projection pipeline.

use serde::{Deserialize, Serialize};

/// Normalise an address for use as a store key (lowercase, `0x`-prefixed).
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", hex.to_ascii_lowercase())
}

/// Parse a hex-encoded quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

/// Largest volume a projection accepts. Stores keep volumes in signed 64-bit
/// columns, and a barcode's holdings never sum past its creation volume.
pub const MAX_VOLUME: u64 = i64::MAX as u64;

// ─── Ledger shapes ────────────────────────────────────────────────────────────

/// A raw log as emitted by a ledger transaction (`eth_getTransactionReceipt`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    /// Emitting contract address.
    pub address: String,
    pub topics: Vec<String>,
    /// ABI-encoded payload, `0x`-prefixed hex.
    pub data: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "blockHash", default)]
    pub block_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    /// Returns the log index as u32, or `None` if the node sent garbage.
    pub fn log_index_u32(&self) -> Option<u32> {
        parse_hex_u64(&self.log_index).and_then(|v| u32::try_from(v).ok())
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }
}

/// A transaction as listed in a fetched block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub hash: String,
    /// Recipient; `None` for contract creation.
    pub to: Option<String>,
}

/// A block fetched by height from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBlock {
    pub height: u64,
    pub hash: String,
    /// Unix timestamp (seconds).
    pub timestamp: i64,
    pub transactions: Vec<LedgerTransaction>,
}

// ─── Domain events ────────────────────────────────────────────────────────────

/// A decoded, typed domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    ParticipantRegistered {
        address: String,
        name: String,
        role_code: u8,
        /// Free-form registration metadata (the participant's public key).
        metadata: String,
    },
    ItemCreated {
        barcode: String,
        name: String,
        manufacturer_name: String,
        manufactured_label: String,
        creator: String,
        volume: u64,
    },
    ItemTransferred {
        barcode: String,
        from: String,
        to: String,
        volume: u64,
        transfer_time: u64,
    },
}

impl DomainEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ParticipantRegistered { .. } => "ParticipantRegistered",
            Self::ItemCreated { .. } => "ItemCreated",
            Self::ItemTransferred { .. } => "ItemTransferred",
        }
    }

    /// The barcode this event touches, if any.
    pub fn barcode(&self) -> Option<&str> {
        match self {
            Self::ParticipantRegistered { .. } => None,
            Self::ItemCreated { barcode, .. } | Self::ItemTransferred { barcode, .. } => {
                Some(barcode)
            }
        }
    }
}

/// Where a decoded event came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub block_height: u64,
    pub block_hash: String,
    pub block_timestamp: i64,
    pub tx_hash: String,
    pub log_index: u32,
}

// ─── Projection records ───────────────────────────────────────────────────────

/// A scanned block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub height: u64,
    pub hash: String,
    pub timestamp: i64,
    pub processed: bool,
}

/// Participant role tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Manufacturer,
    Supplier,
    Vendor,
    Customer,
    Unknown,
}

impl Role {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Manufacturer,
            1 => Self::Supplier,
            2 => Self::Vendor,
            3 => Self::Customer,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manufacturer => write!(f, "Manufacturer"),
            Self::Supplier => write!(f, "Supplier"),
            Self::Vendor => write!(f, "Vendor"),
            Self::Customer => write!(f, "Customer"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A registered participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub address: String,
    pub name: String,
    pub role: Role,
    pub role_code: u8,
    pub metadata: String,
    pub first_seen_height: u64,
    pub last_updated_height: u64,
}

/// A manufactured item. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub barcode: String,
    pub name: String,
    pub manufacturer_name: String,
    pub manufactured_label: String,
    pub creator: String,
    /// Volume minted at creation; the conserved total for this barcode.
    pub initial_volume: u64,
    pub created_height: u64,
    pub created_log_index: u32,
    pub created_tx_hash: String,
}

impl Item {
    /// Returns `true` if `event` describes the same item (ignoring provenance).
    pub fn same_attributes(&self, event: &DomainEvent) -> bool {
        match event {
            DomainEvent::ItemCreated {
                barcode,
                name,
                manufacturer_name,
                manufactured_label,
                creator,
                volume,
            } => {
                &self.barcode == barcode
                    && &self.name == name
                    && &self.manufacturer_name == manufacturer_name
                    && &self.manufactured_label == manufactured_label
                    && self.creator == normalize_address(creator)
                    && self.initial_volume == *volume
            }
            _ => false,
        }
    }
}

/// Volume of one barcode held by one holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub holder: String,
    pub barcode: String,
    pub volume: u64,
    pub last_updated_height: u64,
}

/// Kind of an audit-ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ItemCreated,
    ItemTransferred,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ItemCreated => "item_created",
            Self::ItemTransferred => "item_transferred",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "item_created" => Some(Self::ItemCreated),
            "item_transferred" => Some(Self::ItemTransferred),
            _ => None,
        }
    }
}

/// One immutable entry of the audit ledger.
///
/// Identified by `(block_height, log_index)`; ordered the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub kind: EventKind,
    pub barcode: String,
    /// `None` for creation.
    pub from: Option<String>,
    pub to: String,
    pub volume: u64,
    pub block_height: u64,
    pub log_index: u32,
    pub tx_hash: String,
    /// Block timestamp.
    pub timestamp: i64,
    /// Transfer time reported by the event (transfers only).
    pub transfer_time: Option<u64>,
}

impl TransactionRecord {
    /// Ordering key within the audit ledger.
    pub fn position(&self) -> (u64, u32) {
        (self.block_height, self.log_index)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

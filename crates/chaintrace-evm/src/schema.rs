//! Event schema registry.
//!
//! A static table of the event signatures the indexer understands. Each
//! entry carries its ordered field list and the keccak256 topic the ledger
//! stamps on matching logs. Adding an event kind means adding an entry here
//! and a constructor arm in the decoder; nothing else changes.

use alloy_dyn_abi::DynSolType;
use tiny_keccak::{Hasher, Keccak};

/// ABI type of one event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Address,
    String,
    Uint8,
    Uint256,
}

impl FieldKind {
    pub fn abi_name(&self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::String => "string",
            Self::Uint8 => "uint8",
            Self::Uint256 => "uint256",
        }
    }

    pub fn dyn_type(&self) -> DynSolType {
        match self {
            Self::Address => DynSolType::Address,
            Self::String => DynSolType::String,
            Self::Uint8 => DynSolType::Uint(8),
            Self::Uint256 => DynSolType::Uint(256),
        }
    }
}

/// Which domain event a schema produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaKind {
    ParticipantRegistered,
    ItemCreated,
    ItemTransferred,
}

/// Decoding shape of one event.
#[derive(Debug, Clone)]
pub struct EventSchema {
    /// Solidity event name (e.g. `"NewProduct"`).
    pub name: &'static str,
    pub version: u32,
    pub kind: SchemaKind,
    /// `(field name, type)` in ABI order. None of the fields are indexed.
    pub fields: Vec<(&'static str, FieldKind)>,
    signature: String,
    topic0: String,
}

impl EventSchema {
    pub fn new(
        name: &'static str,
        version: u32,
        kind: SchemaKind,
        fields: Vec<(&'static str, FieldKind)>,
    ) -> Self {
        let types: Vec<&str> = fields.iter().map(|(_, k)| k.abi_name()).collect();
        let signature = format!("{name}({})", types.join(","));
        let topic0 = keccak256_hex(&signature);
        Self {
            name,
            version,
            kind,
            fields,
            signature,
            topic0,
        }
    }

    /// Canonical signature, e.g. `"NewUser(address,string,uint8,string)"`.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Lowercase `0x`-prefixed keccak256 of the signature.
    pub fn topic0(&self) -> &str {
        &self.topic0
    }

    /// Tuple type of the data payload.
    pub fn data_type(&self) -> DynSolType {
        DynSolType::Tuple(self.fields.iter().map(|(_, k)| k.dyn_type()).collect())
    }
}

/// Ordered set of known event schemas. Lookup order is registration order.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: Vec<EventSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The supply-chain contract's events.
    pub fn supply_chain() -> Self {
        use FieldKind::{Address, Uint256, Uint8};
        let text = FieldKind::String;
        let mut registry = Self::new();
        registry.register(EventSchema::new(
            "NewUser",
            1,
            SchemaKind::ParticipantRegistered,
            vec![
                ("userAddress", Address),
                ("name", text),
                ("role", Uint8),
                ("publicKey", text),
            ],
        ));
        registry.register(EventSchema::new(
            "NewProduct",
            1,
            SchemaKind::ItemCreated,
            vec![
                ("manufacturer", Address),
                ("name", text),
                ("manufacturerName", text),
                ("barcode", text),
                ("manufacturedTime", text),
                ("volume", Uint256),
            ],
        ));
        registry.register(EventSchema::new(
            "ProductSold",
            1,
            SchemaKind::ItemTransferred,
            vec![
                ("barcode", text),
                ("buyer", Address),
                ("seller", Address),
                ("transferTime", Uint256),
                ("volume", Uint256),
            ],
        ));
        registry
    }

    /// Append a schema. Later registrations have lower priority.
    pub fn register(&mut self, schema: EventSchema) {
        self.schemas.push(schema);
    }

    /// Schemas whose topic matches `topic0`, in priority order.
    pub fn candidates<'a>(&'a self, topic0: &'a str) -> impl Iterator<Item = &'a EventSchema> + 'a {
        self.schemas
            .iter()
            .filter(move |s| s.topic0.eq_ignore_ascii_case(topic0))
    }

    pub fn get(&self, name: &str) -> Option<&EventSchema> {
        self.schemas.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventSchema> {
        self.schemas.iter()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// keccak256 of `input` as lowercase `0x` hex.
pub fn keccak256_hex(input: &str) -> String {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(input.as_bytes());
    hasher.finalize(&mut output);
    format!("0x{}", hex::encode(output))
}

//! Log decoder: raw ledger log → typed domain event.
//!
//! Pure and synchronous. A log that matches no registered schema, or whose
//! payload does not fit the schema it claims, is [`Decoded::Unrecognized`]
//! and the scanner skips it. A log that does fit a schema but carries an
//! integer wider than 64 bits is an [`IndexerError::ValueOutOfRange`], which
//! rejects the whole block.

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::U256;
use tracing::trace;

use chaintrace_core::error::IndexerError;
use chaintrace_core::types::{normalize_address, DomainEvent, RawLog};

use crate::schema::{EventSchema, SchemaKind, SchemaRegistry};

/// Outcome of decoding one log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Event(DomainEvent),
    Unrecognized,
}

impl Decoded {
    pub fn into_event(self) -> Option<DomainEvent> {
        match self {
            Self::Event(e) => Some(e),
            Self::Unrecognized => None,
        }
    }
}

/// Matches raw logs against a [`SchemaRegistry`].
#[derive(Debug, Clone)]
pub struct LogDecoder {
    registry: SchemaRegistry,
}

impl Default for LogDecoder {
    fn default() -> Self {
        Self::new(SchemaRegistry::supply_chain())
    }
}

impl LogDecoder {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Decode `log`. Candidates are tried in registry order; the first one
    /// whose payload decodes wins.
    pub fn decode(&self, log: &RawLog) -> Result<Decoded, IndexerError> {
        if log.is_removed() {
            return Ok(Decoded::Unrecognized);
        }
        let Some(topic0) = log.topics.first() else {
            return Ok(Decoded::Unrecognized);
        };
        let Ok(data) = hex::decode(log.data.strip_prefix("0x").unwrap_or(&log.data)) else {
            trace!(tx = %log.tx_hash, "log data is not hex");
            return Ok(Decoded::Unrecognized);
        };

        for schema in self.registry.candidates(topic0) {
            match decode_with(schema, &data) {
                Ok(Some(event)) => return Ok(Decoded::Event(event)),
                Ok(None) => {
                    trace!(schema = schema.name, tx = %log.tx_hash, "payload does not fit schema")
                }
                Err(field) => {
                    return Err(IndexerError::ValueOutOfRange {
                        event: schema.name.to_string(),
                        field: field.to_string(),
                        tx_hash: log.tx_hash.clone(),
                    })
                }
            }
        }
        Ok(Decoded::Unrecognized)
    }
}

/// `Ok(None)` if the payload is not this schema's shape, `Err(field)` if it
/// is but `field` holds a value wider than 64 bits.
fn decode_with(schema: &EventSchema, data: &[u8]) -> Result<Option<DomainEvent>, &'static str> {
    let values = match schema.data_type().abi_decode_params(data) {
        Ok(DynSolValue::Tuple(values)) => values,
        _ => return Ok(None),
    };
    if values.len() != schema.fields.len() {
        return Ok(None);
    }
    let names = schema.fields.iter().map(|(name, _)| *name);
    let mut f = Fields(values.into_iter().zip(names));

    let event = match schema.kind {
        SchemaKind::ParticipantRegistered => {
            let Some(address) = f.address() else { return Ok(None) };
            let Some(name) = f.string() else { return Ok(None) };
            let Some(role) = f.uint()? else { return Ok(None) };
            let Some(metadata) = f.string() else { return Ok(None) };
            let Ok(role_code) = u8::try_from(role) else { return Ok(None) };
            DomainEvent::ParticipantRegistered {
                address,
                name,
                role_code,
                metadata,
            }
        }
        SchemaKind::ItemCreated => {
            let Some(creator) = f.address() else { return Ok(None) };
            let Some(name) = f.string() else { return Ok(None) };
            let Some(manufacturer_name) = f.string() else { return Ok(None) };
            let Some(barcode) = f.string() else { return Ok(None) };
            let Some(manufactured_label) = f.string() else { return Ok(None) };
            let Some(volume) = f.uint()? else { return Ok(None) };
            DomainEvent::ItemCreated {
                creator,
                name,
                manufacturer_name,
                barcode,
                manufactured_label,
                volume,
            }
        }
        SchemaKind::ItemTransferred => {
            let Some(barcode) = f.string() else { return Ok(None) };
            let Some(to) = f.address() else { return Ok(None) };
            let Some(from) = f.address() else { return Ok(None) };
            let Some(transfer_time) = f.uint()? else { return Ok(None) };
            let Some(volume) = f.uint()? else { return Ok(None) };
            DomainEvent::ItemTransferred {
                barcode,
                from,
                to,
                volume,
                transfer_time,
            }
        }
    };
    Ok(Some(event))
}

/// Sequential typed access to decoded tuple members, paired with field names.
struct Fields<I: Iterator<Item = (DynSolValue, &'static str)>>(I);

impl<I: Iterator<Item = (DynSolValue, &'static str)>> Fields<I> {
    fn address(&mut self) -> Option<String> {
        match self.0.next()? {
            (DynSolValue::Address(a), _) => Some(normalize_address(&hex::encode(a.as_slice()))),
            _ => None,
        }
    }

    fn string(&mut self) -> Option<String> {
        match self.0.next()? {
            (DynSolValue::String(s), _) => Some(s),
            _ => None,
        }
    }

    /// Unsigned integer. `Err` names the field when it does not fit in 64 bits.
    fn uint(&mut self) -> Result<Option<u64>, &'static str> {
        match self.0.next() {
            Some((DynSolValue::Uint(v, _), name)) => u256_to_u64(v).map(Some).ok_or(name),
            _ => Ok(None),
        }
    }
}

fn u256_to_u64(v: U256) -> Option<u64> {
    let limbs = v.as_limbs();
    if limbs[1..].iter().any(|l| *l != 0) {
        return None;
    }
    Some(limbs[0])
}

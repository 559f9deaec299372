//! chaintrace-evm: EVM event decoding and the chain scanner.
//!
//! ```text
//! JsonRpcLedger ──▶ ChainScanner ──▶ LogDecoder ──▶ Projector ──▶ ProjectionStore
//!                        ▲                 │
//!                   BlockSubscription   SchemaRegistry
//! ```

pub mod builder;
pub mod decoder;
pub mod fetcher;
pub mod index_loop;
pub mod retry;
pub mod schema;

pub use builder::IndexerBuilder;
pub use decoder::{Decoded, LogDecoder};
pub use fetcher::{JsonRpcLedger, JsonRpcRequest, JsonRpcResponse};
pub use index_loop::{BlockReport, ChainScanner, PassReport};
pub use retry::RetryPolicy;
pub use schema::{EventSchema, FieldKind, SchemaKind, SchemaRegistry};

//! Types library for the personal ledger engine
//!
//! Shared definitions used by the projector, the in-memory store and the
//! persistence tier. Everything here is plain data plus pure helpers; no
//! module in this crate performs I/O.
//!
//! # Modules
//! - `ids`: Identifiers (TransactionId, BackupId)
//! - `numeric`: Fixed-point money arithmetic at 4 decimal places
//! - `transaction`: Transaction record, kinds and validation
//! - `account`: Account/category registries and reference resolution
//! - `data`: The full ledger state persisted to disk
//! - `summary`: Aggregated summary payload
//! - `errors`: Error taxonomy

pub mod ids;
pub mod numeric;
pub mod transaction;
pub mod account;
pub mod data;
pub mod summary;
pub mod errors;

/// Current on-disk schema version of [`data::LedgerData`].
pub const SCHEMA_VERSION: u32 = 11;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::account::*;
    pub use crate::data::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::numeric;
    pub use crate::summary::*;
    pub use crate::transaction::*;
    pub use crate::SCHEMA_VERSION;
}

//! Ledger Engine
//!
//! The in-memory half of the ledger:
//! - `projector`: pure transaction-set → balance-map projection
//! - `store`: authoritative collections with a bounded undo history
//! - `summaries`: monthly and global health figures
//!
//! Nothing here touches the disk; durability lives in the `persistence`
//! service.

pub mod projector;
pub mod store;
pub mod summaries;

pub use projector::{liquidity, project, BalanceMap};
pub use store::{StoreConfig, TransactionStore};

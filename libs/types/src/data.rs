//! The full ledger state
//!
//! [`LedgerData`] is what gets persisted, backed up and restored. Every
//! collection sits behind an `Arc`, so cloning the state (for an undo
//! checkpoint or a scheduled save) copies pointers, and a later mutation
//! copies only the collection it touches (`Arc::make_mut`).
//!
//! Collections the engine never interprets (trades, assets, loans, ...) are
//! kept as opaque JSON values supplied by the host.

use crate::account::{Account, Category};
use crate::transaction::{Transaction, TransactionKind};
use crate::SCHEMA_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Base currency used when none is configured.
pub const DEFAULT_BASE_CURRENCY: &str = "COP";

/// Opaque host-owned list
pub type OpaqueList = Arc<Vec<Value>>;

/// A spending/income budget for a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
    #[serde(default)]
    pub area: String,
    pub amount: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Budget {
    pub fn new(
        id: impl Into<String>,
        area: impl Into<String>,
        amount: f64,
        currency: impl Into<String>,
        kind: TransactionKind,
    ) -> Self {
        Self {
            id: id.into(),
            area_id: None,
            area: area.into(),
            amount,
            currency: currency.into(),
            kind,
            extra: BTreeMap::new(),
        }
    }
}

/// Opaque collections replaceable wholesale through `set_collection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectionKind {
    Trades,
    TradingTransfers,
    Assets,
    Recurrents,
    Loans,
    Debts,
    Reminders,
    Snapshots,
    Scenarios,
    Tags,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 10] = [
        CollectionKind::Trades,
        CollectionKind::TradingTransfers,
        CollectionKind::Assets,
        CollectionKind::Recurrents,
        CollectionKind::Loans,
        CollectionKind::Debts,
        CollectionKind::Reminders,
        CollectionKind::Snapshots,
        CollectionKind::Scenarios,
        CollectionKind::Tags,
    ];

    /// JSON field name of the collection.
    pub fn field_name(self) -> &'static str {
        match self {
            CollectionKind::Trades => "trades",
            CollectionKind::TradingTransfers => "tradingTransfers",
            CollectionKind::Assets => "assets",
            CollectionKind::Recurrents => "recurrents",
            CollectionKind::Loans => "loans",
            CollectionKind::Debts => "debts",
            CollectionKind::Reminders => "reminders",
            CollectionKind::Snapshots => "snapshots",
            CollectionKind::Scenarios => "scenarios",
            CollectionKind::Tags => "tags",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

/// Complete persisted ledger state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerData {
    pub version: u32,
    pub base_currency: String,
    /// 1 unit of currency = rate units of base currency
    pub exchange_rates: BTreeMap<String, f64>,

    pub settings: Map<String, Value>,
    pub features: Map<String, Value>,
    pub meta: Map<String, Value>,
    pub enabled_modules: Vec<String>,

    pub account_registry: Arc<Vec<Account>>,
    pub category_registry: Arc<Vec<Category>>,

    pub transactions: Arc<Vec<Transaction>>,
    pub budgets: Arc<Vec<Budget>>,

    pub trades: OpaqueList,
    pub trading_transfers: OpaqueList,
    pub assets: OpaqueList,
    pub recurrents: OpaqueList,
    pub loans: OpaqueList,
    pub debts: OpaqueList,
    pub reminders: OpaqueList,
    pub snapshots: OpaqueList,
    pub scenarios: OpaqueList,
    pub tags: OpaqueList,

    /// Fields this engine does not model, kept verbatim across saves.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for LedgerData {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            base_currency: DEFAULT_BASE_CURRENCY.to_string(),
            exchange_rates: BTreeMap::new(),
            settings: Map::new(),
            features: Map::new(),
            meta: Map::new(),
            enabled_modules: Vec::new(),
            account_registry: Arc::default(),
            category_registry: Arc::default(),
            transactions: Arc::default(),
            budgets: Arc::default(),
            trades: Arc::default(),
            trading_transfers: Arc::default(),
            assets: Arc::default(),
            recurrents: Arc::default(),
            loans: Arc::default(),
            debts: Arc::default(),
            reminders: Arc::default(),
            snapshots: Arc::default(),
            scenarios: Arc::default(),
            tags: Arc::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl LedgerData {
    /// Minimal safe state used when nothing on disk could be trusted.
    pub fn safe_defaults() -> Self {
        let mut data = Self::default();
        data.meta
            .insert("mode".to_string(), Value::String("safe".to_string()));
        data
    }

    pub fn collection(&self, kind: CollectionKind) -> &OpaqueList {
        match kind {
            CollectionKind::Trades => &self.trades,
            CollectionKind::TradingTransfers => &self.trading_transfers,
            CollectionKind::Assets => &self.assets,
            CollectionKind::Recurrents => &self.recurrents,
            CollectionKind::Loans => &self.loans,
            CollectionKind::Debts => &self.debts,
            CollectionKind::Reminders => &self.reminders,
            CollectionKind::Snapshots => &self.snapshots,
            CollectionKind::Scenarios => &self.scenarios,
            CollectionKind::Tags => &self.tags,
        }
    }

    pub fn collection_mut(&mut self, kind: CollectionKind) -> &mut OpaqueList {
        match kind {
            CollectionKind::Trades => &mut self.trades,
            CollectionKind::TradingTransfers => &mut self.trading_transfers,
            CollectionKind::Assets => &mut self.assets,
            CollectionKind::Recurrents => &mut self.recurrents,
            CollectionKind::Loans => &mut self.loans,
            CollectionKind::Debts => &mut self.debts,
            CollectionKind::Reminders => &mut self.reminders,
            CollectionKind::Snapshots => &mut self.snapshots,
            CollectionKind::Scenarios => &mut self.scenarios,
            CollectionKind::Tags => &mut self.tags,
        }
    }

    /// Look up a transaction by id.
    pub fn transaction(&self, id: &str) -> Option<&Transaction> {
        self.transactions.iter().find(|t| t.id.as_str() == id)
    }
}

//! Schema migration pipeline
//!
//! Every state read from disk passes through [`MigrationPipeline::upgrade`]
//! before it is trusted. Upgrades run on raw JSON so fields that older
//! schemas used (and the typed model no longer has) can still be read.
//!
//! Versioned steps run in order from the stored version up to
//! [`SCHEMA_VERSION`]; a normalization pass then runs on every load and is
//! idempotent.

use crate::config::PersistenceConfig;
use ledger_types::account::NO_ACCOUNT;
use ledger_types::data::{CollectionKind, LedgerData, DEFAULT_BASE_CURRENCY};
use ledger_types::ids::TransactionId;
use ledger_types::SCHEMA_VERSION;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info};

/// Oldest version with a migration step; unversioned data enters here.
pub const OLDEST_MIGRATABLE: u32 = 5;

/// Rate used by the multi-currency upgrade when no legacy rate is stored.
const LEGACY_DEFAULT_RATE: f64 = 4000.0;

/// Modules every current install has enabled.
const CORE_MODULES: [&str; 3] = ["assets", "business", "custodial"];

/// Lists that are not typed collections but must exist as arrays.
const EXTRA_COLLECTIONS: [&str; 1] = ["custodialAccounts"];

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Data version {found} is newer than supported version {supported}")]
    FutureVersion { found: u64, supported: u32 },

    #[error("Migration from v{from} failed: {reason}")]
    Step { from: u32, reason: String },

    #[error("Invalid data shape: {0}")]
    Shape(String),
}

/// What an upgrade changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Stored version, `None` when the input carried none
    pub from_version: Option<u64>,
    pub to_version: u32,
    /// Target version of each step that ran
    pub steps: Vec<u32>,
    pub generated_ids: usize,
    pub backfilled_snapshots: usize,
    pub registered_accounts: usize,
    pub registered_categories: usize,
}

impl MigrationReport {
    /// True when the stored data was already current.
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
            && self.generated_ids == 0
            && self.backfilled_snapshots == 0
            && self.registered_accounts == 0
            && self.registered_categories == 0
    }
}

type Step = fn(&MigrationPipeline, &mut Map<String, Value>, &mut MigrationReport) -> Result<(), String>;

// ── Pipeline ────────────────────────────────────────────────────────

/// Upgrades raw stored state to the current schema.
#[derive(Debug, Clone, Default)]
pub struct MigrationPipeline {
    default_accounts: Vec<String>,
    default_categories: Vec<String>,
}

impl MigrationPipeline {
    pub fn new(default_accounts: Vec<String>, default_categories: Vec<String>) -> Self {
        Self {
            default_accounts,
            default_categories,
        }
    }

    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self::new(config.default_accounts.clone(), config.default_categories.clone())
    }

    /// Upgrade `raw` and deserialize it into the typed state.
    pub fn upgrade(&self, raw: Value) -> Result<(LedgerData, MigrationReport), MigrationError> {
        let mut map = match raw {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(MigrationError::Shape(format!(
                    "expected an object, found {}",
                    json_kind(&other)
                )))
            }
        };

        let from_version = match map.get("version") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| {
                MigrationError::Shape(format!("version is not an unsigned integer: {}", v))
            })?),
        };
        if let Some(found) = from_version {
            if found > u64::from(SCHEMA_VERSION) {
                return Err(MigrationError::FutureVersion {
                    found,
                    supported: SCHEMA_VERSION,
                });
            }
        }

        let mut report = MigrationReport {
            from_version,
            to_version: SCHEMA_VERSION,
            ..Default::default()
        };

        let steps: [(u32, Step); 6] = [
            (5, Self::v5_tags),
            (6, Self::v6_trial_markers),
            (7, Self::v7_rate_table),
            (8, Self::v8_registries),
            (9, Self::v9_seed_taxonomy),
            (10, Self::v10_core_modules),
        ];

        // Unversioned or pre-v5 data enters the chain at the oldest step
        let mut version = from_version
            .map(|v| v as u32)
            .unwrap_or(OLDEST_MIGRATABLE)
            .max(OLDEST_MIGRATABLE);
        for (from, step) in steps {
            if version != from {
                continue;
            }
            ensure_collections(&mut map).map_err(MigrationError::Shape)?;
            step(self, &mut map, &mut report).map_err(|reason| MigrationError::Step { from, reason })?;
            version = from + 1;
            report.steps.push(version);
            debug!(from, to = version, "migration step applied");
        }

        self.normalize(&mut map, &mut report)?;

        let data: LedgerData = serde_json::from_value(Value::Object(map))
            .map_err(|e| MigrationError::Shape(e.to_string()))?;

        if !report.is_noop() {
            info!(
                from = ?report.from_version,
                to = report.to_version,
                steps = report.steps.len(),
                generated_ids = report.generated_ids,
                backfilled = report.backfilled_snapshots,
                "ledger data migrated"
            );
        }
        Ok((data, report))
    }

    // ── Versioned steps ─────────────────────────────────────────────

    fn v5_tags(&self, map: &mut Map<String, Value>, _: &mut MigrationReport) -> Result<(), String> {
        if !map.get("tags").is_some_and(Value::is_array) {
            map.insert("tags".into(), Value::Array(Vec::new()));
        }
        Ok(())
    }

    /// Move `#TRIAL:YYYY-MM-DD` markers out of recurrent names.
    fn v6_trial_markers(&self, map: &mut Map<String, Value>, _: &mut MigrationReport) -> Result<(), String> {
        for recurrent in array_mut(map, "recurrents") {
            let Some(obj) = recurrent.as_object_mut() else {
                continue;
            };
            let name = obj.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let trial_end = parse_trial_marker(&name);
            let clean = name.split(" #TRIAL").next().unwrap_or_default().trim().to_string();

            obj.insert("name".into(), Value::String(clean));
            obj.insert("isTrial".into(), Value::Bool(trial_end.is_some()));
            if let Some(end) = trial_end {
                obj.insert("trialEndDate".into(), Value::String(end));
            }
        }
        Ok(())
    }

    /// Replace the single legacy rate with a per-currency table.
    fn v7_rate_table(&self, map: &mut Map<String, Value>, _: &mut MigrationReport) -> Result<(), String> {
        let legacy = legacy_rate(map).unwrap_or(LEGACY_DEFAULT_RATE);
        map.insert(
            "exchangeRates".into(),
            json!({
                "USD": legacy,
                "EUR": js_round(legacy * 1.08),
                "GBP": js_round(legacy * 1.25),
                "MXN": js_round(legacy * 0.058),
                "BRL": js_round(legacy * 0.20),
            }),
        );
        set_meta_version(map, 8);
        Ok(())
    }

    fn v8_registries(&self, map: &mut Map<String, Value>, report: &mut MigrationReport) -> Result<(), String> {
        normalize_registries(map, report);
        set_meta_version(map, 9);
        Ok(())
    }

    fn v9_seed_taxonomy(&self, map: &mut Map<String, Value>, report: &mut MigrationReport) -> Result<(), String> {
        self.seed_taxonomy(map, report);
        set_meta_version(map, 10);
        Ok(())
    }

    fn v10_core_modules(&self, map: &mut Map<String, Value>, _: &mut MigrationReport) -> Result<(), String> {
        let modules = map
            .entry("enabledModules")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !modules.is_array() {
            *modules = Value::Array(Vec::new());
        }
        if let Some(list) = modules.as_array_mut() {
            for module in CORE_MODULES {
                if !list.iter().any(|m| m.as_str() == Some(module)) {
                    list.push(Value::String(module.to_string()));
                }
            }
        }
        set_meta_version(map, 11);
        Ok(())
    }

    // ── Normalization (every load) ──────────────────────────────────

    fn normalize(&self, map: &mut Map<String, Value>, report: &mut MigrationReport) -> Result<(), MigrationError> {
        ensure_collections(map).map_err(MigrationError::Shape)?;
        for key in ["settings", "features", "meta"] {
            match map.get(key) {
                Some(Value::Object(_)) => {}
                None | Some(Value::Null) => {
                    map.insert(key.into(), Value::Object(Map::new()));
                }
                Some(other) => {
                    return Err(MigrationError::Shape(format!(
                        "{} must be an object, found {}",
                        key,
                        json_kind(other)
                    )))
                }
            }
        }
        if !map.get("baseCurrency").is_some_and(Value::is_string) {
            map.insert("baseCurrency".into(), Value::String(DEFAULT_BASE_CURRENCY.into()));
        }

        normalize_registries(map, report);
        normalize_registry_flags(map);
        self.seed_taxonomy(map, report);

        for tx in array_mut(map, "transactions") {
            let Some(obj) = tx.as_object_mut() else {
                continue;
            };
            let blank = obj
                .get("id")
                .and_then(Value::as_str)
                .map_or(true, |id| id.trim().is_empty());
            if blank {
                obj.insert("id".into(), Value::String(TransactionId::generate().to_string()));
                report.generated_ids += 1;
            }
        }

        backfill_rate_snapshots(map, report);

        map.remove("accounts");
        map.remove("areas");
        map.remove("exchangeRate");
        map.insert("version".into(), Value::from(SCHEMA_VERSION));
        Ok(())
    }

    /// Add the configured default accounts and categories missing by name.
    fn seed_taxonomy(&self, map: &mut Map<String, Value>, report: &mut MigrationReport) {
        let base = base_currency(map);

        let mut accounts = registry_entries(map, "accountRegistry");
        for name in &self.default_accounts {
            if !accounts.names.contains(name) {
                let id = accounts.unique_id("acc", name);
                push_entry(map, "accountRegistry", account_entry(&id, name, &base));
                accounts.insert(id, name.clone());
                report.registered_accounts += 1;
            }
        }

        let mut categories = registry_entries(map, "categoryRegistry");
        for name in &self.default_categories {
            if !categories.names.contains(name) {
                let id = categories.unique_id("cat", name);
                push_entry(map, "categoryRegistry", json!({ "id": id, "name": name, "isArchived": false }));
                categories.insert(id, name.clone());
                report.registered_categories += 1;
            }
        }
    }
}

// ── Registries ──────────────────────────────────────────────────────

/// Ids and names already present in one registry.
struct RegistryIndex {
    ids: HashSet<String>,
    names: HashSet<String>,
    by_name: HashMap<String, String>,
}

impl RegistryIndex {
    fn insert(&mut self, id: String, name: String) {
        self.by_name.entry(name.clone()).or_insert_with(|| id.clone());
        self.ids.insert(id);
        self.names.insert(name);
    }

    /// `<prefix>-<slug>`, suffixed with `-2`, `-3`, ... when taken.
    fn unique_id(&self, prefix: &str, name: &str) -> String {
        let base = format!("{}-{}", prefix, slug(name));
        if !self.ids.contains(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{}-{}", base, n))
            .find(|candidate| !self.ids.contains(candidate))
            .unwrap_or(base)
    }
}

fn registry_entries(map: &Map<String, Value>, key: &str) -> RegistryIndex {
    let mut index = RegistryIndex {
        ids: HashSet::new(),
        names: HashSet::new(),
        by_name: HashMap::new(),
    };
    for entry in map.get(key).and_then(Value::as_array).into_iter().flatten() {
        let id = entry.get("id").and_then(Value::as_str);
        let name = entry.get("name").and_then(Value::as_str);
        if let (Some(id), Some(name)) = (id, name) {
            index.insert(id.to_string(), name.to_string());
        }
    }
    index
}

/// Register every account/category name referenced by legacy fields and
/// fill the matching id references where they are absent.
fn normalize_registries(map: &mut Map<String, Value>, report: &mut MigrationReport) {
    let base = base_currency(map);

    let mut category_names: Vec<String> = Vec::new();
    category_names.extend(string_list(map, "areas"));
    category_names.extend(field_values(map, "transactions", "area"));
    category_names.extend(field_values(map, "budgets", "area"));
    category_names.extend(field_values(map, "recurrents", "area"));

    let mut account_names: Vec<String> = Vec::new();
    account_names.extend(string_list(map, "accounts"));
    account_names.extend(field_values(map, "transactions", "from"));
    account_names.extend(field_values(map, "transactions", "to"));
    account_names.extend(field_values(map, "recurrents", "account"));

    let mut categories = registry_entries(map, "categoryRegistry");
    for name in dedup(category_names) {
        if categories.names.contains(&name) {
            continue;
        }
        let id = categories.unique_id("cat", &name);
        push_entry(
            map,
            "categoryRegistry",
            json!({ "id": id, "name": name, "type": "expense", "isArchived": false }),
        );
        categories.insert(id, name);
        report.registered_categories += 1;
    }

    // "none" means no account, never a registry entry
    account_names.retain(|n| n != NO_ACCOUNT);

    let mut accounts = registry_entries(map, "accountRegistry");
    for name in dedup(account_names) {
        if accounts.names.contains(&name) {
            continue;
        }
        let id = accounts.unique_id("acc", &name);
        push_entry(map, "accountRegistry", account_entry(&id, &name, &base));
        accounts.insert(id, name);
        report.registered_accounts += 1;
    }

    for tx in array_mut(map, "transactions") {
        fill_reference(tx, "area", "areaId", &categories.by_name);
        fill_account_reference(tx, "from", "fromId", &accounts.by_name);
        fill_account_reference(tx, "to", "toId", &accounts.by_name);
    }
    for budget in array_mut(map, "budgets") {
        fill_reference(budget, "area", "areaId", &categories.by_name);
    }
    for recurrent in array_mut(map, "recurrents") {
        fill_reference(recurrent, "area", "areaId", &categories.by_name);
        fill_account_reference(recurrent, "account", "accountId", &accounts.by_name);
    }
}

/// Accounts get a currency (the base one when missing); every entry gets a
/// boolean `isArchived`.
fn normalize_registry_flags(map: &mut Map<String, Value>) {
    let base = base_currency(map);
    for account in array_mut(map, "accountRegistry") {
        if let Some(obj) = account.as_object_mut() {
            let has_currency = obj
                .get("currency")
                .and_then(Value::as_str)
                .is_some_and(|c| !c.is_empty());
            if !has_currency {
                obj.insert("currency".into(), Value::String(base.clone()));
            }
            let archived = truthy(obj.get("isArchived"));
            obj.insert("isArchived".into(), Value::Bool(archived));
        }
    }
    for category in array_mut(map, "categoryRegistry") {
        if let Some(obj) = category.as_object_mut() {
            let archived = truthy(obj.get("isArchived"));
            obj.insert("isArchived".into(), Value::Bool(archived));
        }
    }
}

fn fill_reference(entry: &mut Value, name_key: &str, id_key: &str, by_name: &HashMap<String, String>) {
    let Some(obj) = entry.as_object_mut() else {
        return;
    };
    if obj.get(id_key).is_some_and(|v| !v.is_null()) {
        return;
    }
    let id = obj
        .get(name_key)
        .and_then(Value::as_str)
        .and_then(|name| by_name.get(name));
    if let Some(id) = id {
        obj.insert(id_key.to_string(), Value::String(id.clone()));
    }
}

/// Like [`fill_reference`], but the "none" sentinel never gets an id.
fn fill_account_reference(entry: &mut Value, name_key: &str, id_key: &str, by_name: &HashMap<String, String>) {
    if entry.get(name_key).and_then(Value::as_str) == Some(NO_ACCOUNT) {
        return;
    }
    fill_reference(entry, name_key, id_key, by_name);
}

fn account_entry(id: &str, name: &str, currency: &str) -> Value {
    json!({ "id": id, "name": name, "currency": currency, "isArchived": false })
}

// ── Rates ───────────────────────────────────────────────────────────

/// Freeze a rate on every transaction that has none. Existing snapshots
/// are never touched.
fn backfill_rate_snapshots(map: &mut Map<String, Value>, report: &mut MigrationReport) {
    let base = base_currency(map);
    let legacy = legacy_rate(map);
    let rates: HashMap<String, f64> = map
        .get("exchangeRates")
        .and_then(Value::as_object)
        .map(|table| {
            table
                .iter()
                .filter_map(|(k, v)| v.as_f64().filter(|r| *r != 0.0).map(|r| (k.clone(), r)))
                .collect()
        })
        .unwrap_or_default();

    for tx in array_mut(map, "transactions") {
        let Some(obj) = tx.as_object_mut() else {
            continue;
        };
        if obj.get("exchangeRateSnapshot").is_some_and(|v| !v.is_null()) {
            continue;
        }
        let currency = obj.get("currency").and_then(Value::as_str).unwrap_or_default();
        let rate = if currency == base {
            1.0
        } else if let Some(rate) = rates.get(currency) {
            *rate
        } else if currency == "USD" {
            legacy.unwrap_or(1.0)
        } else {
            1.0
        };
        obj.insert("exchangeRateSnapshot".into(), Value::from(rate));
        report.backfilled_snapshots += 1;
    }
}

fn legacy_rate(map: &Map<String, Value>) -> Option<f64> {
    map.get("exchangeRate")
        .and_then(Value::as_f64)
        .filter(|r| r.is_finite() && *r != 0.0)
}

/// Round half toward positive infinity.
fn js_round(value: f64) -> f64 {
    (value + 0.5).floor()
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Every typed collection must be an array; missing or null ones become empty.
fn ensure_collections(map: &mut Map<String, Value>) -> Result<(), String> {
    let keys = ["transactions", "budgets", "accountRegistry", "categoryRegistry"]
        .into_iter()
        .chain(CollectionKind::ALL.iter().map(|k| k.field_name()))
        .chain(EXTRA_COLLECTIONS);
    for key in keys {
        match map.get(key) {
            Some(Value::Array(_)) => {}
            None | Some(Value::Null) => {
                map.insert(key.to_string(), Value::Array(Vec::new()));
            }
            Some(other) => return Err(format!("{} must be an array, found {}", key, json_kind(other))),
        }
    }
    Ok(())
}

fn array_mut<'a>(map: &'a mut Map<String, Value>, key: &str) -> impl Iterator<Item = &'a mut Value> {
    map.get_mut(key)
        .and_then(Value::as_array_mut)
        .into_iter()
        .flat_map(|items| items.iter_mut())
}

fn push_entry(map: &mut Map<String, Value>, key: &str, entry: Value) {
    let list = map.entry(key).or_insert_with(|| Value::Array(Vec::new()));
    if let Some(items) = list.as_array_mut() {
        items.push(entry);
    }
}

fn string_list(map: &Map<String, Value>, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn field_values(map: &Map<String, Value>, key: &str, field: &str) -> Vec<String> {
    map.get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get(field).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn dedup(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names.into_iter().filter(|n| seen.insert(n.clone())).collect()
}

fn base_currency(map: &Map<String, Value>) -> String {
    map.get("baseCurrency")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_BASE_CURRENCY)
        .to_string()
}

fn set_meta_version(map: &mut Map<String, Value>, version: u32) {
    let meta = map.entry("meta").or_insert_with(|| Value::Object(Map::new()));
    if let Some(obj) = meta.as_object_mut() {
        obj.insert("version".into(), Value::from(version));
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Lowercase with whitespace runs collapsed to `-`.
fn slug(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// Date of a `#TRIAL:YYYY-MM-DD` marker, if the name carries one.
fn parse_trial_marker(name: &str) -> Option<String> {
    let start = name.find("#TRIAL:")? + "#TRIAL:".len();
    let candidate = name.get(start..start + 10)?;
    let bytes = candidate.as_bytes();
    let shape_ok = bytes.iter().enumerate().all(|(i, b)| match i {
        4 | 7 => *b == b'-',
        _ => b.is_ascii_digit(),
    });
    shape_ok.then(|| candidate.to_string())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> MigrationPipeline {
        MigrationPipeline::new(vec!["Cash".into()], vec!["Food".into()])
    }

    fn v5_fixture() -> Value {
        json!({
            "version": 5,
            "baseCurrency": "COP",
            "exchangeRate": 4100,
            "accounts": ["Bank", "Cash"],
            "areas": ["Rent"],
            "transactions": [
                { "id": "t1", "date": "2023-01-05", "type": "expense", "amount": 10,
                  "currency": "USD", "from": "Bank", "area": "Rent" },
                { "id": "", "date": "2023-01-06", "type": "income", "amount": 5,
                  "currency": "COP", "from": "Wallet", "exchangeRateSnapshot": 1 }
            ],
            "budgets": [ { "id": "b1", "area": "Rent", "amount": 100, "type": "expense" } ],
            "recurrents": [ { "name": "Streaming #TRIAL:2024-02-01", "area": "Fun", "account": "Bank" } ]
        })
    }

    #[test]
    fn test_full_chain_from_v5() {
        let (data, report) = pipeline().upgrade(v5_fixture()).unwrap();

        assert_eq!(report.from_version, Some(5));
        assert_eq!(report.steps, vec![6, 7, 8, 9, 10, 11]);
        assert_eq!(data.version, SCHEMA_VERSION);
        assert_eq!(report.generated_ids, 1);
        assert!(data.transactions.iter().all(|t| !t.id.is_blank()));

        // rate table derived from the legacy single rate
        assert_eq!(data.exchange_rates["USD"], 4100.0);
        assert_eq!(data.exchange_rates["EUR"], 4428.0);
        assert_eq!(data.exchange_rates["GBP"], 5125.0);

        // registries and references
        let bank = data.account_registry.iter().find(|a| a.name == "Bank").unwrap();
        assert_eq!(bank.id, "acc-bank");
        assert_eq!(bank.currency, "COP");
        assert!(data.account_registry.iter().any(|a| a.name == "Wallet"));
        let t1 = data.transaction("t1").unwrap();
        assert_eq!(t1.from_id.as_deref(), Some("acc-bank"));
        assert_eq!(t1.area_id.as_deref(), Some("cat-rent"));
        assert_eq!(data.budgets[0].area_id.as_deref(), Some("cat-rent"));

        // seeded defaults and core modules
        assert!(data.category_registry.iter().any(|c| c.id == "cat-food"));
        for module in CORE_MODULES {
            assert!(data.enabled_modules.iter().any(|m| m == module));
        }

        // legacy fields removed
        assert!(!data.extra.contains_key("accounts"));
        assert!(!data.extra.contains_key("areas"));
        assert!(!data.extra.contains_key("exchangeRate"));

        let recurrent = &data.recurrents[0];
        assert_eq!(recurrent["name"], "Streaming");
        assert_eq!(recurrent["isTrial"], true);
        assert_eq!(recurrent["trialEndDate"], "2024-02-01");
        assert_eq!(recurrent["accountId"], "acc-bank");
    }

    #[test]
    fn test_rate_snapshot_backfill_never_overwrites() {
        let (data, _) = pipeline().upgrade(v5_fixture()).unwrap();
        // USD resolved through the rate table built from the legacy rate
        assert_eq!(data.transaction("t1").unwrap().exchange_rate_snapshot, Some(4100.0));
        let second = data.transactions.iter().find(|t| t.id.as_str() != "t1").unwrap();
        assert_eq!(second.exchange_rate_snapshot, Some(1.0));

        let raw = json!({
            "version": 11,
            "baseCurrency": "COP",
            "exchangeRates": { "USD": 5000 },
            "transactions": [
                { "id": "a", "date": "2024-01-01", "type": "income", "amount": 1,
                  "currency": "USD", "exchangeRateSnapshot": 3900 },
                { "id": "b", "date": "2024-01-02", "type": "income", "amount": 1, "currency": "EUR" }
            ]
        });
        let (data, report) = pipeline().upgrade(raw).unwrap();
        assert_eq!(data.transaction("a").unwrap().exchange_rate_snapshot, Some(3900.0));
        assert_eq!(data.transaction("b").unwrap().exchange_rate_snapshot, Some(1.0));
        assert_eq!(report.backfilled_snapshots, 1);
        assert!(report.steps.is_empty());
    }

    #[test]
    fn test_upgrade_is_idempotent() {
        let (first, _) = pipeline().upgrade(v5_fixture()).unwrap();
        let raw = serde_json::to_value(&first).unwrap();
        let (second, report) = pipeline().upgrade(raw).unwrap();
        assert_eq!(first, second);
        assert!(report.is_noop());
    }

    #[test]
    fn test_future_version_rejected() {
        let result = pipeline().upgrade(json!({ "version": 99 }));
        assert!(matches!(
            result,
            Err(MigrationError::FutureVersion { found: 99, supported: SCHEMA_VERSION })
        ));
    }

    #[test]
    fn test_unversioned_data_runs_full_chain() {
        let (data, report) = pipeline().upgrade(json!({ "transactions": [] })).unwrap();
        assert_eq!(report.from_version, None);
        assert_eq!(report.steps.len(), 6);
        assert_eq!(data.exchange_rates["USD"], LEGACY_DEFAULT_RATE);
    }

    #[test]
    fn test_bad_shapes_are_errors() {
        assert!(matches!(pipeline().upgrade(json!([1, 2])), Err(MigrationError::Shape(_))));
        assert!(matches!(
            pipeline().upgrade(json!({ "version": 11, "transactions": "nope" })),
            Err(MigrationError::Shape(_))
        ));
        assert!(matches!(
            pipeline().upgrade(json!({ "version": 11, "transactions": [ { "type": "bogus" } ] })),
            Err(MigrationError::Shape(_))
        ));
    }

    #[test]
    fn test_null_input_yields_defaults() {
        let (data, _) = MigrationPipeline::default().upgrade(Value::Null).unwrap();
        assert_eq!(data.version, SCHEMA_VERSION);
        assert_eq!(data.base_currency, DEFAULT_BASE_CURRENCY);
        assert!(data.transactions.is_empty());
    }

    #[test]
    fn test_none_sentinel_is_not_an_account() {
        let raw = json!({
            "version": 8,
            "accountRegistry": [ { "id": "c1", "name": "Cash" } ],
            "transactions": [
                { "id": "t", "date": "2024-01-01", "type": "transfer", "amount": 50,
                  "currency": "COP", "from": "Cash", "to": "none" }
            ],
            "recurrents": [ { "name": "Gym", "account": "none" } ]
        });
        let before: LedgerData = serde_json::from_value(raw.clone()).unwrap();
        let before = ledger_engine::project(&before.transactions, &before.account_registry);

        let (data, _) = MigrationPipeline::default().upgrade(raw).unwrap();
        assert!(data.account_registry.iter().all(|a| a.name != NO_ACCOUNT));
        let t = data.transaction("t").unwrap();
        assert_eq!(t.from_id.as_deref(), Some("c1"));
        assert_eq!(t.to_id, None);
        assert!(data.recurrents[0].get("accountId").is_none());

        let after = ledger_engine::project(&data.transactions, &data.account_registry);
        assert_eq!(after, before);
        assert_eq!(after.get("c1", "COP"), -50.0);
        assert!(after.account(NO_ACCOUNT).is_none());
    }

    #[test]
    fn test_registry_flags_and_slug_collisions() {
        let raw = json!({
            "version": 11,
            "baseCurrency": "USD",
            "accountRegistry": [ { "id": "acc-my-bank", "name": "Other", "isArchived": 0 } ],
            "transactions": [
                { "id": "a", "date": "2024-01-01", "type": "expense", "amount": 1,
                  "currency": "USD", "from": "My  Bank" }
            ]
        });
        let (data, _) = MigrationPipeline::default().upgrade(raw).unwrap();
        let other = &data.account_registry[0];
        assert_eq!(other.currency, "USD");
        assert!(!other.is_archived);
        let my_bank = data.account_registry.iter().find(|a| a.name == "My  Bank").unwrap();
        assert_eq!(my_bank.id, "acc-my-bank-2");
        assert_eq!(data.transaction("a").unwrap().from_id.as_deref(), Some("acc-my-bank-2"));
    }

    #[test]
    fn test_trial_marker_parsing() {
        assert_eq!(parse_trial_marker("X #TRIAL:2024-03-09"), Some("2024-03-09".into()));
        assert_eq!(parse_trial_marker("X #TRIAL:soon"), None);
        assert_eq!(parse_trial_marker("Plain"), None);
    }
}

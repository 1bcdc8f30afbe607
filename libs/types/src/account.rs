//! Account and category registries
//!
//! Older records reference accounts by display name; newer ones carry ids.
//! [`AccountResolver`] turns either form into an [`AccountRef`] once, so the
//! projector never has to chase fallback chains itself.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reference value meaning "no account".
pub const NO_ACCOUNT: &str = "none";

/// A registered account.
///
/// Archival only hides the account in listings; it never changes balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub is_archived: bool,
}

impl Account {
    pub fn new(id: impl Into<String>, name: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            currency: currency.into(),
            is_archived: false,
        }
    }
}

/// A registered spending/income category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub is_archived: bool,
}

/// How a transaction's account reference was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountRef {
    /// The record carried an explicit id
    ById(String),
    /// The record carried a display name that matched a registered account
    ByLegacyName { name: String, id: String },
    /// A name with no registered match; the raw string is kept as the key
    Unresolved(String),
    /// No reference, or the "none" sentinel
    Absent,
}

impl AccountRef {
    /// Balance-map key for postings against this reference.
    pub fn posting_key(&self) -> Option<&str> {
        match self {
            AccountRef::ById(id) => Some(id),
            AccountRef::ByLegacyName { id, .. } => Some(id),
            AccountRef::Unresolved(raw) => Some(raw),
            AccountRef::Absent => None,
        }
    }

    fn or_absent_if_sentinel(self) -> Self {
        match self.posting_key() {
            Some(key) if key == NO_ACCOUNT => AccountRef::Absent,
            _ => self,
        }
    }
}

/// Name→id lookup built once from the account registry.
///
/// Name matching is case-insensitive. When two accounts share a name the
/// last registered one wins.
#[derive(Debug, Clone, Default)]
pub struct AccountResolver {
    by_name: HashMap<String, String>,
}

impl AccountResolver {
    pub fn new(accounts: &[Account]) -> Self {
        let mut by_name = HashMap::with_capacity(accounts.len());
        for account in accounts {
            if account.id.is_empty() || account.name.is_empty() {
                continue;
            }
            by_name.insert(account.name.to_lowercase(), account.id.clone());
        }
        Self { by_name }
    }

    /// Resolve a reference: id if present, else a registered name, else the
    /// raw name. Nothing is dropped silently; only empty input and the
    /// sentinel become [`AccountRef::Absent`].
    pub fn resolve(&self, id: Option<&str>, name: &str) -> AccountRef {
        let resolved = match id.filter(|s| !s.is_empty()) {
            Some(id) => AccountRef::ById(id.to_string()),
            None if name.is_empty() => AccountRef::Absent,
            None => match self.by_name.get(&name.to_lowercase()) {
                Some(id) => AccountRef::ByLegacyName {
                    name: name.to_string(),
                    id: id.clone(),
                },
                None => AccountRef::Unresolved(name.to_string()),
            },
        };
        resolved.or_absent_if_sentinel()
    }

    /// Id registered under `name`, if any.
    pub fn id_for_name(&self, name: &str) -> Option<&str> {
        self.by_name.get(&name.to_lowercase()).map(String::as_str)
    }
}

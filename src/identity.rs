//! Resolving caller-supplied identifiers to canonical holders.
//!
//! A person can be addressed by their directory record id, by a human-facing
//! number printed on their card, or by the id of a linked login account. The
//! resolver tries those keys in [`HolderKey::PRIORITY`] order and returns the
//! first active record, so the same input always maps to the same holder.

use std::sync::Arc;

use dashmap::DashMap;

use crate::model::HolderRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HolderKey {
    /// Directory record id.
    Primary,
    /// Roll number or employee number.
    Secondary,
    /// Linked login account id.
    Account,
}

impl HolderKey {
    pub const PRIORITY: [HolderKey; 3] = [HolderKey::Primary, HolderKey::Secondary, HolderKey::Account];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderRecord {
    pub id: HolderRef,
    pub secondary_id: Option<String>,
    pub account_id: Option<String>,
    pub active: bool,
}

/// Read-only view of the external holder directory.
pub trait Directory: Send + Sync {
    fn find(&self, key: HolderKey, value: &str) -> Option<HolderRecord>;
}

pub struct IdentityResolver {
    directory: Arc<dyn Directory>,
}

impl IdentityResolver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    pub fn resolve(&self, candidate: &str) -> Option<HolderRef> {
        self.resolve_with_key(candidate).map(|(holder, _)| holder)
    }

    /// Like [`resolve`](Self::resolve), also reporting which key matched.
    pub fn resolve_with_key(&self, candidate: &str) -> Option<(HolderRef, HolderKey)> {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return None;
        }
        HolderKey::PRIORITY.into_iter().find_map(|key| {
            self.directory
                .find(key, candidate)
                .filter(|record| record.active)
                .map(|record| (record.id, key))
        })
    }
}

/// In-process directory, indexed by every key.
#[derive(Default)]
pub struct InMemoryDirectory {
    by_primary: DashMap<String, HolderRecord>,
    by_secondary: DashMap<String, HolderRecord>,
    by_account: DashMap<String, HolderRecord>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record. Stale secondary/account entries of a replaced record are dropped.
    pub fn upsert(&self, record: HolderRecord) {
        if let Some((_, old)) = self.by_primary.remove(record.id.as_str()) {
            if let Some(s) = &old.secondary_id {
                self.by_secondary.remove(s);
            }
            if let Some(a) = &old.account_id {
                self.by_account.remove(a);
            }
        }
        if let Some(s) = &record.secondary_id {
            self.by_secondary.insert(s.clone(), record.clone());
        }
        if let Some(a) = &record.account_id {
            self.by_account.insert(a.clone(), record.clone());
        }
        self.by_primary.insert(record.id.0.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.by_primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_primary.is_empty()
    }
}

impl Directory for InMemoryDirectory {
    fn find(&self, key: HolderKey, value: &str) -> Option<HolderRecord> {
        let index = match key {
            HolderKey::Primary => &self.by_primary,
            HolderKey::Secondary => &self.by_secondary,
            HolderKey::Account => &self.by_account,
        };
        index.get(value).map(|e| e.value().clone())
    }
}

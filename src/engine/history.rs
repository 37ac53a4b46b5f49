//! Append-only change history
//!
//! `append` only ever adds to the end. Queries are read-only projections.
//! `prune_older_than` is the single operation allowed to delete entries and
//! is never called implicitly.

use super::change::{ChangeRecord, ChangeType};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryLog {
    entries: Vec<ChangeRecord>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap previously persisted entries (kept in stored order)
    pub fn from_entries(entries: Vec<ChangeRecord>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ChangeRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, changes: &[ChangeRecord]) {
        self.entries.extend_from_slice(changes);
    }

    pub fn by_type(&self, change_type: ChangeType) -> Vec<&ChangeRecord> {
        self.entries
            .iter()
            .filter(|c| c.change_type == change_type)
            .collect()
    }

    pub fn by_list(&self, source_list: &str) -> Vec<&ChangeRecord> {
        self.entries
            .iter()
            .filter(|c| c.source_list == source_list)
            .collect()
    }

    pub fn by_cas(&self, cas_id: &str) -> Vec<&ChangeRecord> {
        self.entries.iter().filter(|c| c.cas_id == cas_id).collect()
    }

    /// Up to `limit` most recent entries, newest first
    ///
    /// Entries sharing a timestamp keep their reverse append order, so the
    /// last record of a detection pass comes first.
    pub fn recent(&self, limit: usize) -> Vec<&ChangeRecord> {
        let mut sorted: Vec<&ChangeRecord> = self.entries.iter().rev().collect();
        sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        sorted.truncate(limit);
        sorted
    }

    pub fn counts_by_type(&self) -> BTreeMap<ChangeType, usize> {
        let mut counts = BTreeMap::new();
        for change in &self.entries {
            *counts.entry(change.change_type).or_insert(0) += 1;
        }
        counts
    }

    /// Drop entries detected strictly before `cutoff`, returning how many went
    pub fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|c| c.timestamp >= cutoff);
        let removed = before - self.entries.len();
        if removed > 0 {
            log::debug!("Pruned {} history entries older than {}", removed, cutoff);
        }
        removed
    }
}

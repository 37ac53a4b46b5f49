//! Change detection between two snapshots of a source list
//!
//! Keys only in the new snapshot are insertions, keys only in the old one are
//! deletions, and keys in both are modifications when at least one attribute
//! column shared by both snapshots differs. `cas_id` and `cas_name` never
//! count as modified fields, and a column that exists in only one snapshot is
//! ignored entirely.
//!
//! Output order is fixed: insertions, deletions, then modifications, each
//! sorted by `cas_id`.

use super::change::{ChangeRecord, FieldChange};
use super::NowFn;
use crate::table::ListTable;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub struct ChangeDetector {
    now_fn: NowFn,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeDetector {
    /// Detector stamping records with the system clock
    pub fn new() -> Self {
        Self::new_with_timestamp_fn(Box::new(Utc::now))
    }

    /// Detector with a custom clock (deterministic tests)
    pub fn new_with_timestamp_fn(now_fn: NowFn) -> Self {
        Self { now_fn }
    }

    /// Compare two snapshots of one list
    ///
    /// `old = None` means the list previously had no rows. Every record from
    /// one call shares the same detection timestamp.
    pub fn detect_changes_for_list(
        &self,
        list_name: &str,
        old: Option<&ListTable>,
        new: &ListTable,
    ) -> Vec<ChangeRecord> {
        let now = (self.now_fn)();
        diff_tables(list_name, old, new, now)
    }

    /// Run detection for every newly loaded list, ordered by list name
    ///
    /// Lists missing from `new_lists` (for example because they failed to
    /// load) produce nothing: absence of a snapshot is not a deletion.
    pub fn detect_all_changes(
        &self,
        old_lists: &BTreeMap<String, ListTable>,
        new_lists: &BTreeMap<String, ListTable>,
    ) -> Vec<ChangeRecord> {
        self.detect_all_changes_at((self.now_fn)(), old_lists, new_lists)
    }

    /// Same as `detect_all_changes` with an explicit detection time
    pub fn detect_all_changes_at(
        &self,
        now: DateTime<Utc>,
        old_lists: &BTreeMap<String, ListTable>,
        new_lists: &BTreeMap<String, ListTable>,
    ) -> Vec<ChangeRecord> {
        let mut all = Vec::new();

        for (list_name, new) in new_lists {
            let changes = diff_tables(list_name, old_lists.get(list_name), new, now);
            if !changes.is_empty() {
                log::debug!("🔍 {}: {} change(s)", list_name, changes.len());
            }
            all.extend(changes);
        }

        all
    }
}

fn diff_tables(
    list_name: &str,
    old: Option<&ListTable>,
    new: &ListTable,
    now: DateTime<Utc>,
) -> Vec<ChangeRecord> {
    let mut insertions = Vec::new();
    let mut deletions = Vec::new();
    let mut modifications = Vec::new();

    let old = match old {
        Some(old) if !old.is_empty() => old,
        _ => {
            for cas_id in new.sorted_ids() {
                if let Some(row) = new.get(cas_id) {
                    insertions.push(ChangeRecord::insertion(now, list_name, row));
                }
            }
            return insertions;
        }
    };

    let common = new.common_columns(old);

    for cas_id in new.sorted_ids() {
        let Some(new_row) = new.get(cas_id) else { continue };
        match old.get(cas_id) {
            None => insertions.push(ChangeRecord::insertion(now, list_name, new_row)),
            Some(old_row) => {
                let fields: Vec<FieldChange> = common
                    .iter()
                    .filter(|col| old_row.attr(col) != new_row.attr(col))
                    .map(|col| FieldChange {
                        field: col.to_string(),
                        old: old_row.attr(col).clone(),
                        new: new_row.attr(col).clone(),
                    })
                    .collect();

                if !fields.is_empty() {
                    modifications.push(ChangeRecord::modification(
                        now, list_name, old_row, new_row, fields,
                    ));
                }
            }
        }
    }

    for cas_id in old.sorted_ids() {
        if new.contains(cas_id) {
            continue;
        }
        if let Some(old_row) = old.get(cas_id) {
            deletions.push(ChangeRecord::deletion(now, list_name, old_row));
        }
    }

    let mut out = insertions;
    out.append(&mut deletions);
    out.append(&mut modifications);
    out
}

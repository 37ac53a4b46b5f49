//! Aggregation of all source lists and lifecycle timestamp reconciliation
//!
//! # Flow
//!
//! ```text
//! ListTable per list ──┐
//!                      ├─► merge (one row per cas_id × source_list)
//! previous aggregate ──┘        ↓
//!                        reconcile created_at / updated_at by key
//!                               ↓
//!                        compare with previous (timestamps ignored)
//!                               ↓
//!                        WriteDecision::Write | SkipUnchanged
//! ```
//!
//! The aggregate never keeps tombstones: a key missing from the new merge is
//! dropped, and the deletion only lives in the change history.

use super::NowFn;
use crate::table::{common_columns, CellValue, ListTable, SubstanceRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One substance-in-one-list row of the aggregate table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub cas_id: String,
    pub cas_name: String,
    pub source_list: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, CellValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AggregateRow {
    pub fn attr(&self, column: &str) -> &CellValue {
        static NULL: CellValue = CellValue::Null;
        self.attributes.get(column).unwrap_or(&NULL)
    }

    fn to_record(&self) -> SubstanceRecord {
        SubstanceRecord {
            cas_id: self.cas_id.clone(),
            cas_name: self.cas_name.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// Long-form union of all source lists
///
/// Holds the declared attribute schema of every list it contains so the
/// reconciler and the detector can restrict comparisons to shared columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateTable {
    pub schemas: BTreeMap<String, Vec<String>>,
    pub rows: Vec<AggregateRow>,
}

impl AggregateTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, cas_id: &str, source_list: &str) -> Option<&AggregateRow> {
        self.rows
            .iter()
            .find(|r| r.cas_id == cas_id && r.source_list == source_list)
    }

    pub fn list_names(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }

    /// Union of every list's attribute columns, first-seen order by list name
    pub fn columns(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for columns in self.schemas.values() {
            for c in columns {
                if seen.insert(c.as_str()) {
                    out.push(c.as_str());
                }
            }
        }
        out
    }

    /// Rows of one list, in table order
    pub fn rows_for_list<'a>(&'a self, source_list: &'a str) -> impl Iterator<Item = &'a AggregateRow> {
        self.rows.iter().filter(move |r| r.source_list == source_list)
    }

    /// Rebuild a per-list snapshot from the aggregate
    ///
    /// Used as the "old" side of change detection.
    pub fn list_table(&self, source_list: &str) -> Option<ListTable> {
        let columns = self.schemas.get(source_list)?.clone();
        let rows: Vec<SubstanceRecord> = self
            .rows_for_list(source_list)
            .map(AggregateRow::to_record)
            .collect();
        match ListTable::new(source_list, columns.clone(), rows) {
            Ok(table) => Some(table),
            Err(e) => {
                // Persisted aggregate should never carry duplicate keys
                log::warn!("⚠️  Ignoring previous rows of '{}': {}", source_list, e);
                Some(ListTable::empty(source_list, columns))
            }
        }
    }

    /// Split into per-list snapshots keyed by list name
    pub fn split_by_list(&self) -> BTreeMap<String, ListTable> {
        self.schemas
            .keys()
            .filter_map(|name| self.list_table(name).map(|t| (name.clone(), t)))
            .collect()
    }

    /// Content equality ignoring `created_at` / `updated_at` and row order
    ///
    /// Missing attributes and explicit nulls compare equal.
    pub fn content_eq(&self, other: &AggregateTable) -> bool {
        if self.schemas != other.schemas || self.rows.len() != other.rows.len() {
            return false;
        }

        let theirs: HashMap<(&str, &str), &AggregateRow> = other
            .rows
            .iter()
            .map(|r| ((r.cas_id.as_str(), r.source_list.as_str()), r))
            .collect();
        if theirs.len() != other.rows.len() {
            return false;
        }

        self.rows.iter().all(|ours| {
            match theirs.get(&(ours.cas_id.as_str(), ours.source_list.as_str())) {
                Some(their) => {
                    ours.cas_name == their.cas_name
                        && non_null(&ours.attributes) == non_null(&their.attributes)
                }
                None => false,
            }
        })
    }
}

fn non_null(attributes: &BTreeMap<String, CellValue>) -> BTreeMap<&str, &CellValue> {
    attributes
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.as_str(), v))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Write even when content is unchanged
    pub force_write: bool,
    /// Lists that failed to load this cycle; their previous rows are kept as-is
    pub carry_over_lists: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    Write,
    SkipUnchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub new_rows: usize,
    pub modified_rows: usize,
    pub unchanged_rows: usize,
    pub dropped_rows: usize,
    pub carried_over_rows: usize,
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub table: AggregateTable,
    pub decision: WriteDecision,
    pub stats: ReconcileStats,
}

impl Reconciliation {
    pub fn should_write(&self) -> bool {
        self.decision == WriteDecision::Write
    }
}

pub struct Aggregator {
    now_fn: NowFn,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self::new_with_timestamp_fn(Box::new(Utc::now))
    }

    pub fn new_with_timestamp_fn(now_fn: NowFn) -> Self {
        Self { now_fn }
    }

    /// Merge freshly loaded lists and reconcile against the previous aggregate
    ///
    /// For every merged row keyed by `(cas_id, source_list)`:
    /// - no previous row: `created_at = updated_at = now`
    /// - previous row, some non-metadata value differs: keep `created_at`,
    ///   advance `updated_at`
    /// - previous row, nothing differs: carry both timestamps
    ///
    /// Non-metadata values are `cas_name` plus the attribute columns present
    /// in both the previous and the new schema of that list.
    pub fn reconcile(
        &self,
        new_lists: &BTreeMap<String, ListTable>,
        previous: Option<&AggregateTable>,
        options: &ReconcileOptions,
    ) -> Reconciliation {
        self.reconcile_at((self.now_fn)(), new_lists, previous, options)
    }

    /// Same as `reconcile` with an explicit "now"
    pub fn reconcile_at(
        &self,
        now: DateTime<Utc>,
        new_lists: &BTreeMap<String, ListTable>,
        previous: Option<&AggregateTable>,
        options: &ReconcileOptions,
    ) -> Reconciliation {
        let mut stats = ReconcileStats::default();
        let mut table = AggregateTable::default();

        let prior: HashMap<(&str, &str), &AggregateRow> = previous
            .map(|p| {
                p.rows
                    .iter()
                    .map(|r| ((r.cas_id.as_str(), r.source_list.as_str()), r))
                    .collect()
            })
            .unwrap_or_default();

        for (list_name, list) in new_lists {
            table.schemas.insert(list_name.clone(), list.columns().to_vec());

            let previous_columns = previous
                .and_then(|p| p.schemas.get(list_name))
                .cloned()
                .unwrap_or_default();
            let compared = common_columns(list.columns(), &previous_columns);

            for record in list.rows() {
                let (created_at, updated_at) =
                    match prior.get(&(record.cas_id.as_str(), list_name.as_str())) {
                        None => {
                            stats.new_rows += 1;
                            (now, now)
                        }
                        Some(old) => {
                            let differs = old.cas_name != record.cas_name
                                || compared.iter().any(|c| old.attr(c) != record.attr(c));
                            if differs {
                                stats.modified_rows += 1;
                                (old.created_at, now.max(old.created_at))
                            } else {
                                stats.unchanged_rows += 1;
                                (old.created_at, old.updated_at.max(old.created_at))
                            }
                        }
                    };

                table.rows.push(AggregateRow {
                    cas_id: record.cas_id.clone(),
                    cas_name: record.cas_name.clone(),
                    source_list: list_name.clone(),
                    attributes: record.attributes.clone(),
                    created_at,
                    updated_at,
                });
            }

            if let Some(previous) = previous {
                stats.dropped_rows += previous
                    .rows_for_list(list_name)
                    .filter(|r| !list.contains(&r.cas_id))
                    .count();
            }
        }

        if let Some(previous) = previous {
            for list_name in &options.carry_over_lists {
                if new_lists.contains_key(list_name) {
                    continue;
                }
                let Some(columns) = previous.schemas.get(list_name) else { continue };
                table.schemas.insert(list_name.clone(), columns.clone());
                for row in previous.rows_for_list(list_name) {
                    table.rows.push(row.clone());
                    stats.carried_over_rows += 1;
                }
            }

            // Lists neither reloaded nor carried over disappear with their rows
            for list_name in previous.schemas.keys() {
                if !new_lists.contains_key(list_name) && !options.carry_over_lists.contains(list_name) {
                    stats.dropped_rows += previous.rows_for_list(list_name).count();
                }
            }
        }

        let unchanged = previous.map_or(false, |p| p.content_eq(&table));
        let decision = if unchanged && !options.force_write {
            WriteDecision::SkipUnchanged
        } else {
            WriteDecision::Write
        };

        log::info!(
            "🧮 Reconciled {} row(s): {} new, {} modified, {} unchanged, {} dropped, {} carried over → {:?}",
            table.len(),
            stats.new_rows,
            stats.modified_rows,
            stats.unchanged_rows,
            stats.dropped_rows,
            stats.carried_over_rows,
            decision
        );

        Reconciliation {
            table,
            decision,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    /// Aggregator whose clock advances by one hour on every reconcile call
    fn ticking_aggregator() -> (Aggregator, Arc<AtomicI64>) {
        let ticks = Arc::new(AtomicI64::new(0));
        let counter = ticks.clone();
        let aggregator = Aggregator::new_with_timestamp_fn(Box::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            t0() + Duration::hours(n)
        }));
        (aggregator, ticks)
    }

    fn lists(tables: Vec<ListTable>) -> BTreeMap<String, ListTable> {
        tables.into_iter().map(|t| (t.name().to_string(), t)).collect()
    }

    fn annex(rows: Vec<SubstanceRecord>) -> ListTable {
        ListTable::new("annex_xiv", vec!["info_1".to_string()], rows).unwrap()
    }

    #[test]
    fn test_first_run_sets_both_timestamps() {
        let (aggregator, _) = ticking_aggregator();
        let new = lists(vec![annex(vec![SubstanceRecord::new("A1", "Foo").with("info_1", "x")])]);

        let result = aggregator.reconcile(&new, None, &ReconcileOptions::default());
        assert!(result.should_write());
        let row = result.table.get("A1", "annex_xiv").unwrap();
        assert_eq!(row.created_at, t0());
        assert_eq!(row.updated_at, t0());
        assert_eq!(result.stats.new_rows, 1);
    }

    #[test]
    fn test_unchanged_cycles_preserve_timestamps_and_skip_write() {
        let (aggregator, _) = ticking_aggregator();
        let new = lists(vec![annex(vec![SubstanceRecord::new("A1", "Foo").with("info_1", "x")])]);

        let mut state = aggregator
            .reconcile(&new, None, &ReconcileOptions::default())
            .table;
        for _ in 0..3 {
            let result = aggregator.reconcile(&new, Some(&state), &ReconcileOptions::default());
            assert_eq!(result.decision, WriteDecision::SkipUnchanged);
            assert_eq!(result.stats.unchanged_rows, 1);
            state = result.table;
        }

        let row = state.get("A1", "annex_xiv").unwrap();
        assert_eq!(row.created_at, t0());
        assert_eq!(row.updated_at, t0());
    }

    #[test]
    fn test_force_write_overrides_skip() {
        let (aggregator, _) = ticking_aggregator();
        let new = lists(vec![annex(vec![SubstanceRecord::new("A1", "Foo")])]);
        let state = aggregator
            .reconcile(&new, None, &ReconcileOptions::default())
            .table;

        let forced = ReconcileOptions {
            force_write: true,
            ..Default::default()
        };
        let result = aggregator.reconcile(&new, Some(&state), &forced);
        assert_eq!(result.decision, WriteDecision::Write);
    }

    #[test]
    fn test_modification_advances_updated_at_only() {
        let (aggregator, _) = ticking_aggregator();
        let before = lists(vec![annex(vec![SubstanceRecord::new("A1", "Foo").with("info_1", "x")])]);
        let after = lists(vec![annex(vec![SubstanceRecord::new("A1", "Foo").with("info_1", "y")])]);

        let state = aggregator
            .reconcile(&before, None, &ReconcileOptions::default())
            .table;
        let result = aggregator.reconcile(&after, Some(&state), &ReconcileOptions::default());

        assert!(result.should_write());
        let row = result.table.get("A1", "annex_xiv").unwrap();
        assert_eq!(row.created_at, t0());
        assert_eq!(row.updated_at, t0() + Duration::hours(1));
        assert_eq!(result.stats.modified_rows, 1);
    }

    #[test]
    fn test_deleted_key_is_dropped_and_reinsert_is_fresh() {
        let (aggregator, _) = ticking_aggregator();
        let with_row = lists(vec![annex(vec![SubstanceRecord::new("A1", "Foo")])]);
        let without = lists(vec![annex(vec![])]);

        let state = aggregator
            .reconcile(&with_row, None, &ReconcileOptions::default())
            .table;
        let removed = aggregator.reconcile(&without, Some(&state), &ReconcileOptions::default());
        assert!(removed.table.get("A1", "annex_xiv").is_none());
        assert_eq!(removed.stats.dropped_rows, 1);
        assert!(removed.should_write());

        let back = aggregator.reconcile(&with_row, Some(&removed.table), &ReconcileOptions::default());
        let row = back.table.get("A1", "annex_xiv").unwrap();
        assert_eq!(row.created_at, t0() + Duration::hours(2));
    }

    #[test]
    fn test_same_cas_in_two_lists_are_independent_rows() {
        let (aggregator, _) = ticking_aggregator();
        let restriction = ListTable::new(
            "restriction",
            vec!["entry".to_string()],
            vec![SubstanceRecord::new("A1", "Foo").with("entry", 5.0)],
        )
        .unwrap();
        let new = lists(vec![annex(vec![SubstanceRecord::new("A1", "Foo")]), restriction]);

        let result = aggregator.reconcile(&new, None, &ReconcileOptions::default());
        assert_eq!(result.table.len(), 2);
        assert!(result.table.get("A1", "annex_xiv").is_some());
        assert!(result.table.get("A1", "restriction").is_some());
        assert_eq!(result.table.columns(), vec!["info_1", "entry"]);
    }

    #[test]
    fn test_disjoint_schema_change_keeps_timestamps() {
        let (aggregator, _) = ticking_aggregator();
        let old = ListTable::new(
            "annex_xiv",
            vec!["info_1".to_string(), "info_9".to_string()],
            vec![SubstanceRecord::new("A1", "Foo").with("info_1", "x").with("info_9", "z")],
        )
        .unwrap();
        let new = annex(vec![SubstanceRecord::new("A1", "Foo").with("info_1", "x")]);

        let state = aggregator
            .reconcile(&lists(vec![old]), None, &ReconcileOptions::default())
            .table;
        let result = aggregator.reconcile(&lists(vec![new]), Some(&state), &ReconcileOptions::default());

        let row = result.table.get("A1", "annex_xiv").unwrap();
        assert_eq!(row.updated_at, t0());
        assert_eq!(result.stats.unchanged_rows, 1);
        // The schema itself changed, so the new aggregate still gets written
        assert!(result.should_write());
    }

    #[test]
    fn test_failed_list_is_carried_over() {
        let (aggregator, _) = ticking_aggregator();
        let restriction = ListTable::new(
            "restriction",
            vec![],
            vec![SubstanceRecord::new("R1", "Lead")],
        )
        .unwrap();
        let both = lists(vec![annex(vec![SubstanceRecord::new("A1", "Foo")]), restriction]);
        let state = aggregator
            .reconcile(&both, None, &ReconcileOptions::default())
            .table;

        let only_annex = lists(vec![annex(vec![SubstanceRecord::new("A1", "Foo")])]);
        let options = ReconcileOptions {
            force_write: false,
            carry_over_lists: ["restriction".to_string()].into_iter().collect(),
        };
        let result = aggregator.reconcile(&only_annex, Some(&state), &options);

        assert_eq!(result.stats.carried_over_rows, 1);
        assert_eq!(result.stats.dropped_rows, 0);
        assert_eq!(result.decision, WriteDecision::SkipUnchanged);
        assert_eq!(
            result.table.get("R1", "restriction").unwrap().created_at,
            t0()
        );
    }

    #[test]
    fn test_clock_behind_created_at_never_regresses() {
        let future = t0() + Duration::days(30);
        let aggregator = Aggregator::new_with_timestamp_fn(Box::new(t0));
        let previous = AggregateTable {
            schemas: [("annex_xiv".to_string(), vec!["info_1".to_string()])]
                .into_iter()
                .collect(),
            rows: vec![AggregateRow {
                cas_id: "A1".to_string(),
                cas_name: "Foo".to_string(),
                source_list: "annex_xiv".to_string(),
                attributes: [("info_1".to_string(), CellValue::from("x"))].into_iter().collect(),
                created_at: future,
                updated_at: future,
            }],
        };
        let new = lists(vec![annex(vec![SubstanceRecord::new("A1", "Foo").with("info_1", "y")])]);

        let result = aggregator.reconcile(&new, Some(&previous), &ReconcileOptions::default());
        let row = result.table.get("A1", "annex_xiv").unwrap();
        assert_eq!(row.created_at, future);
        assert!(row.updated_at >= row.created_at);
    }

    #[test]
    fn test_content_eq_treats_missing_as_null() {
        let row = |attrs: Vec<(&str, CellValue)>| AggregateRow {
            cas_id: "A1".to_string(),
            cas_name: "Foo".to_string(),
            source_list: "annex_xiv".to_string(),
            attributes: attrs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            created_at: t0(),
            updated_at: t0(),
        };
        let schemas: BTreeMap<String, Vec<String>> =
            [("annex_xiv".to_string(), vec!["info_1".to_string()])].into_iter().collect();

        let a = AggregateTable {
            schemas: schemas.clone(),
            rows: vec![row(vec![("info_1", CellValue::Null)])],
        };
        let mut b = AggregateTable {
            schemas,
            rows: vec![row(vec![])],
        };
        assert!(a.content_eq(&b));

        b.rows[0].updated_at = t0() + Duration::days(1);
        assert!(a.content_eq(&b));

        b.rows[0].attributes.insert("info_1".to_string(), CellValue::from("x"));
        assert!(!a.content_eq(&b));
    }
}

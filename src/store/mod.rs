//! Persistence of the aggregate table, change history and load summaries
//!
//! Two interchangeable backends sit behind `StateStore`:
//!
//! ```text
//! UpdateCycle ──► StateStore ──► SqliteStore (one transaction per write)
//!                           └──► JsonStore   (temp file + rename per write)
//! ```
//!
//! Either way a failed write leaves the previously persisted state intact.

pub mod json_store;
pub mod sqlite_store;

pub use json_store::JsonStore;
pub use sqlite_store::SqliteStore;

use crate::config::{AppConfig, BackendType};
use crate::engine::aggregator::AggregateTable;
use crate::engine::change::ChangeRecord;
use crate::engine::history::HistoryLog;
use crate::engine::summary::ListSummary;
use chrono::{DateTime, Utc};

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Database(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<tempfile::PersistError> for StoreError {
    fn from(err: tempfile::PersistError) -> Self {
        StoreError::Io(err.error)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Backend for everything the update cycle persists
pub trait StateStore {
    /// Last persisted aggregate, `None` before the first write
    fn load_aggregate(&self) -> Result<Option<AggregateTable>, StoreError>;

    /// Replace the persisted aggregate as a whole
    fn save_aggregate(&mut self, table: &AggregateTable) -> Result<(), StoreError>;

    /// Full change history in append order
    fn load_history(&self) -> Result<HistoryLog, StoreError>;

    /// Append change records; existing entries are never touched
    fn append_history(&mut self, changes: &[ChangeRecord]) -> Result<(), StoreError>;

    /// Delete history entries detected before `cutoff`, returning how many went
    fn prune_history(&mut self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    fn append_summaries(&mut self, summaries: &[ListSummary]) -> Result<(), StoreError>;

    /// Load summaries, newest first
    fn load_summaries(&self) -> Result<Vec<ListSummary>, StoreError>;

    /// Persist everything one update cycle produced
    ///
    /// `aggregate` is `None` when the aggregate is unchanged. History and
    /// summaries are written before the aggregate: if anything fails, the
    /// previous aggregate stays the baseline and the same changes are
    /// detected again next cycle. Backends with transactions commit all three
    /// at once.
    fn commit_cycle(
        &mut self,
        aggregate: Option<&AggregateTable>,
        changes: &[ChangeRecord],
        summaries: &[ListSummary],
    ) -> Result<(), StoreError> {
        self.append_history(changes)?;
        self.append_summaries(summaries)?;
        if let Some(table) = aggregate {
            self.save_aggregate(table)?;
        }
        Ok(())
    }

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// Open the backend selected by configuration
pub fn open_store(config: &AppConfig) -> Result<Box<dyn StateStore>, StoreError> {
    match config.backend {
        BackendType::Sqlite => Ok(Box::new(SqliteStore::new(&config.db_path)?)),
        BackendType::Json => Ok(Box::new(JsonStore::new(&config.output_dir)?)),
    }
}

/// Sort summaries newest first, keeping list order within one cycle
pub(crate) fn newest_first(mut summaries: Vec<ListSummary>) -> Vec<ListSummary> {
    summaries.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.source_list.cmp(&b.source_list))
    });
    summaries
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for backend tests

    use super::*;
    use crate::engine::aggregator::AggregateRow;
    use crate::table::{CellValue, SubstanceRecord};
    use chrono::TimeZone;

    pub fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 10, hour, 0, 0).unwrap()
    }

    pub fn sample_aggregate() -> AggregateTable {
        AggregateTable {
            schemas: [
                ("annex_xiv".to_string(), vec!["info_1".to_string()]),
                ("restriction".to_string(), vec!["entry".to_string()]),
            ]
            .into_iter()
            .collect(),
            rows: vec![
                AggregateRow {
                    cas_id: "7440-43-9".to_string(),
                    cas_name: "Cadmium".to_string(),
                    source_list: "annex_xiv".to_string(),
                    attributes: [("info_1".to_string(), CellValue::from("x"))].into_iter().collect(),
                    created_at: ts(1),
                    updated_at: ts(2),
                },
                AggregateRow {
                    cas_id: "7439-92-1".to_string(),
                    cas_name: "Lead".to_string(),
                    source_list: "restriction".to_string(),
                    attributes: [("entry".to_string(), CellValue::Number(63.0))].into_iter().collect(),
                    created_at: ts(1),
                    updated_at: ts(1),
                },
            ],
        }
    }

    pub fn sample_changes(hour: u32) -> Vec<ChangeRecord> {
        let old = SubstanceRecord::new("7440-43-9", "Cadmium").with("info_1", "x");
        let new = SubstanceRecord::new("7440-43-9", "Cadmium").with("info_1", "y");
        vec![
            ChangeRecord::insertion(ts(hour), "restriction", &SubstanceRecord::new("7439-92-1", "Lead")),
            ChangeRecord::modification(
                ts(hour),
                "annex_xiv",
                &old,
                &new,
                vec![crate::engine::change::FieldChange {
                    field: "info_1".to_string(),
                    old: CellValue::from("x"),
                    new: CellValue::from("y"),
                }],
            ),
        ]
    }

    /// Exercise the `StateStore` contract against any backend
    pub fn exercise_store(store: &mut dyn StateStore) {
        assert!(store.load_aggregate().unwrap().is_none());
        assert!(store.load_history().unwrap().is_empty());

        let aggregate = sample_aggregate();
        store.save_aggregate(&aggregate).unwrap();
        let loaded = store.load_aggregate().unwrap().unwrap();
        assert_eq!(loaded.schemas, aggregate.schemas);
        assert!(loaded.content_eq(&aggregate));
        assert_eq!(
            loaded.get("7440-43-9", "annex_xiv").unwrap().updated_at,
            ts(2)
        );

        // Saving an empty aggregate is still a persisted state
        store.save_aggregate(&AggregateTable::default()).unwrap();
        assert_eq!(store.load_aggregate().unwrap(), Some(AggregateTable::default()));

        store.append_history(&sample_changes(3)).unwrap();
        store.append_history(&sample_changes(5)).unwrap();
        let history = store.load_history().unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.entries()[0], sample_changes(3)[0]);
        assert_eq!(history.entries()[3], sample_changes(5)[1]);

        assert_eq!(store.prune_history(ts(4)).unwrap(), 2);
        let history = store.load_history().unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.entries().iter().all(|c| c.timestamp == ts(5)));

        let summaries = crate::engine::summary::summarize(ts(3), ["annex_xiv"], &sample_changes(3));
        store.append_summaries(&summaries).unwrap();
        let later = crate::engine::summary::summarize(ts(6), ["annex_xiv"], &[]);
        store.append_summaries(&later).unwrap();
        let loaded = store.load_summaries().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].timestamp, ts(6));
        assert_eq!(loaded[1].source_list, "annex_xiv");
        assert_eq!(loaded[1].modifications, 1);
    }

    /// Exercise `commit_cycle` against any fresh backend
    pub fn exercise_commit_cycle(store: &mut dyn StateStore) {
        let summaries = crate::engine::summary::summarize(ts(3), ["annex_xiv"], &sample_changes(3));
        store
            .commit_cycle(Some(&sample_aggregate()), &sample_changes(3), &summaries)
            .unwrap();
        assert!(store.load_aggregate().unwrap().unwrap().content_eq(&sample_aggregate()));
        assert_eq!(store.load_history().unwrap().len(), 2);
        assert_eq!(store.load_summaries().unwrap().len(), 2);

        // Unchanged aggregate: history and summaries still recorded
        let idle = crate::engine::summary::summarize(ts(4), ["annex_xiv", "restriction"], &[]);
        store.commit_cycle(None, &[], &idle).unwrap();
        assert!(store.load_aggregate().unwrap().unwrap().content_eq(&sample_aggregate()));
        assert_eq!(store.load_history().unwrap().len(), 2);
        assert_eq!(store.load_summaries().unwrap()[0].timestamp, ts(4));
    }
}

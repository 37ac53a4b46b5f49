//! One synchronous update cycle
//!
//! ```text
//! load previous aggregate
//!     ↓
//! load every configured list (failures collected, not fatal)
//!     ↓
//! reconcile + detect changes per loaded list + one summary per list
//!     ↓
//! commit: history, summaries, then the aggregate unless unchanged
//!     ↓
//! archive loaded source files (optional)
//! ```
//!
//! All timestamps produced by one cycle come from a single clock reading.

use super::aggregator::{Aggregator, ReconcileOptions, ReconcileStats, WriteDecision};
use super::change::{ChangeRecord, ChangeType};
use super::detector::ChangeDetector;
use super::history::HistoryLog;
use super::summary::{mark_failed, summarize, ListSummary};
use super::NowFn;
use crate::archive::archive_file;
use crate::config::ListsConfig;
use crate::source::{LoadError, SourceLoader};
use crate::store::{StateStore, StoreError};
use crate::table::ListTable;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    /// Persist the aggregate even when nothing changed
    pub force_write: bool,
}

/// A list that could not be loaded this cycle
#[derive(Debug)]
pub struct ListFailure {
    pub list: String,
    pub error: LoadError,
}

#[derive(Debug)]
pub enum CycleError {
    /// Not a single configured list could be loaded
    NoListsLoaded(Vec<ListFailure>),
    Store(StoreError),
}

impl From<StoreError> for CycleError {
    fn from(err: StoreError) -> Self {
        CycleError::Store(err)
    }
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleError::NoListsLoaded(failures) => {
                write!(f, "No source list could be loaded")?;
                for failure in failures {
                    write!(f, "; {}: {}", failure.list, failure.error)?;
                }
                Ok(())
            }
            CycleError::Store(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl std::error::Error for CycleError {}

/// Outcome of one cycle
#[derive(Debug)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub decision: WriteDecision,
    pub stats: ReconcileStats,
    pub aggregate_rows: usize,
    pub loaded_lists: Vec<String>,
    pub failures: Vec<ListFailure>,
    pub changes: Vec<ChangeRecord>,
    pub summaries: Vec<ListSummary>,
    /// Per list, CAS ids absent from the master reference
    pub unknown_cas_ids: BTreeMap<String, Vec<String>>,
    /// Source copies written to the archive directory
    pub archived: Vec<PathBuf>,
}

impl CycleReport {
    pub fn written(&self) -> bool {
        self.decision == WriteDecision::Write
    }

    /// Some lists loaded, some did not
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn count(&self, change_type: ChangeType) -> usize {
        self.changes
            .iter()
            .filter(|c| c.change_type == change_type)
            .count()
    }
}

pub struct UpdateCycle {
    lists: ListsConfig,
    loader: Box<dyn SourceLoader>,
    store: Box<dyn StateStore>,
    aggregator: Aggregator,
    detector: ChangeDetector,
    archive_dir: Option<PathBuf>,
    now_fn: NowFn,
}

impl UpdateCycle {
    pub fn new(
        lists: ListsConfig,
        loader: Box<dyn SourceLoader>,
        store: Box<dyn StateStore>,
    ) -> Self {
        Self::new_with_timestamp_fn(lists, loader, store, Box::new(Utc::now))
    }

    /// Cycle with a custom clock (deterministic tests)
    pub fn new_with_timestamp_fn(
        lists: ListsConfig,
        loader: Box<dyn SourceLoader>,
        store: Box<dyn StateStore>,
        now_fn: NowFn,
    ) -> Self {
        Self {
            lists,
            loader,
            store,
            aggregator: Aggregator::new(),
            detector: ChangeDetector::new(),
            archive_dir: None,
            now_fn,
        }
    }

    /// Copy each loaded list file into `dir` after a committed cycle
    pub fn with_archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn history(&self) -> Result<HistoryLog, StoreError> {
        self.store.load_history()
    }

    /// Drop history older than `retention_days` before now
    pub fn prune_history(&mut self, retention_days: i64) -> Result<usize, StoreError> {
        let cutoff = (self.now_fn)() - Duration::days(retention_days.max(0));
        let removed = self.store.prune_history(cutoff)?;
        if removed > 0 {
            log::info!("🧹 Pruned {} history entr(ies) older than {}", removed, cutoff);
        }
        Ok(removed)
    }

    pub fn run(&mut self, options: &CycleOptions) -> Result<CycleReport, CycleError> {
        let now = (self.now_fn)();
        log::info!(
            "🚀 Update cycle started ({} list(s), {} backend)",
            self.lists.lists.len(),
            self.store.backend_type()
        );

        let previous = self.store.load_aggregate()?;

        let mut loaded: BTreeMap<String, ListTable> = BTreeMap::new();
        let mut failures = Vec::new();
        for spec in &self.lists.lists {
            match self.loader.load_list(spec) {
                Ok(table) => {
                    log::debug!("{} ({}): {} row(s)", spec.name, spec.description(), table.len());
                    loaded.insert(spec.name.clone(), table);
                }
                Err(error) => {
                    log::error!("❌ Failed to load {}: {}", spec.name, error);
                    failures.push(ListFailure {
                        list: spec.name.clone(),
                        error,
                    });
                }
            }
        }

        if loaded.is_empty() {
            return Err(CycleError::NoListsLoaded(failures));
        }

        let unknown_cas_ids = self.check_cas_source(&loaded);

        let carry_over_lists: BTreeSet<String> = failures.iter().map(|f| f.list.clone()).collect();
        let reconcile_options = ReconcileOptions {
            force_write: options.force_write,
            carry_over_lists,
        };
        let reconciliation =
            self.aggregator
                .reconcile_at(now, &loaded, previous.as_ref(), &reconcile_options);

        let old_lists = previous
            .as_ref()
            .map(|p| p.split_by_list())
            .unwrap_or_default();
        let changes = self.detector.detect_all_changes_at(now, &old_lists, &loaded);

        let list_names: BTreeSet<&str> = old_lists
            .keys()
            .chain(loaded.keys())
            .map(String::as_str)
            .collect();
        let mut summaries = summarize(now, list_names, &changes);
        mark_failed(&mut summaries, now, failures.iter().map(|f| f.list.as_str()));

        let aggregate = if reconciliation.should_write() {
            Some(&reconciliation.table)
        } else {
            log::info!("⏭️  Aggregate unchanged, skipping write");
            None
        };
        self.store.commit_cycle(aggregate, &changes, &summaries)?;

        let archived = match &self.archive_dir {
            Some(dir) => self.archive_sources(dir, &loaded, now),
            None => Vec::new(),
        };

        let report = CycleReport {
            started_at: now,
            decision: reconciliation.decision,
            stats: reconciliation.stats,
            aggregate_rows: reconciliation.table.len(),
            loaded_lists: loaded.keys().cloned().collect(),
            failures,
            changes,
            summaries,
            unknown_cas_ids,
            archived,
        };

        log::info!(
            "✅ Update cycle done: {} insertion(s), {} deletion(s), {} modification(s), {} failed list(s)",
            report.count(ChangeType::Insertion),
            report.count(ChangeType::Deletion),
            report.count(ChangeType::Modification),
            report.failures.len()
        );

        Ok(report)
    }

    /// Archive the source file of every loaded list
    ///
    /// Copy failures are logged; the cycle is already committed.
    fn archive_sources(
        &self,
        dir: &Path,
        loaded: &BTreeMap<String, ListTable>,
        now: DateTime<Utc>,
    ) -> Vec<PathBuf> {
        let mut archived = Vec::new();
        for spec in self.lists.lists.iter().filter(|s| loaded.contains_key(&s.name)) {
            let Some(source) = self.loader.source_path(&spec.file) else {
                continue;
            };
            match archive_file(&source, dir, &spec.name, now) {
                Ok(path) => archived.push(path),
                Err(e) => log::warn!("⚠️  Could not archive {}: {}", source.display(), e),
            }
        }
        if !archived.is_empty() {
            log::info!("🗄️  Archived {} source file(s) to {}", archived.len(), dir.display());
        }
        archived
    }

    /// Compare loaded lists against the master CAS reference
    ///
    /// A missing or unreadable reference only disables the check.
    fn check_cas_source(&self, loaded: &BTreeMap<String, ListTable>) -> BTreeMap<String, Vec<String>> {
        let mut unknown = BTreeMap::new();
        let Some(file) = self.lists.cas_source.as_deref() else {
            return unknown;
        };

        let registry = match self.loader.load_cas_source(file) {
            Ok(registry) => registry,
            Err(e) => {
                log::warn!("⚠️  CAS reference unavailable, skipping check: {}", e);
                return unknown;
            }
        };

        for (name, table) in loaded {
            let ids = registry.unknown_ids(table);
            if !ids.is_empty() {
                log::warn!(
                    "⚠️  {}: {} CAS id(s) not in the master reference",
                    name,
                    ids.len()
                );
                unknown.insert(name.clone(), ids.into_iter().map(str::to_string).collect());
            }
        }
        unknown
    }
}

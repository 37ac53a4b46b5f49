//! JSON file backend
//!
//! Files under the output directory:
//! - `aggregate.json`      - the whole aggregate table
//! - `change_history.jsonl` - one change record per line, append-only
//! - `load_summaries.jsonl` - one summary per line, append-only
//!
//! Every write, appends included, goes through a temp file in the same
//! directory that is renamed over the target, so readers only ever see a
//! complete file. A torn last line left by some other writer is dropped with
//! a warning instead of failing every later read.
//!
//! `commit_cycle` writes the history and summaries first and the aggregate
//! last.

use super::{newest_first, StateStore, StoreError};
use crate::engine::aggregator::AggregateTable;
use crate::engine::change::ChangeRecord;
use crate::engine::history::HistoryLog;
use crate::engine::summary::ListSummary;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const AGGREGATE_FILE: &str = "aggregate.json";
const HISTORY_FILE: &str = "change_history.jsonl";
const SUMMARY_FILE: &str = "load_summaries.jsonl";

pub struct JsonStore {
    base_path: PathBuf,
}

impl JsonStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        log::info!("📝 JSON store at {}", base_path.display());
        Ok(Self { base_path })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.base_path.join(file)
    }

    /// Replace `target` atomically with `bytes`
    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let mut tmp = NamedTempFile::new_in(&self.base_path)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(target)?;
        Ok(())
    }

    /// Current log content, ending on a complete line
    ///
    /// An unterminated last line that does not parse is a torn write and is
    /// dropped; one that parses just lacks its newline.
    fn complete_lines<T: DeserializeOwned>(&self, file: &str) -> Result<String, StoreError> {
        let path = self.path(file);
        if !path.exists() {
            return Ok(String::new());
        }

        let mut content = fs::read_to_string(&path)?;
        if content.is_empty() || content.ends_with('\n') {
            return Ok(content);
        }

        let tail_start = content.rfind('\n').map_or(0, |i| i + 1);
        let tail = &content[tail_start..];
        if tail.trim().is_empty() || serde_json::from_str::<T>(tail).is_ok() {
            content.push('\n');
        } else {
            log::warn!(
                "⚠️  Dropping torn trailing line of {} ({} byte(s))",
                path.display(),
                tail.len()
            );
            content.truncate(tail_start);
        }
        Ok(content)
    }

    fn append_lines<T: Serialize + DeserializeOwned>(
        &self,
        file: &str,
        items: &[T],
    ) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut content = self.complete_lines::<T>(file)?;
        for item in items {
            content.push_str(&serde_json::to_string(item)?);
            content.push('\n');
        }
        self.write_atomic(&self.path(file), content.as_bytes())
    }

    fn read_lines<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>, StoreError> {
        let content = self.complete_lines::<T>(file)?;
        let mut out = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            out.push(serde_json::from_str(line)?);
        }
        Ok(out)
    }
}

impl StateStore for JsonStore {
    fn load_aggregate(&self) -> Result<Option<AggregateTable>, StoreError> {
        let path = self.path(AGGREGATE_FILE);
        if !path.exists() {
            log::info!("No existing aggregate file found: {}", path.display());
            return Ok(None);
        }

        let json = fs::read_to_string(&path)?;
        let table: AggregateTable = serde_json::from_str(&json)?;
        log::debug!("📤 Loaded aggregate from {}: {} row(s)", path.display(), table.len());
        Ok(Some(table))
    }

    fn save_aggregate(&mut self, table: &AggregateTable) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(table)?;
        self.write_atomic(&self.path(AGGREGATE_FILE), json.as_bytes())?;
        log::info!("💾 Aggregate written to {}: {} row(s)", AGGREGATE_FILE, table.len());
        Ok(())
    }

    fn load_history(&self) -> Result<HistoryLog, StoreError> {
        Ok(HistoryLog::from_entries(self.read_lines(HISTORY_FILE)?))
    }

    fn append_history(&mut self, changes: &[ChangeRecord]) -> Result<(), StoreError> {
        self.append_lines(HISTORY_FILE, changes)?;
        log::debug!("✅ Appended {} change(s) to {}", changes.len(), HISTORY_FILE);
        Ok(())
    }

    fn prune_history(&mut self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut history = self.load_history()?;
        let removed = history.prune_older_than(cutoff);
        if removed == 0 {
            return Ok(0);
        }

        let mut buf = String::new();
        for entry in history.entries() {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }
        self.write_atomic(&self.path(HISTORY_FILE), buf.as_bytes())?;
        Ok(removed)
    }

    fn append_summaries(&mut self, summaries: &[ListSummary]) -> Result<(), StoreError> {
        self.append_lines(SUMMARY_FILE, summaries)
    }

    fn load_summaries(&self) -> Result<Vec<ListSummary>, StoreError> {
        Ok(newest_first(self.read_lines(SUMMARY_FILE)?))
    }

    fn backend_type(&self) -> &'static str {
        "JSON"
    }
}

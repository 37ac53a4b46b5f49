//! SQLite backend
//!
//! Tables:
//! - `aggregate_meta`  - single row marking that an aggregate was persisted
//! - `aggregate_lists` - declared attribute columns per list (JSON array)
//! - `aggregate_rows`  - one row per (cas_id, source_list), attributes as JSON
//! - `change_history`  - append-only change records
//! - `load_summaries`  - append-only per-list cycle counts
//!
//! Timestamps are stored as RFC 3339 text with microsecond precision so
//! lexical order matches chronological order.

use super::{newest_first, StateStore, StoreError};
use crate::engine::aggregator::{AggregateRow, AggregateTable};
use crate::engine::change::{ChangeRecord, ChangeType};
use crate::engine::history::HistoryLog;
use crate::engine::summary::ListSummary;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path.as_ref())?;
        // journal_mode answers with the resulting mode, so read it back
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("📊 SQLite journal mode: {}", mode);
        Self::init_schema(&conn)?;

        log::info!("✅ SQLite store initialized at {}", db_path.as_ref().display());
        Ok(Self { conn })
    }

    /// In-memory database, used by tests
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS aggregate_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                persisted_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS aggregate_lists (
                source_list TEXT PRIMARY KEY,
                columns_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS aggregate_rows (
                position INTEGER NOT NULL,
                cas_id TEXT NOT NULL,
                source_list TEXT NOT NULL,
                cas_name TEXT NOT NULL,
                attributes_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (cas_id, source_list)
            );
            CREATE TABLE IF NOT EXISTS change_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                change_type TEXT NOT NULL,
                source_list TEXT NOT NULL,
                cas_id TEXT NOT NULL,
                cas_name TEXT NOT NULL,
                modified_fields TEXT NOT NULL DEFAULT '',
                record_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_timestamp ON change_history(timestamp);
            CREATE INDEX IF NOT EXISTS idx_history_cas ON change_history(cas_id);
            CREATE TABLE IF NOT EXISTS load_summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                source_list TEXT NOT NULL,
                insertions INTEGER NOT NULL,
                modifications INTEGER NOT NULL,
                deletions INTEGER NOT NULL,
                load_failed INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(())
    }
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("invalid timestamp '{}': {}", s, e)))
}

/// Replace the persisted aggregate within an open transaction
fn write_aggregate(conn: &Connection, table: &AggregateTable) -> Result<(), StoreError> {
    conn.execute("DELETE FROM aggregate_rows", [])?;
    conn.execute("DELETE FROM aggregate_lists", [])?;

    for (name, columns) in &table.schemas {
        conn.execute(
            "INSERT INTO aggregate_lists (source_list, columns_json) VALUES (?1, ?2)",
            params![name, serde_json::to_string(columns)?],
        )?;
    }

    let mut stmt = conn.prepare(
        "INSERT INTO aggregate_rows
         (position, cas_id, source_list, cas_name, attributes_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for (position, row) in table.rows.iter().enumerate() {
        stmt.execute(params![
            position as i64,
            row.cas_id,
            row.source_list,
            row.cas_name,
            serde_json::to_string(&row.attributes)?,
            fmt_ts(&row.created_at),
            fmt_ts(&row.updated_at),
        ])?;
    }

    conn.execute(
        "INSERT INTO aggregate_meta (id, persisted_at) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET persisted_at = excluded.persisted_at",
        params![fmt_ts(&Utc::now())],
    )?;
    Ok(())
}

fn insert_history(conn: &Connection, changes: &[ChangeRecord]) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(
        "INSERT INTO change_history
         (timestamp, change_type, source_list, cas_id, cas_name, modified_fields, record_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for change in changes {
        stmt.execute(params![
            fmt_ts(&change.timestamp),
            change.change_type.as_str(),
            change.source_list,
            change.cas_id,
            change.cas_name,
            change.modified_field_names().join(", "),
            serde_json::to_string(change)?,
        ])?;
    }
    Ok(())
}

fn insert_summaries(conn: &Connection, summaries: &[ListSummary]) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(
        "INSERT INTO load_summaries
         (timestamp, source_list, insertions, modifications, deletions, load_failed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for s in summaries {
        stmt.execute(params![
            fmt_ts(&s.timestamp),
            s.source_list,
            s.insertions as i64,
            s.modifications as i64,
            s.deletions as i64,
            s.load_failed,
        ])?;
    }
    Ok(())
}

impl StateStore for SqliteStore {
    fn load_aggregate(&self) -> Result<Option<AggregateTable>, StoreError> {
        let persisted: Option<String> = self
            .conn
            .query_row("SELECT persisted_at FROM aggregate_meta WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        if persisted.is_none() {
            return Ok(None);
        }

        let mut table = AggregateTable::default();

        let mut stmt = self
            .conn
            .prepare("SELECT source_list, columns_json FROM aggregate_lists ORDER BY source_list")?;
        let lists = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for entry in lists {
            let (name, columns_json) = entry?;
            table.schemas.insert(name, serde_json::from_str(&columns_json)?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT cas_id, source_list, cas_name, attributes_json, created_at, updated_at
             FROM aggregate_rows ORDER BY position ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        for entry in rows {
            let (cas_id, source_list, cas_name, attributes_json, created_at, updated_at) = entry?;
            table.rows.push(AggregateRow {
                cas_id,
                source_list,
                cas_name,
                attributes: serde_json::from_str(&attributes_json)?,
                created_at: parse_ts(&created_at)?,
                updated_at: parse_ts(&updated_at)?,
            });
        }

        log::debug!("📤 Loaded aggregate: {} row(s)", table.len());
        Ok(Some(table))
    }

    fn save_aggregate(&mut self, table: &AggregateTable) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        write_aggregate(&tx, table)?;
        tx.commit()?;
        log::info!("💾 Aggregate written to SQLite: {} row(s)", table.len());
        Ok(())
    }

    fn load_history(&self) -> Result<HistoryLog, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record_json FROM change_history ORDER BY id ASC")?;
        let records = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut entries = Vec::new();
        for json in records {
            entries.push(serde_json::from_str::<ChangeRecord>(&json?)?);
        }
        Ok(HistoryLog::from_entries(entries))
    }

    fn append_history(&mut self, changes: &[ChangeRecord]) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        insert_history(&tx, changes)?;
        tx.commit()?;

        log::debug!("✅ Appended {} change(s) to history", changes.len());
        Ok(())
    }

    fn prune_history(&mut self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM change_history WHERE timestamp < ?1",
            params![fmt_ts(&cutoff)],
        )?;
        Ok(removed)
    }

    fn append_summaries(&mut self, summaries: &[ListSummary]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        insert_summaries(&tx, summaries)?;
        tx.commit()?;
        Ok(())
    }

    /// Aggregate, history and summaries in one transaction
    fn commit_cycle(
        &mut self,
        aggregate: Option<&AggregateTable>,
        changes: &[ChangeRecord],
        summaries: &[ListSummary],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        insert_history(&tx, changes)?;
        insert_summaries(&tx, summaries)?;
        if let Some(table) = aggregate {
            write_aggregate(&tx, table)?;
        }
        tx.commit()?;

        log::info!(
            "💾 Cycle committed to SQLite: {} change(s), aggregate {}",
            changes.len(),
            match aggregate {
                Some(table) => format!("written ({} row(s))", table.len()),
                None => "unchanged".to_string(),
            }
        );
        Ok(())
    }

    fn load_summaries(&self) -> Result<Vec<ListSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, source_list, insertions, modifications, deletions, load_failed
             FROM load_summaries ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for entry in rows {
            let (timestamp, source_list, insertions, modifications, deletions, load_failed) = entry?;
            out.push(ListSummary {
                timestamp: parse_ts(&timestamp)?,
                source_list,
                insertions: insertions.max(0) as usize,
                modifications: modifications.max(0) as usize,
                deletions: deletions.max(0) as usize,
                load_failed,
            });
        }
        Ok(newest_first(out))
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

impl SqliteStore {
    /// Count history rows of one change type without loading them
    pub fn count_changes(&self, change_type: ChangeType) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM change_history WHERE change_type = ?1",
            params![change_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }
}

//! Change-detection and timestamp-reconciliation engine
//!
//! # Architecture
//!
//! ```text
//! SourceLoader (one ListTable per configured list)
//!     ↓
//! Aggregator::reconcile (previous aggregate → new aggregate + WriteDecision)
//!     ↓
//! ChangeDetector::detect_all_changes (previous per-list snapshots vs new)
//!     ↓
//! HistoryLog / StateStore (append-only change history + load summaries)
//! ```
//!
//! `UpdateCycle` drives one synchronous pass through all of it.

pub mod aggregator;
pub mod change;
pub mod cycle;
pub mod detector;
pub mod history;
pub mod summary;

pub use aggregator::{
    AggregateRow, AggregateTable, Aggregator, ReconcileOptions, ReconcileStats, Reconciliation,
    WriteDecision,
};
pub use change::{ChangeRecord, ChangeType, FieldChange};
pub use cycle::{CycleError, CycleOptions, CycleReport, ListFailure, UpdateCycle};
pub use detector::ChangeDetector;
pub use history::HistoryLog;
pub use summary::{mark_failed, summarize, ListSummary};

use chrono::{DateTime, Utc};

/// Clock used to stamp detections and lifecycle timestamps
pub type NowFn = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

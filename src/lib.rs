//! ECHA substance-list change tracking
//!
//! Loads the configured regulatory lists, keeps one aggregate table with
//! per-row lifecycle timestamps, and records every insertion, deletion and
//! modification between consecutive loads.

pub mod archive;
pub mod config;
pub mod engine;
pub mod source;
pub mod store;
pub mod table;

pub use config::{AppConfig, BackendType, ConfigError, ListSpec, ListsConfig};
pub use engine::{ChangeRecord, ChangeType, CycleError, CycleOptions, CycleReport, UpdateCycle};
pub use source::{FileSourceLoader, LoadError, SourceLoader};
pub use store::{open_store, StateStore, StoreError};
pub use table::{CellValue, ListTable, SubstanceRecord};

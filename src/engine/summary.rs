//! Per-list load summaries
//!
//! Each update cycle records how many insertions, modifications and deletions
//! every list saw, so past loads can be reviewed without scanning the full
//! change history.

use super::change::{ChangeRecord, ChangeType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSummary {
    pub timestamp: DateTime<Utc>,
    pub source_list: String,
    pub insertions: usize,
    pub modifications: usize,
    pub deletions: usize,
    /// The list could not be loaded this cycle; the counts are zero
    #[serde(default)]
    pub load_failed: bool,
}

impl ListSummary {
    pub fn total(&self) -> usize {
        self.insertions + self.modifications + self.deletions
    }

    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }

    pub fn status(&self) -> &'static str {
        if self.load_failed {
            "failed"
        } else if self.has_changes() {
            "changed"
        } else {
            "unchanged"
        }
    }
}

/// One summary row per list name, sorted by name
///
/// Lists with no change still get a row so an idle list is visible.
/// Callers flag lists that failed to load with `mark_failed`.
pub fn summarize<'a>(
    timestamp: DateTime<Utc>,
    list_names: impl IntoIterator<Item = &'a str>,
    changes: &[ChangeRecord],
) -> Vec<ListSummary> {
    let mut names: BTreeSet<&str> = list_names.into_iter().collect();
    names.extend(changes.iter().map(|c| c.source_list.as_str()));

    names
        .into_iter()
        .map(|name| {
            let count = |t: ChangeType| {
                changes
                    .iter()
                    .filter(|c| c.source_list == name && c.change_type == t)
                    .count()
            };
            ListSummary {
                timestamp,
                source_list: name.to_string(),
                insertions: count(ChangeType::Insertion),
                modifications: count(ChangeType::Modification),
                deletions: count(ChangeType::Deletion),
                load_failed: false,
            }
        })
        .collect()
}

/// Flag the rows of lists that failed to load, adding rows for any missing
pub fn mark_failed<'a>(
    summaries: &mut Vec<ListSummary>,
    timestamp: DateTime<Utc>,
    failed: impl IntoIterator<Item = &'a str>,
) {
    for name in failed {
        match summaries.iter_mut().find(|s| s.source_list == name) {
            Some(summary) => summary.load_failed = true,
            None => summaries.push(ListSummary {
                timestamp,
                source_list: name.to_string(),
                insertions: 0,
                modifications: 0,
                deletions: 0,
                load_failed: true,
            }),
        }
    }
    summaries.sort_by(|a, b| a.source_list.cmp(&b.source_list));
}

//! Change records emitted by the detector and kept in the history log

use crate::table::{CellValue, SubstanceRecord, CAS_NAME};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insertion,
    Deletion,
    Modification,
}

impl ChangeType {
    pub fn all() -> [ChangeType; 3] {
        [ChangeType::Insertion, ChangeType::Deletion, ChangeType::Modification]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insertion => "insertion",
            ChangeType::Deletion => "deletion",
            ChangeType::Modification => "modification",
        }
    }

}

impl std::str::FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "insertion" => Ok(ChangeType::Insertion),
            "deletion" => Ok(ChangeType::Deletion),
            "modification" => Ok(ChangeType::Modification),
            other => Err(format!("unknown change type '{}'", other)),
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One differing attribute of a modified record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: CellValue,
    pub new: CellValue,
}

/// A detected insertion, deletion or modification of one substance in one list
///
/// Immutable once written to the history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub timestamp: DateTime<Utc>,
    pub change_type: ChangeType,
    pub source_list: String,
    pub cas_id: String,
    pub cas_name: String,
    /// Only populated for modifications
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_fields: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_values: Option<BTreeMap<String, CellValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_values: Option<BTreeMap<String, CellValue>>,
}

impl ChangeRecord {
    pub fn insertion(timestamp: DateTime<Utc>, source_list: &str, new: &SubstanceRecord) -> Self {
        Self {
            timestamp,
            change_type: ChangeType::Insertion,
            source_list: source_list.to_string(),
            cas_id: new.cas_id.clone(),
            cas_name: new.cas_name.clone(),
            modified_fields: Vec::new(),
            old_values: None,
            new_values: Some(snapshot(new)),
        }
    }

    pub fn deletion(timestamp: DateTime<Utc>, source_list: &str, old: &SubstanceRecord) -> Self {
        Self {
            timestamp,
            change_type: ChangeType::Deletion,
            source_list: source_list.to_string(),
            cas_id: old.cas_id.clone(),
            cas_name: old.cas_name.clone(),
            modified_fields: Vec::new(),
            old_values: Some(snapshot(old)),
            new_values: None,
        }
    }

    pub fn modification(
        timestamp: DateTime<Utc>,
        source_list: &str,
        old: &SubstanceRecord,
        new: &SubstanceRecord,
        modified_fields: Vec<FieldChange>,
    ) -> Self {
        Self {
            timestamp,
            change_type: ChangeType::Modification,
            source_list: source_list.to_string(),
            cas_id: new.cas_id.clone(),
            cas_name: new.cas_name.clone(),
            modified_fields,
            old_values: Some(snapshot(old)),
            new_values: Some(snapshot(new)),
        }
    }

    /// Names of the changed fields (empty unless this is a modification)
    pub fn modified_field_names(&self) -> Vec<&str> {
        self.modified_fields.iter().map(|f| f.field.as_str()).collect()
    }
}

/// Row values as stored alongside a change, name included
fn snapshot(record: &SubstanceRecord) -> BTreeMap<String, CellValue> {
    let mut values = record.attributes.clone();
    values.insert(CAS_NAME.to_string(), CellValue::Text(record.cas_name.clone()));
    values
}

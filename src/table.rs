//! Per-list substance tables
//!
//! Every source list is loaded into a `ListTable`: rows keyed by `cas_id`, each
//! carrying a `cas_name` and a map of list-specific attribute values. The
//! attribute column set is declared per table so comparisons can be explicit
//! about which columns two snapshots have in common.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Key column holding the CAS registry number
pub const CAS_ID: &str = "cas_id";

/// Key column holding the substance name
pub const CAS_NAME: &str = "cas_name";

static NULL: CellValue = CellValue::Null;

/// A single spreadsheet cell
///
/// Missing attributes and empty cells are both `Null`, and `Null == Null`,
/// so two blank cells never count as a difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Parse a raw text cell: empty ⇒ Null, numeric ⇒ Number, otherwise Text
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return CellValue::Null;
        }
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => CellValue::Number(n),
            _ => CellValue::Text(trimmed.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Render the value as plain text (Null renders empty)
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Number(n) => n.to_string(),
            CellValue::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

/// One logical row of a source list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstanceRecord {
    pub cas_id: String,
    pub cas_name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, CellValue>,
}

impl SubstanceRecord {
    pub fn new(cas_id: impl Into<String>, cas_name: impl Into<String>) -> Self {
        Self {
            cas_id: cas_id.into(),
            cas_name: cas_name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with(mut self, column: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.attributes.insert(column.into(), value.into());
        self
    }

    /// Attribute value, `Null` when the column is absent
    pub fn attr(&self, column: &str) -> &CellValue {
        self.attributes.get(column).unwrap_or(&NULL)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableError {
    DuplicateCasId { list: String, cas_id: String },
    EmptyCasId { list: String, row: usize },
    MissingKeyColumn { list: String, column: String },
}

impl std::fmt::Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableError::DuplicateCasId { list, cas_id } => {
                write!(f, "Duplicate cas_id '{}' in list '{}'", cas_id, list)
            }
            TableError::EmptyCasId { list, row } => {
                write!(f, "Empty cas_id at row {} of list '{}'", row, list)
            }
            TableError::MissingKeyColumn { list, column } => {
                write!(f, "Missing key column '{}' in list '{}'", column, list)
            }
        }
    }
}

impl std::error::Error for TableError {}

/// A loaded snapshot of one source list
#[derive(Debug, Clone, PartialEq)]
pub struct ListTable {
    name: String,
    columns: Vec<String>,
    rows: Vec<SubstanceRecord>,
    index: HashMap<String, usize>,
}

impl ListTable {
    /// Build a table, rejecting empty or duplicate `cas_id` values
    ///
    /// `columns` is the declared attribute schema; the key columns are
    /// stripped from it if present. Row attributes outside the schema are
    /// dropped so every row agrees with the declared column set.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<String>,
        rows: Vec<SubstanceRecord>,
    ) -> Result<Self, TableError> {
        let name = name.into();

        let mut seen = HashSet::new();
        let columns: Vec<String> = columns
            .into_iter()
            .filter(|c| c != CAS_ID && c != CAS_NAME)
            .filter(|c| seen.insert(c.clone()))
            .collect();
        let allowed: HashSet<&str> = columns.iter().map(String::as_str).collect();

        let mut index = HashMap::with_capacity(rows.len());
        let mut kept = Vec::with_capacity(rows.len());

        for (i, mut row) in rows.into_iter().enumerate() {
            row.cas_id = row.cas_id.trim().to_string();
            if row.cas_id.is_empty() {
                return Err(TableError::EmptyCasId { list: name, row: i });
            }
            if index.contains_key(&row.cas_id) {
                return Err(TableError::DuplicateCasId {
                    list: name,
                    cas_id: row.cas_id,
                });
            }
            row.attributes.retain(|k, _| allowed.contains(k.as_str()));
            index.insert(row.cas_id.clone(), kept.len());
            kept.push(row);
        }

        Ok(Self {
            name,
            columns,
            rows: kept,
            index,
        })
    }

    /// Empty table with the given schema
    pub fn empty(name: impl Into<String>, columns: Vec<String>) -> Self {
        // Cannot fail: no rows
        Self {
            name: name.into(),
            columns: columns
                .into_iter()
                .filter(|c| c != CAS_ID && c != CAS_NAME)
                .collect(),
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in load order
    pub fn rows(&self) -> &[SubstanceRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, cas_id: &str) -> Option<&SubstanceRecord> {
        self.index.get(cas_id).map(|&i| &self.rows[i])
    }

    pub fn contains(&self, cas_id: &str) -> bool {
        self.index.contains_key(cas_id)
    }

    /// All keys, sorted
    pub fn sorted_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.index.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Attribute columns present in both tables, in this table's order
    pub fn common_columns<'a>(&'a self, other: &ListTable) -> Vec<&'a str> {
        common_columns(&self.columns, &other.columns)
    }
}

/// Columns of `ours` that also appear in `theirs`, in `ours` order
pub fn common_columns<'a>(ours: &'a [String], theirs: &[String]) -> Vec<&'a str> {
    let theirs: HashSet<&str> = theirs.iter().map(String::as_str).collect();
    ours.iter()
        .map(String::as_str)
        .filter(|c| theirs.contains(c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_cells() {
        assert_eq!(CellValue::parse(""), CellValue::Null);
        assert_eq!(CellValue::parse("   "), CellValue::Null);
        assert_eq!(CellValue::parse("12.5"), CellValue::Number(12.5));
        assert_eq!(CellValue::parse(" Annex XIV "), CellValue::Text("Annex XIV".to_string()));
        // Not a finite number
        assert_eq!(CellValue::parse("NaN"), CellValue::Text("NaN".to_string()));
    }

    #[test]
    fn test_duplicate_cas_id_rejected() {
        let rows = vec![
            SubstanceRecord::new("50-00-0", "Formaldehyde"),
            SubstanceRecord::new("50-00-0", "Formaldehyde again"),
        ];
        let err = ListTable::new("restriction", vec![], rows).unwrap_err();
        assert_eq!(
            err,
            TableError::DuplicateCasId {
                list: "restriction".to_string(),
                cas_id: "50-00-0".to_string()
            }
        );
    }

    #[test]
    fn test_empty_cas_id_rejected() {
        let rows = vec![SubstanceRecord::new("  ", "Nameless")];
        let err = ListTable::new("restriction", vec![], rows).unwrap_err();
        assert!(matches!(err, TableError::EmptyCasId { row: 0, .. }));
    }

    #[test]
    fn test_schema_strips_keys_and_unknown_attributes() {
        let rows = vec![SubstanceRecord::new("7440-43-9", "Cadmium")
            .with("info_1", "x")
            .with("stray", "y")];
        let table = ListTable::new("authorisation", cols(&["cas_id", "cas_name", "info_1"]), rows)
            .unwrap();

        assert_eq!(table.columns(), &["info_1".to_string()]);
        let row = table.get("7440-43-9").unwrap();
        assert_eq!(row.attr("info_1"), &CellValue::from("x"));
        assert_eq!(row.attr("stray"), &CellValue::Null);
    }

    #[test]
    fn test_common_columns_keeps_order() {
        let a = ListTable::empty("a", cols(&["info_3", "info_1", "info_9"]));
        let b = ListTable::empty("a", cols(&["info_1", "info_3"]));
        assert_eq!(a.common_columns(&b), vec!["info_3", "info_1"]);
    }

    #[test]
    fn test_sorted_ids() {
        let rows = vec![
            SubstanceRecord::new("C3", "c"),
            SubstanceRecord::new("A1", "a"),
            SubstanceRecord::new("B2", "b"),
        ];
        let table = ListTable::new("l", vec![], rows).unwrap();
        assert_eq!(table.sorted_ids(), vec!["A1", "B2", "C3"]);
        assert_eq!(table.rows()[0].cas_id, "C3");
    }
}

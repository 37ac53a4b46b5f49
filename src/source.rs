//! Source list loading
//!
//! Reads each configured list file into a `ListTable`. Two formats are
//! understood, picked by file extension:
//! - `.csv`: header row, comma separated, double-quoted fields
//! - `.json`: an array of flat objects
//!
//! Both must provide `cas_id` and `cas_name`. Anything else becomes a
//! list-specific attribute column.

use crate::config::ListSpec;
use crate::table::{CellValue, ListTable, SubstanceRecord, TableError, CAS_ID, CAS_NAME};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum LoadError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, message: String },
    SchemaMismatch(TableError),
    UnsupportedFormat(PathBuf),
}

impl From<TableError> for LoadError {
    fn from(err: TableError) -> Self {
        LoadError::SchemaMismatch(err)
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io { path, source } => write!(f, "Cannot read {}: {}", path.display(), source),
            LoadError::Parse { path, message } => {
                write!(f, "Cannot parse {}: {}", path.display(), message)
            }
            LoadError::SchemaMismatch(e) => write!(f, "Schema mismatch: {}", e),
            LoadError::UnsupportedFormat(path) => {
                write!(f, "Unsupported file format: {}", path.display())
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// Produces per-list tables for the update cycle
pub trait SourceLoader {
    /// Load one configured list
    fn load_list(&self, spec: &ListSpec) -> Result<ListTable, LoadError>;

    /// Load the master CAS reference, if one is configured
    fn load_cas_source(&self, file: &str) -> Result<CasRegistry, LoadError>;

    /// On-disk location of a list file, for loaders backed by files
    fn source_path(&self, _file: &str) -> Option<PathBuf> {
        None
    }
}

/// Known CAS identifiers from the master reference file
#[derive(Debug, Clone, Default)]
pub struct CasRegistry {
    ids: HashSet<String>,
}

impl CasRegistry {
    pub fn new(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            ids: ids.into_iter().map(|id| id.trim().to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, cas_id: &str) -> bool {
        self.ids.contains(cas_id)
    }

    /// Identifiers of `table` missing from the registry, sorted
    pub fn unknown_ids<'a>(&self, table: &'a ListTable) -> Vec<&'a str> {
        table
            .sorted_ids()
            .into_iter()
            .filter(|id| !self.contains(id))
            .collect()
    }
}

/// Loader reading list files from one input directory
pub struct FileSourceLoader {
    input_dir: PathBuf,
}

impl FileSourceLoader {
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
        }
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    fn read_columns(&self, file: &str) -> Result<(Vec<String>, Vec<BTreeMap<String, CellValue>>), LoadError> {
        let path = self.input_dir.join(file);
        let content = std::fs::read_to_string(&path).map_err(|source| LoadError::Io {
            path: path.clone(),
            source,
        })?;

        match path.extension().and_then(|s| s.to_str()).map(str::to_lowercase).as_deref() {
            Some("csv") => parse_csv(&content).map_err(|message| LoadError::Parse { path, message }),
            Some("json") => parse_json(&content).map_err(|message| LoadError::Parse { path, message }),
            _ => Err(LoadError::UnsupportedFormat(path)),
        }
    }
}

impl SourceLoader for FileSourceLoader {
    fn source_path(&self, file: &str) -> Option<PathBuf> {
        Some(self.input_dir.join(file))
    }

    fn load_list(&self, spec: &ListSpec) -> Result<ListTable, LoadError> {
        let (header, records) = self.read_columns(&spec.file)?;
        let table = build_table(spec, &header, records)?;
        log::info!(
            "📥 Loaded list '{}' from {}: {} row(s), {} attribute column(s)",
            spec.name,
            spec.file,
            table.len(),
            table.columns().len()
        );
        Ok(table)
    }

    fn load_cas_source(&self, file: &str) -> Result<CasRegistry, LoadError> {
        let (header, records) = self.read_columns(file)?;
        if !header.iter().any(|c| c == CAS_ID) {
            return Err(LoadError::SchemaMismatch(TableError::MissingKeyColumn {
                list: file.to_string(),
                column: CAS_ID.to_string(),
            }));
        }
        let registry = CasRegistry::new(
            records
                .into_iter()
                .filter_map(|mut r| r.remove(CAS_ID))
                .map(|v| v.as_text())
                .filter(|id| !id.trim().is_empty()),
        );
        log::info!("📚 CAS reference loaded: {} identifier(s)", registry.len());
        Ok(registry)
    }
}

/// Turn raw column maps into a validated table for `spec`
fn build_table(
    spec: &ListSpec,
    header: &[String],
    records: Vec<BTreeMap<String, CellValue>>,
) -> Result<ListTable, LoadError> {
    for key in [CAS_ID, CAS_NAME] {
        if !header.iter().any(|c| c == key) {
            return Err(LoadError::SchemaMismatch(TableError::MissingKeyColumn {
                list: spec.name.clone(),
                column: key.to_string(),
            }));
        }
    }

    let columns: Vec<String> = match &spec.columns {
        Some(declared) => {
            let missing: Vec<&str> = declared
                .iter()
                .filter(|c| !header.contains(c))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                log::warn!(
                    "⚠️  List '{}' is missing declared column(s) {:?}; they are left out of comparisons",
                    spec.name,
                    missing
                );
            }
            declared.iter().filter(|c| header.contains(c)).cloned().collect()
        }
        None => header
            .iter()
            .filter(|c| c.as_str() != CAS_ID && c.as_str() != CAS_NAME)
            .cloned()
            .collect(),
    };

    let rows = records
        .into_iter()
        .map(|mut r| {
            let cas_id = r.remove(CAS_ID).map(|v| v.as_text()).unwrap_or_default();
            let cas_name = r.remove(CAS_NAME).map(|v| v.as_text()).unwrap_or_default();
            SubstanceRecord {
                cas_id,
                cas_name,
                attributes: r,
            }
        })
        .collect();

    Ok(ListTable::new(spec.name.clone(), columns, rows)?)
}

fn parse_json(content: &str) -> Result<(Vec<String>, Vec<BTreeMap<String, CellValue>>), String> {
    let value: serde_json::Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let items = value
        .as_array()
        .ok_or_else(|| "expected an array of objects".to_string())?;

    let mut header = Vec::new();
    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(items.len());

    for (i, item) in items.iter().enumerate() {
        let object = item
            .as_object()
            .ok_or_else(|| format!("item {} is not an object", i))?;
        let mut record = BTreeMap::new();
        for (key, raw) in object {
            if seen.insert(key.clone()) {
                header.push(key.clone());
            }
            let cell = match raw {
                serde_json::Value::Null => CellValue::Null,
                serde_json::Value::Bool(b) => CellValue::Bool(*b),
                serde_json::Value::Number(n) => n
                    .as_f64()
                    .map(CellValue::Number)
                    .unwrap_or_else(|| CellValue::Text(n.to_string())),
                serde_json::Value::String(s) if s.trim().is_empty() => CellValue::Null,
                serde_json::Value::String(s) => CellValue::Text(s.trim().to_string()),
                other => CellValue::Text(other.to_string()),
            };
            // Identifiers stay textual even when they look numeric
            let cell = match (key.as_str(), cell) {
                (CAS_ID | CAS_NAME, CellValue::Number(n)) => CellValue::Text(n.to_string()),
                (_, cell) => cell,
            };
            record.insert(key.clone(), cell);
        }
        records.push(record);
    }

    Ok((header, records))
}

fn parse_csv(content: &str) -> Result<(Vec<String>, Vec<BTreeMap<String, CellValue>>), String> {
    let mut records = parse_csv_records(content)?.into_iter();

    let header: Vec<String> = match records.next() {
        Some(fields) => fields.into_iter().map(|h| h.trim().to_string()).collect(),
        None => return Ok((Vec::new(), Vec::new())),
    };

    let mut rows = Vec::new();
    for (i, fields) in records.enumerate() {
        if fields.len() > header.len() {
            return Err(format!(
                "record {} has {} fields but the header has {}",
                i + 1,
                fields.len(),
                header.len()
            ));
        }
        let row = header
            .iter()
            .enumerate()
            .map(|(col, name)| {
                let raw = fields.get(col).map(String::as_str).unwrap_or("");
                let cell = if name == CAS_ID || name == CAS_NAME {
                    match raw.trim() {
                        "" => CellValue::Null,
                        s => CellValue::Text(s.to_string()),
                    }
                } else {
                    CellValue::parse(raw)
                };
                (name.clone(), cell)
            })
            .collect();
        rows.push(row);
    }

    Ok((header, rows))
}

/// Split CSV content into records, honouring double quotes and `""` escapes
///
/// A quoted field may span line breaks: records end only at a newline
/// outside quotes. `\r\n` is read as `\n` everywhere and blank lines are
/// skipped.
fn parse_csv_records(content: &str) -> Result<Vec<Vec<String>>, String> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut chars = content.trim_start_matches('\u{feff}').chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            ',' if !in_quotes => record.push(std::mem::take(&mut field)),
            '\n' if !in_quotes => {
                record.push(std::mem::take(&mut field));
                push_record(&mut records, std::mem::take(&mut record), quoted);
                quoted = false;
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(format!("unterminated quoted field in record {}", records.len() + 1));
    }
    if quoted || !record.is_empty() || !field.is_empty() {
        record.push(field);
        push_record(&mut records, record, quoted);
    }

    Ok(records)
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>, quoted: bool) {
    let blank = !quoted && record.len() == 1 && record[0].trim().is_empty();
    if !blank {
        records.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(name: &str, file: &str, columns: Option<Vec<&str>>) -> ListSpec {
        ListSpec {
            name: name.to_string(),
            file: file.to_string(),
            description: None,
            columns: columns.map(|c| c.into_iter().map(String::from).collect()),
        }
    }

    #[test]
    fn test_parse_csv_records_quotes() {
        assert_eq!(
            parse_csv_records(r#"50-00-0,"Formaldehyde, solution","say ""hi""",3"#).unwrap(),
            vec![vec!["50-00-0", "Formaldehyde, solution", r#"say "hi""#, "3"]]
        );
        assert_eq!(
            parse_csv_records("a,,b\r\n\r\nc,d,\n").unwrap(),
            vec![vec!["a", "", "b"], vec!["c", "d", ""]]
        );
        assert!(parse_csv_records("a,\"open\nb").is_err());
    }

    #[test]
    fn test_quoted_newline_stays_in_one_record() {
        let content = "cas_id,cas_name,info_1\n\
                       7440-43-9,\"Cadmium\nand compounds\",x\n\
                       50-00-0,Formaldehyde,y\n";
        let (header, rows) = parse_csv(content).unwrap();
        assert_eq!(header, vec!["cas_id", "cas_name", "info_1"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][CAS_ID], CellValue::from("7440-43-9"));
        assert_eq!(rows[0][CAS_NAME], CellValue::from("Cadmium\nand compounds"));
        assert_eq!(rows[0]["info_1"], CellValue::from("x"));
        assert_eq!(rows[1][CAS_ID], CellValue::from("50-00-0"));

        // Same file with Windows line endings
        let (_, rows) = parse_csv(&content.replace('\n', "\r\n")).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][CAS_NAME], CellValue::from("Cadmium\nand compounds"));
    }

    #[test]
    fn test_load_csv_list() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("annex_xiv.csv"),
            "cas_id,cas_name,info_1,sunset_date\n\
             7440-43-9,Cadmium,12,2024-01-01\n\
             50-00-0,\"Formaldehyde, solution\",,\n",
        )
        .unwrap();

        let loader = FileSourceLoader::new(dir.path());
        let table = loader.load_list(&spec("annex_xiv", "annex_xiv.csv", None)).unwrap();

        assert_eq!(table.name(), "annex_xiv");
        assert_eq!(table.columns(), &["info_1".to_string(), "sunset_date".to_string()]);
        assert_eq!(table.len(), 2);
        let cadmium = table.get("7440-43-9").unwrap();
        assert_eq!(cadmium.attr("info_1"), &CellValue::Number(12.0));
        let formaldehyde = table.get("50-00-0").unwrap();
        assert_eq!(formaldehyde.cas_name, "Formaldehyde, solution");
        assert_eq!(formaldehyde.attr("info_1"), &CellValue::Null);
    }

    #[test]
    fn test_load_json_list_with_declared_columns() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("restriction.json"),
            r#"[
                {"cas_id": "7439-92-1", "cas_name": "Lead", "entry": 63, "notes": "ignored"},
                {"cas_id": "7440-02-0", "cas_name": "Nickel", "entry": 27, "notes": null}
            ]"#,
        )
        .unwrap();

        let loader = FileSourceLoader::new(dir.path());
        let table = loader
            .load_list(&spec("restriction", "restriction.json", Some(vec!["entry", "absent"])))
            .unwrap();

        assert_eq!(table.columns(), &["entry".to_string()]);
        assert_eq!(table.get("7439-92-1").unwrap().attr("entry"), &CellValue::Number(63.0));
        assert_eq!(table.get("7439-92-1").unwrap().attr("notes"), &CellValue::Null);
    }

    #[test]
    fn test_missing_key_column_is_schema_mismatch() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("broken.csv"), "id,cas_name\n1,Foo\n").unwrap();

        let loader = FileSourceLoader::new(dir.path());
        let err = loader.load_list(&spec("broken", "broken.csv", None)).unwrap_err();
        assert!(matches!(
            err,
            LoadError::SchemaMismatch(TableError::MissingKeyColumn { ref column, .. }) if column == "cas_id"
        ));
    }

    #[test]
    fn test_duplicate_cas_id_is_schema_mismatch() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("dup.csv"), "cas_id,cas_name\nA1,Foo\nA1,Bar\n").unwrap();

        let loader = FileSourceLoader::new(dir.path());
        let err = loader.load_list(&spec("dup", "dup.csv", None)).unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch(TableError::DuplicateCasId { .. })));
    }

    #[test]
    fn test_missing_file_and_unknown_format() {
        let dir = tempdir().unwrap();
        let loader = FileSourceLoader::new(dir.path());
        assert!(matches!(
            loader.load_list(&spec("gone", "gone.csv", None)),
            Err(LoadError::Io { .. })
        ));

        std::fs::write(dir.path().join("list.xlsx"), "binary").unwrap();
        assert!(matches!(
            loader.load_list(&spec("xlsx", "list.xlsx", None)),
            Err(LoadError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_cas_registry_reports_unknown_ids() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("cas_source.csv"), "cas_id,cas_name\nA1,Foo\nB2,Bar\n").unwrap();

        let loader = FileSourceLoader::new(dir.path());
        let registry = loader.load_cas_source("cas_source.csv").unwrap();
        assert_eq!(registry.len(), 2);

        let table = ListTable::new(
            "annex_xiv",
            vec![],
            vec![SubstanceRecord::new("Z9", "Unknown"), SubstanceRecord::new("A1", "Foo")],
        )
        .unwrap();
        assert_eq!(registry.unknown_ids(&table), vec!["Z9"]);
    }
}

//! Timestamped copies of loaded source files
//!
//! After a committed cycle each loaded list file can be copied to
//! `<archive_dir>/<list>_<YYYYmmdd_HHMMSS>.<ext>`, keeping the exact input
//! that produced a given history entry.

use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Archive file name for `list_name` loaded from `source` at `timestamp`
pub fn archive_name(list_name: &str, source: &Path, timestamp: DateTime<Utc>) -> String {
    let stamp = timestamp.format("%Y%m%d_%H%M%S");
    match source.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_{}.{}", list_name, stamp, ext),
        None => format!("{}_{}", list_name, stamp),
    }
}

/// Copy `source` into `archive_dir`, creating the directory if needed
pub fn archive_file(
    source: &Path,
    archive_dir: &Path,
    list_name: &str,
    timestamp: DateTime<Utc>,
) -> io::Result<PathBuf> {
    fs::create_dir_all(archive_dir)?;
    let target = archive_dir.join(archive_name(list_name, source, timestamp));
    fs::copy(source, &target)?;
    log::debug!("🗄️  Archived {} → {}", source.display(), target.display());
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_archive_copies_with_timestamped_name() {
        let input = tempdir().unwrap();
        let archive = tempdir().unwrap();
        let source = input.path().join("annex_xiv.csv");
        fs::write(&source, "cas_id,cas_name\nA1,Foo\n").unwrap();

        let ts = Utc.with_ymd_and_hms(2024, 7, 9, 14, 5, 3).unwrap();
        let target = archive_file(&source, &archive.path().join("nested"), "authorisation", ts).unwrap();

        assert_eq!(
            target.file_name().unwrap().to_str().unwrap(),
            "authorisation_20240709_140503.csv"
        );
        assert_eq!(fs::read_to_string(&target).unwrap(), "cas_id,cas_name\nA1,Foo\n");
        // Source left in place
        assert!(source.exists());
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let archive = tempdir().unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 7, 9, 14, 5, 3).unwrap();
        assert!(archive_file(Path::new("/nonexistent/list.json"), archive.path(), "x", ts).is_err());
        assert_eq!(archive_name("x", Path::new("noext"), ts), "x_20240709_140503");
    }
}

//! Remote file identity.

use chrono::{DateTime, Utc};

use crate::shortname::m20_timestamp;

/// One printable file found on the printer's storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    short_name: String,
    path: String,
    size: u64,
    modified: DateTime<Utc>,
    timestamp: String,
}

impl FileRecord {
    /// Create a record. `size` is 0 when the printer did not report one.
    pub fn new(short_name: String, path: String, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            short_name,
            path,
            size,
            timestamp: m20_timestamp(modified),
            modified,
        }
    }

    /// Legacy 8.3 name the host addresses the file by.
    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    /// Path on the printer, relative to the storage root.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Last modification time.
    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    /// Modification time in the host's packed hex encoding.
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Lower-cased base name of the path.
    pub fn canonical_name(&self) -> String {
        canonical_name(&self.path)
    }

    /// Whether the file name ends with one of `suffixes` (case-insensitive).
    pub fn has_suffix(&self, suffixes: &[&str]) -> bool {
        let name = self.canonical_name();
        suffixes
            .iter()
            .any(|suffix| name.ends_with(&suffix.to_lowercase()))
    }

    /// Line used in the host's file listing.
    pub fn log_line(&self) -> String {
        format!(
            "{} {} {} \"{}\"",
            self.short_name,
            self.size,
            self.timestamp,
            self.canonical_name()
        )
    }
}

/// Lower-cased base name of a remote path.
pub fn canonical_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(path: &str) -> FileRecord {
        let modified = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        FileRecord::new("benchy~1.3mf".into(), path.into(), 2048, modified)
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("cache/Benchy.GCODE.3mf"), "benchy.gcode.3mf");
        assert_eq!(canonical_name("Plain.3MF"), "plain.3mf");
    }

    #[test]
    fn test_log_line() {
        let record = record("cache/Benchy Boat.3mf");
        assert_eq!(
            record.log_line(),
            "benchy~1.3mf 2048 0x58616000 \"benchy boat.3mf\""
        );
    }

    #[test]
    fn test_compound_suffix() {
        let record = record("cache/Benchy.gcode.3mf");
        assert!(record.has_suffix(&[".gcode.3mf"]));
        assert!(record.has_suffix(&[".3MF"]));
        assert!(!record.has_suffix(&[".gcode"]));
        assert!(!record.has_suffix(&[]));
    }
}

//! The job currently on the print bed.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::record::FileRecord;

/// Archive suffixes a running task can resolve to.
pub const PROJECT_SUFFIXES: [&str; 2] = [".3mf", ".gcode.3mf"];

/// A file being printed and how far along it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintJob {
    /// File being printed.
    pub file: FileRecord,
    /// Progress in percent (0-100).
    pub progress: u8,
}

impl PrintJob {
    /// Create a job, clamping progress to 100.
    pub fn new(file: FileRecord, progress: u8) -> Self {
        Self {
            file,
            progress: progress.min(100),
        }
    }

    /// Byte position matching the progress, as the host expects it.
    pub fn file_position(&self) -> u64 {
        self.file.size() * u64::from(self.progress) / 100
    }

    /// Whether the printer reports the job as done.
    pub fn is_complete(&self) -> bool {
        self.progress >= 100
    }
}

/// Job slot shared between the state machine and the polling worker.
pub type SharedJob = Arc<RwLock<Option<PrintJob>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn file(size: u64) -> FileRecord {
        let modified = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        FileRecord::new("model.3mf".into(), "model.3mf".into(), size, modified)
    }

    #[test]
    fn test_file_position() {
        assert_eq!(PrintJob::new(file(1000), 40).file_position(), 400);
        assert_eq!(PrintJob::new(file(0), 40).file_position(), 0);
        assert_eq!(PrintJob::new(file(999), 100).file_position(), 999);
    }

    #[test]
    fn test_progress_is_clamped() {
        let job = PrintJob::new(file(10), 250);
        assert_eq!(job.progress, 100);
        assert!(job.is_complete());
    }
}

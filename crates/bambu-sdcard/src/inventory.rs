//! Printable files on the printer, addressed by legacy short names.
//!
//! The inventory scans the printer's storage over FTPS and keeps two caches
//! that are always swapped together: short name to [`FileRecord`], and
//! canonical name to [`FileRecord`]. Lookups accept either form; a short
//! name always resolves to its own file.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::record::{canonical_name, FileRecord};
use crate::shortname::dos_name;
use crate::transport::{RemoteFs, RemoteSession};

/// Directories scanned for project files, relative to the storage root.
pub const SCAN_DIRECTORIES: [&str; 2] = ["", "cache/"];

/// Extension of printable project files.
pub const PROJECT_EXTENSION: &str = ".3mf";

/// Result of a delete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The printer removed the file.
    Deleted,
    /// No cached file matches the name; nothing was sent.
    NotFound,
    /// The printer refused or the transport failed.
    Failed(String),
}

#[derive(Debug, Default)]
struct Caches {
    /// Short name to its own record. Short names are unique per scan.
    by_short: HashMap<String, FileRecord>,
    /// Canonical name to the first scanned record with that name.
    by_canonical: HashMap<String, FileRecord>,
    ordered: Vec<FileRecord>,
}

impl Caches {
    fn from_scan(scan: &[FileRecord]) -> Self {
        let mut caches = Caches::default();
        for record in scan {
            caches
                .by_short
                .insert(record.short_name().to_string(), record.clone());
            caches
                .by_canonical
                .entry(record.canonical_name())
                .or_insert_with(|| record.clone());
        }
        caches.ordered = scan.to_vec();
        caches
    }

    fn resolve(&self, name: &str) -> Option<&FileRecord> {
        let file_name = canonical_name(name);
        self.by_short
            .get(&file_name)
            .or_else(|| self.by_canonical.get(&file_name))
    }
}

/// Cached view of the printer's project files.
pub struct RemoteFileInventory {
    fs: Arc<dyn RemoteFs>,
    caches: RwLock<Caches>,
    selected: RwLock<Option<FileRecord>>,
    scan_lock: Mutex<()>,
}

impl RemoteFileInventory {
    /// Create an empty inventory backed by `fs`.
    pub fn new(fs: Arc<dyn RemoteFs>) -> Self {
        Self {
            fs,
            caches: RwLock::new(Caches::default()),
            selected: RwLock::new(None),
            scan_lock: Mutex::new(()),
        }
    }

    /// Rescan the printer and replace both caches.
    ///
    /// On error the previous caches stay in place.
    pub async fn refresh(&self) -> Result<Vec<FileRecord>> {
        let _scan = self.scan_lock.lock().await;

        let mut session = self.fs.connect().await?;
        let scan = scan_session(session.as_mut()).await;
        if let Err(e) = session.quit().await {
            debug!("closing file session failed: {}", e);
        }
        let records = scan?;

        *self.caches.write().await = Caches::from_scan(&records);
        debug!(count = records.len(), "file inventory refreshed");
        Ok(records)
    }

    /// Rescan and return every file in scan order.
    pub async fn list_all(&self) -> Result<Vec<FileRecord>> {
        self.refresh().await?;
        Ok(self.cached().await)
    }

    /// Files from the last successful scan, without rescanning.
    pub async fn cached(&self) -> Vec<FileRecord> {
        self.caches.read().await.ordered.clone()
    }

    /// Find a file by short name or canonical name.
    pub async fn lookup(&self, name: &str) -> Option<FileRecord> {
        let record = self.caches.read().await.resolve(name).cloned();
        debug!(file = name, found = record.is_some(), "file lookup");
        record
    }

    /// Like [`lookup`](Self::lookup), but only for files ending in one of `suffixes`.
    pub async fn lookup_by_suffix(&self, name: &str, suffixes: &[&str]) -> Option<FileRecord> {
        self.lookup(name)
            .await
            .filter(|record| record.has_suffix(suffixes))
    }

    /// Select a file for printing.
    ///
    /// Returns `None` when no file matches. With `skip_if_selected` a repeat
    /// selection of the same file leaves the current selection untouched.
    pub async fn select(&self, name: &str, skip_if_selected: bool) -> Option<FileRecord> {
        let Some(record) = self.lookup(name).await else {
            error!("{} open failed", name);
            return None;
        };

        let mut selected = self.selected.write().await;
        if skip_if_selected {
            if let Some(current) = selected.as_ref().filter(|c| c.path() == record.path()) {
                return Some(current.clone());
            }
        }

        info!(
            "File opened: {}  Size: {}",
            record.canonical_name(),
            record.size()
        );
        *selected = Some(record.clone());
        Some(record)
    }

    /// Currently selected file.
    pub async fn selected(&self) -> Option<FileRecord> {
        self.selected.read().await.clone()
    }

    /// Whether a file is selected.
    pub async fn has_selected(&self) -> bool {
        self.selected.read().await.is_some()
    }

    /// Drop the current selection.
    pub async fn clear_selection(&self) {
        *self.selected.write().await = None;
    }

    /// Delete a file on the printer over a fresh session.
    ///
    /// Failures are logged and reported in the outcome, never returned as
    /// errors. Caches are left alone until the next scan.
    pub async fn delete(&self, name: &str) -> DeleteOutcome {
        let Some(record) = self.lookup(name).await else {
            debug!(file = name, "delete skipped, file not found");
            return DeleteOutcome::NotFound;
        };

        let outcome = match self.delete_remote(record.path()).await {
            Ok(true) => DeleteOutcome::Deleted,
            Ok(false) => DeleteOutcome::Failed("delete refused".into()),
            Err(e) => DeleteOutcome::Failed(e.to_string()),
        };
        match &outcome {
            DeleteOutcome::Failed(reason) => warn!("Error deleting file {}: {}", name, reason),
            _ => debug!("{} deleted", name),
        }
        outcome
    }

    async fn delete_remote(&self, path: &str) -> Result<bool> {
        let mut session = self.fs.connect().await?;
        let deleted = session.delete(path).await;
        if let Err(e) = session.quit().await {
            debug!("closing file session failed: {}", e);
        }
        deleted
    }
}

async fn scan_session(session: &mut dyn RemoteSession) -> Result<Vec<FileRecord>> {
    let mut entries = Vec::new();
    for directory in SCAN_DIRECTORIES {
        entries.extend(session.list_entries(directory, PROJECT_EXTENSION).await?);
    }

    let mut used = HashSet::new();
    let mut records = Vec::with_capacity(entries.len());
    for path in entries {
        let size = session.size(&path).await?;
        let modified = session.modified_time(&path).await?;
        let short_name = dos_name(&canonical_name(&path), &used)?;
        used.insert(short_name.clone());
        records.push(FileRecord::new(short_name, path, size.unwrap_or(0), modified));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFs, FakeFile};

    fn inventory(fs: &Arc<FakeFs>) -> RemoteFileInventory {
        RemoteFileInventory::new(fs.clone())
    }

    #[tokio::test]
    async fn test_case_only_duplicates_get_distinct_short_names() {
        let fs = FakeFs::with_files(vec![
            FakeFile::new("case.3mf", 10),
            FakeFile::new("CASE.3MF", 20),
        ]);
        let inventory = inventory(&fs);

        let records = inventory.refresh().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].short_name(), "case.3mf");
        assert_eq!(records[1].short_name(), "case~1.3mf");
        assert_ne!(records[0], records[1]);
    }

    #[tokio::test]
    async fn test_caches_match_scan() {
        let fs = FakeFs::with_files(vec![
            FakeFile::new("Benchy.gcode.3mf", 100),
            FakeFile::new("cache/Plate Two.3mf", 200),
            FakeFile::new("notes.txt", 1),
        ]);
        let inventory = inventory(&fs);
        let records = inventory.list_all().await.unwrap();

        let paths: Vec<_> = records.iter().map(|r| r.path()).collect();
        assert_eq!(paths, vec!["Benchy.gcode.3mf", "cache/Plate Two.3mf"]);

        let caches = inventory.caches.read().await;
        assert_eq!(caches.by_short.len(), 2);
        for (short, record) in &caches.by_short {
            assert_eq!(record.short_name(), short);
            assert!(caches.by_canonical.contains_key(&record.canonical_name()));
        }
        for record in caches.by_canonical.values() {
            assert!(caches.by_short.contains_key(record.short_name()));
        }
    }

    #[tokio::test]
    async fn test_short_name_resolves_to_its_own_file() {
        let fs = FakeFs::with_files(vec![
            FakeFile::new("case.3mf", 10),
            FakeFile::new("cache/CASE.3MF", 20),
        ]);
        let inventory = inventory(&fs);
        let records = inventory.refresh().await.unwrap();
        assert_eq!(records[1].short_name(), "case~1.3mf");

        let second = inventory.lookup("case~1.3mf").await.unwrap();
        assert_eq!(second, records[1]);
        assert_eq!(second.path(), "cache/CASE.3MF");
        assert_eq!(inventory.lookup("case.3mf").await.unwrap(), records[0]);

        let selected = inventory.select("case~1.3mf", false).await.unwrap();
        assert_eq!(selected.path(), "cache/CASE.3MF");

        assert_eq!(inventory.delete("case~1.3mf").await, DeleteOutcome::Deleted);
        assert_eq!(fs.deleted(), vec!["cache/CASE.3MF".to_string()]);
    }

    #[tokio::test]
    async fn test_lookup_is_alias_transparent() {
        let fs = FakeFs::with_files(vec![FakeFile::new("cache/Benchy Boat.3mf", 100)]);
        let inventory = inventory(&fs);
        inventory.refresh().await.unwrap();

        let by_short = inventory.lookup("benchy~1.3mf").await.unwrap();
        let by_canonical = inventory.lookup("Benchy Boat.3MF").await.unwrap();
        assert_eq!(by_short, by_canonical);
        assert_eq!(by_short.path(), "cache/Benchy Boat.3mf");
        assert!(inventory.lookup("/sd/benchy~1.3mf").await.is_some());
        assert!(inventory.lookup("other.3mf").await.is_none());
    }

    #[tokio::test]
    async fn test_lookup_by_suffix() {
        let fs = FakeFs::with_files(vec![
            FakeFile::new("benchy.gcode.3mf", 100),
            FakeFile::new("model.3mf", 100),
        ]);
        let inventory = inventory(&fs);
        inventory.refresh().await.unwrap();

        assert!(inventory
            .lookup_by_suffix("benchy.gcode.3mf", &[".gcode.3mf"])
            .await
            .is_some());
        assert!(inventory
            .lookup_by_suffix("model.3mf", &[".gcode.3mf"])
            .await
            .is_none());
        assert!(inventory
            .lookup_by_suffix("model.3mf", &[".3mf", ".gcode.3mf"])
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_caches() {
        let fs = FakeFs::with_files(vec![FakeFile::new("model.3mf", 100)]);
        let inventory = inventory(&fs);
        inventory.refresh().await.unwrap();

        fs.fail_listing(true);
        assert!(inventory.refresh().await.is_err());
        assert!(inventory.lookup("model.3mf").await.is_some());
        assert_eq!(inventory.cached().await.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_changed_files() {
        let fs = FakeFs::with_files(vec![FakeFile::new("old.3mf", 100)]);
        let inventory = inventory(&fs);
        inventory.refresh().await.unwrap();

        fs.set_files(vec![FakeFile::new("cache/new.3mf", 50)]);
        assert!(inventory.lookup("new.3mf").await.is_none());
        let records = inventory.list_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(inventory.lookup("new.3mf").await.is_some());
        assert!(inventory.lookup("old.3mf").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_size_becomes_zero() {
        let fs = FakeFs::with_files(vec![FakeFile::new("model.3mf", 100).without_size()]);
        let inventory = inventory(&fs);
        let records = inventory.refresh().await.unwrap();
        assert_eq!(records[0].size(), 0);
    }

    #[tokio::test]
    async fn test_select_missing_file_fails() {
        let fs = FakeFs::with_files(vec![]);
        let inventory = inventory(&fs);
        inventory.refresh().await.unwrap();

        assert!(inventory.select("missing.3mf", false).await.is_none());
        assert!(inventory.selected().await.is_none());
    }

    #[tokio::test]
    async fn test_select_is_idempotent_when_skipping() {
        let fs = FakeFs::with_files(vec![FakeFile::new("model.3mf", 100)]);
        let inventory = inventory(&fs);
        inventory.refresh().await.unwrap();

        let first = inventory.select("model.3mf", true).await.unwrap();
        let second = inventory.select("model.3mf", true).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inventory.selected().await.unwrap().timestamp(), first.timestamp());

        inventory.clear_selection().await;
        assert!(!inventory.has_selected().await);
    }

    #[tokio::test]
    async fn test_delete_unknown_file_does_not_connect() {
        let fs = FakeFs::with_files(vec![]);
        let inventory = inventory(&fs);

        assert_eq!(inventory.delete("ghost.3mf").await, DeleteOutcome::NotFound);
        assert_eq!(fs.connections(), 0);
    }

    #[tokio::test]
    async fn test_delete_uses_fresh_session() {
        let fs = FakeFs::with_files(vec![FakeFile::new("cache/model.3mf", 100)]);
        let inventory = inventory(&fs);
        inventory.refresh().await.unwrap();

        assert_eq!(inventory.delete("model.3mf").await, DeleteOutcome::Deleted);
        assert_eq!(fs.connections(), 2);
        assert_eq!(fs.deleted(), vec!["cache/model.3mf".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_failure_is_reported_not_raised() {
        let fs = FakeFs::with_files(vec![FakeFile::new("model.3mf", 100)]);
        let inventory = inventory(&fs);
        inventory.refresh().await.unwrap();

        fs.refuse_deletes(true);
        assert!(matches!(
            inventory.delete("model.3mf").await,
            DeleteOutcome::Failed(_)
        ));
    }
}

//! In-memory collaborators for tests and dry runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::broadcast;

use crate::commands::PrinterCommand;
use crate::error::{BridgeError, Result};
use crate::status::{DeviceSnapshot, PrintState};
use crate::transport::{HostSink, RemoteFs, RemoteSession, TelemetryChannel};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A file stored on a [`FakeFs`].
#[derive(Debug, Clone)]
pub struct FakeFile {
    path: String,
    size: Option<u64>,
    modified: DateTime<Utc>,
}

impl FakeFile {
    /// A file at `path` (relative to the storage root).
    pub fn new(path: &str, size: u64) -> Self {
        Self {
            path: path.to_string(),
            size: Some(size),
            modified: Utc
                .with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
                .single()
                .unwrap_or_default(),
        }
    }

    /// Make the server unable to report the size.
    pub fn without_size(mut self) -> Self {
        self.size = None;
        self
    }

    fn directory(&self) -> &str {
        match self.path.rfind('/') {
            Some(index) => &self.path[..=index],
            None => "",
        }
    }
}

#[derive(Debug, Default)]
struct FsState {
    files: Vec<FakeFile>,
    deleted: Vec<String>,
    connections: usize,
    fail_listing: bool,
    refuse_deletes: bool,
}

/// File server keeping its files in memory.
#[derive(Debug, Default)]
pub struct FakeFs {
    state: Arc<Mutex<FsState>>,
}

impl FakeFs {
    /// A server holding `files`.
    pub fn with_files(files: Vec<FakeFile>) -> Arc<Self> {
        let fs = Self::default();
        lock(&fs.state).files = files;
        Arc::new(fs)
    }

    /// Replace the stored files.
    pub fn set_files(&self, files: Vec<FakeFile>) {
        lock(&self.state).files = files;
    }

    /// Make directory listings fail.
    pub fn fail_listing(&self, fail: bool) {
        lock(&self.state).fail_listing = fail;
    }

    /// Make deletes answer with a refusal.
    pub fn refuse_deletes(&self, refuse: bool) {
        lock(&self.state).refuse_deletes = refuse;
    }

    /// Number of sessions opened so far.
    pub fn connections(&self) -> usize {
        lock(&self.state).connections
    }

    /// Paths deleted so far.
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }
}

#[async_trait]
impl RemoteFs for FakeFs {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>> {
        lock(&self.state).connections += 1;
        Ok(Box::new(FakeSession {
            state: self.state.clone(),
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<FsState>>,
}

impl FakeSession {
    fn file(&self, path: &str) -> Option<FakeFile> {
        lock(&self.state)
            .files
            .iter()
            .find(|f| f.path == path)
            .cloned()
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn list_entries(&mut self, directory: &str, extension: &str) -> Result<Vec<String>> {
        let state = lock(&self.state);
        if state.fail_listing {
            return Err(BridgeError::ConnectionFailed("listing failed".into()));
        }
        let extension = extension.to_lowercase();
        Ok(state
            .files
            .iter()
            .filter(|f| f.directory() == directory)
            .filter(|f| f.path.to_lowercase().ends_with(&extension))
            .map(|f| f.path.clone())
            .collect())
    }

    async fn size(&mut self, path: &str) -> Result<Option<u64>> {
        Ok(self.file(path).and_then(|f| f.size))
    }

    async fn modified_time(&mut self, path: &str) -> Result<DateTime<Utc>> {
        self.file(path)
            .map(|f| f.modified)
            .ok_or_else(|| BridgeError::Ftp {
                code: 550,
                message: format!("{}: No such file", path),
            })
    }

    async fn delete(&mut self, path: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        if state.refuse_deletes {
            return Ok(false);
        }
        let before = state.files.len();
        state.files.retain(|f| f.path != path);
        if state.files.len() == before {
            return Ok(false);
        }
        state.deleted.push(path.to_string());
        Ok(true)
    }

    async fn quit(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TelemetryState {
    snapshot: DeviceSnapshot,
    progress_script: VecDeque<u8>,
    published: Vec<PrinterCommand>,
}

/// Telemetry channel driven by the test.
#[derive(Debug)]
pub struct FakeTelemetry {
    connected: AtomicBool,
    fail_publishes: AtomicBool,
    state: Mutex<TelemetryState>,
    status_tx: broadcast::Sender<DeviceSnapshot>,
}

impl FakeTelemetry {
    /// A connected channel with an empty snapshot.
    pub fn new() -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            connected: AtomicBool::new(true),
            fail_publishes: AtomicBool::new(false),
            state: Mutex::new(TelemetryState::default()),
            status_tx,
        })
    }

    /// Set the connected flag.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every publish fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Commands published so far.
    pub fn published(&self) -> Vec<PrinterCommand> {
        lock(&self.state).published.clone()
    }

    /// Report `task` with progress values handed out one per snapshot read.
    ///
    /// The last value sticks once the script runs out.
    pub fn script_progress(&self, task: &str, progress: &[u8]) {
        let mut state = lock(&self.state);
        state.snapshot.subtask_name = task.to_string();
        state.progress_script = progress.iter().copied().collect();
    }

    /// Push a report with a new printer state to subscribers.
    pub fn report_state(&self, print_state: PrintState) {
        self.report(|snapshot| snapshot.state = print_state);
    }

    /// Push a report carrying `errors` as the active HMS errors.
    pub fn report_hms(&self, errors: &[&str]) {
        self.report(|snapshot| {
            snapshot.hms_errors = errors.iter().map(|e| e.to_string()).collect();
        });
    }

    fn report(&self, update: impl FnOnce(&mut DeviceSnapshot)) {
        let snapshot = {
            let mut state = lock(&self.state);
            update(&mut state.snapshot);
            state.snapshot.clone()
        };
        let _ = self.status_tx.send(snapshot);
    }
}

#[async_trait]
impl TelemetryChannel for FakeTelemetry {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, command: &PrinterCommand) -> Result<()> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(BridgeError::MqttError("publish failed".into()));
        }
        lock(&self.state).published.push(command.clone());
        Ok(())
    }

    fn snapshot(&self) -> DeviceSnapshot {
        let mut state = lock(&self.state);
        if let Some(progress) = state.progress_script.pop_front() {
            state.snapshot.progress_percent = progress;
        }
        state.snapshot.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceSnapshot> {
        self.status_tx.subscribe()
    }

    async fn close(&self) {
        self.set_connected(false);
    }
}

/// Host sink that records every line.
#[derive(Debug, Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    /// An empty sink.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lines sent so far.
    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    /// How many times `line` was sent.
    pub fn count(&self, line: &str) -> usize {
        lock(&self.lines).iter().filter(|l| *l == line).count()
    }

    /// Forget recorded lines.
    pub fn clear(&self) {
        lock(&self.lines).clear();
    }
}

impl HostSink for RecordingSink {
    fn send_line(&self, line: &str) {
        lock(&self.lines).push(line.to_string());
    }
}

//! Background tasks that run while a job is printing or paused.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::host::job_status_line;
use crate::inventory::RemoteFileInventory;
use crate::job::{PrintJob, SharedJob, PROJECT_SUFFIXES};
use crate::record::FileRecord;
use crate::state::{Event, WorkerOutcome};
use crate::status::DeviceSnapshot;
use crate::transport::{HostSink, TelemetryChannel};

/// A spawned task together with its stop signal.
pub struct TaskHandle<T> {
    cancel: CancellationToken,
    handle: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    /// Signal the task to stop and wait until it has.
    ///
    /// Returns `None` if the task panicked.
    pub async fn stop(self) -> Option<T> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(value) => Some(value),
            Err(e) => {
                error!("background task failed: {}", e);
                None
            }
        }
    }
}

/// Find the stored file a device task name refers to.
///
/// Task names sometimes lack the archive suffix, so the name is also tried
/// with each project suffix appended.
pub async fn resolve_task_file(
    inventory: &RemoteFileInventory,
    task_name: &str,
) -> Option<FileRecord> {
    let task_name = task_name.trim();
    if task_name.is_empty() {
        return None;
    }
    if let Some(record) = inventory.lookup_by_suffix(task_name, &PROJECT_SUFFIXES).await {
        return Some(record);
    }

    let lowered = task_name.to_lowercase();
    if PROJECT_SUFFIXES.iter().any(|suffix| lowered.ends_with(suffix)) {
        return None;
    }
    for suffix in [".gcode.3mf", ".3mf"] {
        let candidate = format!("{}{}", task_name, suffix);
        if let Some(record) = inventory.lookup_by_suffix(&candidate, &PROJECT_SUFFIXES).await {
            return Some(record);
        }
    }
    None
}

/// Build a job from a device snapshot, if its task resolves to a stored file.
pub async fn resolve_job(
    inventory: &RemoteFileInventory,
    snapshot: &DeviceSnapshot,
) -> Option<PrintJob> {
    let file = resolve_task_file(inventory, &snapshot.subtask_name).await?;
    Some(PrintJob::new(file, snapshot.progress_percent))
}

/// Polls the printer while a job runs and reports progress to the host.
pub struct PrintingWorker {
    inventory: Arc<RemoteFileInventory>,
    telemetry: Arc<dyn TelemetryChannel>,
    sink: Arc<dyn HostSink>,
    job: SharedJob,
    interval: Duration,
}

impl PrintingWorker {
    /// Create a worker sharing `job` with the state machine.
    pub fn new(
        inventory: Arc<RemoteFileInventory>,
        telemetry: Arc<dyn TelemetryChannel>,
        sink: Arc<dyn HostSink>,
        job: SharedJob,
        interval: Duration,
    ) -> Self {
        Self {
            inventory,
            telemetry,
            sink,
            job,
            interval,
        }
    }

    /// Spawn the polling loop.
    ///
    /// Unless it was cancelled, the worker announces its exit on `events`
    /// tagged with `generation`.
    pub fn spawn(
        self,
        generation: u64,
        events: mpsc::UnboundedSender<Event>,
    ) -> TaskHandle<WorkerOutcome> {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let outcome = self.run(&token).await;
            debug!(generation, ?outcome, "printing worker exited");
            if outcome != WorkerOutcome::Cancelled {
                let _ = events.send(Event::WorkerExited {
                    generation,
                    outcome,
                });
            }
            outcome
        });
        TaskHandle { cancel, handle }
    }

    /// Poll until the job completes, vanishes, or `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) -> WorkerOutcome {
        loop {
            if cancel.is_cancelled() {
                return WorkerOutcome::Cancelled;
            }
            match self.job.read().await.as_ref() {
                Some(job) if !job.is_complete() => {}
                _ => break,
            }

            self.poll_once().await;

            tokio::select! {
                _ = cancel.cancelled() => return WorkerOutcome::Cancelled,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        if self.job.read().await.is_none() {
            warn!("Printing state was triggered with empty print job");
            return WorkerOutcome::AbortedNoJob;
        }
        WorkerOutcome::Completed
    }

    async fn poll_once(&self) {
        let snapshot = self.telemetry.snapshot();
        match resolve_job(&self.inventory, &snapshot).await {
            Some(job) => *self.job.write().await = Some(job),
            None => debug!("No 3mf file found for {:?}", snapshot.subtask_name),
        }
        let line = job_status_line(self.job.read().await.as_ref());
        self.sink.send_line(&line);
    }
}

/// Re-send the job status every `interval` until cancelled.
pub fn spawn_status_reporter(
    sink: Arc<dyn HostSink>,
    job: SharedJob,
    interval: Duration,
) -> TaskHandle<()> {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        loop {
            let line = job_status_line(job.read().await.as_ref());
            sink.send_line(&line);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    });
    TaskHandle { cancel, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFile, FakeFs, FakeTelemetry, RecordingSink};
    use tokio::sync::RwLock;

    async fn setup(
        files: Vec<FakeFile>,
    ) -> (Arc<RemoteFileInventory>, Arc<FakeTelemetry>, Arc<RecordingSink>) {
        let inventory = Arc::new(RemoteFileInventory::new(FakeFs::with_files(files)));
        inventory.refresh().await.unwrap();
        (inventory, FakeTelemetry::new(), RecordingSink::new())
    }

    #[tokio::test]
    async fn test_resolve_task_without_suffix() {
        let (inventory, _, _) = setup(vec![FakeFile::new("cache/Benchy.gcode.3mf", 10)]).await;

        let record = resolve_task_file(&inventory, "Benchy").await.unwrap();
        assert_eq!(record.path(), "cache/Benchy.gcode.3mf");
        assert!(resolve_task_file(&inventory, "benchy.gcode.3mf").await.is_some());
        assert!(resolve_task_file(&inventory, "").await.is_none());
        assert!(resolve_task_file(&inventory, "other.3mf").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_completes_at_hundred() {
        let (inventory, telemetry, sink) = setup(vec![FakeFile::new("model.3mf", 1000)]).await;
        telemetry.script_progress("model.3mf", &[40, 100]);

        let job: SharedJob = Arc::new(RwLock::new(Some(PrintJob::new(
            inventory.lookup("model.3mf").await.unwrap(),
            0,
        ))));
        let worker = PrintingWorker::new(
            inventory,
            telemetry,
            sink.clone(),
            job.clone(),
            Duration::from_secs(3),
        );

        let outcome = worker.run(&CancellationToken::new()).await;
        assert_eq!(outcome, WorkerOutcome::Completed);
        assert_eq!(
            sink.lines(),
            vec!["SD printing byte 400/1000", "SD printing byte 1000/1000"]
        );
        assert_eq!(job.read().await.as_ref().unwrap().progress, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_without_job_aborts() {
        let (inventory, telemetry, sink) = setup(vec![]).await;
        let job: SharedJob = Arc::new(RwLock::new(None));
        let worker = PrintingWorker::new(inventory, telemetry, sink.clone(), job, Duration::from_secs(3));

        let outcome = worker.run(&CancellationToken::new()).await;
        assert_eq!(outcome, WorkerOutcome::AbortedNoJob);
        assert!(sink.lines().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_snapshot_keeps_job() {
        let (inventory, telemetry, sink) = setup(vec![FakeFile::new("model.3mf", 100)]).await;
        telemetry.script_progress("unknown.3mf", &[50]);
        let job: SharedJob = Arc::new(RwLock::new(Some(PrintJob::new(
            inventory.lookup("model.3mf").await.unwrap(),
            10,
        ))));
        let worker = PrintingWorker::new(inventory, telemetry, sink.clone(), job.clone(), Duration::from_secs(3));

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(&cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), WorkerOutcome::Cancelled);
        assert_eq!(job.read().await.as_ref().unwrap().progress, 10);
        assert_eq!(sink.lines(), vec!["SD printing byte 10/100"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_worker_reports_exit() {
        let (inventory, telemetry, sink) = setup(vec![FakeFile::new("model.3mf", 100)]).await;
        telemetry.script_progress("model.3mf", &[100]);
        let job: SharedJob = Arc::new(RwLock::new(Some(PrintJob::new(
            inventory.lookup("model.3mf").await.unwrap(),
            0,
        ))));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = PrintingWorker::new(inventory, telemetry, sink, job, Duration::from_secs(3))
            .spawn(7, tx);
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            Event::WorkerExited {
                generation: 7,
                outcome: WorkerOutcome::Completed
            }
        );
        assert_eq!(handle.stop().await, Some(WorkerOutcome::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reporter_runs_until_stopped() {
        let sink = RecordingSink::new();
        let job: SharedJob = Arc::new(RwLock::new(None));
        let reporter = spawn_status_reporter(sink.clone(), job, Duration::from_secs(3));

        tokio::time::sleep(Duration::from_secs(7)).await;
        reporter.stop().await;
        assert_eq!(sink.lines(), vec!["Not SD printing"; 3]);
    }
}

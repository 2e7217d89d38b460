//! The virtual SD card printer.
//!
//! [`VirtualPrinter`] owns the state machine behind an async mutex. Host
//! commands, worker exits and device reports all go through one dispatch
//! path, so effects of one event finish before the next event is looked at.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::commands::PrinterCommand;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::host::job_status_line;
use crate::inventory::{DeleteOutcome, RemoteFileInventory};
use crate::job::{PrintJob, SharedJob};
use crate::record::FileRecord;
use crate::state::{transition, CommandKind, Effect, Event, Guards, PrinterState, WorkerOutcome};
use crate::status::{DeviceSnapshot, PrintState};
use crate::transport::{HostSink, RemoteFs, TelemetryChannel};
use crate::worker::{resolve_job, spawn_status_reporter, PrintingWorker, TaskHandle};

struct Context {
    config: BridgeConfig,
    inventory: Arc<RemoteFileInventory>,
    telemetry: Arc<dyn TelemetryChannel>,
    sink: Arc<dyn HostSink>,
    job: SharedJob,
    events: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct Machine {
    state: PrinterState,
    worker: Option<(u64, TaskHandle<WorkerOutcome>)>,
    next_generation: u64,
    reporter: Option<TaskHandle<()>>,
}

struct Shared {
    ctx: Context,
    machine: Mutex<Machine>,
}

impl Shared {
    async fn dispatch(&self, event: Event) -> PrinterState {
        let mut machine = self.machine.lock().await;
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let guards = Guards {
                has_selection: self.ctx.inventory.has_selected().await,
                connected: self.ctx.telemetry.is_connected(),
                worker_generation: machine.worker.as_ref().map(|(generation, _)| *generation),
            };
            let step = transition(machine.state, &event, &guards);
            if step.next != machine.state {
                debug!("Changing state from {:?} to {:?}", machine.state, step.next);
            }
            for effect in step.effects {
                if let Some(follow_up) = self.apply(&mut machine, effect).await {
                    pending.push_back(follow_up);
                }
            }
            machine.state = step.next;
        }

        machine.state
    }

    async fn apply(&self, machine: &mut Machine, effect: Effect) -> Option<Event> {
        let ctx = &self.ctx;
        match effect {
            Effect::Publish(kind) => return self.publish(kind).await,
            Effect::ClearSelection => ctx.inventory.clear_selection().await,
            Effect::RefreshJob => match self.initial_job().await {
                Some(job) => *ctx.job.write().await = Some(job),
                // Resuming keeps the paused job when the snapshot no longer resolves.
                None if machine.state == PrinterState::Paused => {
                    debug!("no job found on resume, keeping the paused job");
                }
                None => *ctx.job.write().await = None,
            },
            Effect::StartWorker => {
                if let Some((_, previous)) = machine.worker.take() {
                    previous.stop().await;
                }
                machine.next_generation += 1;
                let generation = machine.next_generation;
                let worker = PrintingWorker::new(
                    ctx.inventory.clone(),
                    ctx.telemetry.clone(),
                    ctx.sink.clone(),
                    ctx.job.clone(),
                    ctx.config.poll_interval(),
                );
                machine.worker = Some((generation, worker.spawn(generation, ctx.events.clone())));
            }
            Effect::StopWorker => {
                if let Some((generation, worker)) = machine.worker.take() {
                    let outcome = worker.stop().await;
                    debug!(generation, ?outcome, "printing worker stopped");
                }
            }
            Effect::ReportPaused => ctx.sink.send_line("// action:paused"),
            Effect::StartPauseReporter => {
                if ctx.job.read().await.is_none() {
                    warn!("job paused, but no print job available?");
                } else if machine.reporter.is_none() {
                    machine.reporter = Some(spawn_status_reporter(
                        ctx.sink.clone(),
                        ctx.job.clone(),
                        ctx.config.poll_interval(),
                    ));
                }
            }
            Effect::StopPauseReporter => {
                if let Some(reporter) = machine.reporter.take() {
                    reporter.stop().await;
                }
            }
            Effect::ReportFinished => {
                if let Some(job) = ctx.job.write().await.take() {
                    debug!("SD File Print finishing: {}", job.file.canonical_name());
                    ctx.sink.send_line("Done printing file");
                }
            }
        }
        None
    }

    async fn publish(&self, kind: CommandKind) -> Option<Event> {
        let ctx = &self.ctx;
        let (command, target) = match kind {
            CommandKind::Start => {
                let Some(selected) = ctx.inventory.selected().await else {
                    warn!("Cannot start print job if file was not selected");
                    return None;
                };
                let command = PrinterCommand::project_file(&selected, &ctx.config);
                (command, selected.canonical_name())
            }
            CommandKind::Pause => (PrinterCommand::Pause, String::new()),
            CommandKind::Resume => (PrinterCommand::Resume, String::new()),
            CommandKind::Stop => (PrinterCommand::Stop, String::new()),
        };

        debug!("Sending {} command: {}", command.name(), command.to_json());
        match ctx.telemetry.publish(&command).await {
            Ok(()) => {
                match kind {
                    CommandKind::Start => info!("Started print for {}", target),
                    CommandKind::Pause => info!("print paused"),
                    CommandKind::Resume => info!("print resumed"),
                    CommandKind::Stop => info!("print cancelled"),
                }
                Some(Event::Published(kind))
            }
            Err(e) => {
                warn!("Failed to send {} command: {}", command.name(), e);
                Some(Event::PublishFailed(kind))
            }
        }
    }

    /// Job for a freshly entered Printing state, rescanning once on a miss.
    async fn initial_job(&self) -> Option<PrintJob> {
        let ctx = &self.ctx;
        let snapshot = ctx.telemetry.snapshot();
        if let Some(job) = resolve_job(&ctx.inventory, &snapshot).await {
            return Some(job);
        }

        debug!("No 3mf file found for {:?}, rescanning", snapshot.subtask_name);
        if let Err(e) = ctx.inventory.refresh().await {
            error!("file scan failed: {}", e);
            return None;
        }
        resolve_job(&ctx.inventory, &ctx.telemetry.snapshot()).await
    }

    async fn shutdown(&self) {
        let mut machine = self.machine.lock().await;
        if let Some((_, worker)) = machine.worker.take() {
            worker.stop().await;
        }
        if let Some(reporter) = machine.reporter.take() {
            reporter.stop().await;
        }
    }
}

/// Presents a networked printer as a printer with a classic SD card.
pub struct VirtualPrinter {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl VirtualPrinter {
    /// Wire up the printer and start listening for worker and device events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: BridgeConfig,
        fs: Arc<dyn RemoteFs>,
        telemetry: Arc<dyn TelemetryChannel>,
        sink: Arc<dyn HostSink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let status_rx = telemetry.subscribe();
        let shared = Arc::new(Shared {
            ctx: Context {
                config,
                inventory: Arc::new(RemoteFileInventory::new(fs)),
                telemetry,
                sink,
                job: Arc::new(RwLock::new(None)),
                events: events_tx,
            },
            machine: Mutex::new(Machine::default()),
        });

        let shutdown = CancellationToken::new();
        let pump = tokio::spawn(pump_events(
            shared.clone(),
            events_rx,
            status_rx,
            shutdown.clone(),
        ));

        Self {
            shared,
            shutdown,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// The file inventory backing the virtual SD card.
    pub fn inventory(&self) -> &Arc<RemoteFileInventory> {
        &self.shared.ctx.inventory
    }

    /// Committed lifecycle state.
    ///
    /// Waits for any transition in progress to finish.
    pub async fn state(&self) -> PrinterState {
        self.shared.machine.lock().await.state
    }

    /// The job being printed, if known.
    pub async fn current_job(&self) -> Option<PrintJob> {
        self.shared.ctx.job.read().await.clone()
    }

    /// Job slot shared with background reporters.
    pub fn shared_job(&self) -> SharedJob {
        self.shared.ctx.job.clone()
    }

    /// Rescan and list every printable file.
    pub async fn list_files(&self) -> Result<Vec<FileRecord>> {
        self.inventory().list_all().await
    }

    /// Select a file by short or canonical name.
    pub async fn select_file(&self, name: &str) -> Option<FileRecord> {
        self.inventory().select(name, false).await
    }

    /// Delete a file on the printer.
    pub async fn delete_file(&self, name: &str) -> DeleteOutcome {
        self.inventory().delete(name).await
    }

    /// Start the selected file, or resume a paused job.
    pub async fn start_print(&self) -> PrinterState {
        self.shared.dispatch(Event::StartRequested).await
    }

    /// Pause the running job.
    pub async fn pause_print(&self) -> PrinterState {
        self.shared.dispatch(Event::PauseRequested).await
    }

    /// Cancel the running or paused job.
    pub async fn cancel_print(&self) -> PrinterState {
        self.shared.dispatch(Event::CancelRequested).await
    }

    /// Feed a printer state report into the machine.
    pub async fn device_reported(&self, state: PrintState) -> PrinterState {
        self.shared.dispatch(Event::DeviceReported(state)).await
    }

    /// Whether the printer's command channel is up.
    pub fn is_connected(&self) -> bool {
        self.shared.ctx.telemetry.is_connected()
    }

    /// Send a raw command outside the lifecycle, e.g. a forwarded G-code line.
    pub async fn send_command(&self, command: &PrinterCommand) -> Result<()> {
        let telemetry = &self.shared.ctx.telemetry;
        if !telemetry.is_connected() {
            return Err(BridgeError::ConnectionFailed("printer not connected".into()));
        }
        debug!("Sending {} command: {}", command.name(), command.to_json());
        telemetry.publish(command).await
    }

    /// Stop every background task and drop the printer connection.
    pub async fn emergency_stop(&self) {
        warn!("emergency stop requested");
        self.shutdown().await;
        self.shared.ctx.telemetry.close().await;
    }

    /// Send the current job status line to the host.
    pub async fn report_job_status(&self) {
        let line = job_status_line(self.shared.ctx.job.read().await.as_ref());
        self.shared.ctx.sink.send_line(&line);
    }

    /// Stop the event pump and every background task.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(pump) = self.pump.lock().await.take() {
            if let Err(e) = pump.await {
                error!("event pump failed: {}", e);
            }
        }
        self.shared.shutdown().await;
    }
}

impl Drop for VirtualPrinter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn pump_events(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<Event>,
    status: broadcast::Receiver<DeviceSnapshot>,
    shutdown: CancellationToken,
) {
    let mut status = Some(status);
    let mut last_hms: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(event) = events.recv() => {
                shared.dispatch(event).await;
            }
            snapshot = next_status(&mut status) => {
                if snapshot.hms_errors != last_hms {
                    for error in &snapshot.hms_errors {
                        debug!("HMS Error: {}", error);
                        shared
                            .ctx
                            .sink
                            .send_line(&format!("// action:notification {}", error.trim()));
                    }
                    last_hms = snapshot.hms_errors;
                }
                // A job at 100% is finishing; entering Printing for it again
                // would announce it twice.
                if snapshot.state == PrintState::Printing && snapshot.progress_percent >= 100 {
                    continue;
                }
                // Same-state reports are no-ops in the machine, so every report
                // is applied and a local transition the device ignored re-syncs.
                shared.dispatch(Event::DeviceReported(snapshot.state)).await;
            }
        }
    }
    debug!("event pump stopped");
}

async fn next_status(status: &mut Option<broadcast::Receiver<DeviceSnapshot>>) -> DeviceSnapshot {
    loop {
        let Some(receiver) = status.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(snapshot) => return snapshot,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "status updates lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("telemetry status channel closed");
                *status = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFile, FakeFs, FakeTelemetry, RecordingSink};

    fn printer(
        files: Vec<FakeFile>,
    ) -> (VirtualPrinter, Arc<FakeTelemetry>, Arc<RecordingSink>) {
        let telemetry = FakeTelemetry::new();
        let sink = RecordingSink::new();
        let config = BridgeConfig {
            device_type: "P1S".into(),
            ..Default::default()
        };
        let printer = VirtualPrinter::new(
            config,
            FakeFs::with_files(files),
            telemetry.clone(),
            sink.clone(),
        );
        (printer, telemetry, sink)
    }

    #[tokio::test]
    async fn test_start_without_selection_is_noop() {
        let (printer, telemetry, _) = printer(vec![]);
        assert_eq!(printer.start_print().await, PrinterState::Idle);
        assert!(telemetry.published().is_empty());
    }

    #[tokio::test]
    async fn test_start_publishes_project_file() {
        let (printer, telemetry, _) = printer(vec![FakeFile::new("cache/Model.3mf", 10)]);
        printer.list_files().await.unwrap();
        printer.select_file("model.3mf").await.unwrap();

        assert_eq!(printer.start_print().await, PrinterState::Idle);
        let published = telemetry.published();
        assert_eq!(published.len(), 1);
        let json = published[0].to_json();
        assert_eq!(json["print"]["file"], "cache/Model.3mf");
        assert_eq!(json["print"]["url"], "file:///sdcard/cache/Model.3mf");
    }

    #[tokio::test]
    async fn test_failed_start_stays_idle() {
        let (printer, telemetry, _) = printer(vec![FakeFile::new("model.3mf", 10)]);
        printer.list_files().await.unwrap();
        printer.select_file("model.3mf").await.unwrap();
        telemetry.fail_publishes(true);

        assert_eq!(printer.start_print().await, PrinterState::Idle);
        assert!(printer.inventory().has_selected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entering_printing_clears_selection_and_builds_job() {
        let (printer, telemetry, _) = printer(vec![FakeFile::new("model.3mf", 200)]);
        printer.list_files().await.unwrap();
        printer.select_file("model.3mf").await.unwrap();
        telemetry.script_progress("model.3mf", &[25]);

        assert_eq!(
            printer.device_reported(PrintState::Printing).await,
            PrinterState::Printing
        );
        assert!(!printer.inventory().has_selected().await);
        assert_eq!(printer.current_job().await.unwrap().progress, 25);
        printer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_entering_printing_rescans_on_miss() {
        let (printer, telemetry, _) = printer(vec![FakeFile::new("fresh.3mf", 200)]);
        telemetry.script_progress("fresh", &[5]);

        printer.device_reported(PrintState::Printing).await;
        let job = printer.current_job().await.unwrap();
        assert_eq!(job.file.path(), "fresh.3mf");
        printer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_while_disconnected_is_ignored() {
        let (printer, telemetry, _) = printer(vec![FakeFile::new("model.3mf", 200)]);
        telemetry.script_progress("model.3mf", &[25]);
        printer.device_reported(PrintState::Printing).await;

        telemetry.set_connected(false);
        assert_eq!(printer.pause_print().await, PrinterState::Printing);
        assert!(telemetry.published().is_empty());
        printer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_then_resume() {
        let (printer, telemetry, sink) = printer(vec![FakeFile::new("model.3mf", 200)]);
        telemetry.script_progress("model.3mf", &[25]);
        printer.device_reported(PrintState::Printing).await;

        assert_eq!(printer.pause_print().await, PrinterState::Paused);
        assert!(sink.lines().contains(&"// action:paused".to_string()));
        assert_eq!(printer.start_print().await, PrinterState::Printing);
        assert_eq!(
            telemetry.published(),
            vec![PrinterCommand::Pause, PrinterCommand::Resume]
        );
        printer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hms_errors_are_notified_once() {
        let (printer, telemetry, sink) = printer(vec![]);
        telemetry.report_hms(&["HMS_0300_0100_0001_0007"]);
        telemetry.report_hms(&["HMS_0300_0100_0001_0007"]);
        telemetry.report_hms(&["HMS_0300_0100_0001_0007", "HMS_0500_0200_0002_0001"]);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(
            sink.lines(),
            vec![
                "// action:notification HMS_0300_0100_0001_0007",
                "// action:notification HMS_0300_0100_0001_0007",
                "// action:notification HMS_0500_0200_0002_0001",
            ]
        );
        printer.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_command_requires_connection() {
        let (printer, telemetry, _) = printer(vec![]);
        let command = PrinterCommand::GcodeLine("G28".into());
        printer.send_command(&command).await.unwrap();

        telemetry.set_connected(false);
        assert!(printer.send_command(&command).await.is_err());
        assert_eq!(telemetry.published(), vec![command]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_keeps_job_when_task_no_longer_resolves() {
        let (printer, telemetry, _) = printer(vec![FakeFile::new("model.3mf", 200)]);
        telemetry.script_progress("model.3mf", &[25]);
        printer.device_reported(PrintState::Printing).await;
        assert_eq!(printer.pause_print().await, PrinterState::Paused);

        telemetry.script_progress("unknown.3mf", &[30]);
        assert_eq!(printer.start_print().await, PrinterState::Printing);
        let job = printer.current_job().await.unwrap();
        assert_eq!(job.file.path(), "model.3mf");
        printer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_device_report_resyncs_local_pause() {
        let (printer, telemetry, _) = printer(vec![FakeFile::new("model.3mf", 200)]);
        telemetry.script_progress("model.3mf", &[25]);
        telemetry.report_state(PrintState::Printing);
        while printer.state().await != PrinterState::Printing {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(printer.pause_print().await, PrinterState::Paused);
        telemetry.report_state(PrintState::Printing);
        for _ in 0..100 {
            if printer.state().await == PrinterState::Printing {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(printer.state().await, PrinterState::Printing);
        printer.shutdown().await;
    }
}

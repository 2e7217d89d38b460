//! Legacy SD card command surface for the host.
//!
//! The host talks to the bridge the way it would talk to a serial printer
//! with an SD card slot: `M20` to list, `M23` to select, `M24` to start and
//! so on. Every handled command is acknowledged with `ok`. Codes the bridge
//! does not handle itself are forwarded to the printer as G-code lines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::commands::PrinterCommand;
use crate::inventory::DeleteOutcome;
use crate::job::PrintJob;
use crate::printer::VirtualPrinter;
use crate::transport::HostSink;
use crate::worker::{spawn_status_reporter, TaskHandle};

/// Status line for `M27` style progress reports.
pub fn job_status_line(job: Option<&PrintJob>) -> String {
    match job {
        Some(job) => format!(
            "SD printing byte {}/{}",
            job.file_position(),
            job.file.size()
        ),
        None => "Not SD printing".to_string(),
    }
}

/// A parsed host command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    /// Upper-cased command code, e.g. `M23`.
    pub code: String,
    /// Everything after the code, trimmed.
    pub argument: String,
}

impl HostCommand {
    /// Parse a line, dropping `;` comments, line numbers and checksums.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.split(';').next().unwrap_or_default();
        let line = match line.rfind('*') {
            Some(index) => &line[..index],
            None => line,
        };
        let mut tokens = line.trim().splitn(2, char::is_whitespace);
        let mut code = tokens.next()?.to_uppercase();
        let mut rest = tokens.next().unwrap_or_default().trim().to_string();

        if code.starts_with('N') && code[1..].chars().all(|c| c.is_ascii_digit()) {
            let mut tokens = rest.splitn(2, char::is_whitespace);
            code = tokens.next()?.to_uppercase();
            rest = tokens.next().unwrap_or_default().trim().to_string();
        }
        if code.is_empty() {
            return None;
        }

        Some(Self {
            code,
            argument: rest,
        })
    }

    /// The command as it would be sent on, without comments or line numbers.
    pub fn line(&self) -> String {
        if self.argument.is_empty() {
            self.code.clone()
        } else {
            format!("{} {}", self.code, self.argument)
        }
    }

    /// Integer value of a `S<n>` style parameter.
    pub fn param(&self, letter: char) -> Option<u64> {
        self.argument
            .split_whitespace()
            .find_map(|token| token.strip_prefix(letter))
            .and_then(|value| value.parse().ok())
    }
}

/// Executes host commands against a [`VirtualPrinter`].
pub struct HostCommandExecutor {
    printer: Arc<VirtualPrinter>,
    sink: Arc<dyn HostSink>,
    auto_report: Mutex<Option<TaskHandle<()>>>,
    killed: AtomicBool,
}

impl HostCommandExecutor {
    /// Create an executor writing replies to `sink`.
    pub fn new(printer: Arc<VirtualPrinter>, sink: Arc<dyn HostSink>) -> Self {
        Self {
            printer,
            sink,
            auto_report: Mutex::new(None),
            killed: AtomicBool::new(false),
        }
    }

    /// Whether an emergency stop (`M112`) closed the command surface.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Handle one line from the host.
    ///
    /// Returns `false` for blank lines and for every line after `M112`.
    pub async fn execute(&self, line: &str) -> bool {
        if self.is_killed() {
            debug!("ignoring {:?} after emergency stop", line);
            return false;
        }
        let Some(command) = HostCommand::parse(line) else {
            return false;
        };
        debug!("processing host command {:?}", command);

        match command.code.as_str() {
            "M20" => self.list_files().await,
            "M21" => self.sink.send_line("SD card ok"),
            "M23" => self.select_file(&command.argument).await,
            "M24" => {
                self.printer.start_print().await;
            }
            "M25" => {
                self.printer.pause_print().await;
            }
            "M26" => {
                if command.param('S') == Some(0) {
                    self.printer.cancel_print().await;
                } else {
                    debug!("ignoring M26 command.");
                    self.sink.send_line("M26 disabled for Bambu");
                }
            }
            "M27" => self.report_status(&command).await,
            "M30" => self.delete_file(&command.argument).await,
            "M115" => {
                self.sink.send_line("Bambu Printer Integration");
                self.sink.send_line("Cap:EXTENDED_M20:1");
                self.sink.send_line("Cap:LFN_WRITE:1");
            }
            "M524" => {
                self.printer.cancel_print().await;
            }
            "M112" => {
                self.emergency_stop().await;
                return true;
            }
            "M117" => self.sink.send_line(&format!("echo:{}", command.argument)),
            "M118" => self.serial_print(&command.argument),
            "M220" => self.set_speed(&command).await,
            _ => self.forward(&command).await,
        }

        self.sink.send_line("ok");
        true
    }

    /// Stop the automatic status reporter, if any.
    pub async fn shutdown(&self) {
        if let Some(reporter) = self.auto_report.lock().await.take() {
            reporter.stop().await;
        }
    }

    async fn emergency_stop(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.shutdown().await;
        self.printer.emergency_stop().await;
        self.sink.send_line("echo:EMERGENCY SHUTDOWN DETECTED. KILLED.");
    }

    fn serial_print(&self, argument: &str) {
        if argument.is_empty() {
            self.sink.send_line("Unrecognized command parameters for M118");
            return;
        }
        const TARGETS: [&str; 5] = ["A1", "E1", "Pn0", "Pn1", "Pn2"];
        let (target, text) = match argument.split_once(char::is_whitespace) {
            Some((target, text)) if TARGETS.contains(&target) => (target, text.trim_start()),
            None if TARGETS.contains(&argument) => (argument, ""),
            _ => ("", argument),
        };
        match target {
            "A1" => self.sink.send_line(&format!("//{}", text)),
            "E1" => self.sink.send_line(&format!("echo:{}", text)),
            _ => self.sink.send_line(text),
        }
    }

    async fn set_speed(&self, command: &HostCommand) {
        if !self.printer.is_connected() {
            debug!("printer not connected, ignoring M220");
            return;
        }
        let Some(percent) = command.param('S') else {
            return;
        };
        let Some(speed) = PrinterCommand::speed_adjust(percent) else {
            debug!(percent, "speed out of range");
            return;
        };
        match self.printer.send_command(&speed).await {
            Ok(()) => info!("{}% speed adjustment command sent successfully", percent),
            Err(e) => warn!("speed adjustment failed: {}", e),
        }
    }

    async fn forward(&self, command: &HostCommand) {
        if self.printer.is_connected() {
            let gcode = PrinterCommand::GcodeLine(command.line());
            match self.printer.send_command(&gcode).await {
                Ok(()) => {
                    info!("command sent successfully");
                    return;
                }
                Err(e) => warn!("forwarding {} failed: {}", command.code, e),
            }
        }
        self.sink
            .send_line(&format!("echo:Unknown command: {}", command.code));
    }

    async fn list_files(&self) {
        self.sink.send_line("Begin file list");
        match self.printer.list_files().await {
            Ok(files) => {
                for file in files {
                    self.sink.send_line(&file.log_line());
                }
            }
            Err(e) => error!("listing files failed: {}", e),
        }
        self.sink.send_line("End file list");
    }

    async fn select_file(&self, name: &str) {
        match self.printer.select_file(name).await {
            Some(file) => {
                self.sink.send_line(&format!(
                    "File opened: {}  Size: {}",
                    file.canonical_name(),
                    file.size()
                ));
                self.sink.send_line("File selected");
            }
            None => self
                .sink
                .send_line(&format!("open failed, File: {}", name)),
        }
    }

    async fn delete_file(&self, name: &str) {
        if let DeleteOutcome::Failed(reason) = self.printer.delete_file(name).await {
            debug!("delete of {} failed: {}", name, reason);
        }
    }

    async fn report_status(&self, command: &HostCommand) {
        if let Some(interval) = command.param('S') {
            let mut auto_report = self.auto_report.lock().await;
            if let Some(previous) = auto_report.take() {
                previous.stop().await;
            }
            if interval > 0 {
                *auto_report = Some(spawn_status_reporter(
                    self.sink.clone(),
                    self.printer.shared_job(),
                    Duration::from_secs(interval),
                ));
            }
        }
        self.printer.report_job_status().await;
    }
}

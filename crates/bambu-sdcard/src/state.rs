//! Print lifecycle state machine.
//!
//! [`transition`] is pure: it maps the current state and an event to the
//! next state plus a list of [`Effect`]s. The printer executes the effects
//! in order and feeds publish results back in as new events.

use tracing::{debug, warn};

use crate::status::PrintState;

/// Lifecycle state presented to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrinterState {
    /// Nothing is printing.
    #[default]
    Idle,
    /// A job is running and being polled.
    Printing,
    /// A job is paused on the printer.
    Paused,
}

/// Commands whose publish result drives a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Start the selected file.
    Start,
    /// Pause the running job.
    Pause,
    /// Resume the paused job.
    Resume,
    /// Stop the job.
    Stop,
}

/// How a polling worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The job reached 100 percent.
    Completed,
    /// The job vanished while polling.
    AbortedNoJob,
    /// The worker was told to stop.
    Cancelled,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Host asked to start or resume.
    StartRequested,
    /// Host asked to pause.
    PauseRequested,
    /// Host asked to cancel.
    CancelRequested,
    /// A command was published successfully.
    Published(CommandKind),
    /// Publishing a command failed.
    PublishFailed(CommandKind),
    /// The printer reported a new `gcode_state`.
    DeviceReported(PrintState),
    /// A polling worker finished on its own.
    WorkerExited {
        /// Generation of the worker that exited.
        generation: u64,
        /// Why it exited.
        outcome: WorkerOutcome,
    },
}

/// Side effects requested by a transition, executed in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Publish a command and report the result as an event.
    Publish(CommandKind),
    /// Forget the host's file selection.
    ClearSelection,
    /// Rebuild the current job from the device snapshot.
    RefreshJob,
    /// Spawn the polling worker.
    StartWorker,
    /// Stop the polling worker and wait for it.
    StopWorker,
    /// Tell the host the job is paused.
    ReportPaused,
    /// Spawn the periodic status reporter used while paused.
    StartPauseReporter,
    /// Stop the paused status reporter and wait for it.
    StopPauseReporter,
    /// Tell the host the job is done and drop it.
    ReportFinished,
}

/// Facts about the surroundings that guard transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Guards {
    /// A file is selected in the inventory.
    pub has_selection: bool,
    /// The telemetry channel is connected.
    pub connected: bool,
    /// Generation of the running worker, if any.
    pub worker_generation: Option<u64>,
}

/// Result of feeding an event to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the effects ran.
    pub next: PrinterState,
    /// Effects to execute, in order.
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: PrinterState) -> Self {
        Self {
            next: state,
            effects: Vec::new(),
        }
    }

    fn stay_with(state: PrinterState, effects: Vec<Effect>) -> Self {
        Self {
            next: state,
            effects,
        }
    }

    /// Leave `from` for `to`, running exit hooks, `between`, then entry hooks.
    fn change(from: PrinterState, to: PrinterState, between: &[Effect]) -> Self {
        if from == to {
            return Self::stay_with(from, between.to_vec());
        }
        let mut effects = on_exit(from);
        effects.extend_from_slice(between);
        effects.extend(on_enter(to));
        Self { next: to, effects }
    }
}

fn on_enter(state: PrinterState) -> Vec<Effect> {
    match state {
        PrinterState::Idle => Vec::new(),
        PrinterState::Printing => vec![Effect::ClearSelection, Effect::RefreshJob, Effect::StartWorker],
        PrinterState::Paused => vec![Effect::ReportPaused, Effect::StartPauseReporter],
    }
}

fn on_exit(state: PrinterState) -> Vec<Effect> {
    match state {
        PrinterState::Idle => Vec::new(),
        PrinterState::Printing => vec![Effect::StopWorker],
        PrinterState::Paused => vec![Effect::StopPauseReporter],
    }
}

/// Compute the next state and effects for `event`.
pub fn transition(state: PrinterState, event: &Event, guards: &Guards) -> Transition {
    use PrinterState::*;

    match (state, event) {
        (_, Event::DeviceReported(reported)) => device_transition(state, reported),

        (_, Event::PublishFailed(kind)) => {
            warn!("{:?} command failed while {:?}", kind, state);
            Transition::stay(state)
        }

        (Idle, Event::StartRequested) => {
            if guards.has_selection {
                Transition::stay_with(Idle, vec![Effect::Publish(CommandKind::Start)])
            } else {
                warn!("Cannot start print job if file was not selected");
                Transition::stay(Idle)
            }
        }
        // The printer confirms the start through its next report.
        (Idle, Event::Published(CommandKind::Start)) => Transition::stay(Idle),

        (Printing, Event::PauseRequested) => publish_if_connected(Printing, CommandKind::Pause, guards),
        (Printing, Event::CancelRequested) => publish_if_connected(Printing, CommandKind::Stop, guards),
        (Printing, Event::Published(CommandKind::Pause)) => Transition::change(Printing, Paused, &[]),
        (Printing, Event::Published(CommandKind::Stop)) => {
            Transition::change(Printing, Idle, &[Effect::ReportFinished])
        }
        (Printing, Event::WorkerExited { generation, outcome }) => {
            if guards.worker_generation != Some(*generation) {
                debug!(generation, "ignoring exit of a stale worker");
                return Transition::stay(Printing);
            }
            match outcome {
                WorkerOutcome::Completed => Transition::change(Printing, Idle, &[Effect::ReportFinished]),
                WorkerOutcome::AbortedNoJob => {
                    warn!("print job vanished while printing, staying in Printing");
                    Transition::stay(Printing)
                }
                WorkerOutcome::Cancelled => Transition::stay(Printing),
            }
        }

        (Paused, Event::StartRequested) => publish_if_connected(Paused, CommandKind::Resume, guards),
        (Paused, Event::CancelRequested) => publish_if_connected(Paused, CommandKind::Stop, guards),
        (Paused, Event::Published(CommandKind::Resume)) => Transition::change(Paused, Printing, &[]),
        (Paused, Event::Published(CommandKind::Stop)) => {
            Transition::change(Paused, Idle, &[Effect::ReportFinished])
        }

        (state, event) => {
            debug!("{:?} ignored while {:?}", event, state);
            Transition::stay(state)
        }
    }
}

fn publish_if_connected(state: PrinterState, kind: CommandKind, guards: &Guards) -> Transition {
    if guards.connected {
        Transition::stay_with(state, vec![Effect::Publish(kind)])
    } else {
        warn!("printer not connected, {:?} skipped", kind);
        Transition::stay(state)
    }
}

fn device_transition(state: PrinterState, reported: &PrintState) -> Transition {
    let (target, finished) = match reported {
        PrintState::Idle | PrintState::Error(_) => (PrinterState::Idle, false),
        PrintState::Finished => (PrinterState::Idle, true),
        PrintState::Printing => (PrinterState::Printing, false),
        PrintState::Paused => (PrinterState::Paused, false),
        PrintState::Preparing | PrintState::Unknown => {
            debug!("no state change for printer state {:?}", reported);
            return Transition::stay(state);
        }
    };

    if finished && state != PrinterState::Idle {
        Transition::change(state, target, &[Effect::ReportFinished])
    } else {
        Transition::change(state, target, &[])
    }
}

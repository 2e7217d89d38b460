#![warn(missing_docs)]

//! Legacy SD card emulation for Bambu Lab printers.
//!
//! Hosts that only know how to drive a serial printer with an SD card slot
//! can use this crate to print files stored on a networked Bambu printer.
//!
//! This crate provides:
//! - An FTPS backed file inventory with stable 8.3 short names
//! - MQTT communication with the printer
//! - A printer state machine (idle, printing, paused)
//! - A progress worker reporting to the host while a job runs
//! - The classic `M20`/`M23`/`M24`/`M27` command surface
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use bambu_sdcard::{
//!     BambuMqttClient, BridgeConfig, FtpsClient, FtpsConfig, HostCommandExecutor,
//!     MqttConfig, VirtualPrinter,
//! };
//!
//! let config = BridgeConfig::load("bridge.toml".as_ref())?;
//! let fs = Arc::new(FtpsClient::new(FtpsConfig::from_bridge(&config))?);
//! let telemetry = Arc::new(BambuMqttClient::connect(MqttConfig::from_bridge(&config)?).await?);
//!
//! let printer = Arc::new(VirtualPrinter::new(config, fs, telemetry, sink.clone()));
//! let host = HostCommandExecutor::new(printer, sink);
//!
//! host.execute("M20").await;
//! host.execute("M23 benchy~1.3mf").await;
//! host.execute("M24").await;
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod ftps;
pub mod host;
pub mod inventory;
pub mod job;
pub mod mqtt;
pub mod printer;
pub mod record;
pub mod shortname;
pub mod state;
pub mod status;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod worker;

pub use commands::PrinterCommand;
pub use config::{BridgeConfig, PrintOptions};
pub use error::{BridgeError, Result};
pub use ftps::{FtpsClient, FtpsConfig};
pub use host::{job_status_line, HostCommand, HostCommandExecutor};
pub use inventory::{DeleteOutcome, RemoteFileInventory};
pub use job::PrintJob;
pub use mqtt::{BambuMqttClient, MqttConfig};
pub use printer::VirtualPrinter;
pub use record::FileRecord;
pub use state::PrinterState;
pub use status::{DeviceSnapshot, PrintState};
pub use transport::{HostSink, RemoteFs, RemoteSession, TelemetryChannel};
pub use worker::PrintingWorker;

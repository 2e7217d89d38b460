//! Seams to the printer's file server, its telemetry channel and the host.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::commands::PrinterCommand;
use crate::error::Result;
use crate::status::DeviceSnapshot;

/// Opens sessions on the printer's file server.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Open and log in a new session.
    async fn connect(&self) -> Result<Box<dyn RemoteSession>>;
}

/// A logged-in file server session.
#[async_trait]
pub trait RemoteSession: Send {
    /// Paths in `directory` whose name ends with `extension`.
    async fn list_entries(&mut self, directory: &str, extension: &str) -> Result<Vec<String>>;

    /// Size of a file, `None` when the server does not know it.
    async fn size(&mut self, path: &str) -> Result<Option<u64>>;

    /// Last modification time of a file.
    async fn modified_time(&mut self, path: &str) -> Result<DateTime<Utc>>;

    /// Delete a file. `Ok(false)` when the server refused.
    async fn delete(&mut self, path: &str) -> Result<bool>;

    /// Close the session politely.
    async fn quit(self: Box<Self>) -> Result<()>;
}

/// Command and status channel of the printer.
#[async_trait]
pub trait TelemetryChannel: Send + Sync {
    /// Whether the channel currently has a live connection.
    fn is_connected(&self) -> bool;

    /// Send a command to the printer.
    async fn publish(&self, command: &PrinterCommand) -> Result<()>;

    /// Latest merged device status.
    fn snapshot(&self) -> DeviceSnapshot;

    /// Subscribe to status updates.
    fn subscribe(&self) -> broadcast::Receiver<DeviceSnapshot>;

    /// Drop the connection. Later publishes fail.
    async fn close(&self);
}

/// Line oriented output towards the host.
pub trait HostSink: Send + Sync {
    /// Send one line to the host.
    fn send_line(&self, line: &str);
}

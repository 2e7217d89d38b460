//! MQTT client for Bambu printers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration, Transport,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::PrinterCommand;
use crate::config::{BridgeConfig, MQTT_PORT};
use crate::error::{BridgeError, Result};
use crate::status::DeviceSnapshot;
use crate::transport::TelemetryChannel;

/// Delay before polling the event loop again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// MQTT connection configuration.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Printer host name or IP address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Printer serial number, part of every topic.
    pub serial: String,
    /// Login name.
    pub username: String,
    /// Access code (from printer's LAN mode settings).
    pub access_code: String,
    /// PEM encoded CA certificate, empty to use none.
    pub ca: Vec<u8>,
    /// Connection timeout.
    pub timeout: Duration,
}

impl MqttConfig {
    /// Settings for the printer described by `config`, reading its CA file.
    pub fn from_bridge(config: &BridgeConfig) -> Result<Self> {
        let ca = match &config.ca_file {
            Some(path) => std::fs::read(path)?,
            None => Vec::new(),
        };
        Ok(Self {
            host: config.host.clone(),
            port: MQTT_PORT,
            serial: config.serial.clone(),
            username: config.username.clone(),
            access_code: config.access_code.clone(),
            ca,
            timeout: Duration::from_secs(10),
        })
    }

    fn report_topic(&self) -> String {
        format!("device/{}/report", self.serial)
    }

    fn command_topic(&self, command: &PrinterCommand) -> String {
        format!("device/{}/{}", self.serial, command.topic_suffix())
    }
}

/// Connection state shared with the event loop task.
#[derive(Debug)]
struct LinkState {
    connected: AtomicBool,
    snapshot: Mutex<DeviceSnapshot>,
    status_tx: broadcast::Sender<DeviceSnapshot>,
}

impl LinkState {
    fn new() -> Self {
        let (status_tx, _) = broadcast::channel(16);
        Self {
            connected: AtomicBool::new(false),
            snapshot: Mutex::new(DeviceSnapshot::default()),
            status_tx,
        }
    }

    fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Merge a report payload and broadcast the result.
    fn apply_report(&self, payload: &[u8]) -> bool {
        let Ok(report) = serde_json::from_slice::<serde_json::Value>(payload) else {
            debug!("ignoring non JSON report");
            return false;
        };
        let snapshot = {
            let mut current = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
            if !current.merge_report(&report) {
                return false;
            }
            current.clone()
        };
        let _ = self.status_tx.send(snapshot);
        true
    }
}

/// MQTT client for Bambu printer communication.
///
/// A background task drives the connection, reconnects after errors and
/// keeps the merged device snapshot current.
pub struct BambuMqttClient {
    config: MqttConfig,
    client: AsyncClient,
    link: Arc<LinkState>,
    cancel: CancellationToken,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl BambuMqttClient {
    /// Connect to a Bambu printer and wait for the broker to accept us.
    pub async fn connect(config: MqttConfig) -> Result<Self> {
        let client_id = format!("bambu-sdcard_{}", uuid::Uuid::new_v4());

        let mut mqtt_options = MqttOptions::new(&client_id, config.host.clone(), config.port);
        mqtt_options.set_credentials(config.username.clone(), config.access_code.clone());
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_clean_session(true);

        let tls_config = TlsConfiguration::Simple {
            ca: config.ca.clone(),
            alpn: None,
            client_auth: None,
        };
        mqtt_options.set_transport(Transport::tls_with_config(tls_config));

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 100);
        wait_for_connection(&mut event_loop, config.timeout).await?;

        let link = Arc::new(LinkState::new());
        link.connected.store(true, Ordering::SeqCst);
        info!(host = %config.host, "connected to printer MQTT broker");

        let cancel = CancellationToken::new();
        let event_task = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            config.clone(),
            link.clone(),
            cancel.clone(),
        ));

        let mqtt_client = Self {
            config,
            client,
            link,
            cancel,
            event_task: Mutex::new(Some(event_task)),
        };
        mqtt_client.subscribe_reports().await?;
        mqtt_client.publish(&PrinterCommand::PushAll).await?;
        Ok(mqtt_client)
    }

    async fn subscribe_reports(&self) -> Result<()> {
        self.client
            .subscribe(self.config.report_topic(), QoS::AtMostOnce)
            .await
            .map_err(|e| BridgeError::MqttError(e.to_string()))
    }

    /// Get the printer serial number.
    pub fn serial(&self) -> &str {
        &self.config.serial
    }

    /// Disconnect after flushing queued commands, then stop the background task.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect failed: {}", e);
        }
        let task = self
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.config.timeout, &mut task)
                .await
                .is_err()
            {
                self.cancel.cancel();
                let _ = task.await;
            }
        }
        self.cancel.cancel();
    }
}

impl Drop for BambuMqttClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl TelemetryChannel for BambuMqttClient {
    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, command: &PrinterCommand) -> Result<()> {
        let topic = self.config.command_topic(command);
        let payload = command.to_json().to_string();
        debug!(topic = %topic, command = command.name(), "publishing command");

        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| BridgeError::MqttError(e.to_string()))
    }

    fn snapshot(&self) -> DeviceSnapshot {
        self.link.snapshot()
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceSnapshot> {
        self.link.status_tx.subscribe()
    }

    async fn close(&self) {
        self.disconnect().await;
    }
}

async fn wait_for_connection(event_loop: &mut EventLoop, limit: Duration) -> Result<()> {
    let connack = async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => continue,
                Err(e) => return Err(BridgeError::ConnectionFailed(e.to_string())),
            }
        }
    };
    tokio::time::timeout(limit, connack)
        .await
        .map_err(|_| BridgeError::Timeout("connection timeout".into()))?
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    config: MqttConfig,
    link: Arc<LinkState>,
    cancel: CancellationToken,
) {
    let report_topic = config.report_topic();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !link.connected.swap(true, Ordering::SeqCst) {
                    info!("reconnected to printer MQTT broker");
                }
                // The queue is drained by this very loop, so never wait on it.
                if let Err(e) = client.try_subscribe(report_topic.clone(), QoS::AtMostOnce) {
                    warn!("resubscribe failed: {}", e);
                }
                let pushall = PrinterCommand::PushAll;
                if let Err(e) = client.try_publish(
                    config.command_topic(&pushall),
                    QoS::AtMostOnce,
                    false,
                    pushall.to_json().to_string(),
                ) {
                    warn!("status request failed: {}", e);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic == report_topic {
                    link.apply_report(&publish.payload);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if link.connected.swap(false, Ordering::SeqCst) {
                    warn!("MQTT connection lost: {}", e);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    link.connected.store(false, Ordering::SeqCst);
    debug!("MQTT event loop stopped");
}

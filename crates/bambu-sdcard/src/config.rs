//! Bridge configuration.
//!
//! Settings are read from a TOML file:
//!
//! ```toml
//! host = "192.168.1.50"
//! serial = "00M00A2B012345"
//! access_code = "12345678"
//! device_type = "P1S"
//!
//! [print_options]
//! timelapse = false
//! use_ams = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Implicit FTPS port used by the printer.
pub const FTPS_PORT: u16 = 990;

/// MQTT over TLS port used by the printer.
pub const MQTT_PORT: u16 = 8883;

/// Options embedded in every print start command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintOptions {
    /// Record a timelapse.
    pub timelapse: bool,
    /// Auto bed leveling before the print.
    pub bed_leveling: bool,
    /// Flow dynamics calibration.
    pub flow_cali: bool,
    /// Vibration compensation calibration.
    pub vibration_cali: bool,
    /// First layer inspection (lidar).
    pub layer_inspect: bool,
    /// Feed filament through the AMS.
    pub use_ams: bool,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            timelapse: false,
            bed_leveling: true,
            flow_cali: true,
            vibration_cali: false,
            layer_inspect: false,
            use_ams: true,
        }
    }
}

/// Printer connection and behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Printer host name or IP address.
    pub host: String,
    /// Printer serial number.
    pub serial: String,
    /// Access code (from printer's LAN mode settings).
    pub access_code: String,
    /// Login used for both FTPS and MQTT.
    pub username: String,
    /// Printer model, e.g. "X1C", "P1S", "A1".
    pub device_type: String,
    /// Seconds between status polls while printing.
    pub poll_interval_secs: u64,
    /// PEM file with the printer's CA certificate for MQTT.
    pub ca_file: Option<PathBuf>,
    /// Print start options.
    pub print_options: PrintOptions,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            serial: String::new(),
            access_code: String::new(),
            username: "bblp".into(),
            device_type: String::new(),
            poll_interval_secs: 3,
            ca_file: None,
            print_options: PrintOptions::default(),
        }
    }
}

impl BridgeConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Check that every value needed to reach the printer is present.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("host", &self.host),
            ("serial", &self.serial),
            ("access_code", &self.access_code),
            ("device_type", &self.device_type),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(BridgeError::InvalidConfig(format!("{} is not set", key)));
            }
        }
        if self.poll_interval_secs == 0 {
            return Err(BridgeError::InvalidConfig(
                "poll_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// URL root of the printer's storage as seen by its firmware.
    pub fn filesystem_root(&self) -> &'static str {
        match self.device_type.to_uppercase().as_str() {
            "X1" | "X1C" => "file:///mnt/sdcard/",
            _ => "file:///sdcard/",
        }
    }

    /// Interval between status polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

//! Printer status types.

use serde::{Deserialize, Serialize};

/// Printer state as reported in `gcode_state`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrintState {
    /// Printer is idle.
    Idle,
    /// Print in progress.
    Printing,
    /// Print paused.
    Paused,
    /// Print finished.
    Finished,
    /// Error state.
    Error(String),
    /// Preparing to print.
    Preparing,
    /// Unknown state.
    #[default]
    Unknown,
}

impl PrintState {
    /// Parse from Bambu status string.
    pub fn from_bambu_status(status: &str) -> Self {
        match status.to_lowercase().as_str() {
            "idle" | "standby" => Self::Idle,
            "printing" | "running" => Self::Printing,
            "paused" | "pause" => Self::Paused,
            "finished" | "finish" | "completed" => Self::Finished,
            "preparing" | "prepare" | "slicing" => Self::Preparing,
            s if s.contains("error") || s.contains("fail") => Self::Error(status.to_string()),
            _ => Self::Unknown,
        }
    }
}

/// Point-in-time view of the printer assembled from MQTT reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Current print state.
    pub state: PrintState,
    /// Name of the active task, usually the project file name.
    pub subtask_name: String,
    /// Gcode file the firmware is executing.
    pub gcode_file: Option<String>,
    /// Print progress (0-100).
    pub progress_percent: u8,
    /// Current layer number.
    pub layer_current: u32,
    /// Total layer count.
    pub layer_total: u32,
    /// Remaining time in minutes.
    pub time_remaining_min: u32,
    /// Active health management (HMS) errors, e.g. `HMS_0300_0100_0001_0007`.
    #[serde(default)]
    pub hms_errors: Vec<String>,
}

impl DeviceSnapshot {
    /// Parse a snapshot from a single Bambu MQTT message.
    pub fn from_mqtt_payload(payload: &serde_json::Value) -> Self {
        let mut snapshot = Self::default();
        snapshot.merge_report(payload);
        snapshot
    }

    /// Fold a report into this snapshot.
    ///
    /// Printers only send the fields that changed since the last push, so
    /// absent fields keep their previous value. Returns `true` when the
    /// payload carried a `print` section.
    pub fn merge_report(&mut self, payload: &serde_json::Value) -> bool {
        let Some(print) = payload.get("print") else {
            return false;
        };

        if let Some(state_str) = print.get("gcode_state").and_then(|v| v.as_str()) {
            self.state = PrintState::from_bambu_status(state_str);
        }

        if let Some(name) = print.get("subtask_name").and_then(|v| v.as_str()) {
            self.subtask_name = name.to_string();
        }
        if let Some(name) = print.get("gcode_file").and_then(|v| v.as_str()) {
            self.gcode_file = Some(name.to_string());
        }

        if let Some(pct) = print.get("mc_percent").and_then(|v| v.as_f64()) {
            self.progress_percent = pct.clamp(0.0, 100.0) as u8;
        }

        // Layers
        if let Some(layer) = print.get("layer_num").and_then(|v| v.as_u64()) {
            self.layer_current = layer as u32;
        }
        if let Some(total) = print.get("total_layer_num").and_then(|v| v.as_u64()) {
            self.layer_total = total as u32;
        }

        if let Some(remaining) = print.get("mc_remaining_time").and_then(|v| v.as_u64()) {
            self.time_remaining_min = remaining as u32;
        }

        if let Some(hms) = print.get("hms").and_then(|v| v.as_array()) {
            self.hms_errors = hms
                .iter()
                .filter_map(|entry| {
                    let attr = entry.get("attr")?.as_u64()?;
                    let code = entry.get("code")?.as_u64()?;
                    Some(hms_code(attr as u32, code as u32))
                })
                .collect();
        }

        true
    }
}

/// Render an HMS entry the way Bambu's wiki indexes them.
pub fn hms_code(attr: u32, code: u32) -> String {
    format!(
        "HMS_{:04X}_{:04X}_{:04X}_{:04X}",
        attr >> 16,
        attr & 0xFFFF,
        code >> 16,
        code & 0xFFFF
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_parsing() {
        assert_eq!(PrintState::from_bambu_status("RUNNING"), PrintState::Printing);
        assert_eq!(PrintState::from_bambu_status("PAUSE"), PrintState::Paused);
        assert_eq!(PrintState::from_bambu_status("FINISH"), PrintState::Finished);
        assert_eq!(PrintState::from_bambu_status("IDLE"), PrintState::Idle);
        assert_eq!(PrintState::from_bambu_status("PREPARE"), PrintState::Preparing);
        assert_eq!(
            PrintState::from_bambu_status("FAILED"),
            PrintState::Error("FAILED".into())
        );
        assert_eq!(PrintState::from_bambu_status("???"), PrintState::Unknown);
    }

    #[test]
    fn test_full_report() {
        let snapshot = DeviceSnapshot::from_mqtt_payload(&json!({
            "print": {
                "gcode_state": "RUNNING",
                "subtask_name": "benchy.gcode.3mf",
                "gcode_file": "/data/Metadata/plate_1.gcode",
                "mc_percent": 42,
                "layer_num": 10,
                "total_layer_num": 120,
                "mc_remaining_time": 33
            }
        }));

        assert_eq!(snapshot.state, PrintState::Printing);
        assert_eq!(snapshot.subtask_name, "benchy.gcode.3mf");
        assert_eq!(snapshot.progress_percent, 42);
        assert_eq!(snapshot.layer_total, 120);
        assert_eq!(snapshot.time_remaining_min, 33);
    }

    #[test]
    fn test_partial_report_keeps_previous_fields() {
        let mut snapshot = DeviceSnapshot::from_mqtt_payload(&json!({
            "print": { "gcode_state": "RUNNING", "subtask_name": "cube", "mc_percent": 5 }
        }));

        assert!(snapshot.merge_report(&json!({ "print": { "mc_percent": 6 } })));
        assert_eq!(snapshot.subtask_name, "cube");
        assert_eq!(snapshot.state, PrintState::Printing);
        assert_eq!(snapshot.progress_percent, 6);

        assert!(!snapshot.merge_report(&json!({ "system": { "command": "ledctrl" } })));
        assert_eq!(snapshot.progress_percent, 6);
    }

    #[test]
    fn test_hms_errors() {
        let mut snapshot = DeviceSnapshot::from_mqtt_payload(&json!({
            "print": { "hms": [{ "attr": 0x0300_0100u32, "code": 0x0001_0007u32 }] }
        }));
        assert_eq!(snapshot.hms_errors, vec!["HMS_0300_0100_0001_0007"]);

        snapshot.merge_report(&json!({ "print": { "mc_percent": 7 } }));
        assert_eq!(snapshot.hms_errors.len(), 1);

        snapshot.merge_report(&json!({ "print": { "hms": [] } }));
        assert!(snapshot.hms_errors.is_empty());
    }
}

//! Bambu printer commands.

use serde_json::json;

use crate::config::{BridgeConfig, PrintOptions};
use crate::record::FileRecord;

/// Plate gcode inside a sliced project archive.
const PLATE_PARAM: &str = "Metadata/plate_1.gcode";

/// Speed percentages the firmware accepts.
pub const SPEED_PERCENT_RANGE: std::ops::RangeInclusive<u64> = 1..=166;

/// Command to send to the printer.
#[derive(Debug, Clone, PartialEq)]
pub enum PrinterCommand {
    /// Request printer status push.
    PushAll,
    /// Start printing a project file already stored on the printer.
    ProjectFile {
        /// Canonical file name, reported back as the task name.
        subtask_name: String,
        /// Path of the file on the printer's storage.
        file: String,
        /// Firmware URL of the file.
        url: String,
        /// Print start options.
        options: PrintOptions,
    },
    /// Pause current print.
    Pause,
    /// Resume paused print.
    Resume,
    /// Stop current print.
    Stop,
    /// Send G-code line.
    GcodeLine(String),
}

impl PrinterCommand {
    /// Build the start command for a stored file.
    pub fn project_file(record: &FileRecord, config: &BridgeConfig) -> Self {
        let file = record.path().to_string();
        PrinterCommand::ProjectFile {
            subtask_name: record.canonical_name().to_string(),
            url: format!("{}{}", config.filesystem_root(), file),
            file,
            options: config.print_options.clone(),
        }
    }

    /// G-code that changes the print speed to `percent` of nominal.
    ///
    /// The firmware couples acceleration, feed rate and the claimed speed
    /// level; the curves below are the ones its own speed presets follow.
    /// Returns `None` outside [`SPEED_PERCENT_RANGE`].
    pub fn speed_adjust(percent: u64) -> Option<Self> {
        if !SPEED_PERCENT_RANGE.contains(&percent) {
            return None;
        }
        let speed_fraction = 100.0 / percent as f64;
        let acceleration = ((speed_fraction - 1.0191) / -0.814).exp();
        let feed_rate = 2.1645 * acceleration.powi(3) - 5.3247 * acceleration.powi(2)
            + 4.342 * acceleration
            - 0.181;
        let speed_level = 1.539 * acceleration.powi(2) - 0.7032 * acceleration + 4.0834;

        Some(PrinterCommand::GcodeLine(format!(
            "M204.2 K{:.2} \nM220 K{:.2} \nM73.2 R{:.2} \nM1002 set_gcode_claim_speed_level {:.0}",
            acceleration, feed_rate, speed_fraction, speed_level
        )))
    }

    /// Convert command to JSON payload.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PrinterCommand::PushAll => json!({
                "pushing": {
                    "sequence_id": "0",
                    "command": "pushall"
                }
            }),

            PrinterCommand::ProjectFile {
                subtask_name,
                file,
                url,
                options,
            } => json!({
                "print": {
                    "sequence_id": 0,
                    "command": "project_file",
                    "param": PLATE_PARAM,
                    "md5": "",
                    "profile_id": "0",
                    "project_id": "0",
                    "subtask_id": "0",
                    "task_id": "0",
                    "subtask_name": subtask_name,
                    "file": file,
                    "url": url,
                    "timelapse": options.timelapse,
                    "bed_leveling": options.bed_leveling,
                    "flow_cali": options.flow_cali,
                    "vibration_cali": options.vibration_cali,
                    "layer_inspect": options.layer_inspect,
                    "use_ams": options.use_ams
                }
            }),

            PrinterCommand::Pause => json!({
                "print": {
                    "sequence_id": "0",
                    "command": "pause"
                }
            }),

            PrinterCommand::Resume => json!({
                "print": {
                    "sequence_id": "0",
                    "command": "resume"
                }
            }),

            PrinterCommand::Stop => json!({
                "print": {
                    "sequence_id": "0",
                    "command": "stop"
                }
            }),

            PrinterCommand::GcodeLine(gcode) => json!({
                "print": {
                    "sequence_id": "0",
                    "command": "gcode_line",
                    "param": format!("{}\n", gcode.trim_end())
                }
            }),
        }
    }

    /// Get the MQTT topic suffix for this command.
    pub fn topic_suffix(&self) -> &'static str {
        "request"
    }

    /// Short name of the command for logs.
    pub fn name(&self) -> &'static str {
        match self {
            PrinterCommand::PushAll => "pushall",
            PrinterCommand::ProjectFile { .. } => "project_file",
            PrinterCommand::Pause => "pause",
            PrinterCommand::Resume => "resume",
            PrinterCommand::Stop => "stop",
            PrinterCommand::GcodeLine(_) => "gcode_line",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(path: &str) -> FileRecord {
        let modified = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        FileRecord::new("benchy.3mf".into(), path.into(), 1024, modified)
    }

    #[test]
    fn test_push_all_command() {
        let cmd = PrinterCommand::PushAll;
        let json = cmd.to_json();
        assert!(json.get("pushing").is_some());
    }

    #[test]
    fn test_pause_command() {
        let cmd = PrinterCommand::Pause;
        let json = cmd.to_json();
        assert_eq!(json["print"]["command"].as_str(), Some("pause"));
    }

    #[test]
    fn test_project_file_command_fields() {
        let config = BridgeConfig {
            device_type: "X1C".into(),
            print_options: PrintOptions {
                timelapse: true,
                use_ams: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let cmd = PrinterCommand::project_file(&record("cache/Benchy.3mf"), &config);
        let json = cmd.to_json();
        let print = &json["print"];

        assert_eq!(print["command"], "project_file");
        assert_eq!(print["param"], "Metadata/plate_1.gcode");
        assert_eq!(print["subtask_name"], "benchy.3mf");
        assert_eq!(print["file"], "cache/Benchy.3mf");
        assert_eq!(print["url"], "file:///mnt/sdcard/cache/Benchy.3mf");
        assert_eq!(print["timelapse"], true);
        assert_eq!(print["bed_leveling"], true);
        assert_eq!(print["use_ams"], false);
    }

    #[test]
    fn test_project_file_url_root_for_p1() {
        let config = BridgeConfig {
            device_type: "P1S".into(),
            ..Default::default()
        };
        let cmd = PrinterCommand::project_file(&record("Benchy.3mf"), &config);
        assert_eq!(cmd.to_json()["print"]["url"], "file:///sdcard/Benchy.3mf");
    }

    #[test]
    fn test_gcode_line_is_newline_terminated() {
        let json = PrinterCommand::GcodeLine("M104 S200".into()).to_json();
        assert_eq!(json["print"]["param"], "M104 S200\n");
    }

    #[test]
    fn test_speed_adjust_gcode() {
        let cmd = PrinterCommand::speed_adjust(100).unwrap();
        assert_eq!(cmd.name(), "gcode_line");
        assert_eq!(
            cmd.to_json()["print"]["param"],
            "M204.2 K1.02 \nM220 K1.01 \nM73.2 R1.00 \nM1002 set_gcode_claim_speed_level 5\n"
        );

        let PrinterCommand::GcodeLine(half) = PrinterCommand::speed_adjust(50).unwrap() else {
            panic!("expected a gcode line");
        };
        assert!(half.contains("M73.2 R2.00"));

        assert!(PrinterCommand::speed_adjust(0).is_none());
        assert!(PrinterCommand::speed_adjust(167).is_none());
    }
}

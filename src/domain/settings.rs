use crate::domain::profile::{CHARACTERISTIC_UUID, DEFAULT_TRANSFORM_GRACE_MS, SERVICE_UUID};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "robosen_controller".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Which BLE backend the engine drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    WinRt,
    Simulated,
}

impl Default for TransportKind {
    fn default() -> Self {
        if cfg!(windows) {
            Self::WinRt
        } else {
            Self::Simulated
        }
    }
}

/// A robot the simulated backend advertises
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedRobotSettings {
    pub name: String,
    pub address: u64,
    #[serde(default = "default_false")]
    pub vehicle_mode: bool,
    #[serde(default = "default_battery")]
    pub battery: u8,
}

fn default_battery() -> u8 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_simulated_robots")]
    pub simulated_robots: Vec<SimulatedRobotSettings>,

    // Discovery
    #[serde(default = "default_scan_window_ms")]
    pub scan_window_ms: u64,
    /// Stop connecting once this many robots are connected
    #[serde(default)]
    pub max_robots: Option<usize>,

    // Robot timing
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_motion_idle_ms")]
    pub motion_idle_ms: u64,
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    #[serde(default = "default_transform_grace_ms")]
    pub transform_grace_ms: u64,
    #[serde(default = "default_stop_repeats")]
    pub stop_repeats: u8,
    #[serde(default = "default_command_delay_ms")]
    pub command_delay_ms: u64,
    #[serde(default = "default_repeat_spacing_ms")]
    pub repeat_spacing_ms: u64,

    // Reconnect Settings
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    // Advanced BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_characteristic_uuid")]
    pub ble_write_char_uuid: String,
    #[serde(default = "default_characteristic_uuid")]
    pub ble_notify_char_uuid: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            transport: TransportKind::default(),
            simulated_robots: default_simulated_robots(),
            scan_window_ms: default_scan_window_ms(),
            max_robots: None,
            poll_interval_ms: default_poll_interval_ms(),
            motion_idle_ms: default_motion_idle_ms(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
            transform_grace_ms: default_transform_grace_ms(),
            stop_repeats: default_stop_repeats(),
            command_delay_ms: default_command_delay_ms(),
            repeat_spacing_ms: default_repeat_spacing_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            ble_service_uuid: default_service_uuid(),
            ble_write_char_uuid: default_characteristic_uuid(),
            ble_notify_char_uuid: default_characteristic_uuid(),
        }
    }
}

fn default_simulated_robots() -> Vec<SimulatedRobotSettings> {
    vec![
        SimulatedRobotSettings {
            name: "OP-M-SIM001".to_string(),
            address: 0x00C0_FFEE_0001,
            vehicle_mode: false,
            battery: 90,
        },
        SimulatedRobotSettings {
            name: "GSEG-SIM002".to_string(),
            address: 0x00C0_FFEE_0002,
            vehicle_mode: true,
            battery: 75,
        },
    ]
}
fn default_scan_window_ms() -> u64 {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_motion_idle_ms() -> u64 {
    2_000
}
fn default_confirm_timeout_ms() -> u64 {
    3_000
}
fn default_transform_grace_ms() -> u64 {
    DEFAULT_TRANSFORM_GRACE_MS
}
fn default_stop_repeats() -> u8 {
    3
}
fn default_command_delay_ms() -> u64 {
    20
}
fn default_repeat_spacing_ms() -> u64 {
    100
}
fn default_reconnect_max_attempts() -> u32 {
    5
}
fn default_reconnect_base_delay_ms() -> u64 {
    500
}
fn default_reconnect_max_delay_ms() -> u64 {
    8_000
}
fn default_service_uuid() -> String {
    SERVICE_UUID.to_string()
}
fn default_characteristic_uuid() -> String {
    CHARACTERISTIC_UUID.to_string()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when it is missing or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("RobosenController");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

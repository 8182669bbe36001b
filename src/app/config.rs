use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

pub const CONFIG_PATH_ENV: &str = "DROIDSCOPE_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdbSettings {
    pub command_path: String,
    pub command_timeout_sec: u64,
    pub transfer_timeout_sec: u64,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
            command_timeout_sec: 10,
            transfer_timeout_sec: 600,
        }
    }
}

impl AdbSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_sec)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_sec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogcatSettings {
    pub clear_on_start: bool,
}

impl Default for LogcatSettings {
    fn default() -> Self {
        Self {
            clear_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScreenRecordSettings {
    pub remote_dir: String,
    pub bit_rate: String,
    pub time_limit_sec: u32,
    pub size: String,
    pub flush_grace_ms: u64,
}

impl Default for ScreenRecordSettings {
    fn default() -> Self {
        Self {
            remote_dir: "/sdcard".to_string(),
            bit_rate: String::new(),
            time_limit_sec: 0,
            size: String::new(),
            flush_grace_ms: 1000,
        }
    }
}

impl ScreenRecordSettings {
    /// `screenrecord` stops on its own after 180 seconds unless told otherwise.
    pub fn effective_time_limit(&self) -> Duration {
        let secs = if self.time_limit_sec == 0 {
            180
        } else {
            self.time_limit_sec
        };
        Duration::from_secs(u64::from(secs))
    }

    pub fn flush_grace(&self) -> Duration {
        Duration::from_millis(self.flush_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetrySettings {
    pub poll_interval_ms: u64,
    pub always_detailed_memory: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            always_detailed_memory: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileListingMode {
    #[default]
    Sync,
    Ls,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct FileSettings {
    pub listing: FileListingMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub logcat: LogcatSettings,
    #[serde(default)]
    pub screen_record: ScreenRecordSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub files: FileSettings,
    #[serde(default)]
    pub output_path: String,
    #[serde(default)]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adb: AdbSettings::default(),
            logging: LoggingSettings::default(),
            logcat: LogcatSettings::default(),
            screen_record: ScreenRecordSettings::default(),
            telemetry: TelemetrySettings::default(),
            files: FileSettings::default(),
            output_path: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl AppConfig {
    /// Configured directory for exported artifacts; `None` leaves the choice to the caller.
    pub fn output_dir(&self) -> Option<PathBuf> {
        let trimmed = self.output_path.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    home_dir().join(".droidscope_config.json")
}

pub fn backup_config_path() -> PathBuf {
    home_dir().join(".droidscope_config.backup.json")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn load_config(trace_id: &str) -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn save_config(config: &AppConfig, trace_id: &str) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path(), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), trace_id))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    if config.adb.command_timeout_sec == 0 {
        config.adb.command_timeout_sec = 10;
    }
    if config.adb.transfer_timeout_sec < config.adb.command_timeout_sec {
        config.adb.transfer_timeout_sec = 600;
    }
    config.screen_record.remote_dir = config
        .screen_record
        .remote_dir
        .trim()
        .trim_end_matches('/')
        .to_string();
    if config.screen_record.remote_dir.is_empty() {
        config.screen_record.remote_dir = "/sdcard".to_string();
    }
    if config.screen_record.time_limit_sec > 180 {
        config.screen_record.time_limit_sec = 180;
    }
    if config.screen_record.flush_grace_ms > 10_000 {
        config.screen_record.flush_grace_ms = 1000;
    }
    config.telemetry.poll_interval_ms = config.telemetry.poll_interval_ms.clamp(250, 10_000);
    config.output_path = config.output_path.trim().to_string();
    config
}

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Local;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::app::adb::executor::ShellExecutor;
use crate::app::adb::paths::{join_device_path, shell_quote};
use crate::app::config::ScreenRecordSettings;
use crate::app::error::AppError;
use crate::app::models::RecordingExport;

pub const STOP_COMMAND: &str = "pkill -l SIGINT screenrecord";
pub const VIDEO_DATA_URL_PREFIX: &str = "data:video/mp4;base64,";
const TASK_TIMEOUT_MARGIN: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordingState {
    Idle,
    Recording,
    Stopping,
}

/// Where a finished recording goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingDestination {
    /// Returned to the caller as a base64 data URL.
    Inline,
    File(PathBuf),
}

struct Shared {
    state: RecordingState,
    generation: u64,
    remote_path: Option<String>,
}

pub fn recording_remote_path(remote_dir: &str) -> String {
    let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
    join_device_path(remote_dir, &format!("screenrecord_{stamp}.mp4"))
}

pub fn screenrecord_command(settings: &ScreenRecordSettings, remote_path: &str) -> String {
    let mut parts = vec!["screenrecord".to_string()];
    if !settings.bit_rate.trim().is_empty() {
        parts.push("--bit-rate".to_string());
        parts.push(settings.bit_rate.trim().to_string());
    }
    if settings.time_limit_sec > 0 {
        parts.push("--time-limit".to_string());
        parts.push(settings.time_limit_sec.to_string());
    }
    if !settings.size.trim().is_empty() {
        parts.push("--size".to_string());
        parts.push(settings.size.trim().to_string());
    }
    parts.push(shell_quote(remote_path));
    parts.join(" ")
}

/// At most one capture per device. The background task only ever moves a recording it started
/// back to Idle, which the generation counter enforces.
pub struct RecordingController {
    settings: ScreenRecordSettings,
    shared: Arc<Mutex<Shared>>,
    task: Option<JoinHandle<()>>,
}

impl RecordingController {
    pub fn new(settings: ScreenRecordSettings) -> Self {
        Self {
            settings,
            shared: Arc::new(Mutex::new(Shared {
                state: RecordingState::Idle,
                generation: 0,
                remote_path: None,
            })),
            task: None,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.shared
            .lock()
            .map(|shared| shared.state)
            .unwrap_or(RecordingState::Idle)
    }

    pub fn remote_path(&self) -> Option<String> {
        self.shared
            .lock()
            .ok()
            .and_then(|shared| shared.remote_path.clone())
    }

    /// `Ok(false)` if a recording is already in progress.
    pub fn start(&mut self, executor: Arc<dyn ShellExecutor>, trace_id: &str) -> Result<bool, AppError> {
        let remote_path = recording_remote_path(&self.settings.remote_dir);
        let command = screenrecord_command(&self.settings, &remote_path);
        let generation = {
            let mut shared = self
                .shared
                .lock()
                .map_err(|_| AppError::system("Recording state locked", trace_id))?;
            if shared.state != RecordingState::Idle {
                warn!(trace_id = %trace_id, state = ?shared.state, "recording already in progress");
                return Ok(false);
            }
            shared.generation += 1;
            shared.state = RecordingState::Recording;
            shared.remote_path = Some(remote_path.clone());
            shared.generation
        };

        let timeout = self.settings.effective_time_limit() + TASK_TIMEOUT_MARGIN;
        let shared = Arc::clone(&self.shared);
        let task_trace = trace_id.to_string();
        let spawned = std::thread::Builder::new()
            .name("screenrecord".to_string())
            .spawn(move || {
                match executor.shell_with_timeout(&command, timeout, &task_trace) {
                    Ok(_) => debug!(trace_id = %task_trace, "screenrecord exited"),
                    Err(err) => {
                        error!(trace_id = %task_trace, error = %err, "screenrecord failed");
                        if let Ok(mut shared) = shared.lock() {
                            if shared.generation == generation && shared.state == RecordingState::Recording {
                                shared.state = RecordingState::Idle;
                                shared.remote_path = None;
                            }
                        }
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                // The previous task has either exited or is about to; it never touches a newer generation.
                self.task = Some(handle);
                info!(trace_id = %trace_id, remote_path = %remote_path, "screen recording started");
                Ok(true)
            }
            Err(err) => {
                self.reset();
                Err(AppError::system(
                    format!("Failed to spawn screenrecord task: {err}"),
                    trace_id,
                ))
            }
        }
    }

    /// Signals the device-side capture, waits the flush grace period, then fetches and deletes the
    /// file. The controller is Idle afterwards whatever the outcome.
    pub fn stop(
        &mut self,
        executor: &dyn ShellExecutor,
        destination: RecordingDestination,
        trace_id: &str,
    ) -> Result<RecordingExport, AppError> {
        let remote_path = {
            let mut shared = self
                .shared
                .lock()
                .map_err(|_| AppError::system("Recording state locked", trace_id))?;
            if shared.state != RecordingState::Recording {
                return Err(AppError::precondition("No recording in progress", trace_id));
            }
            shared.state = RecordingState::Stopping;
            shared.remote_path.clone().unwrap_or_default()
        };

        if let Err(err) = executor.shell(STOP_COMMAND, trace_id) {
            self.reset();
            return Err(err);
        }
        std::thread::sleep(self.settings.flush_grace());

        let result = retrieve_recording(executor, &remote_path, &destination, trace_id);
        self.reset();
        if let Some(task) = self.task.take() {
            if task.is_finished() {
                let _ = task.join();
            }
        }

        let export = result?;
        let remove = format!("rm -f {}", shell_quote(&remote_path));
        if let Err(err) = executor.shell(&remove, trace_id) {
            warn!(trace_id = %trace_id, error = %err, remote_path = %remote_path, "failed to delete device recording");
        }
        info!(trace_id = %trace_id, size_bytes = export.size_bytes, "screen recording exported");
        Ok(export)
    }

    /// Signals a running capture without retrieving it; used when the session lets go of the device.
    pub fn abort(&mut self, executor: &dyn ShellExecutor, trace_id: &str) {
        if self.state() != RecordingState::Recording {
            return;
        }
        if let Err(err) = executor.shell(STOP_COMMAND, trace_id) {
            warn!(trace_id = %trace_id, error = %err, "failed to signal screenrecord");
        }
        self.reset();
        info!(trace_id = %trace_id, "screen recording abandoned");
    }

    fn reset(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.state = RecordingState::Idle;
            shared.remote_path = None;
        }
    }
}

fn retrieve_recording(
    executor: &dyn ShellExecutor,
    remote_path: &str,
    destination: &RecordingDestination,
    trace_id: &str,
) -> Result<RecordingExport, AppError> {
    match destination {
        RecordingDestination::Inline => {
            let bytes = executor.read_file(remote_path, trace_id)?;
            if bytes.is_empty() {
                return Err(AppError::dependency("Recording file is empty", trace_id));
            }
            Ok(RecordingExport {
                remote_path: remote_path.to_string(),
                size_bytes: bytes.len() as u64,
                local_path: None,
                data_url: Some(format!("{VIDEO_DATA_URL_PREFIX}{}", STANDARD.encode(&bytes))),
            })
        }
        RecordingDestination::File(path) => {
            ensure_parent_dir(path, trace_id)?;
            executor.pull(remote_path, path, trace_id)?;
            let size_bytes = fs::metadata(path)
                .map_err(|err| AppError::system(format!("Failed to stat recording: {err}"), trace_id))?
                .len();
            if size_bytes == 0 {
                return Err(AppError::dependency("Recording file is empty", trace_id));
            }
            Ok(RecordingExport {
                remote_path: remote_path.to_string(),
                size_bytes,
                local_path: Some(path.to_string_lossy().to_string()),
                data_url: None,
            })
        }
    }
}

pub(crate) fn ensure_parent_dir(path: &Path, trace_id: &str) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|err| AppError::system(format!("Failed to create output dir: {err}"), trace_id))?;
    }
    Ok(())
}

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::executor::{AdbShellExecutor, ShellExecutor};
use crate::app::adb::locator::{list_devices, locate_adb};
use crate::app::adb::parse::{
    build_device_overview, output_reports_success, parse_pm_list_packages, parse_pm_path,
    parse_sdk_version, OverviewSources,
};
use crate::app::adb::paths::{
    device_basename, join_device_path, shell_quote, validate_device_path, validate_package_name,
};
use crate::app::adb::table::{
    parse_detected_process_table, parse_fixed_process_table, parse_ls_long, process_list_command,
    process_records, sort_directories_first, sync_entry_to_file_entry, FALLBACK_PROCESS_COMMAND,
};
use crate::app::config::{AppConfig, FileListingMode};
use crate::app::error::AppError;
use crate::app::logcat::{LogSink, LogStreamTailer, TailerState};
use crate::app::models::{
    DeviceIdentity, DeviceOverview, FileEntry, MemoryReading, PackageEntry, ProcessRecord,
    RecordingExport, ScreenCapture,
};
use crate::app::recording::{ensure_parent_dir, RecordingController, RecordingDestination, RecordingState};
use crate::app::screenshot::capture_screenshot;
use crate::app::telemetry::{self, DeviceCapabilities, TelemetrySink, TickerHandle};


const SDK_COMMAND: &str = "getprop ro.build.version.sdk";

fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

fn ensure_non_empty(value: &str, field: &str, trace_id: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(format!("{field} is required"), trace_id));
    }
    Ok(())
}

fn ensure_package(package: &str, trace_id: &str) -> Result<String, AppError> {
    validate_package_name(package).map_err(|err| AppError::validation(err, trace_id))?;
    Ok(package.trim().to_string())
}

fn ensure_device_path(path: &str, trace_id: &str) -> Result<String, AppError> {
    validate_device_path(path).map_err(|err| AppError::validation(err, trace_id))?;
    Ok(path.trim().to_string())
}

/// Listing accepts `/` itself; mutations go through [`ensure_device_path`].
fn ensure_listing_path(path: &str, trace_id: &str) -> Result<String, AppError> {
    let trimmed = path.trim();
    if !trimmed.starts_with('/') || trimmed.contains(['\0', '\n']) {
        return Err(AppError::validation(
            "device_path must be an absolute device path starting with '/'",
            trace_id,
        ));
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err(AppError::validation("device_path must not contain '..' segments", trace_id));
    }
    Ok(trimmed.to_string())
}

struct BoundDevice {
    identity: DeviceIdentity,
    executor: Arc<dyn ShellExecutor>,
    capabilities: DeviceCapabilities,
}

/// Everything the operator can do against one selected device. Operations before a device is
/// bound fail with `ERR_PRECONDITION`.
pub struct DeviceSession {
    config: AppConfig,
    device: Option<BoundDevice>,
    tailer: LogStreamTailer,
    recording: RecordingController,
    telemetry: Option<TickerHandle>,
}

impl DeviceSession {
    pub fn new(config: AppConfig) -> Self {
        let recording = RecordingController::new(config.screen_record.clone());
        Self {
            config,
            device: None,
            tailer: LogStreamTailer::new(),
            recording,
            telemetry: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceIdentity>, AppError> {
        let trace_id = new_trace_id();
        let program = locate_adb(&self.config.adb, &trace_id)?;
        list_devices(&program, &self.config.adb, &trace_id)
    }

    /// Binds to a device reachable through the local adb server.
    pub fn connect(&mut self, serial: &str) -> Result<DeviceCapabilities, AppError> {
        let trace_id = new_trace_id();
        ensure_non_empty(serial, "serial", &trace_id)?;
        let serial = serial.trim();
        let program = locate_adb(&self.config.adb, &trace_id)?;
        let identity = list_devices(&program, &self.config.adb, &trace_id)?
            .into_iter()
            .find(|device| device.serial == serial)
            .ok_or_else(|| {
                AppError::dependency(format!("Device {serial} is not connected"), &trace_id)
            })?;
        let executor = Arc::new(AdbShellExecutor::new(program, serial, &self.config.adb));
        self.bind(identity, executor)
    }

    /// Replaces any current binding; background work tied to the old device is stopped first.
    pub fn bind(
        &mut self,
        identity: DeviceIdentity,
        executor: Arc<dyn ShellExecutor>,
    ) -> Result<DeviceCapabilities, AppError> {
        let trace_id = new_trace_id();
        ensure_non_empty(&identity.serial, "serial", &trace_id)?;
        self.release(&trace_id);

        let raw = executor.shell(SDK_COMMAND, &trace_id)?;
        let sdk_level = parse_sdk_version(&raw).unwrap_or_else(|| {
            warn!(trace_id = %trace_id, serial = %identity.serial, output = %raw.trim(), "unparseable sdk level; assuming 0");
            0
        });
        let capabilities = DeviceCapabilities::resolve(sdk_level, &self.config.telemetry);
        info!(
            trace_id = %trace_id,
            serial = %identity.serial,
            sdk_level,
            memory_probe = ?capabilities.memory_probe,
            cpu_probe = ?capabilities.cpu_probe,
            "device bound"
        );
        self.device = Some(BoundDevice {
            identity,
            executor,
            capabilities,
        });
        Ok(capabilities)
    }

    /// Returns whether a device was bound.
    pub fn unbind(&mut self) -> bool {
        let trace_id = new_trace_id();
        self.release(&trace_id)
    }

    fn release(&mut self, trace_id: &str) -> bool {
        if let Some(mut ticker) = self.telemetry.take() {
            ticker.stop();
        }
        if let Err(err) = self.tailer.stop(trace_id) {
            warn!(trace_id = %trace_id, error = %err, "failed to stop log tailer");
        }
        let Some(device) = self.device.take() else {
            return false;
        };
        self.recording.abort(device.executor.as_ref(), trace_id);
        info!(trace_id = %trace_id, serial = %device.identity.serial, "device released");
        true
    }

    fn bound(&self, trace_id: &str) -> Result<&BoundDevice, AppError> {
        self.device
            .as_ref()
            .ok_or_else(|| AppError::precondition("No device selected", trace_id))
    }

    pub fn is_bound(&self) -> bool {
        self.device.is_some()
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.device.as_ref().map(|device| &device.identity)
    }

    pub fn capabilities(&self) -> Result<DeviceCapabilities, AppError> {
        let trace_id = new_trace_id();
        Ok(self.bound(&trace_id)?.capabilities)
    }

    pub fn sdk_level(&self) -> Result<u32, AppError> {
        Ok(self.capabilities()?.sdk_level)
    }

    pub fn device_overview(&self) -> Result<DeviceOverview, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let shell = |command: &str| device.executor.shell(command, &trace_id);
        // Optional fields: a device without wlan0 or a locked-down settings provider still
        // gets an overview.
        let optional = |command: &str| {
            shell(command).unwrap_or_else(|err| {
                warn!(trace_id = %trace_id, command = %command, error = %err, "optional overview query failed");
                String::new()
            })
        };
        let kernel = shell("uname -r")?;
        let font_scale = optional("settings get system font_scale");
        let getprop = shell("getprop")?;
        let wlan = optional("ip addr show wlan0");
        let meminfo = shell("cat /proc/meminfo")?;
        let wm_size = shell("wm size")?;
        let wm_density = shell("wm density")?;
        Ok(build_device_overview(
            &device.identity.serial,
            device.capabilities.sdk_level,
            &OverviewSources {
                kernel: &kernel,
                font_scale: &font_scale,
                getprop: &getprop,
                wlan: &wlan,
                meminfo: &meminfo,
                wm_size: &wm_size,
                wm_density: &wm_density,
            },
        ))
    }

    pub fn find_pid(&self, package: &str) -> Result<Option<u32>, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let package = ensure_package(package, &trace_id)?;
        telemetry::find_pid(device.executor.as_ref(), &package, &trace_id)
    }

    pub fn list_packages(&self, third_party_only: bool) -> Result<Vec<PackageEntry>, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let command = if third_party_only {
            "pm list packages -3"
        } else {
            "pm list packages"
        };
        let output = device.executor.shell(command, &trace_id)?;
        Ok(parse_pm_list_packages(&output))
    }

    /// Tries the fixed-column `top` first and falls back to header detection on older toolboxes.
    pub fn list_processes(&self) -> Result<Vec<ProcessRecord>, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let command = process_list_command();
        let output = device.executor.shell(&command, &trace_id)?;
        if let Some(rows) = parse_fixed_process_table(&output, Some(&command)) {
            return Ok(process_records(&rows));
        }
        warn!(trace_id = %trace_id, "fixed-column top unsupported; detecting columns");
        let output = device.executor.shell(FALLBACK_PROCESS_COMMAND, &trace_id)?;
        parse_detected_process_table(&output, Some(FALLBACK_PROCESS_COMMAND))
            .map(|rows| process_records(&rows))
            .ok_or_else(|| AppError::parse("Process listing has no PID header", &trace_id))
    }

    pub fn install_package(&self, apk: &Path) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        if !apk.is_file() {
            return Err(AppError::validation(
                format!("APK not found: {}", apk.display()),
                &trace_id,
            ));
        }
        let output = device.executor.install(apk, &trace_id)?;
        let success = output_reports_success(&output);
        info!(trace_id = %trace_id, apk = %apk.display(), success, "install finished");
        Ok(success)
    }

    fn package_command(
        &self,
        package: &str,
        build: impl FnOnce(&str) -> String,
    ) -> Result<(String, String), AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let package = ensure_package(package, &trace_id)?;
        let output = device.executor.shell(&build(&package), &trace_id)?;
        Ok((output, trace_id))
    }

    pub fn uninstall_package(&self, package: &str) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let package = ensure_package(package, &trace_id)?;
        let output = device.executor.uninstall(&package, &trace_id)?;
        Ok(output_reports_success(&output))
    }

    pub fn clear_app_data(&self, package: &str) -> Result<bool, AppError> {
        let (output, _) = self.package_command(package, |package| format!("pm clear {package}"))?;
        Ok(output_reports_success(&output))
    }

    pub fn start_app(&self, package: &str) -> Result<bool, AppError> {
        let (output, trace_id) = self.package_command(package, |package| {
            format!("monkey -p {package} -c android.intent.category.LAUNCHER 1")
        })?;
        let launched = output.contains("Events injected") && !output.contains("No activities found");
        if !launched {
            warn!(trace_id = %trace_id, output = %output.trim(), "app launch reported no activity");
        }
        Ok(launched)
    }

    /// `am force-stop` prints nothing on success.
    pub fn stop_app(&self, package: &str) -> Result<bool, AppError> {
        let (output, _) = self.package_command(package, |package| format!("am force-stop {package}"))?;
        Ok(output.trim().is_empty())
    }

    pub fn set_app_enabled(&self, package: &str, enabled: bool) -> Result<bool, AppError> {
        let (output, _) = self.package_command(package, |package| {
            if enabled {
                format!("pm enable {package}")
            } else {
                format!("pm disable-user {package}")
            }
        })?;
        let normalized = output.to_lowercase();
        Ok(if enabled {
            normalized.contains("enabled")
        } else {
            normalized.contains("disabled")
        })
    }

    /// Pulls the base APK. `Ok(false)` when the package has no APK path.
    pub fn pull_apk(&self, package: &str, destination: &Path) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let package = ensure_package(package, &trace_id)?;
        let output = device
            .executor
            .shell(&format!("pm path {package}"), &trace_id)?;
        let Some(remote) = parse_pm_path(&output).into_iter().next() else {
            warn!(trace_id = %trace_id, package = %package, "pm path returned no APK path");
            return Ok(false);
        };
        let target = if destination.is_dir() {
            destination.join(format!("{package}.apk"))
        } else {
            destination.to_path_buf()
        };
        ensure_parent_dir(&target, &trace_id)?;
        device.executor.pull(&remote, &target, &trace_id)?;
        info!(trace_id = %trace_id, package = %package, target = %target.display(), "apk pulled");
        Ok(true)
    }

    /// Directories first, then case-insensitive name.
    pub fn list_files(&self, path: &str) -> Result<Vec<FileEntry>, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let path = ensure_listing_path(path, &trace_id)?;
        let mut entries: Vec<FileEntry> = match self.config.files.listing {
            FileListingMode::Sync => device
                .executor
                .list_dir(&path, &trace_id)?
                .iter()
                .map(|entry| sync_entry_to_file_entry(&path, entry))
                .collect(),
            FileListingMode::Ls => {
                let output = device
                    .executor
                    .shell(&format!("ls -l {}", shell_quote(&path)), &trace_id)?;
                parse_ls_long(&path, &output)
            }
        };
        sort_directories_first(&mut entries);
        Ok(entries)
    }

    pub fn create_folder(&self, path: &str) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let path = ensure_device_path(path, &trace_id)?;
        device
            .executor
            .shell(&format!("mkdir -p {}", shell_quote(&path)), &trace_id)?;
        Ok(true)
    }

    pub fn delete_path(&self, path: &str) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let path = ensure_device_path(path, &trace_id)?;
        device
            .executor
            .shell(&format!("rm -rf {}", shell_quote(&path)), &trace_id)?;
        info!(trace_id = %trace_id, path = %path, "device path deleted");
        Ok(true)
    }

    pub fn pull_file(&self, remote: &str, local: &Path) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let remote = ensure_device_path(remote, &trace_id)?;
        let target = if local.is_dir() {
            local.join(device_basename(&remote))
        } else {
            local.to_path_buf()
        };
        ensure_parent_dir(&target, &trace_id)?;
        device.executor.pull(&remote, &target, &trace_id)?;
        Ok(true)
    }

    /// Uploads into `remote_dir` under the local file name; returns the device path written.
    pub fn push_file(&self, local: &Path, remote_dir: &str) -> Result<String, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let remote_dir = ensure_device_path(remote_dir, &trace_id)?;
        if !local.is_file() {
            return Err(AppError::validation(
                format!("Local file not found: {}", local.display()),
                &trace_id,
            ));
        }
        let name = local
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| AppError::validation("Local path has no file name", &trace_id))?;
        let target = join_device_path(&remote_dir, &name);
        device.executor.push(local, &target, &trace_id)?;
        Ok(target)
    }

    pub fn capture_screenshot(&self) -> Result<ScreenCapture, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        capture_screenshot(
            device.executor.as_ref(),
            &self.config.screen_record.remote_dir,
            &trace_id,
        )
    }

    /// Replaces any running subscription.
    pub fn start_logcat(&mut self, sink: LogSink) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        let executor = Arc::clone(&self.bound(&trace_id)?.executor);
        if self.tailer.stop(&trace_id)? {
            info!(trace_id = %trace_id, "previous log tailer replaced");
        }
        self.tailer.start(
            executor.as_ref(),
            self.config.logcat.clear_on_start,
            sink,
            &trace_id,
        )
    }

    pub fn stop_logcat(&mut self) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        self.tailer.stop(&trace_id)
    }

    pub fn logcat_state(&self) -> TailerState {
        self.tailer.state()
    }

    /// `Ok(false)` when a recording is already running.
    pub fn start_recording(&mut self) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        let executor = Arc::clone(&self.bound(&trace_id)?.executor);
        self.recording.start(executor, &trace_id)
    }

    pub fn stop_recording(&mut self, destination: RecordingDestination) -> Result<RecordingExport, AppError> {
        let trace_id = new_trace_id();
        let executor = Arc::clone(&self.bound(&trace_id)?.executor);
        self.recording.stop(executor.as_ref(), destination, &trace_id)
    }

    pub fn recording_state(&self) -> RecordingState {
        self.recording.state()
    }

    /// The package is mandatory on the detailed path and otherwise only used to find the pid.
    pub fn sample_memory(&self, package: Option<&str>) -> Result<Option<MemoryReading>, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let package = match package.filter(|package| !package.trim().is_empty()) {
            Some(package) => Some(ensure_package(package, &trace_id)?),
            None => None,
        };
        let pid = match package.as_deref() {
            Some(package) => telemetry::find_pid(device.executor.as_ref(), package, &trace_id)?,
            None => None,
        };
        device.capabilities.memory_probe.sample(
            device.executor.as_ref(),
            pid,
            package.as_deref(),
            &trace_id,
        )
    }

    pub fn sample_cpu(&self, package: &str) -> Result<String, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let package = ensure_package(package, &trace_id)?;
        let pid = telemetry::find_pid(device.executor.as_ref(), &package, &trace_id)?;
        device
            .capabilities
            .cpu_probe
            .sample(device.executor.as_ref(), pid, Some(&package), &trace_id)
    }

    /// Starts polling `package`, replacing any running poller. `interval` defaults to the
    /// configured poll interval.
    pub fn start_telemetry(
        &mut self,
        package: &str,
        interval: Option<Duration>,
        sink: TelemetrySink,
    ) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        let device = self.bound(&trace_id)?;
        let package = ensure_package(package, &trace_id)?;
        let interval =
            interval.unwrap_or_else(|| Duration::from_millis(self.config.telemetry.poll_interval_ms));
        let handle = telemetry::start_telemetry(
            Arc::clone(&device.executor),
            device.capabilities,
            &package,
            interval,
            sink,
            &trace_id,
        )?;
        if let Some(mut previous) = self.telemetry.replace(handle) {
            previous.stop();
        }
        Ok(true)
    }

    pub fn stop_telemetry(&mut self) -> bool {
        match self.telemetry.take() {
            Some(mut handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let trace_id = new_trace_id();
        self.release(&trace_id);
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::adb::executor::ShellExecutor;
use crate::app::adb::parse::parse_ps_pid;
use crate::app::config::TelemetrySettings;
use crate::app::error::AppError;
use crate::app::memory::{meminfo_command, parse_meminfo_dump, parse_resident_mb, resident_command};
use crate::app::models::{MemoryExportRow, MemoryReading, TelemetrySample};

/// First API level whose toybox `top` understands `-p`/`-o`.
pub const PER_PID_TOP_MIN_SDK: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemoryProbe {
    TopResident,
    MeminfoDump,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CpuProbe {
    TopPerPid,
    TopScan,
}

/// Strategies picked once per bound device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceCapabilities {
    pub sdk_level: u32,
    pub memory_probe: MemoryProbe,
    pub cpu_probe: CpuProbe,
}

impl DeviceCapabilities {
    pub fn resolve(sdk_level: u32, settings: &TelemetrySettings) -> Self {
        let modern = sdk_level >= PER_PID_TOP_MIN_SDK;
        Self {
            sdk_level,
            memory_probe: if modern && !settings.always_detailed_memory {
                MemoryProbe::TopResident
            } else {
                MemoryProbe::MeminfoDump
            },
            cpu_probe: if modern {
                CpuProbe::TopPerPid
            } else {
                CpuProbe::TopScan
            },
        }
    }
}

impl MemoryProbe {
    /// `None` when there is nothing to sample (no pid for the per-process probe, empty output).
    pub fn sample(
        self,
        executor: &dyn ShellExecutor,
        pid: Option<u32>,
        package: Option<&str>,
        trace_id: &str,
    ) -> Result<Option<MemoryReading>, AppError> {
        match self {
            MemoryProbe::TopResident => {
                let Some(pid) = pid else {
                    return Ok(None);
                };
                let raw = executor.shell(&resident_command(pid), trace_id)?.trim().to_string();
                if raw.is_empty() {
                    return Ok(None);
                }
                let megabytes = parse_resident_mb(&raw);
                Ok(Some(MemoryReading::Resident { raw, megabytes }))
            }
            MemoryProbe::MeminfoDump => {
                let package = package
                    .map(str::trim)
                    .filter(|package| !package.is_empty())
                    .ok_or_else(|| {
                        AppError::precondition("A package name is required for detailed memory", trace_id)
                    })?;
                let output = executor.shell(&meminfo_command(package), trace_id)?;
                Ok(Some(MemoryReading::Breakdown {
                    processes: parse_meminfo_dump(&output),
                }))
            }
        }
    }
}

pub fn cpu_per_pid_command(pid: u32) -> String {
    format!("top -n 1 -p {pid} -o %CPU -b -q")
}

pub const CPU_SCAN_COMMAND: &str = "top -n 1";

/// Fifth field of the row whose last field is the package, with `%` removed.
pub fn parse_cpu_scan(output: &str, package: &str) -> String {
    output
        .lines()
        .filter(|line| line.contains(package))
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .find(|tokens| tokens.len() > 4 && tokens.last() == Some(&package))
        .map(|tokens| tokens[4].replace('%', ""))
        .unwrap_or_default()
}

impl CpuProbe {
    /// Empty string when the process is not found.
    pub fn sample(
        self,
        executor: &dyn ShellExecutor,
        pid: Option<u32>,
        package: Option<&str>,
        trace_id: &str,
    ) -> Result<String, AppError> {
        match self {
            CpuProbe::TopPerPid => match pid {
                Some(pid) => Ok(executor.shell(&cpu_per_pid_command(pid), trace_id)?.trim().to_string()),
                None => Ok(String::new()),
            },
            CpuProbe::TopScan => {
                let package = package
                    .map(str::trim)
                    .filter(|package| !package.is_empty())
                    .ok_or_else(|| AppError::precondition("A package name is required", trace_id))?;
                let output = executor.shell(CPU_SCAN_COMMAND, trace_id)?;
                Ok(parse_cpu_scan(&output, package))
            }
        }
    }
}

pub fn find_pid(executor: &dyn ShellExecutor, package: &str, trace_id: &str) -> Result<Option<u32>, AppError> {
    let output = executor.shell(&format!("ps -A | grep {package}"), trace_id)?;
    Ok(parse_ps_pid(&output, package))
}

pub fn sample_telemetry(
    executor: &dyn ShellExecutor,
    capabilities: &DeviceCapabilities,
    package: &str,
    trace_id: &str,
) -> Result<TelemetrySample, AppError> {
    let pid = find_pid(executor, package, trace_id)?;
    let cpu = capabilities
        .cpu_probe
        .sample(executor, pid, Some(package), trace_id)?;
    let memory = capabilities
        .memory_probe
        .sample(executor, pid, Some(package), trace_id)?;
    Ok(TelemetrySample {
        timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        package: package.to_string(),
        pid,
        cpu: (!cpu.is_empty()).then_some(cpu),
        memory,
    })
}

/// Rows for the CSV export: one per sample that carries a breakdown for `process`.
pub fn memory_export_rows(samples: &[TelemetrySample], process: &str) -> Vec<MemoryExportRow> {
    samples
        .iter()
        .filter_map(|sample| match &sample.memory {
            Some(MemoryReading::Breakdown { processes }) => processes.get(process).map(|breakdown| MemoryExportRow {
                time: sample.timestamp.clone(),
                breakdown: *breakdown,
            }),
            _ => None,
        })
        .collect()
}

fn sleep_with_stop(duration: Duration, stop_flag: &AtomicBool) {
    let mut remaining = duration;
    let chunk = Duration::from_millis(50);
    while remaining > Duration::ZERO {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
        let step = remaining.min(chunk);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

/// Runs a closure on its own thread every `interval` until stopped.
pub struct Ticker;

impl Ticker {
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<TickerHandle>
    where
        F: FnMut() + Send + 'static,
    {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_flag = Arc::clone(&stop_flag);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                if thread_flag.load(Ordering::Relaxed) {
                    break;
                }
                let started = Instant::now();
                tick();
                sleep_with_stop(interval.saturating_sub(started.elapsed()), &thread_flag);
            })?;
        Ok(TickerHandle {
            stop_flag,
            handle: Some(handle),
        })
    }
}

/// Cancellation handle for a [`Ticker`]; dropping it stops the ticker too.
pub struct TickerHandle {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TickerHandle {
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Waits for an in-flight tick to finish.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("ticker thread panicked");
            }
        }
    }
}

impl Drop for TickerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub type TelemetrySink = Arc<dyn Fn(TelemetrySample) + Send + Sync>;

/// Polls cpu and memory each tick; a failed tick is logged and the loop carries on.
pub fn start_telemetry(
    executor: Arc<dyn ShellExecutor>,
    capabilities: DeviceCapabilities,
    package: &str,
    interval: Duration,
    sink: TelemetrySink,
    trace_id: &str,
) -> Result<TickerHandle, AppError> {
    let package = package.to_string();
    let tick_trace = trace_id.to_string();
    let mut ticks = 0u64;
    let handle = Ticker::spawn("telemetry", interval, move || {
        ticks += 1;
        match sample_telemetry(executor.as_ref(), &capabilities, &package, &tick_trace) {
            Ok(sample) => sink(sample),
            Err(err) => warn!(trace_id = %tick_trace, tick = ticks, error = %err, "telemetry tick failed"),
        }
    })
    .map_err(|err| AppError::system(format!("Failed to spawn telemetry ticker: {err}"), trace_id))?;
    info!(trace_id = %trace_id, interval_ms = interval.as_millis() as u64, "telemetry started");
    debug!(trace_id = %trace_id, capabilities = ?capabilities, "telemetry probes");
    Ok(handle)
}

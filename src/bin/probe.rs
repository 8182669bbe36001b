use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use droidscope::app::models::{LogRecord, MemoryReading, TelemetrySample};
use droidscope::{
    export_memory_csv, init_logging, load_config, memory_export_filename, memory_export_rows,
    save_screenshot, AppError, DeviceSession, RecordingDestination,
};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    out_dir: Option<PathBuf>,
    json: bool,
    logcat_secs: Option<u64>,
    record_secs: Option<u64>,
    package: Option<String>,
}

#[derive(Serialize)]
struct ProbeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    serial: Option<String>,
    sdk_level: Option<u32>,
    out_dir: String,
    artifacts: HashMap<String, String>,
    checks: Vec<ProbeCheck>,
}

#[derive(Serialize)]
struct ProbeCheck {
    name: &'static str,
    status: &'static str, // pass|fail|warn|skip
    duration_ms: u128,
    artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ProbeCheck {
    fn skipped(name: &'static str) -> Self {
        Self {
            name,
            status: "skip",
            duration_ms: 0,
            artifacts: vec![],
            error_code: None,
            error: None,
        }
    }
}

/// Artifacts written plus an optional warning.
type CheckOutcome = Result<(Vec<String>, Option<String>), AppError>;

fn parse_secs(flag: &str, value: Option<String>) -> Result<u64, String> {
    value
        .ok_or_else(|| format!("{flag} requires a value"))?
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .ok_or_else(|| format!("{flag} expects a positive number of seconds"))
}

fn parse_args() -> Result<Args, String> {
    let mut serial = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let mut out_dir: Option<PathBuf> = None;
    let mut json = false;
    let mut logcat_secs: Option<u64> = None;
    let mut record_secs: Option<u64> = None;
    let mut package: Option<String> = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--out" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--out requires a value".to_string())?;
                out_dir = Some(PathBuf::from(value));
            }
            "--json" => {
                json = true;
            }
            "--with-logcat" => {
                logcat_secs = Some(parse_secs("--with-logcat", it.next())?);
            }
            "--with-record" => {
                record_secs = Some(parse_secs("--with-record", it.next())?);
            }
            "--package" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--package requires a value".to_string())?;
                package = Some(value.trim().to_string());
            }
            "-h" | "--help" => {
                return Err(
                    "Usage: probe [--serial SERIAL] [--out DIR] [--json] [--with-logcat SECS] [--with-record SECS] [--package NAME]\n"
                        .to_string(),
                );
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    Ok(Args {
        serial,
        out_dir,
        json,
        logcat_secs,
        record_secs,
        package,
    })
}

fn ensure_dir(path: &Path) -> Result<(), String> {
    fs::create_dir_all(path)
        .map_err(|err| format!("Failed to create dir {}: {err}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T, trace_id: &str) -> Result<String, AppError> {
    let body = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::system(format!("Failed to serialize {}: {err}", path.display()), trace_id))?;
    fs::write(path, body)
        .map_err(|err| AppError::system(format!("Failed to write {}: {err}", path.display()), trace_id))?;
    Ok(path.to_string_lossy().to_string())
}

/// Records the outcome; returns false when the check failed.
fn run_check<F>(checks: &mut Vec<ProbeCheck>, name: &'static str, f: F) -> bool
where
    F: FnOnce() -> CheckOutcome,
{
    let start = Instant::now();
    let (status, artifacts, error_code, error) = match f() {
        Ok((artifacts, None)) => ("pass", artifacts, None, None),
        Ok((artifacts, Some(warning))) => ("warn", artifacts, Some("WARN".to_string()), Some(warning)),
        Err(err) => ("fail", vec![], Some(err.code), Some(err.error)),
    };
    checks.push(ProbeCheck {
        name,
        status,
        duration_ms: start.elapsed().as_millis(),
        artifacts,
        error_code,
        error,
    });
    status != "fail"
}

fn pick_serial(session: &DeviceSession, requested: Option<String>, trace_id: &str) -> Result<String, AppError> {
    if let Some(serial) = requested {
        return Ok(serial);
    }
    let devices = session.list_devices()?;
    match devices.as_slice() {
        [] => Err(AppError::dependency("No online adb devices found.", trace_id)),
        [only] => Ok(only.serial.clone()),
        many => {
            let serials = many
                .iter()
                .map(|d| d.serial.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            Err(AppError::precondition(
                format!("Multiple online devices found ({serials}). Set ANDROID_SERIAL or pass --serial."),
                trace_id,
            ))
        }
    }
}

fn collect<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
    let buf: Arc<Mutex<Vec<T>>> = Arc::new(Mutex::new(Vec::new()));
    let buf_emit = Arc::clone(&buf);
    let push = move |item: T| {
        let mut guard = buf_emit.lock().unwrap_or_else(|p| p.into_inner());
        guard.push(item);
    };
    (buf, push)
}

fn finish(summary: &ProbeSummary, json: bool) -> ! {
    let output = if json {
        serde_json::to_string_pretty(summary).unwrap_or_else(|_| "{}".to_string())
    } else {
        let mut text = format!(
            "status: {}\ntrace_id: {}\nout: {}\n",
            summary.status, summary.trace_id, summary.out_dir
        );
        for check in &summary.checks {
            text.push_str(&format!("  {:<22} {}", check.name, check.status));
            if let Some(error) = &check.error {
                text.push_str(&format!(" ({error})"));
            }
            text.push('\n');
        }
        text
    };
    println!("{output}");
    std::process::exit(if summary.status == "pass" { 0 } else { 1 });
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let loaded = load_config(&trace_id);

    // --out wins, then the configured output path, then a temp dir.
    let run_dir = format!("droidscope_probe_{trace_id}");
    let out_dir = args
        .out_dir
        .clone()
        .or_else(|| {
            loaded
                .as_ref()
                .ok()
                .and_then(|config| config.output_dir())
                .map(|dir| dir.join(&run_dir))
        })
        .unwrap_or_else(|| std::env::temp_dir().join(&run_dir));
    if let Err(err) = ensure_dir(&out_dir) {
        eprintln!("{err}");
        std::process::exit(1);
    }

    let mut summary = ProbeSummary {
        tool: "droidscope_probe",
        status: "pass",
        trace_id: trace_id.clone(),
        serial: None,
        sdk_level: None,
        out_dir: out_dir.to_string_lossy().to_string(),
        artifacts: HashMap::new(),
        checks: Vec::new(),
    };

    let config = match loaded {
        Ok(cfg) => cfg,
        Err(err) => {
            summary.checks.push(ProbeCheck {
                name: "load_config",
                status: "fail",
                duration_ms: 0,
                artifacts: vec![],
                error_code: Some(err.code),
                error: Some(err.error),
            });
            summary.status = "fail";
            finish(&summary, args.json);
        }
    };
    init_logging(&config.logging.log_level);
    let mut session = DeviceSession::new(config);

    let mut serial = None;
    let picked = run_check(&mut summary.checks, "connect", || {
        let chosen = pick_serial(&session, args.serial.clone(), &trace_id)?;
        let caps = session.connect(&chosen)?;
        summary.sdk_level = Some(caps.sdk_level);
        serial = Some(chosen);
        Ok((vec![], None))
    });
    summary.serial = serial;
    if !picked {
        summary.status = "fail";
        finish(&summary, args.json);
    }

    let mut artifacts: HashMap<String, String> = HashMap::new();
    let mut failed = false;

    failed |= !run_check(&mut summary.checks, "device_overview", || {
        let overview = session.device_overview()?;
        let path = write_json(&out_dir.join("overview.json"), &overview, &trace_id)?;
        artifacts.insert("overview".to_string(), path.clone());
        Ok((vec![path], None))
    });

    failed |= !run_check(&mut summary.checks, "list_processes", || {
        let processes = session.list_processes()?;
        let path = write_json(&out_dir.join("processes.json"), &processes, &trace_id)?;
        artifacts.insert("processes".to_string(), path.clone());
        let warning = processes
            .is_empty()
            .then(|| "Process listing returned no rows.".to_string());
        Ok((vec![path], warning))
    });

    failed |= !run_check(&mut summary.checks, "list_packages", || {
        let packages = session.list_packages(true)?;
        let path = write_json(&out_dir.join("packages.json"), &packages, &trace_id)?;
        artifacts.insert("packages".to_string(), path.clone());
        Ok((vec![path], None))
    });

    failed |= !run_check(&mut summary.checks, "list_files", || {
        let entries = session.list_files("/sdcard")?;
        let path = write_json(&out_dir.join("ls_sdcard.json"), &entries, &trace_id)?;
        artifacts.insert("ls_sdcard".to_string(), path.clone());
        Ok((vec![path], None))
    });

    failed |= !run_check(&mut summary.checks, "capture_screenshot", || {
        let capture = session.capture_screenshot()?;
        let path = out_dir.join("screenshot.png");
        save_screenshot(&capture.image_base64, &path, &trace_id)?;
        let path = path.to_string_lossy().to_string();
        artifacts.insert("screenshot".to_string(), path.clone());
        Ok((vec![path], None))
    });

    match args.logcat_secs {
        Some(secs) => {
            failed |= !run_check(&mut summary.checks, "logcat_stream", || {
                let (records, push) = collect::<LogRecord>();
                session.start_logcat(Arc::new(push))?;
                std::thread::sleep(Duration::from_secs(secs));
                session.stop_logcat()?;
                let records = records.lock().unwrap_or_else(|p| p.into_inner()).clone();
                let path = write_json(&out_dir.join("logcat.json"), &records, &trace_id)?;
                artifacts.insert("logcat".to_string(), path.clone());
                let warning = records
                    .is_empty()
                    .then(|| "Logcat stream produced no records.".to_string());
                Ok((vec![path], warning))
            });
        }
        None => summary.checks.push(ProbeCheck::skipped("logcat_stream")),
    }

    match args.record_secs {
        Some(secs) => {
            failed |= !run_check(&mut summary.checks, "screen_record", || {
                session.start_recording()?;
                std::thread::sleep(Duration::from_secs(secs));
                let local = out_dir.join("recording.mp4");
                let export = session.stop_recording(RecordingDestination::File(local.clone()))?;
                let path = local.to_string_lossy().to_string();
                artifacts.insert("recording".to_string(), path.clone());
                let warning = (export.size_bytes == 0).then(|| "Recording is empty.".to_string());
                Ok((vec![path], warning))
            });
        }
        None => summary.checks.push(ProbeCheck::skipped("screen_record")),
    }

    match args.package.clone() {
        Some(package) => {
            failed |= !run_check(&mut summary.checks, "telemetry", || {
                let cpu = session.sample_cpu(&package)?;
                let (samples, push) = collect::<TelemetrySample>();
                session.start_telemetry(&package, None, Arc::new(push))?;
                std::thread::sleep(Duration::from_secs(3));
                session.stop_telemetry();
                let samples = samples.lock().unwrap_or_else(|p| p.into_inner()).clone();
                let mut written = vec![write_json(
                    &out_dir.join("telemetry.json"),
                    &samples,
                    &trace_id,
                )?];
                let has_breakdown = samples
                    .iter()
                    .any(|s| matches!(s.memory, Some(MemoryReading::Breakdown { .. })));
                if has_breakdown {
                    let rows = memory_export_rows(&samples, &package);
                    let csv = out_dir.join(memory_export_filename(&package));
                    export_memory_csv(&csv, &rows, &trace_id)?;
                    written.push(csv.to_string_lossy().to_string());
                }
                for path in &written {
                    artifacts.insert(format!("telemetry:{path}"), path.clone());
                }
                let warning = if samples.is_empty() {
                    Some("Telemetry produced no samples.".to_string())
                } else if cpu.is_empty() {
                    Some(format!("{package} is not running."))
                } else {
                    None
                };
                Ok((written, warning))
            });
        }
        None => summary.checks.push(ProbeCheck::skipped("telemetry")),
    }

    session.unbind();
    summary.artifacts = artifacts;
    if failed {
        summary.status = "fail";
    }
    finish(&summary, args.json);
}

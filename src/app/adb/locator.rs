use std::path::Path;

use tracing::debug;

use crate::app::adb::parse::parse_adb_devices;
use crate::app::adb::runner::run_command_with_timeout;
use crate::app::config::AdbSettings;
use crate::app::error::AppError;
use crate::app::models::DeviceIdentity;

/// Strips one layer of wrapping quotes pasted in from a file manager.
pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

pub fn resolve_adb_program(settings: &AdbSettings) -> String {
    let normalized = normalize_command_path(&settings.command_path);
    if normalized.is_empty() {
        "adb".to_string()
    } else {
        normalized
    }
}

/// Resolves and checks the configured adb binary. A bare `adb` is left to `PATH` lookup.
pub fn locate_adb(settings: &AdbSettings, trace_id: &str) -> Result<String, AppError> {
    let program = resolve_adb_program(settings);
    if program == "adb" {
        return Ok(program);
    }
    let path = Path::new(&program);
    if path.is_dir() {
        return Err(AppError::validation(
            "ADB path must point to an executable file",
            trace_id,
        ));
    }
    if !path.exists() {
        return Err(AppError::dependency(
            format!("ADB executable not found at {program}"),
            trace_id,
        ));
    }
    Ok(program)
}

pub fn list_devices(program: &str, settings: &AdbSettings, trace_id: &str) -> Result<Vec<DeviceIdentity>, AppError> {
    let args = vec!["devices".to_string(), "-l".to_string()];
    let output = run_command_with_timeout(program, &args, settings.command_timeout(), trace_id)?;
    if output.exit_code.unwrap_or(1) != 0 {
        return Err(AppError::dependency(
            format!("adb devices failed: {}", output.stderr.trim()),
            trace_id,
        ));
    }
    let devices = parse_adb_devices(&output.stdout);
    debug!(trace_id = %trace_id, count = devices.len(), "listed devices");
    Ok(devices)
}

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Local;
use tracing::{info, warn};

use crate::app::adb::executor::ShellExecutor;
use crate::app::adb::paths::{join_device_path, shell_quote};
use crate::app::error::AppError;
use crate::app::models::ScreenCapture;
use crate::app::recording::ensure_parent_dir;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
pub const SCREENCAP_COMMAND: &str = "screencap -p";

/// Width and height from the IHDR chunk that must follow the signature.
pub fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 24 || !bytes.starts_with(PNG_SIGNATURE) || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    Some((width, height))
}

pub fn size_in_mb(len: usize) -> f64 {
    let mb = len as f64 / (1024.0 * 1024.0);
    (mb * 100.0).round() / 100.0
}

pub fn build_screen_capture(bytes: &[u8], trace_id: &str) -> Result<ScreenCapture, AppError> {
    if bytes.len() < PNG_SIGNATURE.len() {
        return Err(AppError::dependency("Screenshot data is empty", trace_id));
    }
    let (width, height) = png_dimensions(bytes)
        .ok_or_else(|| AppError::parse("Screenshot data is not a PNG", trace_id))?;
    Ok(ScreenCapture {
        image_base64: STANDARD.encode(bytes),
        width,
        height,
        size_mb: size_in_mb(bytes.len()),
    })
}

/// Streams the PNG over `exec-out`; devices that mangle binary stdout get an on-device file
/// round trip instead.
pub fn capture_screenshot(
    executor: &dyn ShellExecutor,
    remote_dir: &str,
    trace_id: &str,
) -> Result<ScreenCapture, AppError> {
    match executor
        .exec_out(SCREENCAP_COMMAND, trace_id)
        .and_then(|bytes| build_screen_capture(&bytes, trace_id))
    {
        Ok(capture) => return Ok(capture),
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err, "direct screencap failed; using device file");
        }
    }

    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let remote = join_device_path(remote_dir, &format!("screenshot_{stamp}.png"));
    let quoted = shell_quote(&remote);
    executor.shell(&format!("{SCREENCAP_COMMAND} {quoted}"), trace_id)?;
    let bytes = executor.read_file(&remote, trace_id);
    if let Err(err) = executor.shell(&format!("rm -f {quoted}"), trace_id) {
        warn!(trace_id = %trace_id, error = %err, remote = %remote, "failed to delete device screenshot");
    }
    let capture = build_screen_capture(&bytes?, trace_id)?;
    info!(trace_id = %trace_id, width = capture.width, height = capture.height, "screenshot captured");
    Ok(capture)
}

/// Accepts bare base64 or a `data:<mime>;base64,` URL.
pub fn decode_base64_payload(payload: &str, trace_id: &str) -> Result<Vec<u8>, AppError> {
    let trimmed = payload.trim();
    let encoded = match trimmed.strip_prefix("data:") {
        Some(rest) => rest
            .split_once("base64,")
            .map(|(_, data)| data)
            .ok_or_else(|| AppError::validation("Data URL is not base64 encoded", trace_id))?,
        None => trimmed,
    };
    if encoded.is_empty() {
        return Err(AppError::validation("Payload is empty", trace_id));
    }
    STANDARD
        .decode(encoded)
        .map_err(|err| AppError::validation(format!("Invalid base64 payload: {err}"), trace_id))
}

fn write_payload(payload: &str, path: &Path, what: &str, trace_id: &str) -> Result<u64, AppError> {
    let bytes = decode_base64_payload(payload, trace_id)?;
    ensure_parent_dir(path, trace_id)?;
    fs::write(path, &bytes)
        .map_err(|err| AppError::system(format!("Failed to write {what}: {err}"), trace_id))?;
    info!(trace_id = %trace_id, path = %path.display(), bytes = bytes.len(), "{what} saved");
    Ok(bytes.len() as u64)
}

pub fn save_screenshot(image_base64: &str, path: &Path, trace_id: &str) -> Result<u64, AppError> {
    write_payload(image_base64, path, "screenshot", trace_id)
}

pub fn save_recording(data_url: &str, path: &Path, trace_id: &str) -> Result<u64, AppError> {
    write_payload(data_url, path, "recording", trace_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::ScriptedExecutor;

    fn tiny_png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        bytes
    }

    #[test]
    fn rejects_empty_and_non_png() {
        assert_eq!(build_screen_capture(&[], "t").expect_err("empty").code, "ERR_DEPENDENCY");
        assert_eq!(
            build_screen_capture(b"not a png at all, really", "t").expect_err("non-png").code,
            "ERR_PARSE"
        );
    }

    #[test]
    fn reads_dimensions_from_ihdr() {
        let capture = build_screen_capture(&tiny_png(1080, 2340), "t").expect("capture");
        assert_eq!((capture.width, capture.height), (1080, 2340));
        assert_eq!(capture.size_mb, 0.0);
        assert_eq!(STANDARD.decode(capture.image_base64).expect("b64"), tiny_png(1080, 2340));
    }

    #[test]
    fn size_rounds_to_two_decimals() {
        assert_eq!(size_in_mb(1024 * 1024), 1.0);
        assert_eq!(size_in_mb(1_572_864), 1.5);
        assert_eq!(size_in_mb(1_234_567), 1.18);
    }

    #[test]
    fn uses_exec_out_when_it_works() {
        let executor = ScriptedExecutor::new("ABC").on_bytes(SCREENCAP_COMMAND, &tiny_png(10, 20));
        let capture = capture_screenshot(&executor, "/sdcard", "t").expect("capture");
        assert_eq!(capture.width, 10);
        assert_eq!(executor.commands(), vec![SCREENCAP_COMMAND.to_string()]);
    }

    #[test]
    fn falls_back_to_device_file() {
        let executor = ScriptedExecutor::new("ABC")
            .on_bytes(SCREENCAP_COMMAND, b"garbled")
            .on_bytes("cat ", &tiny_png(720, 1280));
        let capture = capture_screenshot(&executor, "/sdcard", "t").expect("capture");
        assert_eq!(capture.height, 1280);
        let commands = executor.commands();
        assert!(commands[1].starts_with("screencap -p '/sdcard/screenshot_"));
        assert!(commands.last().expect("rm").starts_with("rm -f '/sdcard/screenshot_"));
    }

    #[test]
    fn decodes_data_urls_and_bare_base64() {
        let encoded = STANDARD.encode(b"video");
        assert_eq!(
            decode_base64_payload(&format!("data:video/mp4;base64,{encoded}"), "t").expect("url"),
            b"video"
        );
        assert_eq!(decode_base64_payload(&encoded, "t").expect("bare"), b"video");
        assert_eq!(
            decode_base64_payload("data:video/mp4,raw", "t").expect_err("not base64").code,
            "ERR_VALIDATION"
        );
        assert!(decode_base64_payload("!!!", "t").is_err());
    }

    #[test]
    fn saves_payload_to_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shots").join("screen.png");
        let png = tiny_png(1, 1);
        let written = save_screenshot(&STANDARD.encode(&png), &path, "t").expect("save");
        assert_eq!(written, png.len() as u64);
        assert_eq!(std::fs::read(&path).expect("read"), png);

        let clip = dir.path().join("clip.mp4");
        save_recording(&format!("data:video/mp4;base64,{}", STANDARD.encode(b"mp4")), &clip, "t")
            .expect("save recording");
        assert_eq!(std::fs::read(&clip).expect("read"), b"mp4");
    }
}

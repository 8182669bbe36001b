use std::io::BufRead;
use std::path::Path;
use std::process::Child;
use std::time::Duration;

use tracing::{debug, warn};

use crate::app::adb::paths::shell_quote;
use crate::app::adb::runner::{
    run_command_raw_with_timeout, spawn_streaming, terminate_child, RawCommandOutput,
};
use crate::app::adb::table::parse_stat_listing;
use crate::app::config::AdbSettings;
use crate::app::error::AppError;
use crate::app::models::SyncDirEntry;

/// Closing must unblock any reader still parked on the stream.
pub trait StreamCloser: Send {
    fn close(&mut self);
}

pub struct ShellStream {
    pub reader: Box<dyn BufRead + Send>,
    pub closer: Box<dyn StreamCloser>,
}

impl ShellStream {
    pub fn new(reader: Box<dyn BufRead + Send>, closer: Box<dyn StreamCloser>) -> Self {
        Self { reader, closer }
    }

    pub fn into_parts(self) -> (Box<dyn BufRead + Send>, Box<dyn StreamCloser>) {
        (self.reader, self.closer)
    }
}

/// Command channel to one device. Implementations must be shareable with background tasks.
pub trait ShellExecutor: Send + Sync {
    fn serial(&self) -> &str;

    fn shell(&self, command: &str, trace_id: &str) -> Result<String, AppError>;

    fn shell_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<String, AppError>;

    /// Binary-safe stdout of a device command.
    fn exec_out(&self, command: &str, trace_id: &str) -> Result<Vec<u8>, AppError>;

    fn open_stream(&self, command: &str, trace_id: &str) -> Result<ShellStream, AppError>;

    fn pull(&self, remote: &str, local: &Path, trace_id: &str) -> Result<(), AppError>;

    fn push(&self, local: &Path, remote: &str, trace_id: &str) -> Result<(), AppError>;

    /// Returns the installer's textual output.
    fn install(&self, apk: &Path, trace_id: &str) -> Result<String, AppError>;

    fn read_file(&self, remote: &str, trace_id: &str) -> Result<Vec<u8>, AppError> {
        self.exec_out(&format!("cat {}", shell_quote(remote)), trace_id)
    }

    fn uninstall(&self, package: &str, trace_id: &str) -> Result<String, AppError> {
        self.shell(&format!("pm uninstall {package}"), trace_id)
    }

    fn list_dir(&self, path: &str, trace_id: &str) -> Result<Vec<SyncDirEntry>, AppError> {
        let dir = path.trim_end_matches('/');
        let quoted = shell_quote(if dir.is_empty() { "/" } else { dir });
        // The glob stays outside the quotes; hidden entries come from the second pattern.
        let command = format!(
            "cd {quoted} && stat -c '%f|%s|%Y|%n' -- * .[!.]* 2>/dev/null"
        );
        let output = self.shell(&command, trace_id)?;
        Ok(parse_stat_listing(&output))
    }
}

pub struct AdbShellExecutor {
    program: String,
    serial: String,
    command_timeout: Duration,
    transfer_timeout: Duration,
}

impl AdbShellExecutor {
    pub fn new(program: impl Into<String>, serial: impl Into<String>, settings: &AdbSettings) -> Self {
        Self {
            program: program.into(),
            serial: serial.into(),
            command_timeout: settings.command_timeout(),
            transfer_timeout: settings.transfer_timeout(),
        }
    }

    fn device_args(&self, tail: &[&str]) -> Vec<String> {
        let mut args = vec!["-s".to_string(), self.serial.clone()];
        args.extend(tail.iter().map(|item| item.to_string()));
        args
    }

    fn run(
        &self,
        tail: &[&str],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<RawCommandOutput, AppError> {
        let args = self.device_args(tail);
        debug!(trace_id = %trace_id, serial = %self.serial, args = ?tail, "adb");
        run_command_raw_with_timeout(&self.program, &args, timeout, trace_id)
    }

    fn run_checked(
        &self,
        tail: &[&str],
        timeout: Duration,
        action: &str,
        trace_id: &str,
    ) -> Result<RawCommandOutput, AppError> {
        let output = self.run(tail, timeout, trace_id)?;
        if output.exit_code.unwrap_or(1) != 0 {
            return Err(AppError::dependency(
                format!("{action} failed: {}", output.stderr_text()),
                trace_id,
            ));
        }
        Ok(output)
    }
}

/// Remote pipelines such as `ps | grep` exit non-zero with no output; only a silent stdout
/// paired with a complaint on stderr counts as a transport failure.
pub fn shell_output_or_error(output: RawCommandOutput, trace_id: &str) -> Result<String, AppError> {
    let text = output.into_text();
    let failed = text.exit_code.unwrap_or(1) != 0;
    if failed && text.stdout.trim().is_empty() && !text.stderr.trim().is_empty() {
        return Err(AppError::dependency(
            format!("Shell command failed: {}", text.stderr.trim()),
            trace_id,
        ));
    }
    if failed {
        debug!(
            trace_id = %trace_id,
            exit_code = ?text.exit_code,
            "shell command exited non-zero; keeping its output"
        );
    }
    Ok(text.stdout)
}

impl ShellExecutor for AdbShellExecutor {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn shell(&self, command: &str, trace_id: &str) -> Result<String, AppError> {
        self.shell_with_timeout(command, self.command_timeout, trace_id)
    }

    fn shell_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let output = self.run(&["shell", command], timeout, trace_id)?;
        shell_output_or_error(output, trace_id)
    }

    fn exec_out(&self, command: &str, trace_id: &str) -> Result<Vec<u8>, AppError> {
        let output = self.run_checked(
            &["exec-out", command],
            self.transfer_timeout,
            "exec-out",
            trace_id,
        )?;
        Ok(output.stdout)
    }

    fn open_stream(&self, command: &str, trace_id: &str) -> Result<ShellStream, AppError> {
        let args = self.device_args(&["shell", command]);
        let streaming = spawn_streaming(&self.program, &args, trace_id)?;
        Ok(ShellStream::new(
            Box::new(streaming.stdout),
            Box::new(ChildCloser::new(streaming.child, trace_id)),
        ))
    }

    fn pull(&self, remote: &str, local: &Path, trace_id: &str) -> Result<(), AppError> {
        let local = local.to_string_lossy();
        self.run_checked(
            &["pull", remote, local.as_ref()],
            self.transfer_timeout,
            "Pull",
            trace_id,
        )?;
        Ok(())
    }

    fn push(&self, local: &Path, remote: &str, trace_id: &str) -> Result<(), AppError> {
        let local = local.to_string_lossy();
        self.run_checked(
            &["push", local.as_ref(), remote],
            self.transfer_timeout,
            "Push",
            trace_id,
        )?;
        Ok(())
    }

    fn install(&self, apk: &Path, trace_id: &str) -> Result<String, AppError> {
        let apk = apk.to_string_lossy();
        let output = self.run(&["install", "-r", apk.as_ref()], self.transfer_timeout, trace_id)?;
        let text = output.into_text();
        Ok(format!("{}\n{}", text.stdout, text.stderr))
    }

    fn uninstall(&self, package: &str, trace_id: &str) -> Result<String, AppError> {
        let output = self.run(&["uninstall", package], self.command_timeout, trace_id)?;
        let text = output.into_text();
        Ok(format!("{}\n{}", text.stdout, text.stderr))
    }
}

/// Owns the local `adb` child backing a stream; killing it ends the remote command too.
pub struct ChildCloser {
    child: Option<Child>,
    trace_id: String,
}

impl ChildCloser {
    pub fn new(child: Child, trace_id: &str) -> Self {
        Self {
            child: Some(child),
            trace_id: trace_id.to_string(),
        }
    }
}

impl StreamCloser for ChildCloser {
    fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            terminate_child(&mut child, &self.trace_id);
        }
    }
}

impl Drop for ChildCloser {
    fn drop(&mut self) {
        if self.child.is_some() {
            warn!(trace_id = %self.trace_id, "stream dropped without close; killing child");
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(stdout: &str, stderr: &str, exit_code: i32) -> RawCommandOutput {
        RawCommandOutput {
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            exit_code: Some(exit_code),
        }
    }

    #[test]
    fn non_zero_exit_with_output_is_kept() {
        let text = shell_output_or_error(raw("partial\n", "", 1), "trace").expect("ok");
        assert_eq!(text, "partial\n");
    }

    #[test]
    fn non_zero_exit_without_output_is_an_error() {
        let err = shell_output_or_error(raw("", "error: device 'X' not found", 1), "trace-d")
            .expect_err("transport error");
        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert!(err.error.contains("not found"));
    }

    #[test]
    fn grep_without_match_is_empty_not_error() {
        let text = shell_output_or_error(raw("", "", 1), "trace").expect("ok");
        assert!(text.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn child_closer_unblocks_reader() {
        use crate::app::adb::runner::spawn_streaming;

        let args = vec!["-c".to_string(), "exec sleep 30".to_string()];
        let streaming = spawn_streaming("sh", &args, "trace").expect("spawn");
        let stream = ShellStream::new(
            Box::new(streaming.stdout),
            Box::new(ChildCloser::new(streaming.child, "trace")),
        );
        let (mut reader, mut closer) = stream.into_parts();
        let handle = std::thread::spawn(move || {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap_or(0)
        });
        closer.close();
        let read = handle.join().expect("reader thread");
        assert_eq!(read, 0);
    }
}

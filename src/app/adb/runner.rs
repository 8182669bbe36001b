use std::io::{BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::app::error::AppError;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct RawCommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

impl RawCommandOutput {
    pub fn into_text(self) -> CommandOutput {
        CommandOutput {
            stdout: String::from_utf8_lossy(&self.stdout).to_string(),
            stderr: String::from_utf8_lossy(&self.stderr).to_string(),
            exit_code: self.exit_code,
        }
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    run_command_raw_with_timeout(program, args, timeout, trace_id).map(RawCommandOutput::into_text)
}

/// Runs `program` to completion and keeps stdout as bytes (`exec-out` payloads are binary).
pub fn run_command_raw_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<RawCommandOutput, AppError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| AppError::dependency(format!("Failed to spawn {program}: {err}"), trace_id))?;

    // Both pipes are drained on their own threads; a chatty child would otherwise block once
    // the pipe buffer fills and we would report a bogus timeout.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;
    let stdout_handle = drain_pipe(stdout);
    let stderr_handle = drain_pipe(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(AppError::dependency(
                        format!("Command timed out after {}s", timeout.as_secs()),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => {
                let _ = child.kill();
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ));
            }
        }
    };

    Ok(RawCommandOutput {
        stdout: stdout_handle.join().unwrap_or_default(),
        stderr: stderr_handle.join().unwrap_or_default(),
        exit_code,
    })
}

fn drain_pipe<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 8192];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

/// Long-running child whose stdout is consumed line by line by the caller.
pub struct StreamingChild {
    pub child: Child,
    pub stdout: BufReader<ChildStdout>,
}

pub fn spawn_streaming(
    program: &str,
    args: &[String],
    trace_id: &str,
) -> Result<StreamingChild, AppError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| {
            AppError::dependency(format!("Failed to start stream: {err}"), trace_id)
        })?;
    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AppError::system("Failed to capture stream stdout", trace_id));
        }
    };
    Ok(StreamingChild {
        child,
        stdout: BufReader::new(stdout),
    })
}

/// Kills a child and reaps it; errors only mean it already exited.
pub fn terminate_child(child: &mut Child, trace_id: &str) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(err) = child.kill() {
        warn!(trace_id = %trace_id, error = %err, "failed to kill child process");
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    fn shell(script: &str) -> (String, Vec<String>) {
        if cfg!(windows) {
            ("cmd.exe".to_string(), vec!["/C".to_string(), script.to_string()])
        } else {
            ("sh".to_string(), vec!["-c".to_string(), script.to_string()])
        }
    }

    #[test]
    fn run_command_with_timeout_does_not_deadlock_on_large_stdout() {
        let (program, args) = if cfg!(windows) {
            shell("for /L %i in (1,1,100000) do @echo 1234567890")
        } else {
            shell("i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done")
        };

        let output = run_command_with_timeout(&program, &args, Duration::from_secs(20), "trace")
            .expect("large-output command should complete");

        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.len() >= 1_000_000);
    }

    #[cfg(unix)]
    #[test]
    fn run_command_with_timeout_kills_slow_child() {
        let (program, args) = shell("exec sleep 30");
        let started = Instant::now();
        let err = run_command_with_timeout(&program, &args, Duration::from_millis(200), "trace-t")
            .expect_err("expected timeout");
        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert_eq!(err.trace_id, "trace-t");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_a_dependency_error() {
        let err = run_command_with_timeout(
            "/definitely/not/a/real/adb",
            &[],
            Duration::from_secs(1),
            "trace-m",
        )
        .expect_err("spawn should fail");
        assert_eq!(err.code, "ERR_DEPENDENCY");
    }

    #[cfg(unix)]
    #[test]
    fn streaming_child_yields_lines_until_exit() {
        let (program, args) = shell("echo one; echo two");
        let mut stream = spawn_streaming(&program, &args, "trace").expect("spawn");
        let lines: Vec<String> = (&mut stream.stdout)
            .lines()
            .map(|line| line.expect("line"))
            .collect();
        terminate_child(&mut stream.child, "trace");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }
}

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::app::adb::executor::{ShellExecutor, StreamCloser};
use crate::app::adb::table::split_fields;
use crate::app::error::AppError;
use crate::app::models::LogRecord;

pub const LOGCAT_CLEAR_COMMAND: &str = "logcat --clear";
pub const LOGCAT_STREAM_COMMAND: &str = "logcat";
pub const LOG_PACKAGE_SENTINEL: &str = "system";
const UNKNOWN_COMPONENT: &str = "unknown";

pub type LogSink = Arc<dyn Fn(LogRecord) + Send + Sync>;

/// Forwards records into a channel; a dropped receiver just discards them.
pub fn channel_sink(tx: Sender<LogRecord>) -> LogSink {
    let tx = Mutex::new(tx);
    Arc::new(move |record| {
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(record);
        }
    })
}

/// `date time pid tid level message`; anything shorter is not a record.
pub fn parse_log_line(line: &str) -> Option<LogRecord> {
    let parts = split_fields(line.trim(), 6);
    if parts.len() < 6 {
        return None;
    }
    let message = parts[5];
    let component = match message.split_once(':') {
        Some((head, _)) => head.to_string(),
        None => UNKNOWN_COMPONENT.to_string(),
    };
    Some(LogRecord {
        timestamp: format!("{} {}", parts[0], parts[1]),
        process_id: format!("{}-{}", parts[2], parts[3]),
        level: parts[4].chars().next()?,
        message: message.to_string(),
        component,
        package: LOG_PACKAGE_SENTINEL.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    Idle,
    Streaming,
    Stopped,
    Errored,
}

struct ActiveTail {
    stop_flag: Arc<AtomicBool>,
    closer: Box<dyn StreamCloser>,
    handle: JoinHandle<()>,
}

/// One log subscription at a time; the reader runs on its own thread and feeds the sink in
/// arrival order.
pub struct LogStreamTailer {
    state: Arc<Mutex<TailerState>>,
    active: Option<ActiveTail>,
}

impl Default for LogStreamTailer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStreamTailer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TailerState::Idle)),
            active: None,
        }
    }

    pub fn state(&self) -> TailerState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(TailerState::Errored)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some() && self.state() == TailerState::Streaming
    }

    /// `Ok(false)` while another subscription is still streaming.
    pub fn start(
        &mut self,
        executor: &dyn ShellExecutor,
        clear_first: bool,
        sink: LogSink,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        if self.is_active() {
            warn!(trace_id = %trace_id, serial = %executor.serial(), "log tailer already streaming");
            return Ok(false);
        }
        // A previous subscription whose stream ended on its own is reaped here.
        self.reap();

        if clear_first {
            executor.shell(LOGCAT_CLEAR_COMMAND, trace_id)?;
        }
        let stream = executor.open_stream(LOGCAT_STREAM_COMMAND, trace_id)?;
        let (mut reader, closer) = stream.into_parts();

        let stop_flag = Arc::new(AtomicBool::new(false));
        let state = Arc::clone(&self.state);
        self.set_state(TailerState::Streaming);

        let thread_stop = Arc::clone(&stop_flag);
        let thread_trace = trace_id.to_string();
        let spawned = std::thread::Builder::new()
            .name("logcat-tail".to_string())
            .spawn(move || {
                let mut buffer = Vec::new();
                let mut forwarded = 0usize;
                let outcome = loop {
                    buffer.clear();
                    match reader.read_until(b'\n', &mut buffer) {
                        Ok(0) => break TailerState::Stopped,
                        Ok(_) => {
                            if thread_stop.load(Ordering::Relaxed) {
                                break TailerState::Stopped;
                            }
                            let line = String::from_utf8_lossy(&buffer);
                            match parse_log_line(&line) {
                                Some(record) => {
                                    sink(record);
                                    forwarded += 1;
                                }
                                None => continue,
                            }
                        }
                        Err(err) => {
                            if thread_stop.load(Ordering::Relaxed) {
                                break TailerState::Stopped;
                            }
                            warn!(trace_id = %thread_trace, error = %err, "log stream read failed");
                            break TailerState::Errored;
                        }
                    }
                };
                if let Ok(mut guard) = state.lock() {
                    *guard = outcome;
                }
                info!(trace_id = %thread_trace, forwarded, state = ?outcome, "log tailer finished");
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                let mut closer = closer;
                closer.close();
                self.set_state(TailerState::Errored);
                return Err(AppError::system(
                    format!("Failed to spawn log reader: {err}"),
                    trace_id,
                ));
            }
        };

        self.active = Some(ActiveTail {
            stop_flag,
            closer,
            handle,
        });
        info!(trace_id = %trace_id, serial = %executor.serial(), "log tailer started");
        Ok(true)
    }

    /// Closes the stream so the blocked read returns, then joins the reader.
    /// `Ok(false)` when nothing was running.
    pub fn stop(&mut self, trace_id: &str) -> Result<bool, AppError> {
        let Some(mut active) = self.active.take() else {
            debug!(trace_id = %trace_id, "log tailer not running");
            return Ok(false);
        };
        active.stop_flag.store(true, Ordering::Relaxed);
        active.closer.close();
        if active.handle.join().is_err() {
            warn!(trace_id = %trace_id, "log reader thread panicked");
            self.set_state(TailerState::Errored);
            return Ok(true);
        }
        if self.state() == TailerState::Streaming {
            self.set_state(TailerState::Stopped);
        }
        info!(trace_id = %trace_id, "log tailer stopped");
        Ok(true)
    }

    fn reap(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.closer.close();
            let _ = active.handle.join();
        }
    }

    fn set_state(&self, next: TailerState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = next;
        }
    }
}

impl Drop for LogStreamTailer {
    fn drop(&mut self) {
        if let Some(active) = self.active.as_ref() {
            active.stop_flag.store(true, Ordering::Relaxed);
        }
        self.reap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::ScriptedExecutor;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn wait_for_state(tailer: &LogStreamTailer, expected: TailerState) {
        let started = Instant::now();
        while tailer.state() != expected && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(tailer.state(), expected);
    }

    #[test]
    fn parses_threadtime_line() {
        let record = parse_log_line(
            "01-02 03:04:05.678  1234  5678 I ActivityManager: Start proc 42:com.foo/u0a1",
        )
        .expect("record");
        assert_eq!(record.timestamp, "01-02 03:04:05.678");
        assert_eq!(record.process_id, "1234-5678");
        assert_eq!(record.level, 'I');
        assert_eq!(record.component, "ActivityManager");
        assert_eq!(record.message, "ActivityManager: Start proc 42:com.foo/u0a1");
        assert_eq!(record.package, "system");
    }

    #[test]
    fn message_without_colon_has_unknown_component() {
        let record = parse_log_line("01-02 03:04:05.678 1 2 Warn something odd").expect("record");
        assert_eq!(record.level, 'W');
        assert_eq!(record.component, "unknown");
    }

    #[test]
    fn short_lines_are_not_records() {
        assert!(parse_log_line("--------- beginning of main").is_none());
        assert!(parse_log_line("").is_none());
        assert!(parse_log_line("a b c d e").is_none());
    }

    #[test]
    fn forwards_records_in_order_and_stops_at_end_of_stream() {
        let executor = ScriptedExecutor::new("ABC").with_stream(
            "--------- beginning of main\n\
01-01 00:00:01.000 1 1 I First: one\n\
\n\
01-01 00:00:02.000 1 1 D Second: two\n\
garbage\n\
01-01 00:00:03.000 1 1 E Third: three\n",
        );
        let (tx, rx) = mpsc::channel();
        let mut tailer = LogStreamTailer::new();
        assert!(tailer
            .start(&executor, true, channel_sink(tx), "trace")
            .expect("start"));
        wait_for_state(&tailer, TailerState::Stopped);

        let components: Vec<String> = rx.try_iter().map(|record| record.component).collect();
        assert_eq!(components, vec!["First", "Second", "Third"]);
        assert_eq!(executor.commands()[0], LOGCAT_CLEAR_COMMAND);
        assert_eq!(executor.commands()[1], LOGCAT_STREAM_COMMAND);
    }

    #[test]
    fn second_start_while_streaming_is_refused() {
        let executor = ScriptedExecutor::new("ABC");
        let feed = executor.live_stream();
        let mut tailer = LogStreamTailer::new();
        let sink: LogSink = Arc::new(|_record: LogRecord| {});
        assert!(tailer.start(&executor, false, Arc::clone(&sink), "t1").expect("start"));
        assert!(!tailer.start(&executor, false, sink, "t2").expect("second start"));
        assert!(tailer.stop("t3").expect("stop"));
        assert!(!feed.send_line("01-01 00:00:01.000 1 1 I Late: line"));
    }

    #[test]
    fn stop_unblocks_reader_promptly() {
        let executor = ScriptedExecutor::new("ABC");
        let feed = executor.live_stream();
        let (tx, rx) = mpsc::channel();
        let mut tailer = LogStreamTailer::new();
        tailer
            .start(&executor, false, channel_sink(tx), "trace")
            .expect("start");
        assert!(feed.send_line("01-01 00:00:01.000 1 1 I Live: one"));
        let first = rx.recv_timeout(Duration::from_secs(5)).expect("first record");
        assert_eq!(first.component, "Live");

        let started = Instant::now();
        assert!(tailer.stop("trace").expect("stop"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(tailer.state(), TailerState::Stopped);
    }

    #[test]
    fn stop_when_idle_reports_false() {
        let mut tailer = LogStreamTailer::new();
        assert!(!tailer.stop("trace").expect("stop"));
        assert_eq!(tailer.state(), TailerState::Idle);
    }

    #[test]
    fn restart_after_stream_end_is_allowed() {
        let executor = ScriptedExecutor::new("ABC")
            .with_stream("01-01 00:00:01.000 1 1 I A: a\n")
            .with_stream("01-01 00:00:02.000 1 1 I B: b\n");
        let (tx, rx) = mpsc::channel();
        let sink = channel_sink(tx);
        let mut tailer = LogStreamTailer::new();
        assert!(tailer.start(&executor, false, Arc::clone(&sink), "t1").expect("first"));
        wait_for_state(&tailer, TailerState::Stopped);
        assert!(tailer.start(&executor, false, sink, "t2").expect("second"));
        wait_for_state(&tailer, TailerState::Stopped);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn read_error_marks_tailer_errored_and_allows_restart() {
        let executor = ScriptedExecutor::new("ABC")
            .with_broken_stream("01-01 00:00:01.000 1 1 I Before: drop\n")
            .with_stream("01-01 00:00:02.000 1 1 I After: reconnect\n");
        let (tx, rx) = mpsc::channel();
        let sink = channel_sink(tx);
        let mut tailer = LogStreamTailer::new();
        assert!(tailer.start(&executor, false, Arc::clone(&sink), "t1").expect("start"));
        wait_for_state(&tailer, TailerState::Errored);
        assert!(!tailer.is_active());
        let first = rx.recv_timeout(Duration::from_secs(5)).expect("record before error");
        assert_eq!(first.component, "Before");
        assert!(rx.try_recv().is_err());

        assert!(tailer.start(&executor, false, sink, "t2").expect("restart"));
        wait_for_state(&tailer, TailerState::Stopped);
        let second = rx.recv_timeout(Duration::from_secs(5)).expect("record after restart");
        assert_eq!(second.component, "After");
    }

    #[test]
    fn remote_end_of_stream_stops_live_tailer() {
        let executor = ScriptedExecutor::new("ABC");
        let feed = executor.live_stream();
        let (tx, rx) = mpsc::channel();
        let mut tailer = LogStreamTailer::new();
        tailer
            .start(&executor, false, channel_sink(tx), "trace")
            .expect("start");
        assert!(feed.send_line("01-01 00:00:01.000 1 1 I Last: words"));
        feed.finish();
        wait_for_state(&tailer, TailerState::Stopped);
        assert_eq!(rx.try_iter().count(), 1);
        assert!(!feed.send_line("01-01 00:00:02.000 1 1 I Gone: x"));
    }

    #[test]
    fn failed_stream_open_is_a_transport_error() {
        let executor = ScriptedExecutor::new("ABC");
        let mut tailer = LogStreamTailer::new();
        let err = tailer
            .start(&executor, false, Arc::new(|_record: LogRecord| {}), "trace-x")
            .expect_err("no stream");
        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert_eq!(tailer.state(), TailerState::Idle);
    }
}

use std::collections::VecDeque;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::app::adb::executor::{ShellExecutor, ShellStream, StreamCloser};
use crate::app::error::AppError;

#[derive(Clone)]
enum Reply {
    Text(String),
    Bytes(Vec<u8>),
    Fail(String),
    /// Blocks until a later command starts with the given prefix.
    BlockUntil(String),
}

enum StreamScript {
    Canned(String),
    /// Yields the content, then a read error instead of end-of-stream.
    Broken(String),
    Live(Arc<Mutex<Option<Sender<Vec<u8>>>>>),
}

/// Replays canned replies by command prefix and records every command it receives.
pub struct ScriptedExecutor {
    serial: String,
    replies: Mutex<Vec<(String, Reply)>>,
    commands: Mutex<Vec<String>>,
    streams: Mutex<VecDeque<StreamScript>>,
}

impl ScriptedExecutor {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            replies: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            streams: Mutex::new(VecDeque::new()),
        }
    }

    fn push_reply(self, prefix: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .expect("replies")
            .push((prefix.to_string(), reply));
        self
    }

    pub fn on(self, prefix: &str, output: &str) -> Self {
        self.push_reply(prefix, Reply::Text(output.to_string()))
    }

    pub fn on_bytes(self, prefix: &str, bytes: &[u8]) -> Self {
        self.push_reply(prefix, Reply::Bytes(bytes.to_vec()))
    }

    pub fn on_fail(self, prefix: &str, message: &str) -> Self {
        self.push_reply(prefix, Reply::Fail(message.to_string()))
    }

    pub fn on_block_until(self, prefix: &str, release_prefix: &str) -> Self {
        self.push_reply(prefix, Reply::BlockUntil(release_prefix.to_string()))
    }

    pub fn with_stream(self, content: &str) -> Self {
        self.streams
            .lock()
            .expect("streams")
            .push_back(StreamScript::Canned(content.to_string()));
        self
    }

    pub fn with_broken_stream(self, content: &str) -> Self {
        self.streams
            .lock()
            .expect("streams")
            .push_back(StreamScript::Broken(content.to_string()));
        self
    }

    /// Queues a stream that stays open until closed; lines are fed through the returned handle.
    pub fn live_stream(&self) -> LiveFeed {
        let sender = Arc::new(Mutex::new(None));
        self.streams
            .lock()
            .expect("streams")
            .push_back(StreamScript::Live(Arc::clone(&sender)));
        LiveFeed { sender }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands").clone()
    }

    pub fn saw(&self, prefix: &str) -> bool {
        self.commands().iter().any(|command| command.starts_with(prefix))
    }

    fn record(&self, command: &str) {
        self.commands
            .lock()
            .expect("commands")
            .push(command.to_string());
    }

    fn reply_for(&self, command: &str) -> Option<Reply> {
        let replies = self.replies.lock().expect("replies");
        replies
            .iter()
            .find(|(prefix, _)| prefix == command)
            .or_else(|| replies.iter().find(|(prefix, _)| command.starts_with(prefix.as_str())))
            .map(|(_, reply)| reply.clone())
    }

    fn wait_for(&self, release_prefix: &str, timeout: Duration, trace_id: &str) -> Result<(), AppError> {
        let started = Instant::now();
        while started.elapsed() < timeout {
            if self.saw(release_prefix) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Err(AppError::dependency("Command timed out", trace_id))
    }

    fn respond(&self, command: &str, timeout: Duration, trace_id: &str) -> Result<Vec<u8>, AppError> {
        self.record(command);
        match self.reply_for(command) {
            Some(Reply::Text(text)) => Ok(text.into_bytes()),
            Some(Reply::Bytes(bytes)) => Ok(bytes),
            Some(Reply::Fail(message)) => Err(AppError::dependency(message, trace_id)),
            Some(Reply::BlockUntil(release)) => {
                self.wait_for(&release, timeout, trace_id)?;
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }
}

impl ShellExecutor for ScriptedExecutor {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn shell(&self, command: &str, trace_id: &str) -> Result<String, AppError> {
        self.shell_with_timeout(command, Duration::from_secs(10), trace_id)
    }

    fn shell_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let bytes = self.respond(command, timeout, trace_id)?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    fn exec_out(&self, command: &str, trace_id: &str) -> Result<Vec<u8>, AppError> {
        self.record(command);
        match self.reply_for(command) {
            Some(Reply::Bytes(bytes)) => Ok(bytes),
            Some(Reply::Text(text)) => Ok(text.into_bytes()),
            Some(Reply::Fail(message)) => Err(AppError::dependency(message, trace_id)),
            _ => Err(AppError::dependency(format!("exec-out failed: {command}"), trace_id)),
        }
    }

    fn open_stream(&self, command: &str, trace_id: &str) -> Result<ShellStream, AppError> {
        self.record(command);
        let script = self
            .streams
            .lock()
            .expect("streams")
            .pop_front()
            .ok_or_else(|| AppError::dependency("No stream scripted", trace_id))?;
        Ok(match script {
            StreamScript::Canned(content) => ShellStream::new(
                Box::new(BufReader::new(Cursor::new(content.into_bytes()))),
                Box::new(NoopCloser),
            ),
            StreamScript::Broken(content) => ShellStream::new(
                Box::new(BufReader::new(Cursor::new(content.into_bytes()).chain(FailingReader))),
                Box::new(NoopCloser),
            ),
            StreamScript::Live(slot) => {
                let (tx, rx) = mpsc::channel();
                *slot.lock().expect("feed") = Some(tx);
                ShellStream::new(
                    Box::new(BufReader::new(ChannelReader::new(rx))),
                    Box::new(FeedCloser { slot }),
                )
            }
        })
    }

    fn pull(&self, remote: &str, local: &Path, trace_id: &str) -> Result<(), AppError> {
        let bytes = self.respond(&format!("pull {remote}"), Duration::from_secs(1), trace_id)?;
        std::fs::write(local, bytes).map_err(|err| AppError::system(err.to_string(), trace_id))
    }

    fn push(&self, local: &Path, remote: &str, trace_id: &str) -> Result<(), AppError> {
        self.respond(
            &format!("push {} {remote}", local.display()),
            Duration::from_secs(1),
            trace_id,
        )?;
        Ok(())
    }

    fn install(&self, apk: &Path, trace_id: &str) -> Result<String, AppError> {
        let bytes = self.respond(&format!("install {}", apk.display()), Duration::from_secs(1), trace_id)?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }
}

pub struct LiveFeed {
    sender: Arc<Mutex<Option<Sender<Vec<u8>>>>>,
}

impl LiveFeed {
    /// Returns false once the stream has been closed.
    pub fn send_line(&self, line: &str) -> bool {
        let guard = self.sender.lock().expect("feed");
        match guard.as_ref() {
            Some(tx) => tx.send(format!("{line}\n").into_bytes()).is_ok(),
            None => false,
        }
    }

    pub fn finish(&self) {
        self.sender.lock().expect("feed").take();
    }
}

struct FailingReader;

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "device disconnected",
        ))
    }
}

struct NoopCloser;

impl StreamCloser for NoopCloser {
    fn close(&mut self) {}
}

struct FeedCloser {
    slot: Arc<Mutex<Option<Sender<Vec<u8>>>>>,
}

impl StreamCloser for FeedCloser {
    fn close(&mut self) {
        if let Ok(mut guard) = self.slot.lock() {
            guard.take();
        }
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            offset: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.offset >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let count = buf.len().min(self.pending.len() - self.offset);
        buf[..count].copy_from_slice(&self.pending[self.offset..self.offset + count]);
        self.offset += count;
        Ok(count)
    }
}

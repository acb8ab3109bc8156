//! Agent output multiplexer.
//!
//! An [`AgentRun`] owns the child process for the whole run. It polls stdout
//! and stderr from a single task, forwarding completed stdout lines as they
//! arrive and buffering stderr for the failure message, all under one
//! wall-clock deadline. Every run ends with exactly one
//! [`RunEvent::Finished`].

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};

use claude_proxy_error::SandboxError;

use crate::config::MAX_TIMEOUT_SECS;
use crate::launcher::kill_tree;

/// Upper bound on a single readiness wait, so the deadline is noticed even
/// when the child is silent.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long to wait for a killed child to be reaped.
pub const KILL_GRACE: Duration = Duration::from_secs(3);

/// Longest stdout line forwarded; longer lines are dropped.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Stderr kept for the failure message. Older lines are evicted first.
pub const MAX_STDERR_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// One verbatim, non-empty stdout line (without its terminator).
    Line(String),
    /// Terminal outcome; always the last event of a run.
    Finished(RunOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded {
        lines: usize,
        duration: Duration,
    },
    Failed {
        exit_code: Option<i32>,
        /// Accumulated stderr, trimmed; may be empty.
        stderr: String,
        lines: usize,
        duration: Duration,
    },
    TimedOut {
        timeout: Duration,
        lines: usize,
        duration: Duration,
    },
}

impl RunOutcome {
    pub fn lines(&self) -> usize {
        match self {
            RunOutcome::Succeeded { lines, .. }
            | RunOutcome::Failed { lines, .. }
            | RunOutcome::TimedOut { lines, .. } => *lines,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            RunOutcome::Succeeded { duration, .. }
            | RunOutcome::Failed { duration, .. }
            | RunOutcome::TimedOut { duration, .. } => *duration,
        }
    }

    /// Message for the caller, or `None` on success.
    pub fn error_message(&self) -> Option<String> {
        match self {
            RunOutcome::Succeeded { .. } => None,
            RunOutcome::Failed {
                exit_code, stderr, ..
            } => Some(
                SandboxError::AgentProcessExited {
                    exit_code: *exit_code,
                    stderr: Some(stderr.clone()),
                }
                .to_string(),
            ),
            RunOutcome::TimedOut { timeout, .. } => Some(
                SandboxError::AgentTimedOut {
                    timeout_secs: timeout.as_secs(),
                }
                .to_string(),
            ),
        }
    }
}

/// One newline-terminated chunk of child output.
#[derive(Debug, PartialEq, Eq)]
struct Segment {
    bytes: Vec<u8>,
    /// The line was longer than the reader's limit and lost its tail.
    truncated: bool,
}

/// Splits a pipe on `\n` without ever holding more than `max_len` bytes of a
/// single line.
struct LineReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
    max_len: usize,
    truncated: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: Vec::new(),
            max_len,
            truncated: false,
        }
    }

    /// Cancel safe: buffered bytes are only consumed after they were copied
    /// into `line`, and nothing is awaited in between.
    async fn next_segment(&mut self) -> io::Result<Option<Segment>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.line.is_empty() && !self.truncated {
                    return Ok(None);
                }
                return Ok(Some(self.take_segment()));
            }
            let (chunk, used, complete) = match available.iter().position(|byte| *byte == b'\n') {
                Some(end) => (&available[..end], end + 1, true),
                None => (available, available.len(), false),
            };
            let room = self.max_len.saturating_sub(self.line.len());
            if chunk.len() > room {
                self.truncated = true;
            }
            self.line.extend_from_slice(&chunk[..chunk.len().min(room)]);
            self.inner.consume(used);
            if complete {
                return Ok(Some(self.take_segment()));
            }
        }
    }

    fn take_segment(&mut self) -> Segment {
        Segment {
            bytes: std::mem::take(&mut self.line),
            truncated: std::mem::replace(&mut self.truncated, false),
        }
    }
}

enum Polled {
    Stdout(io::Result<Option<Segment>>),
    Stderr(io::Result<Option<Segment>>),
    Idle,
}

pub struct AgentRun {
    child: Child,
    stdout: Option<LineReader<ChildStdout>>,
    stderr: Option<LineReader<ChildStderr>>,
    stderr_lines: VecDeque<String>,
    stderr_bytes: usize,
    line_count: usize,
    timeout: Duration,
    started: Instant,
    deadline: Instant,
    finished: bool,
}

impl std::fmt::Debug for AgentRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRun")
            .field("pid", &self.child.id())
            .field("stdout_open", &self.stdout.is_some())
            .field("stderr_open", &self.stderr.is_some())
            .field("line_count", &self.line_count)
            .field("timeout", &self.timeout)
            .field("finished", &self.finished)
            .finish()
    }
}

impl AgentRun {
    /// Takes ownership of `child`; the deadline starts now. Timeouts above
    /// [`MAX_TIMEOUT_SECS`] are clamped.
    pub fn new(mut child: Child, timeout: Duration) -> Self {
        let stdout = child
            .stdout
            .take()
            .map(|pipe| LineReader::new(pipe, MAX_LINE_BYTES));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| LineReader::new(pipe, MAX_STDERR_BYTES));
        let timeout = timeout.min(Duration::from_secs(MAX_TIMEOUT_SECS));
        let started = Instant::now();
        Self {
            child,
            stdout,
            stderr,
            stderr_lines: VecDeque::new(),
            stderr_bytes: 0,
            line_count: 0,
            timeout,
            started,
            deadline: started + timeout,
            finished: false,
        }
    }

    /// Returns the next event, or `None` once the terminal event was handed out.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        if self.finished {
            return None;
        }
        loop {
            if self.stdout.is_none() && self.stderr.is_none() {
                let outcome = self.wait_for_exit().await;
                return Some(self.finish(outcome));
            }

            let now = Instant::now();
            if now >= self.deadline {
                let outcome = self.cancel().await;
                return Some(self.finish(outcome));
            }
            let wait = POLL_INTERVAL.min(self.deadline - now);

            let polled = tokio::select! {
                segment = next_segment(&mut self.stdout) => Polled::Stdout(segment),
                segment = next_segment(&mut self.stderr) => Polled::Stderr(segment),
                _ = tokio::time::sleep(wait) => Polled::Idle,
            };

            match polled {
                Polled::Stdout(Ok(Some(segment))) => {
                    if segment.truncated {
                        tracing::warn!(
                            limit = MAX_LINE_BYTES,
                            "dropping oversized agent stdout line"
                        );
                        continue;
                    }
                    if let Some(line) = decode_line(segment.bytes) {
                        self.line_count += 1;
                        return Some(RunEvent::Line(line));
                    }
                }
                Polled::Stderr(Ok(Some(segment))) => {
                    if let Some(line) = decode_line(segment.bytes) {
                        self.keep_stderr(line);
                    }
                }
                Polled::Stdout(result) => {
                    if let Err(err) = result {
                        tracing::warn!(error = %err, "agent stdout read failed");
                    }
                    self.stdout = None;
                }
                Polled::Stderr(result) => {
                    if let Err(err) = result {
                        tracing::warn!(error = %err, "agent stderr read failed");
                    }
                    self.stderr = None;
                }
                Polled::Idle => {}
            }
        }
    }

    /// Adapts the run into a lazy, single-pass stream of events.
    pub fn into_stream(self) -> impl Stream<Item = RunEvent> + Send {
        futures::stream::unfold(self, |mut run| async move {
            let event = run.next_event().await?;
            Some((event, run))
        })
    }

    async fn wait_for_exit(&mut self) -> RunOutcome {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.child.wait()).await {
            Ok(Ok(status)) if status.success() => RunOutcome::Succeeded {
                lines: self.line_count,
                duration: self.started.elapsed(),
            },
            Ok(Ok(status)) => RunOutcome::Failed {
                exit_code: status.code(),
                stderr: self.stderr_text(),
                lines: self.line_count,
                duration: self.started.elapsed(),
            },
            Ok(Err(err)) => RunOutcome::Failed {
                exit_code: None,
                stderr: format!("failed to wait for agent: {err}"),
                lines: self.line_count,
                duration: self.started.elapsed(),
            },
            // Pipes closed but the process is still running.
            Err(_) => self.cancel().await,
        }
    }

    async fn cancel(&mut self) -> RunOutcome {
        self.stdout = None;
        self.stderr = None;
        kill_tree(&mut self.child);
        if tokio::time::timeout(KILL_GRACE, self.child.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                pid = ?self.child.id(),
                "agent did not exit within kill grace period"
            );
        }
        RunOutcome::TimedOut {
            timeout: self.timeout,
            lines: self.line_count,
            duration: self.started.elapsed(),
        }
    }

    fn finish(&mut self, outcome: RunOutcome) -> RunEvent {
        self.finished = true;
        RunEvent::Finished(outcome)
    }

    fn keep_stderr(&mut self, line: String) {
        self.stderr_bytes += line.len();
        self.stderr_lines.push_back(line);
        while self.stderr_bytes > MAX_STDERR_BYTES && self.stderr_lines.len() > 1 {
            if let Some(evicted) = self.stderr_lines.pop_front() {
                self.stderr_bytes -= evicted.len();
            }
        }
    }

    fn stderr_text(&self) -> String {
        let lines: Vec<&str> = self.stderr_lines.iter().map(String::as_str).collect();
        lines.join("\n").trim().to_string()
    }
}

impl Drop for AgentRun {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                lines = self.line_count,
                "agent run dropped before completion; killing process"
            );
            kill_tree(&mut self.child);
        }
    }
}

async fn next_segment<R>(reader: &mut Option<LineReader<R>>) -> io::Result<Option<Segment>>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.next_segment().await,
        None => std::future::pending().await,
    }
}

/// Strips a trailing `\r` and drops empty lines.
fn decode_line(mut segment: Vec<u8>) -> Option<String> {
    if segment.last() == Some(&b'\r') {
        segment.pop();
    }
    if segment.is_empty() {
        return None;
    }
    Some(match String::from_utf8(segment) {
        Ok(line) => line,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    })
}

//! A supervised external process
//!
//! Each `ManagedProcess` owns one child through a supervisor task. The task
//! is the only code touching the child: it reads output lines, runs the
//! readiness matcher, handles stop requests and reaps the process. The
//! handle talks to it over channels and observes two independent signals:
//! readiness (pending -> ready | exited) and termination (pending -> exited).

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

use crate::common::{Error, Result};

use super::matcher::{ReadinessMatcher, ReadyEvent};
use super::output::{OutputLine, OutputTail, Stream};
use super::spec::ProcessSpec;

/// How long to keep collecting output after the child has been reaped
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Lines in flight between the pipe readers and the supervisor
const LINE_CHANNEL_CAPACITY: usize = 256;

/// How a process ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal (unix only)
    pub signal: Option<i32>,
    /// The process ignored the interrupt and had to be killed
    pub forced: bool,
    /// Waiting on the process failed
    pub error: Option<String>,
}

impl ExitInfo {
    fn from_status(status: std::io::Result<ExitStatus>, forced: bool) -> Self {
        match status {
            Ok(status) => {
                #[cfg(unix)]
                let signal = {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal()
                };
                #[cfg(not(unix))]
                let signal = None;

                Self {
                    code: status.code(),
                    signal,
                    forced,
                    error: None,
                }
            }
            Err(e) => Self {
                forced,
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }

    fn lost(reason: &str) -> Self {
        Self {
            error: Some(reason.to_string()),
            ..Default::default()
        }
    }

    /// Whether the process ended the way a graceful stop should end it
    pub fn is_clean(&self) -> bool {
        if self.forced || self.error.is_some() {
            return false;
        }
        if self.code == Some(0) {
            return true;
        }
        #[cfg(unix)]
        {
            matches!(self.signal, Some(libc::SIGINT) | Some(libc::SIGTERM))
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(error) = &self.error {
            return write!(f, "wait failed: {}", error);
        }
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code)?,
            (None, Some(signal)) => write!(f, "killed by signal {}", signal)?,
            (None, None) => write!(f, "unknown exit status")?,
        }
        if self.forced {
            write!(f, ", forced after grace period")?;
        }
        Ok(())
    }
}

/// Readiness state published by the supervisor
#[derive(Debug, Clone)]
enum Readiness {
    Pending,
    Ready(ReadyEvent),
    Exited(ExitInfo),
}

/// Requests from the handle to the supervisor
#[derive(Debug)]
enum Control {
    Stop,
}

/// Resolves once the process has been reaped
#[derive(Debug, Clone)]
pub struct Termination {
    name: String,
    rx: watch::Receiver<Option<ExitInfo>>,
}

impl Termination {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the exit information
    pub async fn wait(mut self) -> ExitInfo {
        match self.rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => exit.clone().unwrap_or_default(),
            Err(_) => ExitInfo::lost("supervisor ended without reporting an exit"),
        }
    }
}

/// Handle to a running (or finished) external process
pub struct ManagedProcess {
    name: String,
    pid: Option<u32>,
    started_at: Instant,
    ready_timeout: Duration,
    ready_rx: watch::Receiver<Readiness>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    control_tx: mpsc::UnboundedSender<Control>,
    tail: Arc<Mutex<OutputTail>>,
    stop_requested: bool,
}

impl ManagedProcess {
    /// Launch the process and start watching its output
    ///
    /// Returns as soon as the process is spawned.
    pub fn start(spec: ProcessSpec) -> Result<Self> {
        let argv = spec.command_line();
        tracing::info!(
            process = %spec.name,
            "Starting {} {}",
            spec.program.display(),
            argv.join(" ")
        );

        let started_at = Instant::now();
        let mut child = Command::new(&spec.program)
            .args(&argv)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ProcessSpawn {
                name: spec.name.clone(),
                source: e,
            })?;

        let pid = child.id();
        tracing::debug!(process = %spec.name, pid = ?pid, "Process spawned");

        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let max_line = spec.output_tail_bytes;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, Stream::Stdout, max_line, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, Stream::Stderr, max_line, line_tx);
        }

        let (ready_tx, ready_rx) = watch::channel(Readiness::Pending);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let tail = Arc::new(Mutex::new(OutputTail::new(spec.output_tail_bytes)));

        let supervisor = Supervisor {
            name: spec.name.clone(),
            pid,
            started_at,
            matcher: ReadinessMatcher::new(spec.ready_pattern),
            tail: tail.clone(),
            ready_tx,
            exit_tx,
            grace: spec.stop_grace,
        };
        tokio::spawn(supervisor.run(child, line_rx, control_rx));

        Ok(Self {
            name: spec.name,
            pid,
            started_at,
            ready_timeout: spec.ready_timeout,
            ready_rx,
            exit_rx,
            control_tx,
            tail,
            stop_requested: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// The readiness budget from the process spec
    pub fn ready_timeout(&self) -> Duration {
        self.ready_timeout
    }

    /// Wait for the readiness marker
    ///
    /// Fails with `ReadinessTimeout` when the marker does not show up in
    /// time and with `ProcessExitedEarly` when the process ends first.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<ReadyEvent> {
        let mut rx = self.ready_rx.clone();
        let state = match tokio::time::timeout(
            timeout,
            rx.wait_for(|r| !matches!(r, Readiness::Pending)),
        )
        .await
        {
            Err(_) => return Err(Error::readiness_timeout(&self.name, timeout)),
            Ok(Err(_)) => {
                return Err(Error::Internal(format!(
                    "supervisor for '{}' stopped without a readiness verdict",
                    self.name
                )))
            }
            Ok(Ok(state)) => state.clone(),
        };

        match state {
            Readiness::Ready(event) => Ok(event),
            Readiness::Exited(exit) => Err(Error::exited_early(&self.name, exit, self.output_tail())),
            Readiness::Pending => Err(Error::Internal("readiness still pending".to_string())),
        }
    }

    /// Whether the readiness marker has been seen
    pub fn is_ready(&self) -> bool {
        matches!(*self.ready_rx.borrow(), Readiness::Ready(_))
    }

    /// Ask the process to stop
    ///
    /// Sends an interrupt and escalates to a kill after the grace period.
    /// Only the first call sends anything; every call returns a signal for
    /// the same termination.
    pub fn stop(&mut self) -> Termination {
        if !self.stop_requested {
            self.stop_requested = true;
            if self.is_running() {
                tracing::debug!(process = %self.name, "Stop requested");
            }
            // The supervisor is gone once the child has been reaped
            let _ = self.control_tx.send(Control::Stop);
        }

        self.termination()
    }

    /// Signal for the process's exit, without asking it to stop
    pub fn termination(&self) -> Termination {
        Termination {
            name: self.name.clone(),
            rx: self.exit_rx.clone(),
        }
    }

    /// Whether the child has not been reaped yet
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit information, once the child has been reaped
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    /// Retained output, oldest first
    pub fn output_tail(&self) -> String {
        self.tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .render()
    }

    /// First capture group of the first retained output line matching `pattern`
    pub fn output_capture(&self, pattern: &Regex) -> Option<String> {
        self.tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .find_capture(pattern)
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("ready", &self.is_ready())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Forward lines from one pipe until EOF
fn spawn_reader<R>(reader: R, stream: Stream, max_line: usize, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = read_lines(reader, stream, max_line, tx).await {
            tracing::debug!("Error reading {}: {}", stream.as_str(), e);
        }
    });
}

/// Send each line of `reader`, keeping at most `max_line` bytes of it
///
/// The remainder of an overlong line is discarded without being buffered.
async fn read_lines<R>(
    reader: R,
    stream: Stream,
    max_line: usize,
    tx: mpsc::Sender<OutputLine>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let limit = max_line.max(1) as u64;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = (&mut reader).take(limit).read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        if buf.last() != Some(&b'\n') && n as u64 == limit {
            let skipped = skip_line(&mut reader).await?;
            tracing::debug!(
                "Line on {} exceeds {} bytes, dropped {} bytes",
                stream.as_str(),
                limit,
                skipped
            );
        }

        let text = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        if tx.send(OutputLine { stream, text }).await.is_err() {
            return Ok(());
        }
    }
}

/// Consume input up to and including the next newline
async fn skip_line<R>(reader: &mut R) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let (newline, available) = {
            let chunk = reader.fill_buf().await?;
            (chunk.iter().position(|&b| b == b'\n'), chunk.len())
        };
        match newline {
            _ if available == 0 => return Ok(skipped),
            Some(i) => {
                reader.consume(i + 1);
                return Ok(skipped + i);
            }
            None => {
                reader.consume(available);
                skipped += available;
            }
        }
    }
}

/// State owned by the supervisor task
struct Supervisor {
    name: String,
    pid: Option<u32>,
    started_at: Instant,
    matcher: ReadinessMatcher,
    tail: Arc<Mutex<OutputTail>>,
    ready_tx: watch::Sender<Readiness>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    grace: Duration,
}

impl Supervisor {
    async fn run(
        mut self,
        mut child: Child,
        mut lines: mpsc::Receiver<OutputLine>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        let mut lines_open = true;
        let mut control_open = true;
        let mut interrupted = false;
        let mut forced = false;

        let kill_timer = tokio::time::sleep_until(tokio::time::Instant::now());
        tokio::pin!(kill_timer);
        let mut kill_armed = false;

        let status = loop {
            tokio::select! {
                line = lines.recv(), if lines_open => match line {
                    Some(line) => self.handle_line(line),
                    None => lines_open = false,
                },
                ctl = control.recv(), if control_open => match ctl {
                    Some(Control::Stop) => {
                        if !interrupted {
                            interrupted = true;
                            self.interrupt(&mut child);
                            kill_timer.as_mut().reset(tokio::time::Instant::now() + self.grace);
                            kill_armed = true;
                        }
                    }
                    None => {
                        // Handle dropped without stopping: nobody is left to wait
                        control_open = false;
                        tracing::debug!(process = %self.name, "Handle dropped, killing process");
                        let _ = child.start_kill();
                    }
                },
                _ = &mut kill_timer, if kill_armed => {
                    kill_armed = false;
                    forced = true;
                    tracing::warn!(
                        process = %self.name,
                        "Process ignored interrupt for {:?}, killing",
                        self.grace
                    );
                    if let Err(e) = child.start_kill() {
                        tracing::error!(process = %self.name, "Failed to kill process: {}", e);
                    }
                }
                status = child.wait() => break status,
            }
        };

        // Collect whatever the pipes still hold; a grandchild may keep them open
        if lines_open {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while let Some(line) = lines.recv().await {
                    self.handle_line(line);
                }
            })
            .await;
        }

        let exit = ExitInfo::from_status(status, forced);
        if exit.is_clean() || interrupted {
            tracing::debug!(process = %self.name, "Process exited ({})", exit);
        } else {
            tracing::warn!(process = %self.name, "Process exited ({})", exit);
        }

        self.ready_tx.send_if_modified(|state| {
            if matches!(state, Readiness::Pending) {
                *state = Readiness::Exited(exit.clone());
                true
            } else {
                false
            }
        });
        self.exit_tx.send_replace(Some(exit));
    }

    fn handle_line(&mut self, line: OutputLine) {
        tracing::debug!(
            target: "harness::output",
            process = %self.name,
            stream = line.stream.as_str(),
            "{}",
            line.text
        );

        self.tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.stream, &line.text);

        if let Some(event) = self.matcher.feed(&line.text) {
            tracing::info!(
                process = %self.name,
                "Ready after {:?}",
                event.at.saturating_duration_since(self.started_at)
            );
            self.ready_tx.send_replace(Readiness::Ready(event));
        }
    }

    fn interrupt(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SIGINT lets the process shut down its listeners and tunnels
            let result = unsafe { libc::kill(pid as i32, libc::SIGINT) };
            if result == 0 {
                tracing::debug!(process = %self.name, pid, "Sent SIGINT");
                return;
            }
            tracing::debug!(
                process = %self.name,
                "SIGINT failed: {}",
                std::io::Error::last_os_error()
            );
        }

        if let Err(e) = child.start_kill() {
            tracing::debug!(process = %self.name, "Kill failed: {}", e);
        }
    }
}

//! Supervised child processes.
//!
//! # Responsibilities
//! - Spawn an executable and feed its stdin
//! - Watch one output stream for a readiness marker
//! - Report the exit, whenever it happens, through a hook
//!
//! One monitor task owns each child. The caller of [`launch`] waits until
//! the marker shows up or the child dies; there is no timeout.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::RegexSet;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::EffectiveConfig;
use crate::supervisor::SupervisorError;

const CORE_READY_PATTERN: &str = r"\[Warning\] core: .* started";
const TUNNEL_REGISTERED_PATTERN: &str = r"Registered tunnel connection";
const TUNNEL_QUICK_URL_PATTERN: &str = r"https://[a-zA-Z0-9.-]+\.trycloudflare\.com";

/// Output still buffered when a child exits is read for at most this long.
const DRAIN_GRACE: Duration = Duration::from_millis(200);
const TERMINATE_WAIT: Duration = Duration::from_secs(5);
const CHMOD_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Core,
    Tunnel,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Core => f.write_str("Core"),
            Role::Tunnel => f.write_str("Tunnel"),
        }
    }
}

/// How a child ended. Either field may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: &std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {code}")?,
            None => f.write_str("code none")?,
        }
        match self.signal {
            Some(signal) => write!(f, ", signal {signal}"),
            None => f.write_str(", signal none"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProcessState {
    #[default]
    Idle,
    Downloading,
    Starting,
    Ready,
    Exited(ExitInfo),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Lines on one stream that mean the child is up.
#[derive(Debug, Clone)]
pub struct ReadinessMarker {
    stream: OutputStream,
    patterns: RegexSet,
}

impl ReadinessMarker {
    pub fn new(stream: OutputStream, patterns: &[&str]) -> Result<Self, regex::Error> {
        Ok(Self {
            stream,
            patterns: RegexSet::new(patterns)?,
        })
    }

    pub fn core() -> Result<Self, regex::Error> {
        Self::new(OutputStream::Stdout, &[CORE_READY_PATTERN])
    }

    pub fn tunnel() -> Result<Self, regex::Error> {
        Self::new(
            OutputStream::Stderr,
            &[TUNNEL_REGISTERED_PATTERN, TUNNEL_QUICK_URL_PATTERN],
        )
    }

    pub fn stream(&self) -> OutputStream {
        self.stream
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.patterns.is_match(line)
    }
}

/// Everything needed to spawn one supervised process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub role: Role,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub marker: ReadinessMarker,
}

/// Delivered to the [`ExitHook`] once per child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub role: Role,
    pub pid: u32,
    pub exit: ExitInfo,
    /// The readiness marker had been seen.
    pub was_ready: bool,
    /// The supervisor killed it on purpose.
    pub retired: bool,
}

pub type ExitHook = Box<dyn FnOnce(ProcessExit) + Send + 'static>;

/// Owning handle for a running child. Dropping it kills the child.
#[derive(Debug)]
pub struct ProcessHandle {
    role: Role,
    pid: u32,
    retired: Arc<AtomicBool>,
    kill_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn retire(&mut self) {
        self.retired.store(true, Ordering::Release);
        if let Some(kill_tx) = self.kill_tx.take() {
            // The monitor is gone once the child has exited.
            let _ = kill_tx.send(());
        }
    }

    /// Kill the child and wait for its monitor to finish.
    ///
    /// The exit is reported as retired, so it is never treated as a crash.
    /// Terminating an already exited child is a no-op.
    pub async fn terminate(mut self) {
        self.retire();
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(TERMINATE_WAIT, task).await.is_err() {
                tracing::warn!(role = %self.role, pid = self.pid, "Process did not exit after kill");
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.retire();
    }
}

/// Spawn `spec` and wait until it reports ready.
///
/// A child that exits first yields [`SupervisorError::ExitedBeforeReady`].
/// The hook still receives that exit.
pub async fn launch(spec: LaunchSpec, on_exit: ExitHook) -> Result<ProcessHandle, SupervisorError> {
    let LaunchSpec {
        role,
        program,
        args,
        stdin,
        marker,
    } = spec;

    let mut child = Command::new(&program)
        .args(&args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            role,
            program: program.clone(),
            source,
        })?;

    let pid = child.id().unwrap_or_default();
    tracing::debug!(%role, pid, program = %program.display(), "Process spawned");

    let input = child.stdin.take();
    let retired = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = oneshot::channel();
    let (kill_tx, kill_rx) = oneshot::channel();

    let monitor = Monitor {
        role,
        pid,
        marker,
        retired: retired.clone(),
    };
    let task = tokio::spawn(monitor.run(child, ready_tx, kill_rx, on_exit));

    let handle = ProcessHandle {
        role,
        pid,
        retired,
        kill_tx: Some(kill_tx),
        task: Some(task),
    };

    if let (Some(mut input), Some(document)) = (input, stdin) {
        // A child that dies before reading is caught by the monitor.
        if let Err(err) = input.write_all(document.as_bytes()).await {
            tracing::warn!(%role, pid, error = %err, "Failed to write process stdin");
        }
        let _ = input.shutdown().await;
    }

    match ready_rx.await {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(exit)) => Err(SupervisorError::ExitedBeforeReady { role, exit }),
        Err(_) => Err(SupervisorError::MonitorLost { role }),
    }
}

struct Monitor {
    role: Role,
    pid: u32,
    marker: ReadinessMarker,
    retired: Arc<AtomicBool>,
}

impl Monitor {
    async fn run(
        self,
        mut child: Child,
        ready_tx: oneshot::Sender<Result<(), ExitInfo>>,
        mut kill_rx: oneshot::Receiver<()>,
        on_exit: ExitHook,
    ) {
        let mut stdout = child.stdout.take().map(LineReader::new);
        let mut stderr = child.stderr.take().map(LineReader::new);
        let mut ready_tx = Some(ready_tx);
        let mut kill_armed = true;

        let exit = loop {
            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => self.on_line(OutputStream::Stdout, &line, &mut ready_tx),
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => self.on_line(OutputStream::Stderr, &line, &mut ready_tx),
                    None => stderr = None,
                },
                request = &mut kill_rx, if kill_armed => {
                    kill_armed = false;
                    if request.is_ok() {
                        if let Err(err) = child.start_kill() {
                            tracing::debug!(role = %self.role, pid = self.pid, error = %err, "Kill failed");
                        }
                    }
                }
                status = child.wait() => break match status {
                    Ok(status) => ExitInfo::from_status(&status),
                    Err(err) => {
                        tracing::warn!(role = %self.role, pid = self.pid, error = %err, "Failed to collect exit status");
                        ExitInfo::default()
                    }
                },
            }
        };

        let drain = async {
            while let Some(line) = next_line(&mut stdout).await {
                self.on_line(OutputStream::Stdout, &line, &mut ready_tx);
            }
            while let Some(line) = next_line(&mut stderr).await {
                self.on_line(OutputStream::Stderr, &line, &mut ready_tx);
            }
        };
        let _ = tokio::time::timeout(DRAIN_GRACE, drain).await;

        let was_ready = ready_tx.is_none();
        if let Some(ready_tx) = ready_tx.take() {
            let _ = ready_tx.send(Err(exit));
        }

        let retired = self.retired.load(Ordering::Acquire);
        tracing::info!(
            role = %self.role,
            pid = self.pid,
            code = ?exit.code,
            signal = ?exit.signal,
            retired,
            "[Main] {} exited with {}",
            self.role,
            exit
        );

        on_exit(ProcessExit {
            role: self.role,
            pid: self.pid,
            exit,
            was_ready,
            retired,
        });
    }

    fn on_line(
        &self,
        stream: OutputStream,
        line: &str,
        ready_tx: &mut Option<oneshot::Sender<Result<(), ExitInfo>>>,
    ) {
        if stream != self.marker.stream() || !self.marker.is_match(line) {
            tracing::debug!(role = %self.role, ?stream, "{}", line);
            return;
        }

        match ready_tx.take() {
            Some(ready_tx) => {
                tracing::debug!(role = %self.role, pid = self.pid, "Readiness marker seen");
                let _ = ready_tx.send(Ok(()));
            }
            None => tracing::info!(role = %self.role, "{}", line),
        }
    }
}

/// Splits a child's output into lines without insisting on UTF-8.
///
/// A pipe is only let go at end of stream or on a read error; dropping it
/// while the child still writes would kill the child with SIGPIPE.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Next line, lossily decoded. `None` once the stream is done.
    ///
    /// Cancel safe: bytes read by an abandoned call stay in `buf`.
    async fn next_line(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) if self.buf.is_empty() => None,
            Ok(_) => {
                let line = decode_line(&self.buf);
                self.buf.clear();
                Some(line)
            }
            Err(err) => {
                tracing::debug!(error = %err, "Output stream failed");
                None
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn next_line<R>(lines: &mut Option<LineReader<R>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => None,
    }
}

/// `chmod +x` on Linux, then give the filesystem a moment.
pub async fn make_executable(path: &Path) {
    if !cfg!(target_os = "linux") {
        return;
    }

    match Command::new("chmod").arg("+x").arg(path).status().await {
        Ok(status) if status.success() => {
            tracing::debug!(path = %path.display(), "chmod completed");
        }
        Ok(status) => {
            tracing::warn!(path = %path.display(), code = ?status.code(), "chmod failed");
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "chmod could not run");
        }
    }
    tokio::time::sleep(CHMOD_SETTLE).await;
}

/// Command line for the core.
pub fn core_args() -> Vec<String> {
    vec!["-c".to_string(), "stdin:".to_string()]
}

/// Command line for the tunnel client: token mode when an access token is
/// configured, quick mode against the local listener otherwise.
pub fn tunnel_args(config: &EffectiveConfig) -> Vec<String> {
    let mut args = vec!["tunnel".to_string(), "--no-autoupdate".to_string()];

    match config.cloudflared_access_token.as_deref() {
        Some(token) if !token.is_empty() => {
            args.extend(["run".to_string(), "--token".to_string(), token.to_string()]);
        }
        _ => {
            args.extend(["--url".to_string(), format!("http://localhost:{}", config.port)]);
        }
    }
    if !config.cloudflared_protocol.is_empty() {
        args.extend(["--protocol".to_string(), config.cloudflared_protocol.clone()]);
    }
    if !config.cloudflared_region.is_empty() {
        args.extend(["--region".to_string(), config.cloudflared_region.clone()]);
    }
    args
}

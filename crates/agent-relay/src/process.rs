//! External tool process management.
//!
//! One [`ProcessSession`] is one tool invocation bound to one chat turn. The
//! turn input is written to stdin once and stdin is closed; stdout is framed
//! into [`Record`]s and stderr into text lines, both pushed into a channel in
//! the order they were read. [`ProcessSession::run`] owns the lifetime of the
//! process: natural exit, user cancellation (SIGTERM to the process group,
//! escalated to SIGKILL after a grace period) and the wall-clock timeout
//! (immediate SIGKILL).

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::config::{ResumeMode, ToolConfig};
use crate::error::TurnError;
use crate::frame::{Record, RecordCodec, TextLineCodec, preview};

/// Flags selecting the tool's streaming JSON output.
pub const STREAM_FLAGS: [&str; 5] = [
    "--print",
    "--output-format",
    "stream-json",
    "--include-partial-messages",
    "--verbose",
];

/// Exit code of a process terminated by our own SIGTERM (128 + 15).
pub const GRACEFUL_EXIT_CODE: i32 = 128 + libc::SIGTERM;

const LOG_PREVIEW_CHARS: usize = 200;

/// Everything needed to launch the tool for one turn.
#[derive(Debug, Clone)]
pub struct ToolSpawnConfig {
    pub binary: String,
    pub base_args: Vec<String>,
    pub extra_args: Vec<String>,
    pub resume_mode: ResumeMode,
    /// Conversation to resume, if any.
    pub continuation: Option<String>,
    /// Directories the tool is allowed to read (`--add-dir`).
    pub extra_dirs: Vec<PathBuf>,
    pub work_dir: PathBuf,
    pub env: HashMap<String, String>,
}

impl ToolSpawnConfig {
    pub fn new(tool: &ToolConfig, work_dir: PathBuf) -> Self {
        Self {
            binary: tool.binary.clone(),
            base_args: tool.base_args.clone(),
            extra_args: tool.extra_args.clone(),
            resume_mode: tool.resume_mode,
            continuation: None,
            extra_dirs: Vec::new(),
            work_dir,
            env: tool.env.clone(),
        }
    }

    /// Full argument vector, in invocation order.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.base_args.iter().map(OsString::from).collect();
        args.extend(STREAM_FLAGS.iter().map(OsString::from));

        for dir in &self.extra_dirs {
            args.push("--add-dir".into());
            args.push(dir.into());
        }

        if let Some(ref token) = self.continuation {
            match self.resume_mode {
                ResumeMode::Resume => {
                    args.push("--resume".into());
                    args.push(token.into());
                }
                ResumeMode::Continue => args.push("--continue".into()),
            }
        }

        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args())
            .current_dir(&self.work_dir)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so signals reach helper subprocesses too.
        cmd.process_group(0);
        cmd
    }
}

/// Timing bounds for one turn.
#[derive(Debug, Clone, Copy)]
pub struct TurnLimits {
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub drain_timeout: Duration,
}

impl From<&ToolConfig> for TurnLimits {
    fn from(tool: &ToolConfig) -> Self {
        Self {
            timeout: tool.turn_timeout(),
            kill_grace: tool.kill_grace(),
            drain_timeout: tool.drain_timeout(),
        }
    }
}

/// Launches tool processes.
#[async_trait]
pub trait ToolRuntime: Send + Sync {
    /// Spawn the tool and hand it `input`. Returns as soon as the process
    /// exists; the input is written in the background.
    async fn spawn(
        &self,
        config: &ToolSpawnConfig,
        input: String,
    ) -> Result<ProcessSession, TurnError>;
}

/// Runs the tool as a direct child of the relay.
#[derive(Debug, Default)]
pub struct LocalToolRuntime;

#[async_trait]
impl ToolRuntime for LocalToolRuntime {
    async fn spawn(
        &self,
        config: &ToolSpawnConfig,
        input: String,
    ) -> Result<ProcessSession, TurnError> {
        info!(
            "Spawning {} in {:?} (resume={})",
            config.binary,
            config.work_dir,
            config.continuation.is_some()
        );
        debug!("{} args: {:?}", config.binary, config.args());

        let mut child = config.command().spawn().map_err(|source| TurnError::Spawn {
            binary: config.binary.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let mut line = input.into_bytes();
                line.push(b'\n');
                if let Err(e) = stdin.write_all(&line).await {
                    debug!("Failed to write turn input: {}", e);
                }
                // Closing stdin signals end of input.
                if let Err(e) = stdin.shutdown().await {
                    debug!("Failed to close tool stdin: {}", e);
                }
            });
        }

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        info!("{} started with pid {:?}", config.binary, pid);

        Ok(ProcessSession {
            binary: config.binary.clone(),
            pid,
            child,
            stdout,
            stderr,
        })
    }
}

/// Output read from the tool, in pipe order.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutput {
    Record(Record),
    Stderr(String),
}

/// Why the process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exited,
    /// A cancellation was requested before the process exited.
    Cancelled,
    /// The wall-clock ceiling elapsed.
    TimedOut,
}

/// Final state of a tool process.
#[derive(Debug)]
pub struct ProcessExit {
    /// `code()` or, for signal deaths, `128 + signal`.
    pub exit_code: Option<i32>,
    pub stop: StopReason,
    pub wait_error: Option<io::Error>,
}

/// Shell-style exit code: the status code, or `128 + signal` if the process
/// was killed by a signal.
pub fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|sig| 128 + sig))
}

/// `duration` from now, clamped so huge configured limits cannot overflow.
fn deadline_after(duration: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(duration)
        .unwrap_or_else(|| now + crate::config::MAX_LIMIT)
}

/// Send `signal` to the process group led by `pid`.
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: kill(2) has no memory-safety preconditions; the negative pid
    // addresses the group created with process_group(0) at spawn.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// A running tool invocation.
pub struct ProcessSession {
    binary: String,
    pid: Option<u32>,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl std::fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSession")
            .field("binary", &self.binary)
            .field("pid", &self.pid)
            .finish()
    }
}

impl ProcessSession {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Drive the process to completion.
    ///
    /// Output is sent on `output` as it is read. Returns once the process has
    /// exited and its pipes are drained (or `drain_timeout` has passed).
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        limits: TurnLimits,
        output: mpsc::Sender<ProcessOutput>,
    ) -> ProcessExit {
        let readers: Vec<JoinHandle<()>> = [
            self.stdout
                .take()
                .map(|stdout| spawn_stdout_reader(stdout, self.binary.clone(), output.clone())),
            self.stderr
                .take()
                .map(|stderr| spawn_stderr_reader(stderr, self.binary.clone(), output.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();
        drop(output);

        let deadline = tokio::time::sleep_until(deadline_after(limits.timeout));
        let grace = tokio::time::sleep_until(deadline_after(limits.kill_grace));
        tokio::pin!(deadline);
        tokio::pin!(grace);

        let mut stop = StopReason::Exited;
        let mut escalated = false;

        let status = loop {
            tokio::select! {
                status = self.child.wait() => break status,

                _ = cancel.cancelled(), if stop == StopReason::Exited => {
                    info!("Cancelling {} (pid {:?})", self.binary, self.pid);
                    stop = StopReason::Cancelled;
                    self.terminate(libc::SIGTERM);
                    grace.as_mut().reset(deadline_after(limits.kill_grace));
                }

                _ = &mut grace, if stop == StopReason::Cancelled && !escalated => {
                    warn!(
                        "{} (pid {:?}) ignored SIGTERM for {:?}, killing",
                        self.binary, self.pid, limits.kill_grace
                    );
                    escalated = true;
                    self.terminate(libc::SIGKILL);
                }

                _ = &mut deadline, if stop != StopReason::TimedOut => {
                    warn!(
                        "{} (pid {:?}) exceeded {:?}, killing",
                        self.binary, self.pid, limits.timeout
                    );
                    stop = StopReason::TimedOut;
                    self.terminate(libc::SIGKILL);
                }
            }
        };

        let drain_deadline = deadline_after(limits.drain_timeout);
        let mut group_killed = false;
        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout_at(drain_deadline, reader).await.is_err() {
                warn!(
                    "{} output still open {:?} after exit, killing leftover processes",
                    self.binary, limits.drain_timeout
                );
                // A helper left in the group still holds the pipe.
                if !group_killed {
                    group_killed = true;
                    self.terminate(libc::SIGKILL);
                }
                abort.abort();
            }
        }

        match status {
            Ok(status) => {
                let code = exit_code(status);
                info!(
                    "{} (pid {:?}) exited with code {:?} ({:?})",
                    self.binary, self.pid, code, stop
                );
                ProcessExit {
                    exit_code: code,
                    stop,
                    wait_error: None,
                }
            }
            Err(e) => {
                warn!("Error waiting for {} (pid {:?}): {}", self.binary, self.pid, e);
                ProcessExit {
                    exit_code: None,
                    stop,
                    wait_error: Some(e),
                }
            }
        }
    }

    fn terminate(&mut self, signal: libc::c_int) {
        let Some(pid) = self.pid else {
            return;
        };
        if let Err(e) = signal_group(pid, signal) {
            debug!("Failed to signal process group {}: {}", pid, e);
            if signal == libc::SIGKILL {
                let _ = self.child.start_kill();
            }
        }
    }
}

fn spawn_stdout_reader(
    stdout: ChildStdout,
    binary: String,
    output: mpsc::Sender<ProcessOutput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut frames = FramedRead::new(stdout, RecordCodec::default());
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(record) => {
                    match &record {
                        Record::Event(value) => {
                            debug!("{} stdout: {}", binary, preview(&value.to_string(), LOG_PREVIEW_CHARS))
                        }
                        Record::Raw(line) => {
                            debug!("{} stdout (raw): {}", binary, preview(line, LOG_PREVIEW_CHARS))
                        }
                        Record::Malformed { error, .. } => {
                            warn!("{} wrote a line that is not UTF-8: {}", binary, error)
                        }
                    }
                    if output.send(ProcessOutput::Record(record)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Error reading {} stdout: {}", binary, e);
                    break;
                }
            }
        }
    })
}

fn spawn_stderr_reader(
    stderr: ChildStderr,
    binary: String,
    output: mpsc::Sender<ProcessOutput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = FramedRead::new(stderr, TextLineCodec::default());
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    debug!("{} stderr: {}", binary, preview(&line, LOG_PREVIEW_CHARS));
                    if output.send(ProcessOutput::Stderr(line)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Error reading {} stderr: {}", binary, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_args_fresh_turn() {
        let config = ToolSpawnConfig::new(&ToolConfig::default(), PathBuf::from("/tmp"));
        assert_eq!(strings(config.args()), STREAM_FLAGS.to_vec());
    }

    #[test]
    fn test_args_order_with_everything() {
        let tool = ToolConfig {
            base_args: vec!["wrapper.sh".to_string()],
            extra_args: vec!["--model".to_string(), "m".to_string()],
            ..ToolConfig::default()
        };
        let mut config = ToolSpawnConfig::new(&tool, PathBuf::from("/tmp"));
        config.continuation = Some("sess-1".to_string());
        config.extra_dirs = vec![PathBuf::from("/data/att/c1")];

        assert_eq!(
            strings(config.args()),
            vec![
                "wrapper.sh",
                "--print",
                "--output-format",
                "stream-json",
                "--include-partial-messages",
                "--verbose",
                "--add-dir",
                "/data/att/c1",
                "--resume",
                "sess-1",
                "--model",
                "m",
            ]
        );
    }

    #[test]
    fn test_args_continue_mode() {
        let tool = ToolConfig {
            resume_mode: ResumeMode::Continue,
            ..ToolConfig::default()
        };
        let mut config = ToolSpawnConfig::new(&tool, PathBuf::from("/tmp"));
        config.continuation = Some("ignored".to_string());
        let args = strings(config.args());
        assert_eq!(args.last().map(String::as_str), Some("--continue"));
        assert!(!args.iter().any(|a| a == "ignored"));
    }

    #[test]
    fn test_graceful_exit_code() {
        assert_eq!(GRACEFUL_EXIT_CODE, 143);
    }

    #[tokio::test]
    async fn test_exit_code_for_signal_death() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("kill -TERM $$")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(exit_code(status), Some(GRACEFUL_EXIT_CODE));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let tool = ToolConfig {
            binary: "/nonexistent/agent-relay-test-binary".to_string(),
            ..ToolConfig::default()
        };
        let config = ToolSpawnConfig::new(&tool, std::env::temp_dir());
        let err = LocalToolRuntime
            .spawn(&config, "hi".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Spawn { ref source, .. } if source.kind() == io::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_helper_holding_stdout_is_killed_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("helper-ran");
        let tool = ToolConfig {
            binary: "sh".to_string(),
            base_args: vec![
                "-c".to_string(),
                r#"(sleep 2; touch "$1") & echo '{}'; exit 0"#.to_string(),
                "tool".to_string(),
                marker.display().to_string(),
            ],
            drain_timeout_ms: 300,
            ..ToolConfig::default()
        };
        // base_args precede the stream flags, so `$1` is the marker path.
        let config = ToolSpawnConfig::new(&tool, std::env::temp_dir());
        let session = LocalToolRuntime
            .spawn(&config, "hi".to_string())
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let exit = session
            .run(CancellationToken::new(), TurnLimits::from(&tool), tx)
            .await;
        assert_eq!(exit.exit_code, Some(0));
        assert_eq!(exit.stop, StopReason::Exited);
        assert_eq!(
            rx.recv().await,
            Some(ProcessOutput::Record(Record::Event(serde_json::json!({}))))
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "helper outlived the turn");
    }

    #[tokio::test]
    async fn test_huge_limits_do_not_overflow() {
        let tool = ToolConfig {
            binary: "sh".to_string(),
            base_args: vec!["-c".to_string(), "sleep 30".to_string()],
            ..ToolConfig::default()
        };
        let limits = TurnLimits {
            timeout: Duration::MAX,
            kill_grace: Duration::MAX,
            drain_timeout: Duration::MAX,
        };
        let config = ToolSpawnConfig::new(&tool, std::env::temp_dir());
        let session = LocalToolRuntime
            .spawn(&config, "hi".to_string())
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let exit = session.run(cancel, limits, tx).await;
        assert_eq!(exit.stop, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn test_run_reads_stdin_and_streams_output() {
        let tool = ToolConfig {
            binary: "sh".to_string(),
            base_args: vec![
                "-c".to_string(),
                r#"read line; printf '{"echo":"%s"}\n' "$line"; echo oops >&2"#.to_string(),
                "tool".to_string(),
            ],
            ..ToolConfig::default()
        };
        let config = ToolSpawnConfig::new(&tool, std::env::temp_dir());
        let session = LocalToolRuntime
            .spawn(&config, "hello".to_string())
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let exit = session
            .run(CancellationToken::new(), TurnLimits::from(&tool), tx)
            .await;
        assert_eq!(exit.exit_code, Some(0));
        assert_eq!(exit.stop, StopReason::Exited);

        let mut outputs = Vec::new();
        while let Some(output) = rx.recv().await {
            outputs.push(output);
        }
        assert!(outputs.contains(&ProcessOutput::Record(Record::Event(
            serde_json::json!({"echo": "hello"})
        ))));
        assert!(outputs.contains(&ProcessOutput::Stderr("oops".to_string())));
    }
}

//! Per-connection turn supervision.
//!
//! A [`SessionSupervisor`] owns the single "active turn" slot of one
//! connection. `start` fills it, `cancel` only signals the running process,
//! and the turn's driver task is the only code that empties it again, so a
//! start, a cancel and a natural exit racing each other cannot both clean up.
//! Everything the turn produces reaches the relay as [`TurnEvent`]s over one
//! channel, in the order the process wrote it, ending with exactly one
//! [`TurnEventKind::Finished`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ToolConfig;
use crate::error::TurnError;
use crate::frame::Record;
use crate::process::{
    GRACEFUL_EXIT_CODE, ProcessExit, ProcessOutput, ProcessSession, StopReason, ToolRuntime,
    ToolSpawnConfig, TurnLimits,
};

const PROCESS_OUTPUT_CAPACITY: usize = 64;

/// Input for one chat turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub correlation_id: String,
    pub input: String,
    pub continuation: Option<String>,
    pub extra_dirs: Vec<PathBuf>,
    pub work_dir: PathBuf,
}

/// Description of a running turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnHandle {
    pub correlation_id: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TurnEvent {
    pub correlation_id: String,
    pub kind: TurnEventKind,
}

#[derive(Debug)]
pub enum TurnEventKind {
    Record(Record),
    Stderr(String),
    /// Last event of every turn.
    Finished(TurnOutcome),
}

impl From<ProcessOutput> for TurnEventKind {
    fn from(output: ProcessOutput) -> Self {
        match output {
            ProcessOutput::Record(record) => TurnEventKind::Record(record),
            ProcessOutput::Stderr(line) => TurnEventKind::Stderr(line),
        }
    }
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub exit_code: Option<i32>,
    pub resolution: TurnResolution,
}

#[derive(Debug)]
pub enum TurnResolution {
    Success,
    /// Stopped by the user. Not a failure.
    Interrupted,
    Failed(TurnError),
}

impl TurnOutcome {
    /// Classify a finished process.
    ///
    /// Exit code 0 and [`GRACEFUL_EXIT_CODE`] both count as success. A
    /// user cancel is never a failure, whatever the code; a timeout always
    /// is.
    pub fn from_exit(exit: ProcessExit, binary: &str, timeout: Duration) -> Self {
        let resolution = match exit.stop {
            StopReason::TimedOut => TurnResolution::Failed(TurnError::Timeout {
                binary: binary.to_string(),
                after: timeout,
            }),
            StopReason::Cancelled => TurnResolution::Interrupted,
            StopReason::Exited => match (exit.exit_code, exit.wait_error) {
                (_, Some(e)) => TurnResolution::Failed(TurnError::Io(e)),
                (Some(0 | GRACEFUL_EXIT_CODE), None) => TurnResolution::Success,
                (Some(code), None) => TurnResolution::Failed(TurnError::ProcessExit { code }),
                (None, None) => TurnResolution::Failed(TurnError::Io(std::io::Error::other(
                    "process exited without a status",
                ))),
            },
        };

        Self {
            exit_code: exit.exit_code,
            resolution,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.resolution, TurnResolution::Failed(_))
    }

    pub fn error(&self) -> Option<&TurnError> {
        match &self.resolution {
            TurnResolution::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The active turn was signalled.
    Cancelled { correlation_id: String },
    /// Nothing was running.
    Idle,
}

struct ActiveTurn {
    handle: TurnHandle,
    cancel: CancellationToken,
}

struct SupervisorInner {
    connection_id: String,
    runtime: Arc<dyn ToolRuntime>,
    tool: ToolConfig,
    limits: TurnLimits,
    slot: Mutex<Option<ActiveTurn>>,
    /// Mirrors whether `slot` is occupied, for synchronous readers.
    active: watch::Sender<bool>,
    /// Cancelled when the connection goes away; parent of every turn token.
    closed: CancellationToken,
    events: mpsc::Sender<TurnEvent>,
}

impl SupervisorInner {
    async fn emit(&self, correlation_id: &str, kind: TurnEventKind) {
        let event = TurnEvent {
            correlation_id: correlation_id.to_string(),
            kind,
        };
        // A closed channel means the connection is gone.
        if self.events.send(event).await.is_err() {
            debug!(
                "Connection {} gone, dropping event for {}",
                self.connection_id, correlation_id
            );
        }
    }
}

/// Runs at most one tool process at a time for one connection.
#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSupervisor")
            .field("connection_id", &self.inner.connection_id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl SessionSupervisor {
    pub fn new(
        connection_id: impl Into<String>,
        runtime: Arc<dyn ToolRuntime>,
        tool: ToolConfig,
        events: mpsc::Sender<TurnEvent>,
    ) -> Self {
        let limits = TurnLimits::from(&tool);
        let (active, _) = watch::channel(false);
        Self {
            inner: Arc::new(SupervisorInner {
                connection_id: connection_id.into(),
                runtime,
                tool,
                limits,
                slot: Mutex::new(None),
                active,
                closed: CancellationToken::new(),
                events,
            }),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    /// Spawn the tool for a new turn.
    ///
    /// Returns as soon as the process is running. Fails with
    /// [`TurnError::SessionBusy`] if a turn is already active and with
    /// [`TurnError::Spawn`] if the tool cannot be started.
    pub async fn start(&self, request: TurnRequest) -> Result<TurnHandle, TurnError> {
        let mut slot = self.inner.slot.lock().await;
        if let Some(active) = slot.as_ref() {
            return Err(TurnError::SessionBusy {
                active: active.handle.correlation_id.clone(),
            });
        }
        if self.inner.closed.is_cancelled() {
            return Err(TurnError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection closed",
            )));
        }

        let mut spawn = ToolSpawnConfig::new(&self.inner.tool, request.work_dir);
        spawn.continuation = request.continuation;
        spawn.extra_dirs = request.extra_dirs;

        let session = self.inner.runtime.spawn(&spawn, request.input).await?;

        let handle = TurnHandle {
            correlation_id: request.correlation_id,
            pid: session.pid(),
            started_at: Utc::now(),
        };
        let cancel = self.inner.closed.child_token();

        *slot = Some(ActiveTurn {
            handle: handle.clone(),
            cancel: cancel.clone(),
        });
        self.inner.active.send_replace(true);
        drop(slot);

        info!(
            "Connection {}: turn {} started (pid {:?})",
            self.inner.connection_id, handle.correlation_id, handle.pid
        );
        tokio::spawn(drive_turn(
            self.inner.clone(),
            handle.correlation_id.clone(),
            session,
            cancel,
        ));

        Ok(handle)
    }

    /// Signal the active turn to stop. Safe to call repeatedly.
    pub async fn cancel(&self) -> CancelOutcome {
        let slot = self.inner.slot.lock().await;
        match slot.as_ref() {
            Some(active) => {
                active.cancel.cancel();
                CancelOutcome::Cancelled {
                    correlation_id: active.handle.correlation_id.clone(),
                }
            }
            None => CancelOutcome::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        *self.inner.active.borrow()
    }

    pub async fn active_turn(&self) -> Option<TurnHandle> {
        self.inner
            .slot
            .lock()
            .await
            .as_ref()
            .map(|active| active.handle.clone())
    }

    /// Cancel any active turn and refuse new ones.
    pub fn shutdown(&self) {
        self.inner.closed.cancel();
    }

    /// Wait until no turn is active.
    pub async fn wait_idle(&self) {
        let mut active = self.inner.active.subscribe();
        let _ = active.wait_for(|active| !active).await;
    }
}

async fn drive_turn(
    inner: Arc<SupervisorInner>,
    correlation_id: String,
    session: ProcessSession,
    cancel: CancellationToken,
) {
    let binary = session.binary().to_string();
    let (output_tx, mut output_rx) = mpsc::channel(PROCESS_OUTPUT_CAPACITY);

    let run = session.run(cancel, inner.limits, output_tx);
    tokio::pin!(run);

    let exit = loop {
        tokio::select! {
            Some(output) = output_rx.recv() => {
                inner.emit(&correlation_id, output.into()).await;
            }
            exit = &mut run => break exit,
        }
    };
    while let Some(output) = output_rx.recv().await {
        inner.emit(&correlation_id, output.into()).await;
    }

    let outcome = TurnOutcome::from_exit(exit, &binary, inner.limits.timeout);
    match outcome.error() {
        Some(e) => warn!(
            "Connection {}: turn {} failed: {}",
            inner.connection_id, correlation_id, e
        ),
        None => info!(
            "Connection {}: turn {} finished ({:?})",
            inner.connection_id, correlation_id, outcome.resolution
        ),
    }

    // Free the slot before announcing completion so the next turn is accepted.
    {
        let mut slot = inner.slot.lock().await;
        if slot
            .as_ref()
            .is_some_and(|active| active.handle.correlation_id == correlation_id)
        {
            *slot = None;
            inner.active.send_replace(false);
        }
    }

    inner
        .emit(&correlation_id, TurnEventKind::Finished(outcome))
        .await;
}

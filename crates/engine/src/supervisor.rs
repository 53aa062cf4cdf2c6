//! Process supervisor: owns one encoder process at a time.
//!
//! `Idle → Starting → Running → {Completed | Failed | Cancelled}`. Parallel
//! conversions use one supervisor each; a supervisor refuses to start while
//! its process is alive.

use crate::encode::EncoderCommand;
use crate::progress::{LineSplitter, ProgressParser, ProgressUpdate};
use crate::replace::{discard_staging, prepare_destination, ReplaceError};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Number of diagnostic lines logged when an encode fails.
const FAILURE_TAIL_LINES: usize = 20;

/// Error type for supervision
#[derive(Debug, Error)]
pub enum SuperviseError {
    /// A process is already starting or running on this supervisor.
    #[error("supervisor already has a running process")]
    Busy,

    /// The destination could not be prepared.
    #[error("failed to prepare destination: {0}")]
    Prepare(#[from] ReplaceError),

    /// The encoder could not be launched.
    #[error("failed to launch encoder {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the encoder failed.
    #[error("I/O error while supervising encoder: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SupervisorState {
    pub fn is_active(self) -> bool {
        matches!(self, SupervisorState::Starting | SupervisorState::Running)
    }
}

/// Terminal result of one supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed { exit_code: Option<i32> },
    Cancelled,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

#[derive(Debug)]
struct Inner {
    state: SupervisorState,
    cancel: Option<CancellationToken>,
    diagnostics: Vec<String>,
}

/// Runs the encoder for one job at a time and reports progress.
#[derive(Debug)]
pub struct ProcessSupervisor {
    encoder: PathBuf,
    inner: Mutex<Inner>,
}

impl ProcessSupervisor {
    pub fn new(encoder: impl Into<PathBuf>) -> Self {
        Self {
            encoder: encoder.into(),
            inner: Mutex::new(Inner {
                state: SupervisorState::Idle,
                cancel: None,
                diagnostics: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: SupervisorState) {
        self.lock().state = state;
    }

    pub fn state(&self) -> SupervisorState {
        self.lock().state
    }

    /// Full diagnostic output of the most recent run.
    pub fn diagnostics(&self) -> String {
        self.lock().diagnostics.join("\n")
    }

    /// Last `n` diagnostic lines of the most recent run.
    pub fn diagnostics_tail(&self, n: usize) -> Vec<String> {
        let inner = self.lock();
        let skip = inner.diagnostics.len().saturating_sub(n);
        inner.diagnostics[skip..].to_vec()
    }

    /// Terminate the running process, if any. Safe to call repeatedly.
    pub fn cancel(&self) {
        let token = self.lock().cancel.take();
        if let Some(token) = token {
            info!("cancelling encoder process");
            token.cancel();
        }
    }

    /// Run one encode to completion.
    ///
    /// Progress updates go to `progress` as they are parsed; a dropped
    /// receiver is ignored. The staging file is removed unless the run
    /// completes.
    pub async fn run(
        &self,
        command: &EncoderCommand,
        progress: Option<UnboundedSender<ProgressUpdate>>,
    ) -> Result<Outcome, SuperviseError> {
        self.run_with_cancel(command, progress, CancellationToken::new())
            .await
    }

    /// Like [`ProcessSupervisor::run`], also stopping when `token` fires.
    pub async fn run_with_cancel(
        &self,
        command: &EncoderCommand,
        progress: Option<UnboundedSender<ProgressUpdate>>,
        token: CancellationToken,
    ) -> Result<Outcome, SuperviseError> {
        {
            let mut inner = self.lock();
            if inner.state.is_active() {
                return Err(SuperviseError::Busy);
            }
            inner.state = SupervisorState::Starting;
            inner.cancel = Some(token.clone());
            inner.diagnostics.clear();
        }

        let result = self.execute(command, progress, &token).await;

        let state = match &result {
            Ok(Outcome::Completed) => SupervisorState::Completed,
            Ok(Outcome::Cancelled) => SupervisorState::Cancelled,
            Ok(Outcome::Failed { .. }) | Err(_) => SupervisorState::Failed,
        };
        {
            let mut inner = self.lock();
            inner.state = state;
            inner.cancel = None;
        }
        if !matches!(result, Ok(Outcome::Completed)) {
            discard_staging(&command.staging);
        }
        result
    }

    async fn execute(
        &self,
        command: &EncoderCommand,
        progress: Option<UnboundedSender<ProgressUpdate>>,
        token: &CancellationToken,
    ) -> Result<Outcome, SuperviseError> {
        prepare_destination(&command.output, &command.staging)?;
        if token.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        debug!(encoder = %self.encoder.display(), args = ?command.args, "launching encoder");
        let mut child = Command::new(&self.encoder)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SuperviseError::Spawn {
                program: self.encoder.clone(),
                source,
            })?;
        self.set_state(SupervisorState::Running);

        let started = Instant::now();
        let mut parser = ProgressParser::new(command.effective_duration);
        let mut splitter = LineSplitter::default();
        let mut handle_line = |line: String| {
            if let Some(update) = parser.feed(&line, started.elapsed()) {
                if let Some(tx) = &progress {
                    let _ = tx.send(update);
                }
            }
            self.lock().diagnostics.push(line);
        };

        if let Some(mut stderr) = child.stderr.take() {
            let mut buf = [0u8; 8192];
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        info!("encoder cancelled");
                        return Ok(Outcome::Cancelled);
                    }
                    read = stderr.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => splitter.push(&buf[..n]).into_iter().for_each(&mut handle_line),
                        Err(e) => {
                            warn!(error = %e, "failed reading encoder diagnostics");
                            break;
                        }
                    },
                }
            }
        }
        if let Some(line) = splitter.finish() {
            handle_line(line);
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = token.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                info!("encoder cancelled");
                return Ok(Outcome::Cancelled);
            }
        };

        if status.success() {
            info!(elapsed_secs = started.elapsed().as_secs(), "encoder completed");
            return Ok(Outcome::Completed);
        }

        let exit_code = status.code();
        let tail = self.diagnostics_tail(FAILURE_TAIL_LINES).join("\n");
        error!(?exit_code, diagnostics = %tail, "encoder failed");
        Ok(Outcome::Failed { exit_code })
    }
}

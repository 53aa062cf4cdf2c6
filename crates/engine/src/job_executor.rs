//! Job executor module for scrubline
//!
//! Runs conversion jobs concurrently, limited by a semaphore sized from the
//! concurrency plan. Every job gets its own [`ProcessSupervisor`] and is
//! addressable by id so it can be cancelled while queued or encoding.

use crate::concurrency::ConcurrencyPlan;
use crate::encode::{build_command, BuildError, ConversionJob};
use crate::probe::Prober;
use crate::progress::ProgressUpdate;
use crate::replace::{promote_output, ReplaceError};
use crate::runner::SharedRunner;
use crate::startup::ToolSet;
use crate::supervisor::{Outcome, ProcessSupervisor, SuperviseError};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Error type for job execution operations
#[derive(Debug, Error)]
pub enum JobError {
    /// The encoder command could not be built
    #[error("Could not build encoder command: {0}")]
    Build(#[from] BuildError),

    /// The encoder could not be supervised
    #[error("Encoder supervision failed: {0}")]
    Supervise(#[from] SuperviseError),

    /// The encoder exited with failure; diagnostics were logged
    #[error("Encoder failed with exit code {exit_code:?}")]
    EncoderFailed { exit_code: Option<i32> },

    /// The finished output could not be moved into place
    #[error("Could not finalize output: {0}")]
    Finalize(#[from] ReplaceError),

    /// The job was cancelled
    #[error("Job was cancelled")]
    Cancelled,

    /// The executor was shut down
    #[error("Executor is shut down")]
    Closed,
}

/// Job state representing the current stage in the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a free slot
    Queued,
    /// Collecting source facts
    Probing,
    /// Encoder running
    Encoding,
    /// Moving the output into place
    Finalizing,
    Completed,
    Failed(String),
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Queued => "queued",
            JobState::Probing => "probing",
            JobState::Encoding => "encoding",
            JobState::Finalizing => "finalizing",
            JobState::Completed => "completed",
            JobState::Failed(_) => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed(_) | JobState::Cancelled
        )
    }
}

/// Events published while jobs run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    State { id: Uuid, state: JobState },
    Progress { id: Uuid, update: ProgressUpdate },
}

/// Finished jobs kept queryable by default.
pub const DEFAULT_FINISHED_HISTORY: usize = 64;

struct JobEntry {
    state: JobState,
    cancel: CancellationToken,
    supervisor: Arc<ProcessSupervisor>,
}

/// Live jobs plus the most recently finished ones, oldest first.
#[derive(Default)]
struct JobTable {
    entries: HashMap<Uuid, JobEntry>,
    finished: VecDeque<Uuid>,
}

impl JobTable {
    /// Record a terminal state and forget finished jobs beyond `history`.
    fn finish(&mut self, id: Uuid, history: usize) {
        self.finished.push_back(id);
        while self.finished.len() > history {
            if let Some(old) = self.finished.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

/// Executes conversion jobs with concurrency limiting.
#[derive(Clone)]
pub struct ConversionExecutor {
    semaphore: Arc<Semaphore>,
    plan: ConcurrencyPlan,
    tools: ToolSet,
    prober: Prober,
    jobs: Arc<Mutex<JobTable>>,
    history: usize,
    events: Option<UnboundedSender<JobEvent>>,
}

impl ConversionExecutor {
    pub fn new(plan: ConcurrencyPlan, tools: ToolSet, runner: SharedRunner) -> Self {
        let permits = plan.max_concurrent_jobs.max(1) as usize;
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            prober: Prober::new(&tools, runner),
            plan,
            tools,
            jobs: Arc::new(Mutex::new(JobTable::default())),
            history: DEFAULT_FINISHED_HISTORY,
            events: None,
        }
    }

    /// Publish state and progress events to `tx`.
    pub fn with_events(mut self, tx: UnboundedSender<JobEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Keep at most `n` finished jobs for [`state`](Self::state) and
    /// [`diagnostics`](Self::diagnostics) lookups.
    pub fn with_finished_history(mut self, n: usize) -> Self {
        self.history = n;
        self
    }

    pub fn plan(&self) -> ConcurrencyPlan {
        self.plan
    }

    /// Number of free job slots.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobTable> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: JobEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn set_state(&self, id: Uuid, state: JobState) {
        {
            let mut jobs = self.lock();
            if let Some(entry) = jobs.entries.get_mut(&id) {
                entry.state = state.clone();
                if state.is_terminal() {
                    jobs.finish(id, self.history);
                }
            }
        }
        self.emit(JobEvent::State { id, state });
    }

    /// Number of jobs currently tracked, live or recently finished.
    pub fn tracked_jobs(&self) -> usize {
        self.lock().entries.len()
    }

    /// Current state of a job, if it is known.
    pub fn state(&self, id: Uuid) -> Option<JobState> {
        self.lock().entries.get(&id).map(|e| e.state.clone())
    }

    /// Diagnostic output of a job's encoder run.
    pub fn diagnostics(&self, id: Uuid) -> Option<String> {
        self.lock().entries.get(&id).map(|e| e.supervisor.diagnostics())
    }

    /// Cancel a queued or running job. Returns false for unknown or finished jobs.
    pub fn cancel(&self, id: Uuid) -> bool {
        let jobs = self.lock();
        match jobs.entries.get(&id) {
            Some(entry) if !entry.state.is_terminal() => {
                entry.cancel.cancel();
                entry.supervisor.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every job that has not finished.
    pub fn cancel_all(&self) {
        for entry in self.lock().entries.values() {
            if !entry.state.is_terminal() {
                entry.cancel.cancel();
                entry.supervisor.cancel();
            }
        }
    }

    /// Register a job and return its id without starting it.
    fn register(&self) -> (Uuid, CancellationToken, Arc<ProcessSupervisor>) {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let supervisor = Arc::new(ProcessSupervisor::new(&self.tools.ffmpeg));
        self.lock().entries.insert(
            id,
            JobEntry {
                state: JobState::Queued,
                cancel: cancel.clone(),
                supervisor: supervisor.clone(),
            },
        );
        self.emit(JobEvent::State {
            id,
            state: JobState::Queued,
        });
        (id, cancel, supervisor)
    }

    /// Queue a job on the runtime; the handle resolves to the output path.
    pub fn submit(&self, job: ConversionJob) -> (Uuid, JoinHandle<Result<PathBuf, JobError>>) {
        let (id, cancel, supervisor) = self.register();
        let executor = self.clone();
        let handle = tokio::spawn(async move { executor.execute(id, job, cancel, supervisor).await });
        (id, handle)
    }

    /// Run a job on the current task.
    pub async fn run(&self, job: ConversionJob) -> (Uuid, Result<PathBuf, JobError>) {
        let (id, cancel, supervisor) = self.register();
        let result = self.execute(id, job, cancel, supervisor).await;
        (id, result)
    }

    async fn execute(
        &self,
        id: Uuid,
        job: ConversionJob,
        cancel: CancellationToken,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Result<PathBuf, JobError> {
        let result = self.pipeline(id, job, &cancel, &supervisor).await;
        let state = match &result {
            Ok(_) => JobState::Completed,
            Err(JobError::Cancelled) => JobState::Cancelled,
            Err(e) => JobState::Failed(e.to_string()),
        };
        match &result {
            Ok(path) => info!(job_id = %id, output = %path.display(), "conversion completed"),
            Err(JobError::Cancelled) => info!(job_id = %id, "conversion cancelled"),
            Err(e) => warn!(job_id = %id, error = %e, "conversion failed"),
        }
        self.set_state(id, state);
        result
    }

    async fn pipeline(
        &self,
        id: Uuid,
        mut job: ConversionJob,
        cancel: &CancellationToken,
        supervisor: &ProcessSupervisor,
    ) -> Result<PathBuf, JobError> {
        let _permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit.map_err(|_| JobError::Closed)?,
            _ = cancel.cancelled() => return Err(JobError::Cancelled),
        };

        self.set_state(id, JobState::Probing);
        let facts = tokio::select! {
            facts = self.prober.facts(&job.source) => facts,
            _ = cancel.cancelled() => return Err(JobError::Cancelled),
        };
        if job.preset.expects_video && job.visualization.is_none() && facts.video.is_none() {
            warn!(job_id = %id, source = %job.source.display(), preset = job.preset.id, "source has no video stream");
        }
        if job.expected_duration.is_none() {
            let start = job.trim().start.unwrap_or(0.0);
            job.expected_duration = facts.duration.map(|d| (d - start).max(0.0));
        }

        let command = build_command(&job, &facts, chrono::Local::now().date_naive())?;
        info!(job_id = %id, source = %job.source.display(), preset = job.preset.id, "encoding");
        self.set_state(id, JobState::Encoding);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let forward = async {
            while let Some(update) = rx.recv().await {
                self.emit(JobEvent::Progress { id, update });
            }
        };
        let (outcome, ()) = tokio::join!(
            supervisor.run_with_cancel(&command, Some(tx), cancel.child_token()),
            forward
        );

        match outcome? {
            Outcome::Completed => {}
            Outcome::Cancelled => return Err(JobError::Cancelled),
            Outcome::Failed { exit_code } => return Err(JobError::EncoderFailed { exit_code }),
        }

        self.set_state(id, JobState::Finalizing);
        let (staging, output) = (command.staging.clone(), command.output.clone());
        tokio::task::spawn_blocking(move || promote_output(&staging, &output))
            .await
            .map_err(|e| ReplaceError::MoveFailed(std::io::Error::other(e)))??;
        Ok(command.output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::preset::Preset;
    use crate::runner::fake::{media_responder, FakeRunner};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    /// A stand-in encoder that reports progress and writes its last argument.
    fn fake_encoder(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-ffmpeg");
        let script = format!(
            "#!/bin/sh\nfor last; do :; done\nprintf 'time=00:00:01.00\\r' 1>&2\n{}\n",
            body
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn executor(dir: &Path, body: &str, jobs: u32) -> ConversionExecutor {
        let mut cfg = Config::default();
        cfg.conversion.max_concurrent_jobs = jobs;
        let plan = ConcurrencyPlan::derive_with_cores(&cfg, 8);
        let tools = ToolSet::from_paths(fake_encoder(dir, body), "ffprobe");
        ConversionExecutor::new(plan, tools, FakeRunner::new(media_responder(2.0, vec![2])))
    }

    fn job(dir: &Path) -> ConversionJob {
        let source = dir.join("clip.mov");
        std::fs::write(&source, b"source").unwrap();
        ConversionJob::new(source, Preset::find("h264_mp4").unwrap(), None)
    }

    #[tokio::test]
    async fn test_successful_job_promotes_output() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let exec = executor(dir.path(), "echo encoded > \"$last\"", 1).with_events(tx);

        let (id, result) = exec.run(job(dir.path())).await;
        let output = result.unwrap();
        assert_eq!(output, dir.path().join("clip_h264.mp4"));
        assert_eq!(std::fs::read_to_string(&output).unwrap().trim(), "encoded");
        assert!(!dir.path().join("clip_h264.partial.mp4").exists());
        assert_eq!(exec.state(id), Some(JobState::Completed));

        let mut states = Vec::new();
        let mut progress = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                JobEvent::State { state, .. } => states.push(state),
                JobEvent::Progress { update, .. } => progress.push(update.fraction),
            }
        }
        assert_eq!(
            states,
            vec![
                JobState::Queued,
                JobState::Probing,
                JobState::Encoding,
                JobState::Finalizing,
                JobState::Completed
            ]
        );
        // 1s of a probed 2s source.
        assert_eq!(progress, vec![0.5]);
    }

    #[tokio::test]
    async fn test_failed_encoder_reports_failure() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), "echo 'Conversion failed!' 1>&2; exit 1", 1);

        let (id, result) = exec.run(job(dir.path())).await;
        assert!(matches!(result, Err(JobError::EncoderFailed { exit_code: Some(1) })));
        assert!(matches!(exec.state(id), Some(JobState::Failed(_))));
        assert!(exec.diagnostics(id).unwrap().contains("Conversion failed!"));
        assert!(!dir.path().join("clip_h264.mp4").exists());
        assert!(!exec.cancel(id), "finished jobs cannot be cancelled");
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), "sleep 10", 1);

        let (id, handle) = exec.submit(job(dir.path()));
        while exec.state(id) != Some(JobState::Encoding) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(exec.cancel(id));

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(JobError::Cancelled)));
        assert_eq!(exec.state(id), Some(JobState::Cancelled));
    }

    #[tokio::test]
    async fn test_queued_job_waits_for_slot_and_can_be_cancelled() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), "sleep 10", 1);

        let (first, first_handle) = exec.submit(job(dir.path()));
        while exec.state(first) != Some(JobState::Encoding) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(exec.available_slots(), 0);

        let (second, second_handle) = exec.submit(job(dir.path()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(exec.state(second), Some(JobState::Queued));

        assert!(exec.cancel(second));
        assert!(matches!(second_handle.await.unwrap(), Err(JobError::Cancelled)));

        exec.cancel_all();
        assert!(matches!(first_handle.await.unwrap(), Err(JobError::Cancelled)));
        assert_eq!(exec.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_finished_jobs_are_forgotten_beyond_history() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), "echo encoded > \"$last\"", 1).with_finished_history(2);

        let mut ids = Vec::new();
        for _ in 0..5 {
            let (id, result) = exec.run(job(dir.path())).await;
            result.unwrap();
            ids.push(id);
        }

        assert_eq!(exec.tracked_jobs(), 2);
        assert_eq!(exec.state(ids[0]), None);
        assert_eq!(exec.diagnostics(ids[2]), None);
        assert_eq!(exec.state(ids[3]), Some(JobState::Completed));
        assert_eq!(exec.state(ids[4]), Some(JobState::Completed));
    }

    #[tokio::test]
    async fn test_running_jobs_are_never_forgotten() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), "sleep 10", 2).with_finished_history(0);

        let (running, handle) = exec.submit(job(dir.path()));
        while exec.state(running) != Some(JobState::Encoding) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let (other, other_handle) = exec.submit(job(dir.path()));
        assert!(exec.cancel(other));
        assert!(matches!(other_handle.await.unwrap(), Err(JobError::Cancelled)));

        assert_eq!(exec.tracked_jobs(), 1);
        assert_eq!(exec.state(running), Some(JobState::Encoding));
        assert!(exec.cancel(running));
        assert!(matches!(handle.await.unwrap(), Err(JobError::Cancelled)));
        assert_eq!(exec.tracked_jobs(), 0);
    }

    #[test]
    fn test_cancel_unknown_job() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), "true", 1);
        assert!(!exec.cancel(Uuid::new_v4()));
        assert_eq!(exec.state(Uuid::new_v4()), None);
    }
}

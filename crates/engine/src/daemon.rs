//! Daemon startup and main loop for scrubline
//!
//! Runs the startup checks and cache cleanup, then converts every file that
//! settles in the watch folder with the configured preset.

use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::encode::ConversionJob;
use crate::job_executor::{ConversionExecutor, JobError};
use crate::preset::Preset;
use crate::preview::PreviewCache;
use crate::runner::{SharedRunner, SystemRunner};
use crate::startup::{run_startup_checks, StartupError, ToolSet};
use crate::watch::{FolderWatcher, WatchError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Subdirectory of the watch folder that receives outputs by default.
pub const DEFAULT_OUTPUT_SUBDIR: &str = "converted";

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// The watch preset is not in the catalog
    #[error("Unknown watch preset '{0}'")]
    UnknownPreset(String),

    /// The watch folder cannot be used
    #[error("Watch folder error: {0}")]
    Watch(#[from] WatchError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Located external tools
    pub tools: ToolSet,
    /// Derived concurrency plan
    pub plan: ConcurrencyPlan,
    /// Executor for conversions
    pub executor: ConversionExecutor,
    /// Preview asset cache
    pub cache: PreviewCache,
    preset: &'static Preset,
}

impl Daemon {
    /// Initialize the daemon
    ///
    /// Locates the tools, applies the startup cache cleanup policy and builds
    /// the executor.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        let tools = run_startup_checks(&config)?;
        Self::with_tools(config, tools, SystemRunner::shared())
    }

    /// Initialize with tools that were already located.
    pub fn with_tools(
        config: Config,
        tools: ToolSet,
        runner: SharedRunner,
    ) -> Result<Self, DaemonError> {
        let preset = Preset::find(&config.watch.preset)
            .ok_or_else(|| DaemonError::UnknownPreset(config.watch.preset.clone()))?;

        let cache = PreviewCache::new(&config.preview, &tools, runner.clone());
        match cache.cleanup_on_start(config.preview.cleanup) {
            Ok(report) if report.removed > 0 => {
                info!(removed = report.removed, freed_bytes = report.freed_bytes, "startup cache cleanup")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "startup cache cleanup failed"),
        }

        let plan = ConcurrencyPlan::derive(&config);
        info!(
            max_concurrent_jobs = plan.max_concurrent_jobs,
            total_cores = plan.total_cores,
            "concurrency plan"
        );
        let executor = ConversionExecutor::new(plan, tools.clone(), runner);

        Ok(Self {
            config,
            tools,
            plan,
            executor,
            cache,
            preset,
        })
    }

    pub fn preset(&self) -> &'static Preset {
        self.preset
    }

    /// Where outputs of watched files go.
    pub fn output_dir(&self, watch_dir: &Path) -> PathBuf {
        self.config
            .conversion
            .output_dir
            .clone()
            .unwrap_or_else(|| watch_dir.join(DEFAULT_OUTPUT_SUBDIR))
    }

    /// Poll the watch folder and convert stable files until `shutdown` fires.
    ///
    /// Running jobs are cancelled on shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let watcher = FolderWatcher::from_config(&self.config.watch)?;
        self.run_watcher(watcher, shutdown).await
    }

    /// [`Daemon::run`] with an explicit watcher.
    pub async fn run_watcher(
        &self,
        watcher: FolderWatcher,
        shutdown: CancellationToken,
    ) -> Result<(), DaemonError> {
        let output_dir = self.output_dir(watcher.dir());
        info!(
            dir = %watcher.dir().display(),
            output_dir = %output_dir.display(),
            preset = self.preset.id,
            "daemon started"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watch_task = tokio::spawn(watcher.run(tx, shutdown.clone()));
        let mut jobs = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = rx.recv() => {
                    let Some(batch) = batch else { break };
                    for source in batch {
                        let job = ConversionJob::new(source.clone(), self.preset, Some(&output_dir));
                        let (id, handle) = self.executor.submit(job);
                        info!(%id, source = %source.display(), "queued watched file");
                        jobs.spawn(async move { (source, handle.await) });
                    }
                }
                Some(done) = jobs.join_next(), if !jobs.is_empty() => {
                    log_finished(done);
                }
            }
        }

        info!("daemon shutting down");
        self.executor.cancel_all();
        while let Some(done) = jobs.join_next().await {
            log_finished(done);
        }
        match watch_task.await {
            Ok(result) => result?,
            Err(e) => warn!(error = %e, "watch task ended abnormally"),
        }
        Ok(())
    }
}

type Finished = (PathBuf, Result<Result<PathBuf, JobError>, JoinError>);

fn log_finished(done: Result<Finished, JoinError>) {
    match done {
        Ok((source, Ok(Ok(output)))) => {
            info!(source = %source.display(), output = %output.display(), "conversion finished")
        }
        Ok((source, Ok(Err(e)))) => {
            error!(source = %source.display(), error = %e, "conversion failed")
        }
        Ok((source, Err(e))) => {
            error!(source = %source.display(), error = %e, "conversion task aborted")
        }
        Err(e) => error!(error = %e, "conversion task aborted"),
    }
}

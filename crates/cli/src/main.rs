//! CLI entry point for scrubline
//!
//! Loads the configuration, installs logging and dispatches subcommands to
//! the engine.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{CacheAction, Cli, Commands};
use scrubline::config::Config;
use scrubline::preview::cache::ASSETS_DIR;
use scrubline::preview::{cleanup, SessionSettings};
use scrubline::{
    run_startup_checks, ChunkedSession, Composition, ConcurrencyPlan, ConversionExecutor,
    ConversionJob, Daemon, JobError, JobEvent, PlaybackSurface, Preset, PreviewCache, Prober,
    SystemRunner, VisualizationRequest,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

fn init_logging(verbose: bool) {
    // RUST_LOG wins over the verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if verbose {
            "scrubline=debug,scrubline_config=debug".to_string()
        } else {
            "scrubline=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted; cancelling");
            token.cancel();
        }
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    debug!(config = %cli.config.display(), "configuration loaded");

    match cli.command {
        Commands::Presets => {
            list_presets();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Convert {
            source,
            preset,
            dest,
            comment,
            date_tag,
            keep_metadata,
            start,
            end,
            visualize,
            size,
            fps,
            normalize,
        } => {
            let preset = Preset::find(&preset)
                .with_context(|| format!("unknown preset '{}'; see `scrubline presets`", preset))?;
            let output_dir = dest.or_else(|| config.conversion.output_dir.clone());
            let mut job = ConversionJob::new(&source, preset, output_dir.as_deref());
            job.comment = comment;
            job.date_tag = date_tag;
            job.preserve_metadata = keep_metadata;
            job.trim_start = start;
            job.trim_end = end;
            job.visualization =
                visualize.map(|style| VisualizationRequest::new(style, size, fps).normalized(normalize));
            convert(&config, job).await
        }
        Commands::Assets { source } => {
            assets(&config, &source).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Scrub { source, positions } => {
            scrub(&config, &source, &positions).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cache { action } => {
            cache(&config, action)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Watch { dir } => {
            watch(config, dir).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn list_presets() {
    for preset in Preset::all() {
        let tracks = match (preset.expects_video, preset.expects_audio) {
            (true, true) => "video+audio",
            (true, false) => "video",
            (false, true) => "audio",
            (false, false) => "-",
        };
        println!(
            "{:<20} {:<5} {:<12} {}",
            preset.id, preset.extension, tracks, preset.label
        );
    }
}

async fn convert(config: &Config, job: ConversionJob) -> Result<ExitCode> {
    let tools = run_startup_checks(config)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let executor = ConversionExecutor::new(ConcurrencyPlan::derive(config), tools, SystemRunner::shared())
        .with_events(tx);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                JobEvent::Progress { update, .. } => eprint!(
                    "\r{:>5.1}%  ETA {:<8}",
                    update.fraction * 100.0,
                    update.eta.as_deref().unwrap_or("--:--")
                ),
                JobEvent::State { state, .. } => debug!(state = state.as_str(), "job state"),
            }
        }
    });

    let (id, handle) = executor.submit(job);
    let interrupt = CancellationToken::new();
    let ctrl_c = cancel_on_ctrl_c(interrupt.clone());
    let canceller = executor.clone();
    let cancel_job = tokio::spawn(async move {
        interrupt.cancelled().await;
        canceller.cancel(id);
    });

    let result = handle.await.context("conversion task panicked")?;
    ctrl_c.abort();
    cancel_job.abort();
    printer.abort();
    eprintln!();

    match result {
        Ok(output) => {
            println!("{}", output.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(JobError::Cancelled) => {
            eprintln!("cancelled");
            Ok(ExitCode::from(130))
        }
        // the supervisor already logged the diagnostics tail
        Err(e) => Err(e.into()),
    }
}

async fn assets(config: &Config, source: &Path) -> Result<()> {
    let tools = run_startup_checks(config)?;
    let cache = PreviewCache::new(&config.preview, &tools, SystemRunner::shared());
    let cancel = CancellationToken::new();
    let ctrl_c = cancel_on_ctrl_c(cancel.clone());

    let assets = cache.assets(source, &cancel).await;
    ctrl_c.abort();
    println!("{}", serde_json::to_string_pretty(&assets?)?);
    Ok(())
}

/// Stands in for a player: keeps the last composition and logs each load.
#[derive(Default)]
struct LoggingSurface {
    state: Mutex<SurfaceState>,
}

#[derive(Default)]
struct SurfaceState {
    position: f64,
    playing: bool,
    composition: Option<Composition>,
}

impl LoggingSurface {
    fn lock(&self) -> std::sync::MutexGuard<'_, SurfaceState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl PlaybackSurface for LoggingSurface {
    fn position(&self) -> f64 {
        self.lock().position
    }

    fn is_playing(&self) -> bool {
        self.lock().playing
    }

    fn load(&self, composition: Composition) {
        info!(
            segments = composition.video.len(),
            audio = ?composition.audio,
            "composition loaded"
        );
        self.lock().composition = Some(composition);
    }

    fn seek(&self, seconds: f64) {
        self.lock().position = seconds;
    }

    fn play(&self) {
        self.lock().playing = true;
    }

    fn pause(&self) {
        self.lock().playing = false;
    }
}

async fn scrub(config: &Config, source: &Path, positions: &[f64]) -> Result<()> {
    let tools = run_startup_checks(config)?;
    let runner = SystemRunner::shared();
    let duration = Prober::new(&tools, runner.clone())
        .try_duration(source)
        .await
        .with_context(|| format!("cannot determine the duration of {}", source.display()))?;
    let cache = PreviewCache::new(&config.preview, &tools, runner.clone());
    let entry_dir = cache.entry_dir_for(source)?;

    let surface = Arc::new(LoggingSurface::default());
    let session = ChunkedSession::new(
        source,
        &entry_dir,
        duration,
        SessionSettings::from(&config.preview),
        &tools,
        runner,
        surface.clone(),
    );

    session.activate().await?;
    for &t in positions {
        surface.seek(t);
        session.ensure_chunk_at(t).await?;
    }
    session.wait_background().await;

    let composition = surface.lock().composition.clone();
    println!("{}", serde_json::to_string_pretty(&composition)?);
    session.close().await;
    Ok(())
}

fn cache(config: &Config, action: CacheAction) -> Result<()> {
    let root = config.preview.cache_root.join(ASSETS_DIR);
    match action {
        CacheAction::Size => println!("{}", cleanup::cache_size_bytes(&root)),
        CacheAction::Clean => {
            let report = cleanup::apply_cleanup(&root, config.preview.cleanup, SystemTime::now())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        CacheAction::Purge => {
            let report = cleanup::clear_all(&root)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

async fn watch(mut config: Config, dir: Option<PathBuf>) -> Result<()> {
    if let Some(dir) = dir {
        config.watch.dir = Some(dir);
    }
    let daemon = Daemon::new(config)?;
    let shutdown = CancellationToken::new();
    let ctrl_c = cancel_on_ctrl_c(shutdown.clone());
    daemon.run(shutdown).await?;
    ctrl_c.abort();
    Ok(())
}

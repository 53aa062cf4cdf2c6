//! Chunked preview session: playable preview for sources the player cannot
//! open directly.
//!
//! Video is transcoded in fixed-length chunks on demand. Once every chunk of
//! a section is resident the section is concatenated into one file in the
//! background, and after a delay the chunk files are deleted. Every change in
//! availability rebuilds the whole video track from what is on disk, so the
//! surface never references a deleted chunk.

use super::timeline::{build_timeline, ChunkLayout, Timeline, TimelineSegment};
use crate::config::PreviewConfig;
use crate::replace::{move_file, remove_if_exists, staging_path, ReplaceError};
use crate::runner::{SharedRunner, ToolError, ToolInvocation};
use crate::startup::ToolSet;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHUNK_TIMEOUT: Duration = Duration::from_secs(120);
const CONCAT_TIMEOUT: Duration = Duration::from_secs(120);
const AUDIO_TIMEOUT: Duration = Duration::from_secs(900);

pub const QUICK_AUDIO: &str = "preview_audio_quick.m4a";
pub const FULL_AUDIO: &str = "preview_audio_full.m4a";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("preview I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Files(#[from] ReplaceError),

    #[error("preview transcode failed: {0}")]
    Tool(ToolError),

    #[error("preview session cancelled")]
    Cancelled,
}

impl From<ToolError> for SessionError {
    fn from(e: ToolError) -> Self {
        if e.is_cancelled() {
            SessionError::Cancelled
        } else {
            SessionError::Tool(e)
        }
    }
}

/// What the player is asked to play.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Composition {
    pub duration: f64,
    pub video: Vec<TimelineSegment>,
    pub audio: Option<PathBuf>,
}

/// The embedded player a session drives.
pub trait PlaybackSurface: Send + Sync {
    /// Current position in seconds.
    fn position(&self) -> f64;
    fn is_playing(&self) -> bool;
    /// Replace whatever is loaded with `composition`.
    fn load(&self, composition: Composition);
    fn seek(&self, seconds: f64);
    fn play(&self);
    fn pause(&self);
}

/// Chunk sizing, from `[preview]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub chunk_secs: f64,
    pub section_chunks: u32,
    pub cleanup_delay: Duration,
    pub quick_audio_secs: f64,
}

impl From<&PreviewConfig> for SessionSettings {
    fn from(cfg: &PreviewConfig) -> Self {
        Self {
            chunk_secs: cfg.chunk_secs,
            section_chunks: cfg.section_chunks,
            cleanup_delay: Duration::from_secs(cfg.section_cleanup_delay_secs),
            quick_audio_secs: cfg.quick_audio_secs,
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    resident: BTreeSet<u32>,
    concatenated: BTreeSet<u32>,
    concatenating: BTreeSet<u32>,
    audio: Option<PathBuf>,
    prefetch: Option<(u32, CancellationToken)>,
}

struct SessionInner {
    source: PathBuf,
    entry_dir: PathBuf,
    layout: ChunkLayout,
    settings: SessionSettings,
    ffmpeg: PathBuf,
    runner: SharedRunner,
    surface: Arc<dyn PlaybackSurface>,
    state: Mutex<SessionState>,
    chunk_locks: Mutex<HashMap<u32, Arc<tokio::sync::Mutex<()>>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

/// One chunked preview of one source. Cloning shares the session.
#[derive(Clone)]
pub struct ChunkedSession {
    inner: Arc<SessionInner>,
}

impl ChunkedSession {
    /// `entry_dir` is the source's preview cache directory.
    pub fn new(
        source: &Path,
        entry_dir: &Path,
        duration: f64,
        settings: SessionSettings,
        tools: &ToolSet,
        runner: SharedRunner,
        surface: Arc<dyn PlaybackSurface>,
    ) -> Self {
        let layout = ChunkLayout::new(entry_dir, duration, settings.chunk_secs, settings.section_chunks);
        Self {
            inner: Arc::new(SessionInner {
                source: source.to_path_buf(),
                entry_dir: entry_dir.to_path_buf(),
                layout,
                settings,
                ffmpeg: tools.ffmpeg.clone(),
                runner,
                surface,
                state: Mutex::new(SessionState::default()),
                chunk_locks: Mutex::new(HashMap::new()),
                background: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.inner.layout
    }

    /// Quick audio, then chunk 0, then the full audio track in the background.
    pub async fn activate(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        tokio::fs::create_dir_all(inner.layout.chunks_dir()).await?;
        tokio::fs::create_dir_all(inner.layout.sections_dir()).await?;

        let quick_secs = inner.settings.quick_audio_secs;
        let whole = quick_secs <= 0.0 || inner.layout.duration() <= quick_secs;
        let limit = (!whole).then_some(quick_secs);
        let quick = inner.entry_dir.join(if whole { FULL_AUDIO } else { QUICK_AUDIO });
        match inner.extract_audio(limit, &quick, &inner.cancel).await {
            Ok(()) => inner.lock_state().audio = Some(quick),
            Err(SessionError::Cancelled) => return Err(SessionError::Cancelled),
            Err(e) => warn!(source = %inner.source.display(), error = %e, "preview audio unavailable"),
        }

        inner.load_chunk(0, &inner.cancel).await?;

        if !whole {
            let task = inner.clone();
            inner.spawn_background(async move { task.swap_in_full_audio().await });
        }
        inner.schedule_prefetch(1);
        info!(source = %inner.source.display(), chunks = inner.layout.chunk_count(), "chunked preview active");
        Ok(())
    }

    /// Make sure the chunk covering `t` is playable, then prefetch the next one.
    pub async fn ensure_chunk_at(&self, t: f64) -> Result<(), SessionError> {
        let inner = &self.inner;
        let index = inner.layout.chunk_index(t);
        inner.supersede_prefetch(index);
        inner.load_chunk(index, &inner.cancel).await?;
        inner.schedule_prefetch(index + 1);
        Ok(())
    }

    /// Load one chunk; Ok(false) when it was already covered.
    pub async fn load_chunk(&self, index: u32) -> Result<bool, SessionError> {
        self.inner.load_chunk(index, &self.inner.cancel).await
    }

    /// Rebuild the video track from disk.
    pub fn refresh(&self) -> Timeline {
        self.inner.rebuild()
    }

    pub fn resident_chunks(&self) -> BTreeSet<u32> {
        self.inner.lock_state().resident.clone()
    }

    pub fn concatenated_sections(&self) -> BTreeSet<u32> {
        self.inner.lock_state().concatenated.clone()
    }

    /// Wait for background work (prefetch, audio, concatenation) to settle.
    pub async fn wait_background(&self) {
        self.inner.wait_background().await
    }

    /// Cancel in-flight work and wait for it to stop.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.wait_background().await;
        debug!(source = %self.inner.source.display(), "chunked preview closed");
    }
}

impl SessionInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn spawn_background<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let mut tasks = self.background.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    async fn wait_background(&self) {
        loop {
            let handles = {
                let mut tasks = self.background.lock().unwrap_or_else(|p| p.into_inner());
                std::mem::take(&mut *tasks)
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "preview background task failed");
                }
            }
        }
    }

    fn chunk_lock(&self, index: u32) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.chunk_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(index).or_default().clone()
    }

    fn is_covered(&self, index: u32) -> bool {
        let state = self.lock_state();
        state.resident.contains(&index)
            || state.concatenated.contains(&self.layout.section_of(index))
    }

    async fn run_to(
        &self,
        invocation: ToolInvocation,
        staging: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let result = self.runner.run(&invocation, cancel).await;
        let staging = staging.to_path_buf();
        if let Err(e) = result {
            off_thread(move || remove_if_exists(&staging)).await?;
            return Err(e.into());
        }
        let output = output.to_path_buf();
        off_thread(move || move_file(&staging, &output)).await
    }

    async fn extract_audio(
        &self,
        limit: Option<f64>,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let staging = staging_path(output);
        let mut invocation = ToolInvocation::new(&self.ffmpeg)
            .args(["-hide_banner", "-nostdin", "-y", "-i"])
            .arg(self.source.to_string_lossy());
        if let Some(secs) = limit {
            invocation = invocation.arg("-t").arg(format!("{:.3}", secs));
        }
        let invocation = invocation
            .args(["-map", "0:a:0", "-vn", "-c:a", "aac", "-b:a", "160k"])
            .arg(staging.to_string_lossy())
            .timeout(AUDIO_TIMEOUT);
        self.run_to(invocation, &staging, output, cancel).await
    }

    async fn swap_in_full_audio(self: Arc<Self>) {
        let full = self.entry_dir.join(FULL_AUDIO);
        match self.extract_audio(None, &full, &self.cancel).await {
            Ok(()) => {
                self.lock_state().audio = Some(full);
                self.rebuild();
                debug!(source = %self.source.display(), "full preview audio in place");
            }
            Err(SessionError::Cancelled) => {}
            Err(e) => warn!(error = %e, "full preview audio failed; keeping quick extract"),
        }
    }

    fn chunk_invocation(&self, index: u32, staging: &Path) -> ToolInvocation {
        let (start, len) = self.layout.chunk_span(index);
        ToolInvocation::new(&self.ffmpeg)
            .args(["-hide_banner", "-nostdin", "-y", "-ss"])
            .arg(format!("{:.3}", start))
            .arg("-i")
            .arg(self.source.to_string_lossy())
            .arg("-t")
            .arg(format!("{:.3}", len))
            .args([
                "-map", "0:v:0", "-an", "-c:v", "libx264", "-preset", "ultrafast", "-tune",
                "zerolatency", "-crf", "26", "-pix_fmt", "yuv420p", "-vf",
                "scale=trunc(iw/2)*2:trunc(ih/2)*2", "-movflags", "+faststart",
            ])
            .arg(staging.to_string_lossy())
            .timeout(CHUNK_TIMEOUT)
    }

    async fn load_chunk(
        self: &Arc<Self>,
        index: u32,
        cancel: &CancellationToken,
    ) -> Result<bool, SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        if index >= self.layout.chunk_count() || self.is_covered(index) {
            return Ok(false);
        }

        let lock = self.chunk_lock(index);
        let _held = lock.lock().await;
        if self.is_covered(index) {
            return Ok(false);
        }

        let output = self.layout.chunk_path(index);
        let staging = staging_path(&output);
        let invocation = self.chunk_invocation(index, &staging);
        self.run_to(invocation, &staging, &output, cancel).await?;
        debug!(chunk = index, "preview chunk ready");

        self.lock_state().resident.insert(index);
        self.rebuild();
        self.maybe_concatenate(self.layout.section_of(index));
        Ok(true)
    }

    /// Cancel a prefetch unless it is for `index` or the chunk after it.
    fn supersede_prefetch(&self, index: u32) {
        let mut state = self.lock_state();
        if let Some((target, token)) = state.prefetch.take() {
            if target == index || target == index + 1 {
                state.prefetch = Some((target, token));
            } else {
                debug!(superseded = target, wanted = index, "cancelling preview prefetch");
                token.cancel();
            }
        }
    }

    fn schedule_prefetch(self: &Arc<Self>, index: u32) {
        if index >= self.layout.chunk_count() || self.is_covered(index) {
            return;
        }
        let token = {
            let mut state = self.lock_state();
            if let Some((target, previous)) = state.prefetch.take() {
                if target == index {
                    state.prefetch = Some((target, previous));
                    return;
                }
                previous.cancel();
            }
            let token = self.cancel.child_token();
            state.prefetch = Some((index, token.clone()));
            token
        };

        let task = self.clone();
        self.spawn_background(async move {
            match task.load_chunk(index, &token).await {
                Ok(_) => {}
                Err(SessionError::Cancelled) => debug!(chunk = index, "prefetch cancelled"),
                Err(e) => warn!(chunk = index, error = %e, "prefetch failed"),
            }
            let mut state = task.lock_state();
            if state.prefetch.as_ref().is_some_and(|(target, _)| *target == index) {
                state.prefetch = None;
            }
        });
    }

    /// Start concatenating `section` if all of its chunks are resident.
    fn maybe_concatenate(self: &Arc<Self>, section: u32) {
        {
            let mut state = self.lock_state();
            if state.concatenated.contains(&section) || state.concatenating.contains(&section) {
                return;
            }
            let complete = self
                .layout
                .chunks_in_section(section)
                .all(|c| state.resident.contains(&c));
            if !complete {
                return;
            }
            state.concatenating.insert(section);
        }

        let task = self.clone();
        self.spawn_background(async move {
            let result = task.concatenate(section).await;
            task.lock_state().concatenating.remove(&section);
            match result {
                Ok(()) => task.retire_chunks(section).await,
                Err(SessionError::Cancelled) => {}
                Err(e) => warn!(section, error = %e, "section concatenation failed; keeping chunks"),
            }
        });
    }

    async fn concatenate(&self, section: u32) -> Result<(), SessionError> {
        let output = self.layout.section_path(section);
        let staging = staging_path(&output);
        let list = output.with_extension("txt");
        tokio::fs::create_dir_all(self.layout.sections_dir()).await?;
        let entries: String = self
            .layout
            .chunks_in_section(section)
            .map(|c| concat_entry(&self.layout.chunk_path(c)))
            .collect();
        tokio::fs::write(&list, entries).await?;

        let invocation = ToolInvocation::new(&self.ffmpeg)
            .args(["-hide_banner", "-nostdin", "-y", "-f", "concat", "-safe", "0", "-i"])
            .arg(list.to_string_lossy())
            .args(["-c", "copy", "-movflags", "+faststart"])
            .arg(staging.to_string_lossy())
            .timeout(CONCAT_TIMEOUT);
        let result = self.run_to(invocation, &staging, &output, &self.cancel).await;
        off_thread(move || remove_if_exists(&list)).await?;
        result?;

        self.lock_state().concatenated.insert(section);
        info!(section, "preview section concatenated");
        self.rebuild();
        Ok(())
    }

    /// Delete a concatenated section's chunk files once the delay has passed.
    async fn retire_chunks(&self, section: u32) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.cleanup_delay) => {}
            _ = self.cancel.cancelled() => return,
        }
        for chunk in self.layout.chunks_in_section(section) {
            let path = self.layout.chunk_path(chunk);
            if let Err(e) = off_thread(move || remove_if_exists(&path)).await {
                warn!(chunk, error = %e, "failed to delete preview chunk");
            }
            self.lock_state().resident.remove(&chunk);
        }
        debug!(section, "retired preview chunks");
    }

    /// Rebuild the whole video track and hand it to the surface, keeping the
    /// position and play state.
    fn rebuild(&self) -> Timeline {
        let mut state = self.lock_state();
        let timeline = build_timeline(&self.layout, &state.resident, &state.concatenated, |p| {
            p.is_file()
        });
        for section in &timeline.demoted_sections {
            warn!(section, "preview section file missing; falling back to chunks");
            state.concatenated.remove(section);
        }
        for chunk in &timeline.missing_chunks {
            state.resident.remove(chunk);
        }

        let position = self.surface.position();
        let playing = self.surface.is_playing();
        self.surface.load(Composition {
            duration: self.layout.duration(),
            video: timeline.segments.clone(),
            audio: state.audio.clone(),
        });
        self.surface.seek(position);
        if playing {
            self.surface.play();
        } else {
            self.surface.pause();
        }
        timeline
    }
}

/// Run file work on the blocking pool.
async fn off_thread<T, E, F>(work: F) -> Result<T, SessionError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<SessionError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(std::io::Error::other)?
        .map_err(Into::into)
}

/// One line of an ffmpeg concat list.
fn concat_entry(path: &Path) -> String {
    format!("file '{}'\n", path.to_string_lossy().replace('\'', "'\\''"))
}

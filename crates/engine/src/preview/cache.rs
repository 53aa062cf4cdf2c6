//! Fingerprinted preview asset cache.
//!
//! Layout per source: `{cache_root}/PreviewAssets/{fingerprint}/` holding the
//! row thumbnail, filmstrip thumbnails, the global waveform, one waveform per
//! audio stream and `entry.json`. A complete entry is returned without running
//! any external tool; concurrent requests for the same fingerprint wait for
//! the first one and then read its result.

use super::color::{thumbnail_filter, ColorAdaptation};
use super::fingerprint::SourceFingerprint;
use super::manifest::{
    parse_stream_waveform_name, stream_waveform_name, thumbnail_name, unix_now, CacheManifest,
    GENERATING_MARKER, LEGACY_WAVEFORM, MANIFEST_FILE, ROW_THUMBNAIL, WAVEFORM,
};
use super::{cleanup, CleanupReport};
use crate::config::{CleanupPolicy, PreviewConfig};
use crate::probe::Prober;
use crate::runner::{SharedRunner, ToolError, ToolInvocation};
use crate::startup::ToolSet;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Directory under the cache root that holds every entry.
pub const ASSETS_DIR: &str = "PreviewAssets";

const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(60);
const WAVEFORM_TIMEOUT: Duration = Duration::from_secs(300);
const WAVEFORM_COLOR: &str = "0x9fb4ff";

/// Error type for preview generation
#[derive(Debug, Error)]
pub enum PreviewError {
    /// The source cannot be read.
    #[error("cannot read source {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The source's duration could not be determined.
    #[error("could not determine the duration of {0}")]
    UnknownDuration(PathBuf),

    /// The cache directory could not be written.
    #[error("cache I/O error: {0}")]
    Cache(#[from] std::io::Error),

    /// The encoder could not be run at all.
    #[error("encoder unavailable: {0}")]
    Tool(ToolError),

    #[error("preview generation cancelled")]
    Cancelled,
}

/// Generation settings, taken from `[preview]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewSettings {
    pub thumbnail_count: u32,
    pub thumbnail_width: u32,
    pub end_margin_secs: f64,
    pub waveform_width: u32,
    pub waveform_height: u32,
}

impl From<&PreviewConfig> for PreviewSettings {
    fn from(cfg: &PreviewConfig) -> Self {
        Self {
            thumbnail_count: cfg.thumbnail_count,
            thumbnail_width: cfg.thumbnail_width,
            end_margin_secs: cfg.end_margin_secs,
            waveform_width: 1200,
            waveform_height: 240,
        }
    }
}

/// Everything the cache holds for one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewAssets {
    pub fingerprint: String,
    pub directory: PathBuf,
    pub duration: Option<f64>,
    pub row_thumbnail: Option<PathBuf>,
    pub filmstrip: Vec<PathBuf>,
    /// Filmstrip indices omitted after the retry
    pub missing_thumbnails: Vec<u32>,
    pub waveform: Option<PathBuf>,
    /// Waveform per audio stream ordinal
    pub stream_waveforms: BTreeMap<u32, PathBuf>,
    /// Stream ordinals whose waveform is a copy of the global one
    pub fallback_streams: Vec<u32>,
    /// Served without running any tool
    pub from_cache: bool,
}

impl PreviewAssets {
    fn from_manifest(key: &str, dir: &Path, m: &CacheManifest, from_cache: bool) -> Self {
        Self {
            fingerprint: key.to_string(),
            directory: dir.to_path_buf(),
            duration: m.duration,
            row_thumbnail: m.has_row_thumbnail.then(|| dir.join(ROW_THUMBNAIL)),
            filmstrip: m.filmstrip.iter().map(|i| dir.join(thumbnail_name(*i))).collect(),
            missing_thumbnails: m.missing_thumbnails.clone(),
            waveform: m.waveform.as_ref().map(|w| dir.join(w)),
            stream_waveforms: m
                .stream_waveforms
                .iter()
                .map(|o| (*o, dir.join(stream_waveform_name(*o))))
                .collect(),
            fallback_streams: m.fallback_streams.clone(),
            from_cache,
        }
    }
}

/// Evenly spaced filmstrip timestamps, keeping clear of the last `end_margin` seconds.
pub fn filmstrip_times(duration: f64, count: u32, end_margin: f64) -> Vec<f64> {
    if count == 0 || !duration.is_finite() || duration <= 0.0 {
        return Vec::new();
    }
    let usable = match duration - end_margin.max(0.0) {
        u if u > 0.0 => u,
        _ => duration,
    };
    (0..count)
        .map(|i| usable * (f64::from(i) + 0.5) / f64::from(count))
        .collect()
}

fn row_thumbnail_time(duration: f64) -> f64 {
    (duration * 0.1).min(1.0)
}

/// Failures that abort generation; every other tool error only loses one asset.
fn fatal(err: ToolError) -> Option<PreviewError> {
    match err {
        ToolError::Cancelled { .. } => Some(PreviewError::Cancelled),
        ToolError::Missing { .. } | ToolError::Spawn { .. } => Some(PreviewError::Tool(err)),
        _ => None,
    }
}

/// Preview asset cache; share one instance per process.
pub struct PreviewCache {
    root: PathBuf,
    settings: PreviewSettings,
    ffmpeg: PathBuf,
    prober: Prober,
    runner: SharedRunner,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PreviewCache {
    pub fn new(cfg: &PreviewConfig, tools: &ToolSet, runner: SharedRunner) -> Self {
        Self {
            root: cfg.cache_root.join(ASSETS_DIR),
            settings: PreviewSettings::from(cfg),
            ffmpeg: tools.ffmpeg.clone(),
            prober: Prober::new(tools, runner.clone()),
            runner,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// `{cache_root}/PreviewAssets`
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &PreviewSettings {
        &self.settings
    }

    pub fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Directory for a source's current fingerprint.
    pub fn entry_dir_for(&self, source: &Path) -> Result<PathBuf, PreviewError> {
        let fp = SourceFingerprint::of(source).map_err(|e| PreviewError::Source {
            path: source.to_path_buf(),
            source: e,
        })?;
        Ok(self.entry_dir(&fp.key))
    }

    fn gate(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(key.to_string()).or_default().clone()
    }

    fn release(&self, key: &str, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut map = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        // Map entry plus ours: nobody else is waiting.
        if Arc::strong_count(&gate) <= 2 {
            map.remove(key);
        }
    }

    /// Preview assets for a source, generating whatever is not cached.
    pub async fn assets(
        &self,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<PreviewAssets, PreviewError> {
        let fp = SourceFingerprint::of(source).map_err(|e| PreviewError::Source {
            path: source.to_path_buf(),
            source: e,
        })?;
        let dir = self.entry_dir(&fp.key);

        let gate = self.gate(&fp.key);
        let result = {
            let _held = gate.lock().await;
            match self.lookup(&fp, &dir).await {
                Some(assets) => Ok(assets),
                None => self.generate(&fp, &dir, cancel).await,
            }
        };
        self.release(&fp.key, gate);
        result
    }

    /// A complete entry, read off the async path.
    async fn lookup(&self, fp: &SourceFingerprint, dir: &Path) -> Option<PreviewAssets> {
        let fp = fp.clone();
        let dir = dir.to_path_buf();
        let thumbnail_count = self.settings.thumbnail_count;
        tokio::task::spawn_blocking(move || cached_entry(&fp, &dir, thumbnail_count))
            .await
            .ok()
            .flatten()
    }

    /// Extract one frame; Ok(false) when this frame could not be produced.
    async fn thumbnail(
        &self,
        source: &Path,
        at: f64,
        filter: &str,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool, PreviewError> {
        let invocation = ToolInvocation::new(&self.ffmpeg)
            .args(["-hide_banner", "-nostdin", "-y", "-ss"])
            .arg(format!("{:.3}", at))
            .arg("-i")
            .arg(source.to_string_lossy())
            .args(["-frames:v", "1", "-vf"])
            .arg(filter)
            .args(["-q:v", "4"])
            .arg(out.to_string_lossy())
            .timeout(THUMBNAIL_TIMEOUT);

        match self.runner.run(&invocation, cancel).await {
            Ok(_) => Ok(out.is_file()),
            Err(e) => match fatal(e) {
                Some(err) => Err(err),
                None => Ok(false),
            },
        }
    }

    fn waveform_invocation(&self, source: &Path, graph: String, out: &Path) -> ToolInvocation {
        ToolInvocation::new(&self.ffmpeg)
            .args(["-hide_banner", "-nostdin", "-y", "-i"])
            .arg(source.to_string_lossy())
            .arg("-filter_complex")
            .arg(graph)
            .args(["-frames:v", "1", "-q:v", "3"])
            .arg(out.to_string_lossy())
            .timeout(WAVEFORM_TIMEOUT)
    }

    fn waveform_filter(&self) -> String {
        format!(
            "aformat=channel_layouts=mono,showwavespic=s={}x{}:colors={}",
            self.settings.waveform_width, self.settings.waveform_height, WAVEFORM_COLOR
        )
    }

    async fn generate(
        &self,
        fp: &SourceFingerprint,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PreviewAssets, PreviewError> {
        let source = fp.path.as_path();
        tokio::fs::create_dir_all(dir).await?;
        discard_partial_assets(dir).await?;
        tokio::fs::write(dir.join(GENERATING_MARKER), b"").await?;

        let facts = self.prober.facts(source).await;
        if cancel.is_cancelled() {
            return Err(PreviewError::Cancelled);
        }
        let duration = facts
            .duration
            .ok_or_else(|| PreviewError::UnknownDuration(source.to_path_buf()))?;
        info!(fingerprint = %fp.key, source = %source.display(), "generating preview assets");

        let mut manifest = CacheManifest {
            source: fp.path.clone(),
            size: fp.size,
            modified_nanos: fp.modified_nanos,
            duration: Some(duration),
            ..Default::default()
        };

        if facts.video.is_some() {
            let adaptation = ColorAdaptation::for_video(facts.video.as_ref());
            let chain = thumbnail_filter(adaptation, self.settings.thumbnail_width);
            let simple = thumbnail_filter(ColorAdaptation::None, self.settings.thumbnail_width);
            debug!(?adaptation, "thumbnail color adaptation");

            let row = dir.join(ROW_THUMBNAIL);
            let row_at = row_thumbnail_time(duration);
            let mut row_ok = self.thumbnail(source, row_at, &chain, &row, cancel).await?;
            if !row_ok && adaptation != ColorAdaptation::None {
                row_ok = self.thumbnail(source, row_at, &simple, &row, cancel).await?;
            }
            if !row_ok {
                warn!(source = %source.display(), "row thumbnail could not be generated");
            }
            manifest.has_row_thumbnail = row_ok;

            let times = filmstrip_times(
                duration,
                self.settings.thumbnail_count,
                self.settings.end_margin_secs,
            );
            let mut missing = Vec::new();
            for (i, at) in times.iter().enumerate() {
                let out = dir.join(thumbnail_name(i as u32));
                if !self.thumbnail(source, *at, &chain, &out, cancel).await? {
                    missing.push(i as u32);
                }
            }
            if !missing.is_empty() {
                debug!(?missing, "retrying filmstrip frames without color adaptation");
                let mut still_missing = Vec::new();
                for i in missing {
                    let out = dir.join(thumbnail_name(i));
                    if !self.thumbnail(source, times[i as usize], &simple, &out, cancel).await? {
                        still_missing.push(i);
                    }
                }
                missing = still_missing;
            }
            if !missing.is_empty() {
                warn!(source = %source.display(), omitted = ?missing, "filmstrip frames omitted");
            }
            manifest.filmstrip = (0..times.len() as u32)
                .filter(|i| !missing.contains(i))
                .collect();
            manifest.missing_thumbnails = missing;
        }

        if !facts.audio_streams.is_empty() {
            if cancel.is_cancelled() {
                return Err(PreviewError::Cancelled);
            }
            let ordinals: Vec<u32> = facts.audio_streams.iter().map(|s| s.ordinal).collect();
            self.generate_waveforms(source, dir, &ordinals, &mut manifest, cancel)
                .await?;
        }

        manifest.last_accessed = unix_now();
        let saved = manifest.clone();
        let entry = dir.to_path_buf();
        tokio::task::spawn_blocking(move || saved.save(&entry))
            .await
            .map_err(std::io::Error::other)??;
        tokio::fs::remove_file(dir.join(GENERATING_MARKER)).await?;
        Ok(PreviewAssets::from_manifest(&fp.key, dir, &manifest, false))
    }

    /// Global waveform, then one waveform per stream concurrently.
    async fn generate_waveforms(
        &self,
        source: &Path,
        dir: &Path,
        ordinals: &[u32],
        manifest: &mut CacheManifest,
        cancel: &CancellationToken,
    ) -> Result<(), PreviewError> {
        let filter = self.waveform_filter();
        let inputs: String = ordinals.iter().map(|o| format!("[0:a:{}]", o)).collect();
        let global_graph = if ordinals.len() > 1 {
            format!("{}amix=inputs={}:normalize=0,{}", inputs, ordinals.len(), filter)
        } else {
            format!("{}{}", inputs, filter)
        };
        let global = dir.join(WAVEFORM);
        let invocation = self.waveform_invocation(source, global_graph, &global);
        match self.runner.run(&invocation, cancel).await {
            Ok(_) if global.is_file() => manifest.waveform = Some(WAVEFORM.to_string()),
            Ok(_) => warn!(source = %source.display(), "global waveform missing after render"),
            Err(e) => match fatal(e) {
                Some(err) => return Err(err),
                None => warn!(source = %source.display(), "global waveform failed"),
            },
        }

        let mut tasks = JoinSet::new();
        for &ordinal in ordinals {
            let out = dir.join(stream_waveform_name(ordinal));
            let graph = format!("[0:a:{}]{}", ordinal, filter);
            let invocation = self.waveform_invocation(source, graph, &out);
            let runner = self.runner.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = runner.run(&invocation, &cancel).await;
                (ordinal, result.map(|_| out.is_file()))
            });
        }

        let mut rendered = Vec::new();
        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((ordinal, Ok(true))) => rendered.push(ordinal),
                Ok((_, Err(e))) if e.is_cancelled() => cancelled = true,
                Ok((ordinal, _)) => debug!(ordinal, "stream waveform failed"),
                Err(e) => warn!(error = %e, "stream waveform task aborted"),
            }
        }
        if cancelled {
            return Err(PreviewError::Cancelled);
        }

        let mut fallback = Vec::new();
        for &ordinal in ordinals.iter().filter(|o| !rendered.contains(o)) {
            let Some(global_name) = &manifest.waveform else {
                continue;
            };
            let copied =
                tokio::fs::copy(dir.join(global_name), dir.join(stream_waveform_name(ordinal))).await;
            match copied {
                Ok(_) => {
                    warn!(ordinal, "stream waveform failed; using global waveform");
                    fallback.push(ordinal);
                }
                Err(e) => warn!(ordinal, error = %e, "could not copy fallback waveform"),
            }
        }

        let mut streams: Vec<u32> = rendered.into_iter().chain(fallback.iter().copied()).collect();
        streams.sort_unstable();
        fallback.sort_unstable();
        manifest.stream_waveforms = streams;
        manifest.fallback_streams = fallback;
        Ok(())
    }

    /// Total bytes held by the cache.
    pub fn cache_size_bytes(&self) -> u64 {
        cleanup::cache_size_bytes(&self.root)
    }

    /// Remove every entry.
    pub fn clear_all(&self) -> std::io::Result<CleanupReport> {
        cleanup::clear_all(&self.root)
    }

    /// Apply a retention policy as of `now`.
    pub fn apply_cleanup(
        &self,
        policy: CleanupPolicy,
        now: SystemTime,
    ) -> std::io::Result<CleanupReport> {
        cleanup::apply_cleanup(&self.root, policy, now)
    }

    /// Startup cleanup: purge or expire entries according to `policy`.
    pub fn cleanup_on_start(&self, policy: CleanupPolicy) -> std::io::Result<CleanupReport> {
        cleanup::cleanup_on_start(&self.root, policy)
    }
}

fn is_asset_file(name: &str) -> bool {
    matches!(
        name,
        ROW_THUMBNAIL | WAVEFORM | LEGACY_WAVEFORM | MANIFEST_FILE | GENERATING_MARKER
    ) || (name.starts_with("thumb_") && name.ends_with(".jpg"))
        || parse_stream_waveform_name(name).is_some()
}

/// Remove asset files left by an incomplete or interrupted generation.
/// Chunked session files sharing the directory are kept.
async fn discard_partial_assets(dir: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut removed = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if is_asset_file(&entry.file_name().to_string_lossy()) {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(dir = %dir.display(), removed, "discarded incomplete cache entry");
    }
    Ok(())
}

/// A complete entry with its access time refreshed, or None when the entry
/// is missing, incomplete or was interrupted mid-generation.
fn cached_entry(fp: &SourceFingerprint, dir: &Path, thumbnail_count: u32) -> Option<PreviewAssets> {
    if dir.join(GENERATING_MARKER).exists() {
        debug!(fingerprint = %fp.key, "cache entry was interrupted; regenerating");
        return None;
    }
    let mut manifest = match CacheManifest::load(dir) {
        Some(m) if m.is_complete(dir) => m,
        Some(_) => return None,
        None => adopt_legacy_entry(fp, dir, thumbnail_count)?,
    };
    manifest.last_accessed = unix_now();
    if let Err(e) = manifest.save(dir) {
        warn!(dir = %dir.display(), error = %e, "could not refresh cache manifest");
    }
    debug!(fingerprint = %fp.key, "preview cache hit");
    Some(PreviewAssets::from_manifest(&fp.key, dir, &manifest, true))
}

/// Entries written before manifests existed: complete when the row
/// thumbnail, every filmstrip frame and a global waveform are present.
fn adopt_legacy_entry(fp: &SourceFingerprint, dir: &Path, thumbnail_count: u32) -> Option<CacheManifest> {
    if !dir.join(ROW_THUMBNAIL).is_file() {
        return None;
    }
    let filmstrip: Vec<u32> = (0..thumbnail_count).collect();
    if !filmstrip.iter().all(|i| dir.join(thumbnail_name(*i)).is_file()) {
        return None;
    }
    let waveform = [WAVEFORM, LEGACY_WAVEFORM]
        .into_iter()
        .find(|w| dir.join(w).is_file())?;

    let mut stream_waveforms: Vec<u32> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| parse_stream_waveform_name(&e.file_name().to_string_lossy()))
        .collect();
    stream_waveforms.sort_unstable();

    debug!(fingerprint = %fp.key, "adopting cache entry without manifest");
    Some(CacheManifest {
        source: fp.path.clone(),
        size: fp.size,
        modified_nanos: fp.modified_nanos,
        has_row_thumbnail: true,
        filmstrip,
        waveform: Some(waveform.to_string()),
        stream_waveforms,
        ..Default::default()
    })
}

//! Prober module for collecting source facts with ffprobe.
//!
//! Output is requested as plain `key=value` lines
//! (`-of default=noprint_wrappers=1`). Every probe is bounded by the
//! configured timeout and fails soft: a probe that errors or times out is
//! reported as "unknown" rather than aborting the caller.

use crate::runner::{SharedRunner, ToolError, ToolInvocation};
use crate::startup::ToolSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe could not be run or exited with failure.
    #[error("ffprobe failed: {0}")]
    Tool(#[from] ToolError),

    /// ffprobe output did not contain the requested entry.
    #[error("ffprobe output missing '{0}'")]
    Missing(&'static str),
}

/// One audio stream of the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    /// Global stream index within the container.
    pub index: u32,
    /// Position among audio streams (the `N` in `0:a:N`).
    pub ordinal: u32,
    pub channels: u32,
    pub channel_layout: Option<String>,
}

/// Codec and color description of the first video stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoColorInfo {
    pub codec_name: Option<String>,
    pub pix_fmt: Option<String>,
    pub bits_per_raw_sample: Option<u32>,
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
    pub color_space: Option<String>,
    pub field_order: Option<String>,
}

impl VideoColorInfo {
    /// Interlacing as reported by the container; None when unknown.
    pub fn is_interlaced(&self) -> Option<bool> {
        match self.field_order.as_deref()? {
            "progressive" => Some(false),
            "tt" | "bb" | "tb" | "bt" => Some(true),
            _ => None,
        }
    }

    /// Bits per component, from the raw sample size or the pixel format name.
    pub fn bit_depth(&self) -> u32 {
        if let Some(bits) = self.bits_per_raw_sample.filter(|b| *b > 0) {
            return bits;
        }
        let pix_fmt = self.pix_fmt.as_deref().unwrap_or_default();
        if pix_fmt.contains("16") {
            16
        } else if pix_fmt.contains("12") {
            12
        } else if pix_fmt.contains("10") || pix_fmt.starts_with("p010") {
            10
        } else {
            8
        }
    }

    /// Whether any of transfer, primaries or matrix is tagged.
    pub fn has_color_metadata(&self) -> bool {
        self.color_transfer.is_some() || self.color_primaries.is_some() || self.color_space.is_some()
    }

    /// Camera RAW style codecs that need a plain format conversion to decode to frames.
    pub fn is_raw_class(&self) -> bool {
        self.codec_name
            .as_deref()
            .is_some_and(|c| CAMERA_RAW_CODECS.contains(&c.to_ascii_lowercase().as_str()))
    }
}

/// Codec names of camera RAW formats. Uncompressed `rawvideo` is not one of them.
const CAMERA_RAW_CODECS: &[&str] = &["prores_raw", "braw", "r3d", "cinemadng", "arriraw"];

/// Everything the argument builder and preview cache need to know about a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceFacts {
    /// Duration in seconds, if it could be determined.
    pub duration: Option<f64>,
    pub audio_streams: Vec<AudioStreamInfo>,
    pub video: Option<VideoColorInfo>,
}

impl SourceFacts {
    pub fn is_interlaced(&self) -> Option<bool> {
        self.video.as_ref().and_then(VideoColorInfo::is_interlaced)
    }
}

/// Split `key=value` lines, skipping anything else.
pub fn parse_key_values(text: &str) -> Vec<(&str, &str)> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once('=')?;
            Some((key.trim(), value.trim()))
        })
        .collect()
}

/// Treat ffprobe placeholders as absent.
fn known(value: &str) -> Option<String> {
    match value {
        "" | "N/A" | "unknown" => None,
        v => Some(v.to_string()),
    }
}

/// Parse a `duration=` entry; non-positive or non-finite durations are unknown.
pub fn parse_duration_output(text: &str) -> Option<f64> {
    parse_key_values(text)
        .into_iter()
        .find(|(k, _)| *k == "duration")
        .and_then(|(_, v)| v.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// Parse per-stream blocks; every `index=` line starts a new stream.
pub fn parse_audio_streams(text: &str) -> Vec<AudioStreamInfo> {
    let mut streams: Vec<AudioStreamInfo> = Vec::new();

    for (key, value) in parse_key_values(text) {
        if key == "index" {
            let index = value.parse().unwrap_or(streams.len() as u32);
            streams.push(AudioStreamInfo {
                index,
                ordinal: streams.len() as u32,
                channels: 0,
                channel_layout: None,
            });
            continue;
        }

        let Some(current) = streams.last_mut() else {
            continue;
        };
        match key {
            "channels" => current.channels = value.parse().unwrap_or(0),
            "channel_layout" => current.channel_layout = known(value),
            _ => {}
        }
    }

    streams
}

/// Parse the first video stream's codec and color entries.
pub fn parse_video_info(text: &str) -> Option<VideoColorInfo> {
    let pairs = parse_key_values(text);
    if pairs.is_empty() {
        return None;
    }

    let mut info = VideoColorInfo::default();
    for (key, value) in pairs {
        match key {
            "codec_name" => info.codec_name = known(value),
            "pix_fmt" => info.pix_fmt = known(value),
            "bits_per_raw_sample" => info.bits_per_raw_sample = value.parse().ok(),
            "color_transfer" => info.color_transfer = known(value),
            "color_primaries" => info.color_primaries = known(value),
            "color_space" => info.color_space = known(value),
            "field_order" => info.field_order = known(value),
            _ => {}
        }
    }
    Some(info)
}

/// Runs ffprobe through a [`crate::runner::CommandRunner`].
#[derive(Clone)]
pub struct Prober {
    runner: SharedRunner,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl Prober {
    pub fn new(tools: &ToolSet, runner: SharedRunner) -> Self {
        Self {
            runner,
            ffprobe: tools.ffprobe.clone(),
            timeout: tools.probe_timeout,
        }
    }

    async fn run(&self, path: &Path, entries: &[&str]) -> Result<String, ProbeError> {
        let invocation = ToolInvocation::new(&self.ffprobe)
            .args(["-v", "error"])
            .args(entries.iter().copied())
            .args(["-of", "default=noprint_wrappers=1"])
            .arg(path.to_string_lossy())
            .timeout(self.timeout);

        let output = self
            .runner
            .run(&invocation, &CancellationToken::new())
            .await?;
        Ok(output.stdout)
    }

    /// Container duration in seconds.
    pub async fn try_duration(&self, path: &Path) -> Result<f64, ProbeError> {
        let text = self
            .run(path, &["-show_entries", "format=duration"])
            .await?;
        parse_duration_output(&text).ok_or(ProbeError::Missing("duration"))
    }

    /// Container duration, or None when it cannot be determined in time.
    pub async fn duration(&self, path: &Path) -> Option<f64> {
        match self.try_duration(path).await {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "duration probe failed; treating as unknown");
                None
            }
        }
    }

    /// Audio streams with channel counts; empty when unknown.
    pub async fn audio_streams(&self, path: &Path) -> Vec<AudioStreamInfo> {
        let result = self
            .run(
                path,
                &[
                    "-select_streams",
                    "a",
                    "-show_entries",
                    "stream=index,channels,channel_layout",
                ],
            )
            .await;
        match result {
            Ok(text) => parse_audio_streams(&text),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "audio stream probe failed; assuming none");
                Vec::new()
            }
        }
    }

    /// Codec, pixel format, color tags and field order of the first video stream.
    pub async fn video_info(&self, path: &Path) -> Option<VideoColorInfo> {
        let result = self
            .run(
                path,
                &[
                    "-select_streams",
                    "v:0",
                    "-show_entries",
                    "stream=codec_name,pix_fmt,bits_per_raw_sample,color_transfer,color_primaries,color_space,field_order",
                ],
            )
            .await;
        match result {
            Ok(text) => parse_video_info(&text),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "video probe failed; treating as unknown");
                None
            }
        }
    }

    /// All facts, probed concurrently.
    pub async fn facts(&self, path: &Path) -> SourceFacts {
        let (duration, audio_streams, video) = tokio::join!(
            self.duration(path),
            self.audio_streams(path),
            self.video_info(path)
        );
        let facts = SourceFacts {
            duration,
            audio_streams,
            video,
        };
        debug!(path = %path.display(), ?facts, "probed source");
        facts
    }
}

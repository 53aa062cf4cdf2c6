//! Startup checks module for scrubline
//!
//! Locates the external encoder and prober before any job runs:
//! - Resolve each binary from config overrides or PATH
//! - Verify the encoder actually executes and report its version

use crate::config::{Config, ToolsConfig};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: &'static str, reason: String },

    #[error("Could not determine encoder version: {0}")]
    EncoderVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolved locations of the external binaries the engine drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSet {
    /// Encoder binary (ffmpeg)
    pub ffmpeg: PathBuf,
    /// Prober binary (ffprobe)
    pub ffprobe: PathBuf,
    /// Upper bound for probe invocations
    pub probe_timeout: Duration,
}

impl ToolSet {
    /// Build a tool set from known paths without checking them.
    pub fn from_paths(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Resolve one tool: an override is used only when it exists, otherwise PATH is searched.
fn resolve_tool(name: &'static str, custom: Option<&Path>) -> Result<PathBuf, StartupError> {
    if let Some(path) = custom {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        warn!(tool = name, path = %path.display(), "configured tool path does not exist; searching PATH");
    }

    which::which(name).map_err(|e| StartupError::ToolUnavailable {
        tool: name,
        reason: format!("not found on PATH ({})", e),
    })
}

/// Locate the encoder and prober binaries.
pub fn discover_tools(cfg: &ToolsConfig) -> Result<ToolSet, StartupError> {
    let ffmpeg = resolve_tool("ffmpeg", cfg.ffmpeg_path.as_deref())?;
    let ffprobe = resolve_tool("ffprobe", cfg.ffprobe_path.as_deref())?;
    debug!(ffmpeg = %ffmpeg.display(), ffprobe = %ffprobe.display(), "resolved external tools");

    Ok(ToolSet {
        ffmpeg,
        ffprobe,
        probe_timeout: Duration::from_secs(cfg.probe_timeout_secs.max(1)),
    })
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
///
/// Git snapshot builds ("N-112345-g...") carry no release number and yield None.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Check that the encoder executes, returning its major version when known.
pub fn check_encoder_runs(tools: &ToolSet) -> Result<Option<u32>, StartupError> {
    let output = Command::new(&tools.ffmpeg)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: "ffmpeg",
            reason: format!("failed to run -version: {}", e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: "ffmpeg",
            reason: "ffmpeg -version exited with failure".to_string(),
        });
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major = parse_ffmpeg_version(&version_output);
    match major {
        Some(v) => info!(major = v, "encoder available"),
        None => info!(
            banner = version_output.lines().next().unwrap_or("(empty)"),
            "encoder available, version not recognised"
        ),
    }
    Ok(major)
}

/// Run all startup checks in order
///
/// 1. Tool discovery
/// 2. Encoder execution
pub fn run_startup_checks(cfg: &Config) -> Result<ToolSet, StartupError> {
    let tools = discover_tools(&cfg.tools)?;
    check_encoder_runs(&tools)?;
    Ok(tools)
}

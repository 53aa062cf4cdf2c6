//! Core configuration structures and loading logic

use crate::age::AgeThreshold;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// Explicit encoder path (searched on PATH if None or missing)
    pub ffmpeg_path: Option<PathBuf>,
    /// Explicit prober path (searched on PATH if None or missing)
    pub ffprobe_path: Option<PathBuf>,
    /// Upper bound for a single probe invocation
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_probe_timeout_secs() -> u64 {
    5
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// Conversion queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConversionConfig {
    /// Maximum concurrent conversions (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Directory for converted files (defaults to the source's directory)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

/// When the preview asset cache is cleaned up automatically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Remove every cached entry each time the application starts.
    PurgeOnStart,
    #[serde(rename = "retain_1_day")]
    Retain1Day,
    #[serde(rename = "retain_3_days")]
    Retain3Days,
    #[serde(rename = "retain_7_days")]
    Retain7Days,
    /// Never cleaned automatically.
    Manual,
}

impl CleanupPolicy {
    /// Number of days an entry survives without being accessed, if time-based.
    pub fn retention_days(self) -> Option<u32> {
        match self {
            CleanupPolicy::Retain1Day => Some(1),
            CleanupPolicy::Retain3Days => Some(3),
            CleanupPolicy::Retain7Days => Some(7),
            CleanupPolicy::PurgeOnStart | CleanupPolicy::Manual => None,
        }
    }

    /// Parse the snake_case name used in config files and environment variables.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "purge_on_start" => Some(CleanupPolicy::PurgeOnStart),
            "retain_1_day" => Some(CleanupPolicy::Retain1Day),
            "retain_3_days" => Some(CleanupPolicy::Retain3Days),
            "retain_7_days" => Some(CleanupPolicy::Retain7Days),
            "manual" => Some(CleanupPolicy::Manual),
            _ => None,
        }
    }
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        CleanupPolicy::Retain7Days
    }
}

/// Preview asset cache and chunked preview configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewConfig {
    /// Application support root; assets live under `{cache_root}/PreviewAssets`
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    /// Number of filmstrip thumbnails per source
    #[serde(default = "default_thumbnail_count")]
    pub thumbnail_count: u32,
    /// Thumbnail width in pixels (height follows aspect ratio)
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,
    /// Seconds skipped at the end of the source when spacing thumbnails
    #[serde(default = "default_end_margin_secs")]
    pub end_margin_secs: f64,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    /// Length of one preview chunk in seconds
    #[serde(default = "default_chunk_secs")]
    pub chunk_secs: f64,
    /// Number of consecutive chunks merged into one section
    #[serde(default = "default_section_chunks")]
    pub section_chunks: u32,
    /// Delay before chunk files of a merged section are deleted
    #[serde(default = "default_section_cleanup_delay_secs")]
    pub section_cleanup_delay_secs: u64,
    /// Length of the quick audio extract produced when a session starts
    #[serde(default = "default_quick_audio_secs")]
    pub quick_audio_secs: f64,
}

fn default_cache_root() -> PathBuf {
    env::temp_dir().join("scrubline")
}

fn default_thumbnail_count() -> u32 {
    10
}

fn default_thumbnail_width() -> u32 {
    320
}

fn default_end_margin_secs() -> f64 {
    0.5
}

fn default_chunk_secs() -> f64 {
    15.0
}

fn default_section_chunks() -> u32 {
    8
}

fn default_section_cleanup_delay_secs() -> u64 {
    5
}

fn default_quick_audio_secs() -> f64 {
    120.0
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            thumbnail_count: default_thumbnail_count(),
            thumbnail_width: default_thumbnail_width(),
            end_margin_secs: default_end_margin_secs(),
            cleanup: CleanupPolicy::default(),
            chunk_secs: default_chunk_secs(),
            section_chunks: default_section_chunks(),
            section_cleanup_delay_secs: default_section_cleanup_delay_secs(),
            quick_audio_secs: default_quick_audio_secs(),
        }
    }
}

/// Watch folder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Directory to poll (watching disabled if None)
    pub dir: Option<PathBuf>,
    /// Preset applied to stable files
    #[serde(default = "default_watch_preset")]
    pub preset: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Files older than this are left alone
    #[serde(default)]
    pub ignore_after: Option<AgeThreshold>,
    /// Files older than this are deleted
    #[serde(default)]
    pub delete_after: Option<AgeThreshold>,
    /// Accepted extensions, without the leading dot
    #[serde(default = "default_watch_extensions")]
    pub extensions: Vec<String>,
}

fn default_watch_preset() -> String {
    "h264_mp4".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_watch_extensions() -> Vec<String> {
    [
        "mov", "mp4", "m4v", "mkv", "avi", "mxf", "mts", "m2ts", "ts", "wav", "aif", "aiff",
        "mp3", "m4a", "flac",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dir: None,
            preset: default_watch_preset(),
            poll_interval_secs: default_poll_interval_secs(),
            ignore_after: None,
            delete_after: None,
            extensions: default_watch_extensions(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - SCRUBLINE_FFMPEG -> tools.ffmpeg_path
    /// - SCRUBLINE_FFPROBE -> tools.ffprobe_path
    /// - SCRUBLINE_MAX_CONCURRENT_JOBS -> conversion.max_concurrent_jobs
    /// - SCRUBLINE_CACHE_ROOT -> preview.cache_root
    /// - SCRUBLINE_CACHE_CLEANUP -> preview.cleanup
    /// - SCRUBLINE_WATCH_DIR -> watch.dir
    /// - SCRUBLINE_POLL_INTERVAL_SECS -> watch.poll_interval_secs
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("SCRUBLINE_FFMPEG") {
            if !val.is_empty() {
                self.tools.ffmpeg_path = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("SCRUBLINE_FFPROBE") {
            if !val.is_empty() {
                self.tools.ffprobe_path = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("SCRUBLINE_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.conversion.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("SCRUBLINE_CACHE_ROOT") {
            if !val.is_empty() {
                self.preview.cache_root = PathBuf::from(val);
            }
        }

        // Unknown policy names keep the existing value
        if let Ok(val) = env::var("SCRUBLINE_CACHE_CLEANUP") {
            if let Some(policy) = CleanupPolicy::from_name(&val) {
                self.preview.cleanup = policy;
            }
        }

        if let Ok(val) = env::var("SCRUBLINE_WATCH_DIR") {
            if !val.is_empty() {
                self.watch.dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("SCRUBLINE_POLL_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                if secs > 0 {
                    self.watch.poll_interval_secs = secs;
                }
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults.
    /// Environment overrides apply either way.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}

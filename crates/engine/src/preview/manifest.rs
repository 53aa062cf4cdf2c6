//! `entry.json`: what a cache directory holds and when it was last used.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const MANIFEST_FILE: &str = "entry.json";
pub const ROW_THUMBNAIL: &str = "row_thumb.jpg";
pub const WAVEFORM: &str = "waveform.jpg";
/// Written by older releases; still accepted as the global waveform.
pub const LEGACY_WAVEFORM: &str = "waveform.png";
/// Present while an entry is being generated; removed once `entry.json` is saved.
pub const GENERATING_MARKER: &str = ".generating";

pub fn thumbnail_name(index: u32) -> String {
    format!("thumb_{}.jpg", index)
}

pub fn stream_waveform_name(ordinal: u32) -> String {
    format!("waveform_a{}.jpg", ordinal)
}

/// Parse `waveform_a{N}.jpg` back to its stream ordinal.
pub fn parse_stream_waveform_name(name: &str) -> Option<u32> {
    name.strip_prefix("waveform_a")?
        .strip_suffix(".jpg")?
        .parse()
        .ok()
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Record of one cache entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub source: PathBuf,
    pub size: u64,
    pub modified_nanos: u64,
    pub duration: Option<f64>,
    pub has_row_thumbnail: bool,
    /// Filmstrip indices that were produced
    pub filmstrip: Vec<u32>,
    /// Filmstrip indices that could not be produced
    #[serde(default)]
    pub missing_thumbnails: Vec<u32>,
    /// File name of the global waveform, if any
    pub waveform: Option<String>,
    /// Audio stream ordinals with a waveform image
    pub stream_waveforms: Vec<u32>,
    /// Stream ordinals whose image is a copy of the global waveform
    #[serde(default)]
    pub fallback_streams: Vec<u32>,
    /// Unix seconds of the most recent request
    pub last_accessed: u64,
}

impl CacheManifest {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Read a manifest; a missing or unreadable one is None.
    pub fn load(dir: &Path) -> Option<Self> {
        let text = std::fs::read_to_string(Self::path(dir)).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn save(&self, dir: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        std::fs::write(&tmp, json)?;
        std::fs::rename(tmp, Self::path(dir))
    }

    /// Every file the manifest says the directory contains.
    pub fn expected_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        if self.has_row_thumbnail {
            files.push(ROW_THUMBNAIL.to_string());
        }
        files.extend(self.filmstrip.iter().map(|i| thumbnail_name(*i)));
        files.extend(self.waveform.iter().cloned());
        files.extend(self.stream_waveforms.iter().map(|o| stream_waveform_name(*o)));
        files
    }

    pub fn is_complete(&self, dir: &Path) -> bool {
        self.expected_files().iter().all(|f| dir.join(f).is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_names() {
        assert_eq!(thumbnail_name(3), "thumb_3.jpg");
        assert_eq!(stream_waveform_name(1), "waveform_a1.jpg");
        assert_eq!(parse_stream_waveform_name("waveform_a12.jpg"), Some(12));
        assert_eq!(parse_stream_waveform_name("waveform.jpg"), None);
    }

    #[test]
    fn test_save_load_and_completeness() {
        let dir = TempDir::new().unwrap();
        let manifest = CacheManifest {
            source: PathBuf::from("/media/a.mov"),
            has_row_thumbnail: true,
            filmstrip: vec![0, 2],
            missing_thumbnails: vec![1],
            waveform: Some(LEGACY_WAVEFORM.to_string()),
            stream_waveforms: vec![0],
            last_accessed: 42,
            ..Default::default()
        };
        manifest.save(dir.path()).unwrap();
        assert_eq!(CacheManifest::load(dir.path()), Some(manifest.clone()));
        assert!(!manifest.is_complete(dir.path()));

        for f in manifest.expected_files() {
            std::fs::write(dir.path().join(f), b"x").unwrap();
        }
        assert!(manifest.is_complete(dir.path()));
        assert!(!dir.path().join(thumbnail_name(1)).exists());
    }

    #[test]
    fn test_corrupt_manifest_is_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(CacheManifest::path(dir.path()), b"{not json").unwrap();
        assert_eq!(CacheManifest::load(dir.path()), None);
    }
}

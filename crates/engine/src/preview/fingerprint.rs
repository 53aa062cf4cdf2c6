//! Cache keys for source files.
//!
//! A fingerprint hashes the source path together with its byte size and
//! modification time, so any edit or replacement of the file produces a new
//! key and the old entry is simply orphaned.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Identity of a source file at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch
    pub modified_nanos: u64,
    /// Hex digest used as the cache directory name
    pub key: String,
}

impl SourceFingerprint {
    /// Fingerprint a file on disk.
    pub fn of(path: &Path) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let modified_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Ok(Self::from_parts(path, meta.len(), modified_nanos))
    }

    pub fn from_parts(path: &Path, size: u64, modified_nanos: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            size,
            modified_nanos,
            key: compute_key(path, size, modified_nanos),
        }
    }
}

/// Hash of path, size and modification time (16 bytes, 32 hex chars).
pub fn compute_key(path: &Path, size: u64, modified_nanos: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(size.to_le_bytes());
    hasher.update(modified_nanos.to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    #[test]
    fn test_key_shape() {
        let key = compute_key(Path::new("/media/a.mov"), 10, 20);
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_tracks_size_and_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.mov");
        std::fs::write(&path, b"one").unwrap();
        let first = SourceFingerprint::of(&path).unwrap();
        assert_eq!(first, SourceFingerprint::of(&path).unwrap());

        std::fs::write(&path, b"longer").unwrap();
        let grown = SourceFingerprint::of(&path).unwrap();
        assert_ne!(first.key, grown.key);

        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(3600)).unwrap();
        let touched = SourceFingerprint::of(&path).unwrap();
        assert_eq!(touched.size, grown.size);
        assert_ne!(touched.key, grown.key);
    }

    #[test]
    fn test_directory_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(SourceFingerprint::of(dir.path()).is_err());
        assert!(SourceFingerprint::of(&dir.path().join("missing")).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_key_sensitive_to_each_part(size in 0u64..u64::MAX, mtime in 0u64..u64::MAX, name in "[a-z]{1,12}") {
            let path = PathBuf::from(format!("/media/{}.mov", name));
            let key = compute_key(&path, size, mtime);
            prop_assert_ne!(&key, &compute_key(&path, size.wrapping_add(1), mtime));
            prop_assert_ne!(&key, &compute_key(&path, size, mtime.wrapping_add(1)));
            prop_assert_ne!(&key, &compute_key(&path.with_extension("mp4"), size, mtime));
        }
    }
}

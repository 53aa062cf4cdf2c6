//! Output promotion for finished conversions.
//!
//! The encoder writes to a staging file beside the destination. Only a
//! successful run moves it into place; any file already at the destination
//! is set aside first and restored if the move fails.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while promoting an output.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// The staging file is missing, usually because the encoder wrote nothing.
    #[error("staging file {0} does not exist")]
    MissingStaging(PathBuf),

    /// Failed to set the previous output aside.
    #[error("Failed to back up previous output: {0}")]
    BackupFailed(io::Error),

    /// Failed to move the staging file into place.
    #[error("Failed to move output into place: {0}")]
    MoveFailed(io::Error),

    /// Failed to create the destination directory.
    #[error("Failed to create {path}: {source}")]
    CreateDirFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to delete a stale file.
    #[error("Failed to remove {path}: {source}")]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Staging path for an output: `<stem>.partial.<ext>` in the same directory.
///
/// The extension is kept last so the encoder still picks the right muxer.
pub fn staging_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!("{}.partial.{}", stem, ext.to_string_lossy()),
        None => format!("{}.partial", stem),
    };
    output.with_file_name(name)
}

/// Backup path for a previous output: `<name>.orig.<timestamp>`.
pub fn backup_path(original: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut backup = original.as_os_str().to_owned();
    backup.push(format!(".orig.{}", timestamp));
    PathBuf::from(backup)
}

pub fn remove_if_exists(path: &Path) -> Result<(), ReplaceError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ReplaceError::RemoveFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Rename, falling back to copy + delete across filesystems.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

/// Prepare a destination before an encode: create its directory and delete
/// any previous output and stale staging file.
pub fn prepare_destination(output: &Path, staging: &Path) -> Result<(), ReplaceError> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ReplaceError::CreateDirFailed {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    remove_if_exists(output)?;
    remove_if_exists(staging)
}

/// Remove a staging file left by a failed or cancelled encode.
pub fn discard_staging(staging: &Path) {
    if let Err(e) = remove_if_exists(staging) {
        warn!(path = %staging.display(), error = %e, "could not remove staging file");
    }
}

/// Move a finished staging file over the destination.
///
/// 1. Set any existing destination aside as a backup
/// 2. Move the staging file into place
/// 3. Delete the backup, or restore it if step 2 failed
pub fn promote_output(staging: &Path, output: &Path) -> Result<(), ReplaceError> {
    if !staging.exists() {
        return Err(ReplaceError::MissingStaging(staging.to_path_buf()));
    }

    let backup = if output.exists() {
        let backup = backup_path(output);
        move_file(output, &backup).map_err(ReplaceError::BackupFailed)?;
        Some(backup)
    } else {
        None
    };

    if let Err(e) = move_file(staging, output) {
        if let Some(backup) = &backup {
            let _ = fs::rename(backup, output);
        }
        return Err(ReplaceError::MoveFailed(e));
    }

    if let Some(backup) = backup {
        remove_if_exists(&backup)?;
    }
    debug!(output = %output.display(), "promoted staging file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_staging_path_keeps_extension_last() {
        assert_eq!(
            staging_path(Path::new("/out/clip_h264.mp4")),
            PathBuf::from("/out/clip_h264.partial.mp4")
        );
        assert_eq!(staging_path(Path::new("/out/raw")), PathBuf::from("/out/raw.partial"));
    }

    #[test]
    fn test_backup_path_format() {
        let backup = backup_path(Path::new("/out/clip.mov"));
        let backup_str = backup.to_string_lossy();
        assert!(backup_str.starts_with("/out/clip.mov.orig."));
        let timestamp: u64 = backup_str.rsplit(".orig.").next().unwrap().parse().unwrap();
        assert!(timestamp > 0);
    }

    #[test]
    fn test_promote_over_existing_output() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("clip.mp4");
        let staging = staging_path(&output);
        fs::write(&output, b"old").unwrap();
        fs::write(&staging, b"new").unwrap();

        promote_output(&staging, &output).unwrap();

        assert_eq!(fs::read_to_string(&output).unwrap(), "new");
        assert!(!staging.exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().contains(".orig."))
            .collect();
        assert!(leftovers.is_empty(), "backup should be deleted");
    }

    #[test]
    fn test_promote_without_staging_keeps_output() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("clip.mp4");
        fs::write(&output, b"old").unwrap();

        let result = promote_output(&staging_path(&output), &output);
        assert!(matches!(result, Err(ReplaceError::MissingStaging(_))));
        assert_eq!(fs::read_to_string(&output).unwrap(), "old");
    }

    #[test]
    fn test_prepare_destination_clears_previous_files() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("nested").join("clip.wav");
        let staging = staging_path(&output);

        prepare_destination(&output, &staging).unwrap();
        assert!(output.parent().unwrap().is_dir());

        fs::write(&output, b"old").unwrap();
        fs::write(&staging, b"stale").unwrap();
        prepare_destination(&output, &staging).unwrap();
        assert!(!output.exists());
        assert!(!staging.exists());
    }

    #[test]
    fn test_discard_staging_is_quiet_when_missing() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("x.partial.mp4");
        discard_staging(&staging);
        fs::write(&staging, b"partial").unwrap();
        discard_staging(&staging);
        assert!(!staging.exists());
    }
}

//! Filesystem utilities.
//!
//! Crash-tolerant writes for project and settings files, plus scratch files
//! used to hand media payloads to services that only accept uploads.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::{CoreError, CoreResult};

// =============================================================================
// Path Validation Utilities
// =============================================================================

/// Validates that an identifier component is safe to use in file paths.
///
/// Rejects empty strings, `..`, path separators, drive letters and control
/// characters.
pub fn validate_path_id_component(id: &str, label: &str) -> CoreResult<()> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(CoreError::ValidationError(format!(
            "{label} is empty or contains only whitespace"
        )));
    }
    if trimmed.contains("..")
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains(':')
    {
        return Err(CoreError::ValidationError(format!(
            "Invalid {label}: contains path traversal characters"
        )));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(CoreError::ValidationError(format!(
            "Invalid {label}: contains control characters"
        )));
    }
    Ok(())
}

/// Validates a local input file path.
///
/// Remote URLs are rejected; the file must exist and be a regular file.
pub async fn validate_local_input_path(path: &str, label: &str) -> CoreResult<PathBuf> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidInput(format!("{label} is empty")));
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.contains("://") {
        return Err(CoreError::InvalidInput(format!(
            "{label} must be a local file path, not a URL"
        )));
    }

    let pb = PathBuf::from(trimmed);
    let meta = tokio::fs::metadata(&pb)
        .await
        .map_err(|_| CoreError::InvalidInput(format!("{label} file not found: {}", pb.display())))?;
    if !meta.is_file() {
        return Err(CoreError::InvalidInput(format!(
            "{label} is not a file: {}",
            pb.display()
        )));
    }

    Ok(pb)
}

// =============================================================================
// Atomic Writes
// =============================================================================

/// Write bytes to `path` using an atomic replace pattern.
///
/// Writes a sibling `.tmp` file, syncs it, then renames it into place. An
/// existing destination is moved aside as `.bak` first and restored if the
/// swap fails.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = sibling_path(path, "tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    atomic_replace(path, &tmp_path)
}

/// Write a JSON file atomically with pretty formatting.
pub fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| suffix.to_string());
    path.with_file_name(format!("{file_name}.{suffix}"))
}

fn atomic_replace(dest: &Path, src_tmp: &Path) -> CoreResult<()> {
    if !dest.exists() {
        std::fs::rename(src_tmp, dest)?;
        return Ok(());
    }

    // rename-over-existing is not portable; swap through a backup
    let bak = sibling_path(dest, "bak");
    if bak.exists() {
        let _ = std::fs::remove_file(&bak);
    }

    std::fs::rename(dest, &bak)?;
    match std::fs::rename(src_tmp, dest) {
        Ok(()) => {
            let _ = std::fs::remove_file(&bak);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::rename(&bak, dest);
            let _ = std::fs::remove_file(src_tmp);
            Err(CoreError::IoError(e))
        }
    }
}

// =============================================================================
// Temporary Media Files
// =============================================================================

/// Default scratch directory for media payloads
pub fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("mediaforge")
}

/// A scratch file holding a media payload.
///
/// The file is removed by [`TempMediaFile::remove`] or, as a fallback, when
/// the handle is dropped.
#[derive(Debug)]
pub struct TempMediaFile {
    path: PathBuf,
    removed: bool,
}

impl TempMediaFile {
    /// Reserves a unique path without creating the file
    pub async fn reserve(dir: Option<&Path>, extension: &str) -> CoreResult<Self> {
        let dir = dir.map(Path::to_path_buf).unwrap_or_else(default_temp_dir);
        tokio::fs::create_dir_all(&dir).await?;

        let extension = extension.trim_start_matches('.');
        let name = if extension.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            format!("{}.{}", uuid::Uuid::new_v4(), extension)
        };

        Ok(Self {
            path: dir.join(name),
            removed: false,
        })
    }

    /// Writes `data` to a new unique file
    pub async fn create(dir: Option<&Path>, extension: &str, data: &[u8]) -> CoreResult<Self> {
        let file = Self::reserve(dir, extension).await?;
        tokio::fs::write(&file.path, data).await?;
        debug!("Created temp media file {} ({} bytes)", file.path.display(), data.len());
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> CoreResult<Vec<u8>> {
        Ok(tokio::fs::read(&self.path).await?)
    }

    /// Deletes the file. A file that was never written is not an error.
    pub async fn remove(mut self) -> CoreResult<()> {
        self.removed = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TempMediaFile {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temp file {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_bytes_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.json");

        atomic_write_bytes(&path, b"one").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one");

        atomic_write_bytes(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        assert!(!dir.path().join("file.json.bak").exists());
        assert!(!dir.path().join("file.json.tmp").exists());
    }

    #[test]
    fn test_validate_path_id_component() {
        assert!(validate_path_id_component("01HXYZ123ABC", "projectId").is_ok());
        assert!(validate_path_id_component("my-project", "projectId").is_ok());

        assert!(validate_path_id_component("", "projectId").is_err());
        assert!(validate_path_id_component("..", "projectId").is_err());
        assert!(validate_path_id_component("foo/bar", "projectId").is_err());
        assert!(validate_path_id_component("C:", "projectId").is_err());
        assert!(validate_path_id_component("foo\0bar", "projectId").is_err());
    }

    #[tokio::test]
    async fn test_validate_local_input_path() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("clip.mp4");
        std::fs::write(&file, b"x").unwrap();

        let ok = validate_local_input_path(file.to_str().unwrap(), "input").await;
        assert_eq!(ok.unwrap(), file);

        let url = validate_local_input_path("https://example.com/a.mp4", "input").await;
        assert!(matches!(url, Err(CoreError::InvalidInput(_))));

        let dir_path = validate_local_input_path(dir.path().to_str().unwrap(), "input").await;
        assert!(dir_path.is_err());
    }

    #[tokio::test]
    async fn test_temp_media_file_lifecycle() {
        let dir = TempDir::new().unwrap();
        let file = TempMediaFile::create(Some(dir.path()), ".wav", b"RIFF").await.unwrap();
        let path = file.path().to_path_buf();

        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("wav"));
        assert_eq!(file.read().await.unwrap(), b"RIFF");

        file.remove().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_temp_media_file_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = {
            let file = TempMediaFile::create(Some(dir.path()), "png", b"x").await.unwrap();
            file.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_reserved_file_removal_is_ok() {
        let dir = TempDir::new().unwrap();
        let file = TempMediaFile::reserve(Some(dir.path()), "mp4").await.unwrap();
        assert!(!file.path().exists());
        file.remove().await.unwrap();
    }
}

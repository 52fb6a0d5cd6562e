//! File writer used by the configure phase and rollback.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

/// Suffix appended to backup copies.
pub const BACKUP_SUFFIX: &str = ".backup";

/// `<path>.backup`.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// File operations needed to install and roll back a package.
#[async_trait]
pub trait FileWriter: Send + Sync {
    /// Copy `path` to its backup path. Returns `None` if `path` does not exist.
    async fn backup_if_exists(&self, path: &Path) -> io::Result<Option<PathBuf>>;

    /// Write `content` to `path`, creating parent directories.
    async fn write(&self, path: &Path, content: &[u8]) -> io::Result<()>;

    /// Move `backup` back over `path`.
    async fn restore(&self, backup: &Path, path: &Path) -> io::Result<()>;

    /// Delete `path`; a missing file is not an error.
    async fn delete(&self, path: &Path) -> io::Result<()>;
}

/// [`FileWriter`] on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFileWriter;

#[async_trait]
impl FileWriter for FsFileWriter {
    async fn backup_if_exists(&self, path: &Path) -> io::Result<Option<PathBuf>> {
        let backup = backup_path(path);
        match tokio::fs::copy(path, &backup).await {
            Ok(_) => {
                debug!(path = %path.display(), backup = %backup.display(), "Backed up file");
                Ok(Some(backup))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await
    }

    async fn restore(&self, backup: &Path, path: &Path) -> io::Result<()> {
        tokio::fs::rename(backup, path).await
    }

    async fn delete(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

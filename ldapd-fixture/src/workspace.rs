use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;
use tracing::debug;

use crate::error::{Error, Result};

/// Directory owned by one fixture, holding the slapd configuration and databases
#[derive(Debug)]
pub enum Workspace {
    /// Private temporary directory, removed on drop
    Temporary(TempDir),
    /// Caller supplied directory, left in place
    Directory(PathBuf),
}

impl Workspace {
    /// Fresh temporary directory
    pub fn temporary() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("ldapd-")
            .tempdir()
            .map_err(|e| Error::workspace("cannot create temporary directory", std::env::temp_dir(), Some(e)))?;
        Ok(Workspace::Temporary(dir))
    }

    /// Wipe `path` recursively and recreate it empty
    pub async fn clean(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if exists(&path).await {
            debug!("removing data directory {}", path.display());
            fs::remove_dir_all(&path)
                .await
                .map_err(|e| Error::workspace("cannot delete", &path, Some(e)))?;
            if exists(&path).await {
                return Err(Error::workspace("still present after delete", &path, None));
            }
        }

        fs::create_dir_all(&path)
            .await
            .map_err(|e| Error::workspace("cannot create", &path, Some(e)))?;

        Ok(Workspace::Directory(path))
    }

    /// Root of the workspace
    pub fn path(&self) -> &Path {
        match self {
            Workspace::Temporary(dir) => dir.path(),
            Workspace::Directory(path) => path,
        }
    }
}

async fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clean_removes_previous_content() {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("data");
        std::fs::create_dir_all(data.join("nested")).unwrap();
        std::fs::write(data.join("nested/old.mdb"), b"stale").unwrap();
        std::fs::write(data.join("slapd.pid"), b"42").unwrap();

        let workspace = Workspace::clean(&data).await.unwrap();

        assert_eq!(workspace.path(), data);
        assert_eq!(std::fs::read_dir(&data).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn clean_creates_missing_directory() {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("a/b/c");

        Workspace::clean(&data).await.unwrap();

        assert!(data.is_dir());
    }

    #[tokio::test]
    async fn clean_fails_on_plain_file() {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("file");
        std::fs::write(&data, b"not a directory").unwrap();

        let err = Workspace::clean(&data).await.unwrap_err();
        assert!(matches!(err, Error::Workspace { .. }), "{err:?}");
    }

    #[test]
    fn temporary_is_removed_on_drop() {
        let workspace = Workspace::temporary().unwrap();
        let path = workspace.path().to_path_buf();
        assert!(path.is_dir());
        drop(workspace);
        assert!(!path.exists());
    }
}

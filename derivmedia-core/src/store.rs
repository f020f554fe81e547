use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::engine::remove_if_exists;
use crate::paths::temp_file_path;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file store io error on {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Where derivative files end up. Paths are relative to the store root.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Moves `source` to `destination`, replacing any existing file.
    async fn put(&self, source: &Path, destination: &str) -> StoreResult<()>;
    /// Removes the file; a missing file is not an error.
    async fn delete(&self, path: &str) -> StoreResult<()>;
    async fn exists(&self, path: &str) -> bool;
    /// Whole file in memory, for backends without a local path.
    async fn contents(&self, path: &str) -> StoreResult<Vec<u8>>;
    /// Local file backing `path`. The derivation engine needs one to feed
    /// external tools directly.
    fn local_path(&self, path: &str) -> StoreResult<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn put(&self, source: &Path, destination: &str) -> StoreResult<()> {
        let target = self.absolute(destination);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        if fs::rename(source, &target).await.is_err() {
            // Cross-device moves fall back to copy and remove.
            copy_into_place(source, &target).await?;
            fs::remove_file(source)
                .await
                .map_err(|err| StoreError::Io {
                    source: err,
                    path: source.to_path_buf(),
                })?;
        }
        set_file_mode(&target).await?;
        debug!(path = %target.display(), "stored file");
        Ok(())
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let target = self.absolute(path);
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                source,
                path: target,
            }),
        }
    }

    async fn exists(&self, path: &str) -> bool {
        fs::metadata(self.absolute(path))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    async fn contents(&self, path: &str) -> StoreResult<Vec<u8>> {
        let target = self.absolute(path);
        fs::read(&target)
            .await
            .map_err(|source| StoreError::Io {
                source,
                path: target,
            })
    }

    fn local_path(&self, path: &str) -> StoreResult<PathBuf> {
        Ok(self.absolute(path))
    }
}

/// Copies `source` beside `target` and renames it over `target`, so readers
/// never see a partial file at the final path.
async fn copy_into_place(source: &Path, target: &Path) -> StoreResult<()> {
    let staged = temp_file_path(target);
    if let Err(err) = fs::copy(source, &staged).await {
        remove_if_exists(&staged).await;
        return Err(StoreError::Io {
            source: err,
            path: staged,
        });
    }
    if let Err(err) = fs::rename(&staged, target).await {
        remove_if_exists(&staged).await;
        return Err(StoreError::Io {
            source: err,
            path: target.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) async fn set_file_mode(path: &Path) -> StoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o664))
        .await
        .map_err(|source| StoreError::Io {
            source,
            path: path.to_path_buf(),
        })
}

#[cfg(not(unix))]
pub(crate) async fn set_file_mode(_path: &Path) -> StoreResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_moves_and_replaces() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(dir.path().join("files"));
        let staged = dir.path().join("staged.tmp.mp3");
        std::fs::write(&staged, b"first").unwrap();
        store.put(&staged, "mp3/a.mp3").await.unwrap();
        assert!(!staged.exists());
        assert!(store.exists("mp3/a.mp3").await);

        std::fs::write(&staged, b"second").unwrap();
        store.put(&staged, "mp3/a.mp3").await.unwrap();
        assert_eq!(store.contents("mp3/a.mp3").await.unwrap(), b"second");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.local_path("mp3/a.mp3").unwrap())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o664);
        }
    }

    #[tokio::test]
    async fn copy_fallback_stages_beside_the_target() {
        let dir = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let target = dir.path().join("large/9.jpg");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"previous").unwrap();
        let source = elsewhere.path().join("frame.jpg");
        std::fs::write(&source, b"fresh frame").unwrap();

        copy_into_place(&source, &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"fresh frame");
        assert!(!dir.path().join("large/9.tmp.jpg").exists());
    }

    #[tokio::test]
    async fn failed_copy_keeps_the_target_untouched() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("large/9.jpg");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"previous").unwrap();
        // A directory cannot be copied as a file.
        let source = dir.path().join("not-a-file");
        std::fs::create_dir_all(&source).unwrap();

        let err = copy_into_place(&source, &target).await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert_eq!(std::fs::read(&target).unwrap(), b"previous");
        assert!(!dir.path().join("large/9.tmp.jpg").exists());
    }

    #[tokio::test]
    async fn delete_ignores_missing_files() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(dir.path());
        store.delete("mp3/none.mp3").await.unwrap();
        assert!(!store.exists("mp3/none.mp3").await);
    }
}

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Storage, StorageError, StorageResult};

/// Storage rooted at a local directory. Keys are relative paths.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn io_error(key: &str, source: std::io::Error) -> StorageError {
        match source.kind() {
            ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            ErrorKind::AlreadyExists => StorageError::AlreadyExists(key.to_string()),
            ErrorKind::PermissionDenied => StorageError::Unauthorized(key.to_string()),
            _ => StorageError::Io {
                key: key.to_string(),
                source,
            },
        }
    }
}

impl Storage for LocalStorage {
    async fn get(&self, key: &str, ignore_missing: bool) -> StorageResult<Option<Vec<u8>>> {
        let file = self.path(key);
        debug!("db read {}", file.display());

        match fs::read(&file).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound && ignore_missing => Ok(None),
            Err(e) => Err(Self::io_error(key, e)),
        }
    }

    async fn put(&self, key: &str, data: &[u8], ignore_existing: bool) -> StorageResult<()> {
        let file = self.path(key);
        debug!("db write {}", file.display());

        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_error(key, e))?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true);
        if ignore_existing {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let mut handle = options
            .open(&file)
            .await
            .map_err(|e| Self::io_error(key, e))?;
        handle
            .write_all(data)
            .await
            .map_err(|e| Self::io_error(key, e))?;
        handle.flush().await.map_err(|e| Self::io_error(key, e))?;
        handle.sync_all().await.map_err(|e| Self::io_error(key, e))?;
        Ok(())
    }

    async fn atomic_put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let tmp_key = format!("{key}.tmp");
        debug!("db careful write {}", self.path(key).display());

        self.put(&tmp_key, data, true).await?;
        fs::rename(self.path(&tmp_key), self.path(key))
            .await
            .map_err(|e| Self::io_error(key, e))
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let file = self.path(key);
        debug!("db delete {}", file.display());

        fs::remove_file(&file)
            .await
            .map_err(|e| Self::io_error(key, e))
    }

    async fn ensure_container(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Self::io_error(&self.root.display().to_string(), e))
    }
}

//! Byte-blob storage shared by the catalogue and the packer.
//!
//! Every key lives in one flat namespace rooted at the configured output
//! location. `db.json`, `.locked` and the pack chunks all go through the
//! [`Storage`] trait; which implementation backs it is decided once by
//! [`Backend::open`].

pub mod local;
pub mod s3;

use std::future::Future;

use thiserror::Error;

pub use local::LocalStorage;
pub use s3::S3Storage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("key \"{0}\" not found")]
    NotFound(String),

    #[error("key \"{0}\" already exists")]
    AlreadyExists(String),

    #[error("unauthorized access to {0}")]
    Unauthorized(String),

    #[error("I/O error on \"{key}\": {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error while communicating with storage: {0}")]
    Transport(String),

    #[error("unsupported output location \"{0}\"")]
    UnsupportedLocation(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Capability set every storage backend provides.
pub trait Storage: Send + Sync {
    /// Read a key. With `ignore_missing` an absent key yields `Ok(None)`,
    /// otherwise it is a [`StorageError::NotFound`].
    fn get(
        &self,
        key: &str,
        ignore_missing: bool,
    ) -> impl Future<Output = StorageResult<Option<Vec<u8>>>> + Send;

    /// Write a key. Unless `ignore_existing` is set, the write fails with
    /// [`StorageError::AlreadyExists`] when the key is already present.
    fn put(
        &self,
        key: &str,
        data: &[u8],
        ignore_existing: bool,
    ) -> impl Future<Output = StorageResult<()>> + Send;

    /// Replace a key so that readers see either the old or the new value.
    fn atomic_put(&self, key: &str, data: &[u8]) -> impl Future<Output = StorageResult<()>> + Send;

    fn remove(&self, key: &str) -> impl Future<Output = StorageResult<()>> + Send;

    /// Make sure the root container exists before the first write.
    fn ensure_container(&self) -> impl Future<Output = StorageResult<()>> + Send;
}

/// The backend selected from the output location.
#[derive(Debug)]
pub enum Backend {
    Local(LocalStorage),
    S3(S3Storage),
}

impl Backend {
    /// Parse an output location: a plain path is a local directory,
    /// `s3://bucket/prefix` is object storage.
    pub fn open(location: &str) -> StorageResult<Self> {
        match url::Url::parse(location) {
            Ok(parsed) if parsed.scheme() == "s3" => {
                let bucket = parsed
                    .host_str()
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| StorageError::UnsupportedLocation(location.to_string()))?;
                let prefix = parsed.path().trim_matches('/');
                Ok(Backend::S3(S3Storage::from_env(bucket, prefix)?))
            }
            // Windows drive letters parse as one-letter schemes.
            Ok(parsed) if parsed.scheme().len() > 1 => {
                Err(StorageError::UnsupportedLocation(location.to_string()))
            }
            _ => Ok(Backend::Local(LocalStorage::new(location))),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Backend::Local(local) => local.root().display().to_string(),
            Backend::S3(s3) => s3.to_string(),
        }
    }
}

impl Storage for Backend {
    async fn get(&self, key: &str, ignore_missing: bool) -> StorageResult<Option<Vec<u8>>> {
        match self {
            Backend::Local(s) => s.get(key, ignore_missing).await,
            Backend::S3(s) => s.get(key, ignore_missing).await,
        }
    }

    async fn put(&self, key: &str, data: &[u8], ignore_existing: bool) -> StorageResult<()> {
        match self {
            Backend::Local(s) => s.put(key, data, ignore_existing).await,
            Backend::S3(s) => s.put(key, data, ignore_existing).await,
        }
    }

    async fn atomic_put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        match self {
            Backend::Local(s) => s.atomic_put(key, data).await,
            Backend::S3(s) => s.atomic_put(key, data).await,
        }
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        match self {
            Backend::Local(s) => s.remove(key).await,
            Backend::S3(s) => s.remove(key).await,
        }
    }

    async fn ensure_container(&self) -> StorageResult<()> {
        match self {
            Backend::Local(s) => s.ensure_container().await,
            Backend::S3(s) => s.ensure_container().await,
        }
    }
}

use std::fmt;
use std::sync::Arc;

use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use tracing::debug;

use super::{Storage, StorageError, StorageResult};

/// Storage in an S3 bucket under an optional key prefix.
///
/// Credentials and region come from the usual `AWS_*` environment.
pub struct S3Storage {
    bucket: String,
    prefix: String,
    store: Arc<dyn ObjectStore>,
}

impl S3Storage {
    pub fn from_env(bucket: &str, prefix: &str) -> StorageResult<Self> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_conditional_put(S3ConditionalPut::ETagMatch)
            .build()
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        Ok(Self::with_store(bucket, prefix, Arc::new(store)))
    }

    /// Wrap an already configured object store.
    pub fn with_store(bucket: &str, prefix: &str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            store,
        }
    }

    fn path(&self, key: &str) -> Path {
        if self.prefix.is_empty() {
            Path::from(key)
        } else {
            Path::from(format!("{}/{}", self.prefix, key))
        }
    }

    fn map_error(&self, key: &str, err: object_store::Error) -> StorageError {
        match err {
            object_store::Error::NotFound { .. } => StorageError::NotFound(key.to_string()),
            object_store::Error::AlreadyExists { .. }
            | object_store::Error::Precondition { .. } => {
                StorageError::AlreadyExists(key.to_string())
            }
            object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. } => {
                StorageError::Unauthorized(format!("s3://{}", self.bucket))
            }
            other => StorageError::Transport(other.to_string()),
        }
    }
}

impl fmt::Display for S3Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.prefix)
    }
}

impl fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl Storage for S3Storage {
    async fn get(&self, key: &str, ignore_missing: bool) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path(key);
        debug!("db read s3://{}/{}", self.bucket, path);

        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) if ignore_missing => return Ok(None),
            Err(e) => return Err(self.map_error(key, e)),
        };
        let bytes = result.bytes().await.map_err(|e| self.map_error(key, e))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn put(&self, key: &str, data: &[u8], ignore_existing: bool) -> StorageResult<()> {
        let path = self.path(key);
        debug!("db write s3://{}/{}", self.bucket, path);

        let mode = if ignore_existing {
            PutMode::Overwrite
        } else {
            PutMode::Create
        };
        self.store
            .put_opts(&path, PutPayload::from(data.to_vec()), PutOptions::from(mode))
            .await
            .map_err(|e| self.map_error(key, e))?;
        Ok(())
    }

    async fn atomic_put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        // Single-object writes are already atomic on S3.
        self.put(key, data, true).await
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.path(key);
        debug!("db delete s3://{}/{}", self.bucket, path);

        self.store
            .delete(&path)
            .await
            .map_err(|e| self.map_error(key, e))
    }

    async fn ensure_container(&self) -> StorageResult<()> {
        Ok(())
    }
}

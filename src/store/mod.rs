//! Object storage interface
//!
//! The report pipeline streams finished objects into an [`ObjectStore`]. The
//! store is an external collaborator in production; [`MemoryStore`] is the
//! in-tree implementation used by tests.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object size mismatch: declared {declared}, got {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Destination for finished objects.
///
/// `size` must equal the number of bytes `reader` yields; implementations
/// reject mismatches so truncated uploads never produce a stored object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        size: u64,
    ) -> Result<(), StoreError>;
}

/// In-memory object store.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn object_key(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }

    /// Fetch a stored object.
    pub async fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .await
            .get(&Self::object_key(bucket, key))
            .cloned()
    }

    /// List all stored object keys.
    pub async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        size: u64,
    ) -> Result<(), StoreError> {
        let mut data = Vec::with_capacity(size as usize);
        reader.read_to_end(&mut data).await?;
        if data.len() as u64 != size {
            return Err(StoreError::SizeMismatch {
                declared: size,
                actual: data.len() as u64,
            });
        }
        self.objects
            .lock()
            .await
            .insert(Self::object_key(bucket, key), data);
        Ok(())
    }
}

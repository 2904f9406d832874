//! Object storage seam.
//!
//! Listings of this store are the only source of truth the pipeline has: a
//! segment is "new" when it shows up under the input prefix, and a merge is
//! "done" when its canonical blob exists.

mod memory;
mod s3;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::info;
use tokio::fs;

use crate::error::Result;

pub use memory::MemoryBlobStore;
pub use s3::S3BlobStore;

/// One object returned by [`BlobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    /// Full object path, prefix included.
    pub path: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write (or overwrite) an object.
    async fn put(&self, path: &str, body: Bytes, content_type: &str) -> Result<()>;

    /// Every object whose path starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>>;

    /// Full object contents. A missing object is [`crate::Error::NotFound`].
    async fn get(&self, path: &str) -> Result<Bytes>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Location string handed to external services that read the object directly.
    fn uri(&self, path: &str) -> String;
}

/// Uploads the local file at `file_path` to `object_path`.
pub async fn upload_file(
    store: &dyn BlobStore,
    file_path: &Path,
    object_path: &str,
    content_type: &str,
) -> Result<()> {
    let file_bytes = fs::read(file_path).await?;
    let size = file_bytes.len();
    store
        .put(object_path, Bytes::from(file_bytes), content_type)
        .await?;
    info!(
        "Uploaded {} ({} bytes) to {}",
        file_path.display(),
        size,
        store.uri(object_path)
    );
    Ok(())
}

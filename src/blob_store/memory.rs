use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{BlobEntry, BlobStore};
use crate::error::{Error, Result};

struct StoredBlob {
    body: Bytes,
    created_at: DateTime<Utc>,
}

/// Process-local store for dry runs and tests.
pub struct MemoryBlobStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredBlob>>,
    fail_writes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: RwLock::new(BTreeMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Store an object with an explicit creation time.
    pub fn put_at(&self, path: &str, body: impl Into<Bytes>, created_at: DateTime<Utc>) {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.insert(
            path.to_string(),
            StoredBlob {
                body: body.into(),
                created_at,
            },
        );
    }

    /// Make every subsequent `put` fail until switched back off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Paths currently stored under `prefix`, in order.
    pub fn paths(&self, prefix: &str) -> Vec<String> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, body: Bytes, _content_type: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("write to {} rejected", path)));
        }
        self.put_at(path, body, Utc::now());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, blob)| BlobEntry {
                path: path.clone(),
                created_at: blob.created_at,
            })
            .collect())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        objects
            .get(path)
            .map(|blob| blob.body.clone())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        Ok(objects.contains_key(path))
    }

    fn uri(&self, path: &str) -> String {
        format!("memory://{}/{}", self.bucket, path)
    }
}

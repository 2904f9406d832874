use async_trait::async_trait;
use aws_config::{meta::region::RegionProviderChain, BehaviorVersion};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::debug;

use super::{BlobEntry, BlobStore};
use crate::error::{Error, Result};

pub struct S3BlobStore {
    client: Client,
    bucket: String,
    /// Optional endpoint override (for example, "http://127.0.0.1:9000" for MinIO)
    endpoint: Option<String>,
}

impl S3BlobStore {
    /// Creates a new S3BlobStore.
    ///
    /// * `bucket` - The S3 bucket name.
    /// * `region` - Used when the environment does not provide one.
    /// * `endpoint` - An optional endpoint override (pass, for example, Some("http://127.0.0.1:9000")
    ///   to use a local S3-compatible service like MinIO). Path-style addressing is forced
    ///   when an override is given.
    pub async fn new(bucket: &str, region: &str, endpoint: Option<&str>) -> Self {
        let region_provider = RegionProviderChain::first_try(Some(region.to_string()).map(Region::new))
            .or_default_provider()
            .or_else(Region::new("us-east-1"));

        let shared_config = aws_config::defaults(BehaviorVersion::v2024_03_28())
            .region(region_provider)
            .load()
            .await;

        let mut config = aws_sdk_s3::config::Builder::from(&shared_config);
        if let Some(ep) = endpoint {
            config = config.endpoint_url(ep).force_path_style(true);
        }

        S3BlobStore {
            client: Client::from_conf(config.build()),
            bucket: bucket.to_string(),
            endpoint: endpoint.map(|s| s.to_string()),
        }
    }

    /// HTTP URL of an object, for log lines.
    pub fn object_url(&self, path: &str) -> String {
        if let Some(ref ep) = self.endpoint {
            let trimmed = ep.trim_end_matches('/');
            format!("{}/{}/{}", trimmed, self.bucket, path)
        } else {
            format!("https://{}.s3.amazonaws.com/{}", self.bucket, path)
        }
    }
}

fn storage_error<E>(op: &str, path: &str, err: E) -> Error
where
    E: std::error::Error + 'static,
{
    Error::Storage(format!("{} {}: {}", op, path, DisplayErrorContext(&err)))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, path: &str, body: Bytes, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .content_type(content_type)
            .cache_control("no-cache")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| storage_error("put", path, e))?;

        debug!("Wrote {}", self.object_url(path));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| storage_error("list", prefix, e))?;

            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };
                let created_at = obj
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
                    .unwrap_or_default();
                entries.push(BlobEntry {
                    path: key.to_string(),
                    created_at,
                });
            }

            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(entries)
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(Error::NotFound(path.to_string()));
            }
            Err(e) => return Err(storage_error("get", path, e)),
        };

        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| storage_error("read", path, e))?;
        Ok(body.into_bytes())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(storage_error("head", path, e)),
        }
    }

    fn uri(&self, path: &str) -> String {
        format!("s3://{}/{}", self.bucket, path)
    }
}

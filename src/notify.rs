use std::time::Duration;

use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestNotice<'a> {
    bucket_name: &'a str,
    object_key: &'a str,
}

/// Tells the external ingestion service that a new segment landed.
pub struct IngestNotifier {
    http: reqwest::Client,
    url: String,
    bucket: String,
    timeout: Duration,
}

impl IngestNotifier {
    pub fn new(url: &str, bucket: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            bucket: bucket.to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    /// POST `{bucketName, objectKey}`. A non-2xx answer is an error.
    pub async fn notify(&self, object_key: &str) -> Result<()> {
        self.http
            .post(&self.url)
            .timeout(self.timeout)
            .json(&IngestNotice {
                bucket_name: &self.bucket,
                object_key,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

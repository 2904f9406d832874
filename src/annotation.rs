//! Long-running video annotation jobs.
//!
//! The daemon only needs two things from the annotation service: a way to
//! submit a stored segment and a way to learn when the job's output document
//! has been written. Completion latency is unbounded, so callers await it in a
//! task of its own.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};

/// What to annotate and where the job should write its output document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationRequest {
    pub input_uri: String,
    pub output_uri: String,
    /// Blob path behind `output_uri`.
    pub output_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    /// Operation name assigned by the service.
    pub name: String,
    pub output_path: String,
}

#[async_trait]
pub trait AnnotationJobClient: Send + Sync {
    async fn submit(&self, request: &AnnotationRequest) -> Result<JobHandle>;

    /// Resolves to the blob path of the job's output document.
    async fn await_completion(&self, handle: &JobHandle) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

/// Client for a `videos:annotate` style long-running-operation REST API.
pub struct HttpAnnotationClient {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    poll_interval: Duration,
    timeout: Duration,
}

impl HttpAnnotationClient {
    pub fn new(endpoint: &str, token: Option<String>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            poll_interval,
            timeout,
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn fetch_operation(&self, name: &str) -> Result<Operation> {
        let url = format!("{}/v1/{}", self.endpoint, name);
        let op = self
            .authorize(self.http.get(&url))
            .send()
            .await?
            .error_for_status()?
            .json::<Operation>()
            .await?;
        Ok(op)
    }

    async fn poll_until_done(&self, handle: &JobHandle) -> Result<String> {
        loop {
            let op = self.fetch_operation(&handle.name).await?;
            if let Some(err) = op.error {
                return Err(Error::Annotation(format!(
                    "operation {} failed ({}): {}",
                    handle.name, err.code, err.message
                )));
            }
            if op.done {
                return Ok(handle.output_path.clone());
            }
            debug!("Operation {} still running", handle.name);
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Request body for one segment: faces, tracked objects and explicit content,
/// with person, face and speech context.
pub fn annotate_body(request: &AnnotationRequest) -> serde_json::Value {
    json!({
        "inputUri": request.input_uri,
        "outputUri": request.output_uri,
        "features": ["FACE_DETECTION", "OBJECT_TRACKING", "EXPLICIT_CONTENT_DETECTION"],
        "videoContext": {
            "speechTranscriptionConfig": {
                "languageCode": "en-US",
                "enableAutomaticPunctuation": true
            },
            "personDetectionConfig": {
                "includeBoundingBoxes": true,
                "includeAttributes": false,
                "includePoseLandmarks": true
            },
            "faceDetectionConfig": {
                "includeBoundingBoxes": true,
                "includeAttributes": true
            }
        }
    })
}

#[async_trait]
impl AnnotationJobClient for HttpAnnotationClient {
    async fn submit(&self, request: &AnnotationRequest) -> Result<JobHandle> {
        let url = format!("{}/v1/videos:annotate", self.endpoint);
        let op = self
            .authorize(self.http.post(&url))
            .json(&annotate_body(request))
            .send()
            .await?
            .error_for_status()?
            .json::<Operation>()
            .await?;

        info!("Processing video '{}' as operation {}", request.input_uri, op.name);
        Ok(JobHandle {
            name: op.name,
            output_path: request.output_path.clone(),
        })
    }

    async fn await_completion(&self, handle: &JobHandle) -> Result<String> {
        match tokio::time::timeout(self.timeout, self.poll_until_done(handle)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Annotation(format!(
                "operation {} did not finish within {:?}",
                handle.name, self.timeout
            ))),
        }
    }
}

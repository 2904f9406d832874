use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Which [`crate::blob_store::BlobStore`] implementation the daemon talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(StorageBackend::S3),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(Error::Config(format!("unknown STORAGE_BACKEND '{}'", other))),
        }
    }
}

/// Blob store layout. Prefixes carry their trailing slash.
#[derive(Debug, Clone)]
pub struct Prefixes {
    pub input: String,
    pub temp_output: String,
    pub secondary_output: String,
    pub final_output: String,
    pub view_output: String,
}

impl Prefixes {
    /// Rolling pointer to the most recent merged document.
    pub fn latest_merged_path(&self) -> String {
        format!("{}final_output.json", self.view_output)
    }

    /// Rolling pointer to the most recently finalized video.
    pub fn latest_view_video_path(&self) -> String {
        format!("{}final_output.mp4", self.view_output)
    }
}

impl Default for Prefixes {
    fn default() -> Self {
        Self {
            input: "visualize-input/".into(),
            temp_output: "temp-output-json-files/".into(),
            secondary_output: "visualize-aws-output-files/".into(),
            final_output: "visualize-final-output-files/".into(),
            view_output: "visualize-view-final-output-files/".into(),
        }
    }
}

/// Daemon configuration loaded from environment variables.
///
/// Only `STORAGE_BUCKET` is mandatory, and only with the S3 backend.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: StorageBackend,
    pub bucket: String,
    pub s3_endpoint: Option<String>,
    pub region: String,
    pub prefixes: Prefixes,
    pub rtsp_url: String,
    pub segment_dir: PathBuf,
    pub latest_final_path: PathBuf,
    pub segment_duration: Duration,
    pub poll_interval: Duration,
    pub video_extensions: Vec<String>,
    pub ingest_notify_url: Option<String>,
    pub annotation_endpoint: String,
    pub annotation_token: Option<String>,
    pub annotation_poll: Duration,
    pub annotation_timeout: Duration,
    /// `None` disables the merge sweeper.
    pub merge_sweep: Option<Duration>,
    pub retention_max_age: Duration,
    pub retention_interval: Duration,
    pub host: String,
    pub port: u16,
}

impl Config {
    /// Load configuration from the process environment (and `.env` if present).
    ///
    /// | Env Var                   | Default                                          |
    /// |---------------------------|--------------------------------------------------|
    /// | `STORAGE_BACKEND`         | `s3`                                             |
    /// | `STORAGE_BUCKET`          | required for `s3`                                |
    /// | `S3_ENDPOINT`             | unset                                            |
    /// | `AWS_REGION`              | `us-east-1`                                      |
    /// | `RTSP_URL`                | `rtsp://210.99.70.120:1935/live/cctv005.stream`  |
    /// | `SEGMENT_DIR`             | `uploads/videos`                                 |
    /// | `LATEST_FINAL_PATH`       | `uploads/videos/finalVideo/final_output.mp4`     |
    /// | `SEGMENT_SECS`            | `15`                                             |
    /// | `POLL_INTERVAL_SECS`      | `5`                                              |
    /// | `VIDEO_EXTENSIONS`        | `mp4`                                            |
    /// | `INGEST_NOTIFY_URL`       | unset                                            |
    /// | `ANNOTATION_ENDPOINT`     | `https://videointelligence.googleapis.com`       |
    /// | `ANNOTATION_TOKEN`        | unset                                            |
    /// | `ANNOTATION_POLL_SECS`    | `10`                                             |
    /// | `ANNOTATION_TIMEOUT_SECS` | `1800`                                           |
    /// | `MERGE_SWEEP_SECS`        | `30` (`0` disables)                              |
    /// | `RETENTION_HOURS`         | `6`                                              |
    /// | `RETENTION_INTERVAL_SECS` | `600`                                            |
    /// | `HOST` / `PORT`           | `0.0.0.0` / `8080`                               |
    ///
    /// The `*_PREFIX` variables override [`Prefixes::default`].
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match get("STORAGE_BACKEND") {
            Some(v) => v.parse()?,
            None => StorageBackend::S3,
        };
        let bucket = match (get("STORAGE_BUCKET"), backend) {
            (Some(b), _) => b,
            (None, StorageBackend::Memory) => "local".to_string(),
            (None, StorageBackend::S3) => {
                return Err(Error::Config("STORAGE_BUCKET must be set".into()))
            }
        };

        let defaults = Prefixes::default();
        let prefixes = Prefixes {
            input: prefix(get("INPUT_PREFIX"), defaults.input),
            temp_output: prefix(get("TEMP_OUTPUT_PREFIX"), defaults.temp_output),
            secondary_output: prefix(get("SECONDARY_OUTPUT_PREFIX"), defaults.secondary_output),
            final_output: prefix(get("FINAL_OUTPUT_PREFIX"), defaults.final_output),
            view_output: prefix(get("VIEW_OUTPUT_PREFIX"), defaults.view_output),
        };

        let video_extensions = get("VIDEO_EXTENSIONS")
            .unwrap_or_else(|| "mp4".into())
            .split(',')
            .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if video_extensions.is_empty() {
            return Err(Error::Config("VIDEO_EXTENSIONS must name at least one extension".into()));
        }

        let merge_sweep_secs: u64 = parse_or(&get, "MERGE_SWEEP_SECS", 30)?;
        let retention_hours: u64 = parse_or(&get, "RETENTION_HOURS", 6)?;

        Ok(Self {
            backend,
            bucket,
            s3_endpoint: get("S3_ENDPOINT"),
            region: get("AWS_REGION").unwrap_or_else(|| "us-east-1".into()),
            prefixes,
            rtsp_url: get("RTSP_URL")
                .unwrap_or_else(|| "rtsp://210.99.70.120:1935/live/cctv005.stream".into()),
            segment_dir: get("SEGMENT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("uploads/videos")),
            latest_final_path: get("LATEST_FINAL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("uploads/videos/finalVideo/final_output.mp4")),
            segment_duration: secs(parse_or(&get, "SEGMENT_SECS", 15)?, "SEGMENT_SECS")?,
            poll_interval: secs(parse_or(&get, "POLL_INTERVAL_SECS", 5)?, "POLL_INTERVAL_SECS")?,
            video_extensions,
            ingest_notify_url: get("INGEST_NOTIFY_URL"),
            annotation_endpoint: get("ANNOTATION_ENDPOINT")
                .unwrap_or_else(|| "https://videointelligence.googleapis.com".into()),
            annotation_token: get("ANNOTATION_TOKEN"),
            annotation_poll: secs(parse_or(&get, "ANNOTATION_POLL_SECS", 10)?, "ANNOTATION_POLL_SECS")?,
            annotation_timeout: secs(
                parse_or(&get, "ANNOTATION_TIMEOUT_SECS", 1800)?,
                "ANNOTATION_TIMEOUT_SECS",
            )?,
            merge_sweep: (merge_sweep_secs > 0).then(|| Duration::from_secs(merge_sweep_secs)),
            retention_max_age: Duration::from_secs(retention_hours * 3600),
            retention_interval: secs(
                parse_or(&get, "RETENTION_INTERVAL_SECS", 600)?,
                "RETENTION_INTERVAL_SECS",
            )?,
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "PORT", 8080)?,
        })
    }
}

fn prefix(value: Option<String>, default: String) -> String {
    match value {
        Some(mut p) => {
            if !p.ends_with('/') {
                p.push('/');
            }
            p
        }
        None => default,
    }
}

fn parse_or<T, F>(get: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}

fn secs(value: u64, key: &str) -> Result<Duration> {
    if value == 0 {
        return Err(Error::Config(format!("{} must be greater than zero", key)));
    }
    Ok(Duration::from_secs(value))
}

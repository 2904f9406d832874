use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use regex::Regex;

const KEY_FORMAT: &str = "%Y%m%d_%H%M%S";

static KEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{8}_\d{6}").expect("valid regex"));

/// `YYYYMMDD_HHMMSS` join key shared by a segment and every artifact derived from it.
///
/// Keys sort lexicographically in chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimestampKey(String);

impl TimestampKey {
    /// Pull the first `YYYYMMDD_HHMMSS` run out of an object or file name.
    pub fn extract(name: &str) -> Option<Self> {
        KEY_RE.find(name).map(|m| TimestampKey(m.as_str().to_string()))
    }

    pub fn from_datetime(at: NaiveDateTime) -> Self {
        TimestampKey(at.format(KEY_FORMAT).to_string())
    }

    /// Key for the local wall clock, which is what the segment overlay shows.
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TimestampKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `temp_<key>.mp4`
pub fn segment_file_name(key: &TimestampKey) -> String {
    format!("temp_{}.mp4", key)
}

/// `<segment stem>-<UTC YYYYMMDD_HHMMSS>.json`, the name an annotation job writes its output under.
pub fn job_output_name(segment_name: &str, at: DateTime<Utc>) -> String {
    let stem = Path::new(segment_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(segment_name);
    format!("{}-{}.json", stem, at.format(KEY_FORMAT))
}

/// `merged_<key>.json`
pub fn merged_file_name(key: &TimestampKey) -> String {
    format!("merged_{}.json", key)
}

/// Final path component of a blob path.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

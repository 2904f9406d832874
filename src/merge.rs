//! Timestamp-keyed join of the primary annotation output with its secondary
//! partner document.
//!
//! Exactly-once merging rests on the store alone: the canonical
//! `merged_<key>.json` blob is checked before any download, so duplicate
//! completion notifications and overlapping sweeps are no-ops.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::blob_store::BlobStore;
use crate::error::{Error, Result};
use crate::recorder::Cutover;
use crate::timestamp::{base_name, merged_file_name, TimestampKey};

/// Field of the primary document holding per-segment annotation results.
pub const RESULTS_FIELD: &str = "annotation_results";
/// Sub-section copied out of the secondary document.
pub const SECONDARY_SECTION: &str = "explicit_annotation";

/// Result of one reconciliation attempt. Failures are logged where they happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { key: TimestampKey, path: String },
    /// The artifact name carries no timestamp key.
    Unkeyed,
    /// The partner artifact has not landed yet.
    NoPartner(TimestampKey),
    AlreadyMerged(TimestampKey),
    Failed(TimestampKey),
}

#[derive(Debug, Clone)]
pub struct MergeLayout {
    pub primary_prefix: String,
    pub secondary_prefix: String,
    pub final_prefix: String,
    pub latest_merged_path: String,
}

/// Inject the secondary document's [`SECONDARY_SECTION`] into the primary's first
/// annotation result, synthesising that result when the primary has none.
pub fn merge_documents(mut primary: Value, secondary: &Value) -> std::result::Result<Value, String> {
    let section = secondary
        .get(SECONDARY_SECTION)
        .cloned()
        .unwrap_or_else(|| json!({}));

    let Some(doc) = primary.as_object_mut() else {
        return Err("primary document is not a JSON object".to_string());
    };

    match doc.get_mut(RESULTS_FIELD).and_then(Value::as_array_mut) {
        Some(results) if !results.is_empty() => {
            let Some(first) = results[0].as_object_mut() else {
                return Err(format!("first entry of {} is not an object", RESULTS_FIELD));
            };
            first.insert(SECONDARY_SECTION.to_string(), section);
        }
        _ => {
            doc.insert(
                RESULTS_FIELD.to_string(),
                json!([{
                    "face_detection_annotations": [],
                    "explicit_annotation": section,
                    "object_annotations": []
                }]),
            );
        }
    }

    Ok(primary)
}

pub struct MergeReconciler {
    store: Arc<dyn BlobStore>,
    layout: MergeLayout,
    cutover: Option<Arc<dyn Cutover>>,
    /// Held from the existence check through both writes.
    reconcile_lock: Mutex<()>,
}

impl MergeReconciler {
    pub fn new(store: Arc<dyn BlobStore>, layout: MergeLayout) -> Self {
        Self {
            store,
            layout,
            cutover: None,
            reconcile_lock: Mutex::new(()),
        }
    }

    /// Cut the recording over after every successful merge.
    pub fn with_cutover(mut self, cutover: Arc<dyn Cutover>) -> Self {
        self.cutover = Some(cutover);
        self
    }

    pub fn merged_path(&self, key: &TimestampKey) -> String {
        format!("{}{}", self.layout.final_prefix, merged_file_name(key))
    }

    /// Called when an annotation job's output document has been written.
    /// `artifact` is either a bare file name or a path under the primary prefix.
    pub async fn on_annotation_ready(&self, artifact: &str) -> MergeOutcome {
        let primary_path = qualify(&self.layout.primary_prefix, artifact);
        let Some(key) = TimestampKey::extract(base_name(&primary_path)) else {
            warn!("No timestamp found in: {}", primary_path);
            return MergeOutcome::Unkeyed;
        };

        let partners = match self.keyed_artifacts(&self.layout.secondary_prefix).await {
            Ok(partners) => partners,
            Err(e) => {
                error!("Failed to list {}: {}", self.layout.secondary_prefix, e);
                return MergeOutcome::Failed(key);
            }
        };
        let Some(secondary_path) = partners.get(&key) else {
            info!("==> No matching secondary document for {}", key);
            return MergeOutcome::NoPartner(key);
        };

        let outcome = self.reconcile(&key, &primary_path, secondary_path).await;
        if matches!(outcome, MergeOutcome::Merged { .. }) {
            self.cut_over().await;
        }
        outcome
    }

    /// Mirror of [`Self::on_annotation_ready`] for when the secondary document lands last.
    pub async fn on_secondary_ready(&self, artifact: &str) -> MergeOutcome {
        let secondary_path = qualify(&self.layout.secondary_prefix, artifact);
        let Some(key) = TimestampKey::extract(base_name(&secondary_path)) else {
            warn!("No timestamp found in: {}", secondary_path);
            return MergeOutcome::Unkeyed;
        };

        let partners = match self.keyed_artifacts(&self.layout.primary_prefix).await {
            Ok(partners) => partners,
            Err(e) => {
                error!("Failed to list {}: {}", self.layout.primary_prefix, e);
                return MergeOutcome::Failed(key);
            }
        };
        let Some(primary_path) = partners.get(&key) else {
            info!("==> No matching annotation output for {}", key);
            return MergeOutcome::NoPartner(key);
        };

        let outcome = self.reconcile(&key, primary_path, &secondary_path).await;
        if matches!(outcome, MergeOutcome::Merged { .. }) {
            self.cut_over().await;
        }
        outcome
    }

    /// Merge every key present under both prefixes that has no merged document yet,
    /// oldest first. Cuts over once if anything was merged.
    pub async fn sweep(&self) -> Vec<MergeOutcome> {
        let listed = tokio::try_join!(
            self.keyed_artifacts(&self.layout.primary_prefix),
            self.keyed_artifacts(&self.layout.secondary_prefix),
            self.keyed_artifacts(&self.layout.final_prefix),
        );
        let (primaries, secondaries, merged) = match listed {
            Ok(listed) => listed,
            Err(e) => {
                error!("Merge sweep listing failed: {}", e);
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for (key, primary_path) in &primaries {
            if merged.contains_key(key) {
                continue;
            }
            let Some(secondary_path) = secondaries.get(key) else {
                continue;
            };
            outcomes.push(self.reconcile(key, primary_path, secondary_path).await);
        }

        if outcomes
            .iter()
            .any(|o| matches!(o, MergeOutcome::Merged { .. }))
        {
            self.cut_over().await;
        }
        outcomes
    }

    /// Periodically [`sweep`](Self::sweep) until `cancel` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        info!("Merge sweeper started (every {}s)", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Merge sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let outcomes = self.sweep().await;
                    if !outcomes.is_empty() {
                        info!("Merge sweep reconciled {} pending pair(s)", outcomes.len());
                    }
                }
            }
        }
    }

    /// Map of timestamp key → object path under `prefix`. When two objects share
    /// a key the most recently created wins.
    async fn keyed_artifacts(&self, prefix: &str) -> Result<BTreeMap<TimestampKey, String>> {
        let mut entries = self.store.list(prefix).await?;
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut keyed = BTreeMap::new();
        for entry in entries {
            match TimestampKey::extract(base_name(&entry.path)) {
                Some(key) => {
                    keyed.insert(key, entry.path);
                }
                None => debug!("Skipping unkeyed artifact {}", entry.path),
            }
        }
        Ok(keyed)
    }

    async fn reconcile(
        &self,
        key: &TimestampKey,
        primary_path: &str,
        secondary_path: &str,
    ) -> MergeOutcome {
        let _guard = self.reconcile_lock.lock().await;
        match self.try_reconcile(key, primary_path, secondary_path).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Merge for {} failed: {}", key, e);
                MergeOutcome::Failed(key.clone())
            }
        }
    }

    async fn try_reconcile(
        &self,
        key: &TimestampKey,
        primary_path: &str,
        secondary_path: &str,
    ) -> Result<MergeOutcome> {
        let merged_path = self.merged_path(key);
        if self.store.exists(&merged_path).await? {
            info!("==> Merged document already exists: {}", merged_path);
            return Ok(MergeOutcome::AlreadyMerged(key.clone()));
        }

        info!(
            "Matched documents for {}\n=> secondary: {}\n=> primary: {}",
            key, secondary_path, primary_path
        );
        let primary_raw = self.store.get(primary_path).await?;
        let secondary_raw = self.store.get(secondary_path).await?;

        let primary: Value = serde_json::from_slice(&primary_raw)
            .map_err(|e| Error::malformed(primary_path, e))?;
        let secondary: Value = serde_json::from_slice(&secondary_raw)
            .map_err(|e| Error::malformed(secondary_path, e))?;

        let merged = merge_documents(primary, &secondary)
            .map_err(|reason| Error::malformed(primary_path, reason))?;
        let body = Bytes::from(
            serde_json::to_vec(&merged).map_err(|e| Error::malformed(&merged_path, e))?,
        );

        self.store
            .put(&merged_path, body.clone(), "application/json")
            .await?;
        info!("==> Merged document saved: {}", self.store.uri(&merged_path));

        self.store
            .put(&self.layout.latest_merged_path, body, "application/json")
            .await?;
        info!(
            "==> Latest merged document updated: {}",
            self.store.uri(&self.layout.latest_merged_path)
        );

        Ok(MergeOutcome::Merged {
            key: key.clone(),
            path: merged_path,
        })
    }

    async fn cut_over(&self) {
        if let Some(cutover) = &self.cutover {
            if let Err(e) = cutover.cut_over().await {
                error!("Recording cutover after merge failed: {}", e);
            }
        }
    }
}

fn qualify(prefix: &str, name: &str) -> String {
    if name.starts_with(prefix) {
        name.to_string()
    } else {
        format!("{}{}", prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryBlobStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use crate::blob_store::BlobEntry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingCutover {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Cutover for CountingCutover {
        async fn cut_over(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn layout() -> MergeLayout {
        MergeLayout {
            primary_prefix: "tmp/".into(),
            secondary_prefix: "aws/".into(),
            final_prefix: "final/".into(),
            latest_merged_path: "view/final_output.json".into(),
        }
    }

    fn setup() -> (Arc<MemoryBlobStore>, Arc<CountingCutover>, MergeReconciler) {
        let store = Arc::new(MemoryBlobStore::new("test"));
        let cutover = Arc::new(CountingCutover::default());
        let reconciler = MergeReconciler::new(store.clone(), layout()).with_cutover(cutover.clone());
        (store, cutover, reconciler)
    }

    fn put_json(store: &MemoryBlobStore, path: &str, value: Value) {
        store.put_at(path, serde_json::to_vec(&value).unwrap(), Utc::now());
    }

    async fn read_json(store: &MemoryBlobStore, path: &str) -> Value {
        serde_json::from_slice(&store.get(path).await.unwrap()).unwrap()
    }

    const PRIMARY: &str = "temp_20250101_120000-20250101_120012.json";

    #[test]
    fn empty_primary_gets_synthesised_entry() {
        let merged = merge_documents(
            json!({ "annotation_results": [] }),
            &json!({ "explicit_annotation": { "frames": [1] } }),
        )
        .unwrap();

        let results = merged["annotation_results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["explicit_annotation"], json!({ "frames": [1] }));
        assert_eq!(results[0]["face_detection_annotations"], json!([]));
        assert_eq!(results[0]["object_annotations"], json!([]));
    }

    #[test]
    fn primary_without_results_field_gets_synthesised_entry() {
        let merged = merge_documents(json!({ "version": 1 }), &json!({})).unwrap();
        assert_eq!(merged["version"], 1);
        assert_eq!(merged["annotation_results"][0]["explicit_annotation"], json!({}));
    }

    #[test]
    fn only_first_entry_is_mutated() {
        let primary = json!({
            "annotation_results": [
                { "object_annotations": ["car"] },
                { "object_annotations": ["dog"] }
            ]
        });
        let merged = merge_documents(primary, &json!({ "explicit_annotation": { "x": 1 } })).unwrap();

        assert_eq!(merged["annotation_results"][0]["object_annotations"], json!(["car"]));
        assert_eq!(merged["annotation_results"][0]["explicit_annotation"], json!({ "x": 1 }));
        assert_eq!(merged["annotation_results"][1], json!({ "object_annotations": ["dog"] }));
    }

    #[test]
    fn missing_secondary_section_becomes_empty_object() {
        let merged = merge_documents(
            json!({ "annotation_results": [{}] }),
            &json!({ "other": true }),
        )
        .unwrap();
        assert_eq!(merged["annotation_results"][0]["explicit_annotation"], json!({}));
    }

    #[test]
    fn non_object_documents_are_rejected() {
        assert!(merge_documents(json!([1, 2]), &json!({})).is_err());
        assert!(merge_documents(json!({ "annotation_results": [3] }), &json!({})).is_err());
    }

    #[tokio::test]
    async fn merges_matching_pair_and_updates_latest() {
        let (store, cutover, reconciler) = setup();
        put_json(&store, &format!("tmp/{}", PRIMARY), json!({ "annotation_results": [{ "object_annotations": [] }] }));
        put_json(&store, "aws/aws_20250101_120000.json", json!({ "explicit_annotation": { "frames": [] } }));

        let outcome = reconciler.on_annotation_ready(PRIMARY).await;

        let key = TimestampKey::extract("20250101_120000").unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                key,
                path: "final/merged_20250101_120000.json".into()
            }
        );
        let merged = read_json(&store, "final/merged_20250101_120000.json").await;
        assert_eq!(
            merged["annotation_results"][0]["explicit_annotation"],
            json!({ "frames": [] })
        );
        assert_eq!(read_json(&store, "view/final_output.json").await, merged);
        assert_eq!(cutover.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_notification_is_a_noop() {
        let (store, cutover, reconciler) = setup();
        put_json(&store, &format!("tmp/{}", PRIMARY), json!({ "annotation_results": [] }));
        put_json(&store, "aws/aws_20250101_120000.json", json!({}));

        assert!(matches!(
            reconciler.on_annotation_ready(PRIMARY).await,
            MergeOutcome::Merged { .. }
        ));
        assert!(matches!(
            reconciler.on_annotation_ready(PRIMARY).await,
            MergeOutcome::AlreadyMerged(_)
        ));
        assert_eq!(store.paths("final/").len(), 1);
        assert_eq!(cutover.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unkeyed_artifact_writes_nothing() {
        let (store, cutover, reconciler) = setup();
        put_json(&store, "aws/aws_20250101_120000.json", json!({}));

        assert_eq!(
            reconciler.on_annotation_ready("output.json").await,
            MergeOutcome::Unkeyed
        );
        assert!(store.paths("final/").is_empty());
        assert!(store.paths("view/").is_empty());
        assert_eq!(cutover.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn secondary_arriving_last_needs_its_own_trigger() {
        let (store, _cutover, reconciler) = setup();
        put_json(&store, &format!("tmp/{}", PRIMARY), json!({ "annotation_results": [] }));

        // Primary fires first with no partner: nothing happens.
        assert!(matches!(
            reconciler.on_annotation_ready(PRIMARY).await,
            MergeOutcome::NoPartner(_)
        ));
        put_json(&store, "aws/aws_20250101_120000.json", json!({ "explicit_annotation": { "a": 1 } }));
        assert!(store.paths("final/").is_empty());

        // The symmetric trigger closes the gap.
        assert!(matches!(
            reconciler.on_secondary_ready("aws_20250101_120000.json").await,
            MergeOutcome::Merged { .. }
        ));
        let late = read_json(&store, "final/merged_20250101_120000.json").await;

        // Same inputs, opposite arrival order.
        let (store2, _c2, reconciler2) = setup();
        put_json(&store2, "aws/aws_20250101_120000.json", json!({ "explicit_annotation": { "a": 1 } }));
        put_json(&store2, &format!("tmp/{}", PRIMARY), json!({ "annotation_results": [] }));
        reconciler2.on_annotation_ready(PRIMARY).await;
        let early = read_json(&store2, "final/merged_20250101_120000.json").await;

        assert_eq!(late, early);
    }

    #[tokio::test]
    async fn malformed_document_aborts_without_writes() {
        let (store, cutover, reconciler) = setup();
        store.put_at(&format!("tmp/{}", PRIMARY), "{not json", Utc::now());
        put_json(&store, "aws/aws_20250101_120000.json", json!({}));

        assert!(matches!(
            reconciler.on_annotation_ready(PRIMARY).await,
            MergeOutcome::Failed(_)
        ));
        assert!(store.paths("final/").is_empty());
        assert!(store.paths("view/").is_empty());
        assert_eq!(cutover.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn write_failure_is_retryable() {
        let (store, _cutover, reconciler) = setup();
        put_json(&store, &format!("tmp/{}", PRIMARY), json!({ "annotation_results": [] }));
        put_json(&store, "aws/aws_20250101_120000.json", json!({}));

        store.set_fail_writes(true);
        assert!(matches!(
            reconciler.on_annotation_ready(PRIMARY).await,
            MergeOutcome::Failed(_)
        ));
        assert!(store.paths("final/").is_empty());

        store.set_fail_writes(false);
        assert!(matches!(
            reconciler.on_annotation_ready(PRIMARY).await,
            MergeOutcome::Merged { .. }
        ));
    }

    #[tokio::test]
    async fn duplicate_partner_keys_use_latest_write() {
        let (store, _cutover, reconciler) = setup();
        put_json(&store, &format!("tmp/{}", PRIMARY), json!({ "annotation_results": [] }));
        store.put_at(
            "aws/b_20250101_120000.json",
            serde_json::to_vec(&json!({ "explicit_annotation": "old" })).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 1).unwrap(),
        );
        store.put_at(
            "aws/a_20250101_120000.json",
            serde_json::to_vec(&json!({ "explicit_annotation": "new" })).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 2).unwrap(),
        );

        reconciler.on_annotation_ready(PRIMARY).await;
        let merged = read_json(&store, "final/merged_20250101_120000.json").await;
        assert_eq!(merged["annotation_results"][0]["explicit_annotation"], "new");
    }

    #[tokio::test]
    async fn sweep_reconciles_pending_pairs_oldest_first() {
        let (store, cutover, reconciler) = setup();
        put_json(&store, "tmp/temp_20250101_120000-20250101_120010.json", json!({}));
        put_json(&store, "tmp/temp_20250101_120015-20250101_120025.json", json!({}));
        put_json(&store, "tmp/temp_20250101_120030-20250101_120040.json", json!({}));
        put_json(&store, "aws/aws_20250101_120000.json", json!({ "explicit_annotation": 0 }));
        put_json(&store, "aws/aws_20250101_120015.json", json!({ "explicit_annotation": 15 }));
        put_json(&store, "final/merged_20250101_120000.json", json!({}));

        let outcomes = reconciler.sweep().await;

        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0], MergeOutcome::Merged { key, .. } if key.as_str() == "20250101_120015"));
        let latest = read_json(&store, "view/final_output.json").await;
        assert_eq!(latest["annotation_results"][0]["explicit_annotation"], 15);
        assert_eq!(cutover.calls.load(Ordering::SeqCst), 1);

        assert!(reconciler.sweep().await.is_empty());
        assert_eq!(cutover.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let (_store, _cutover, reconciler) = setup();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::new(reconciler).run_sweeper(Duration::from_millis(10), cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn qualify_leaves_full_paths_alone() {
        assert_eq!(qualify("tmp/", "tmp/a.json"), "tmp/a.json");
        assert_eq!(qualify("tmp/", "a.json"), "tmp/a.json");
    }

    /// Yields before every call and counts writes, so concurrent reconciles interleave.
    struct YieldingStore {
        inner: Arc<MemoryBlobStore>,
        puts: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for YieldingStore {
        async fn put(&self, path: &str, body: Bytes, content_type: &str) -> Result<()> {
            tokio::task::yield_now().await;
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.inner.put(path, body, content_type).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
            tokio::task::yield_now().await;
            self.inner.list(prefix).await
        }

        async fn get(&self, path: &str) -> Result<Bytes> {
            tokio::task::yield_now().await;
            self.inner.get(path).await
        }

        async fn exists(&self, path: &str) -> Result<bool> {
            tokio::task::yield_now().await;
            self.inner.exists(path).await
        }

        fn uri(&self, path: &str) -> String {
            self.inner.uri(path)
        }
    }

    #[tokio::test]
    async fn completion_racing_a_sweep_merges_once() {
        let memory = Arc::new(MemoryBlobStore::new("test"));
        let store = Arc::new(YieldingStore {
            inner: memory.clone(),
            puts: AtomicUsize::new(0),
        });
        let cutover = Arc::new(CountingCutover::default());
        let reconciler = MergeReconciler::new(store.clone(), layout()).with_cutover(cutover.clone());
        put_json(&memory, &format!("tmp/{}", PRIMARY), json!({ "annotation_results": [] }));
        put_json(&memory, "aws/aws_20250101_120000.json", json!({}));

        let (ready, swept) = tokio::join!(reconciler.on_annotation_ready(PRIMARY), reconciler.sweep());

        let merged = std::iter::once(&ready)
            .chain(swept.iter())
            .filter(|o| matches!(o, MergeOutcome::Merged { .. }))
            .count();
        assert_eq!(merged, 1);
        // One canonical write and one latest-pointer write.
        assert_eq!(store.puts.load(Ordering::SeqCst), 2);
        assert_eq!(cutover.calls.load(Ordering::SeqCst), 1);
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Local, TimeZone, Utc};
use serde_json::{json, Value};

use segment_reconciler::annotation::{AnnotationJobClient, AnnotationRequest, JobHandle};
use segment_reconciler::blob_store::{BlobStore, MemoryBlobStore};
use segment_reconciler::discovery::{DiscoverySettings, TickOutcome, VideoDiscovery};
use segment_reconciler::merge::{MergeLayout, MergeOutcome, MergeReconciler};
use segment_reconciler::recorder::Cutover;
use segment_reconciler::timestamp::TimestampKey;
use segment_reconciler::Result;

const INPUT: &str = "visualize-input/";
const TEMP: &str = "temp-output-json-files/";
const SECONDARY: &str = "visualize-aws-output-files/";
const FINAL: &str = "visualize-final-output-files/";
const LATEST: &str = "visualize-view-final-output-files/final_output.json";

/// Writes a one-result annotation document to the requested output path.
struct WritingAnnotator {
    store: Arc<MemoryBlobStore>,
}

#[async_trait]
impl AnnotationJobClient for WritingAnnotator {
    async fn submit(&self, request: &AnnotationRequest) -> Result<JobHandle> {
        Ok(JobHandle {
            name: "projects/test/operations/1".into(),
            output_path: request.output_path.clone(),
        })
    }

    async fn await_completion(&self, handle: &JobHandle) -> Result<String> {
        let doc = json!({
            "annotation_results": [{
                "face_detection_annotations": [],
                "object_annotations": [{ "entity": { "description": "car" } }]
            }]
        });
        self.store
            .put(
                &handle.output_path,
                Bytes::from(serde_json::to_vec(&doc).unwrap()),
                "application/json",
            )
            .await?;
        Ok(handle.output_path.clone())
    }
}

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

fn pipeline() -> (Arc<MemoryBlobStore>, Arc<CountingCutover>, Arc<MergeReconciler>, VideoDiscovery) {
    let store = Arc::new(MemoryBlobStore::new("bucket"));
    let cutover = Arc::new(CountingCutover::default());
    let reconciler = Arc::new(
        MergeReconciler::new(
            store.clone(),
            MergeLayout {
                primary_prefix: TEMP.into(),
                secondary_prefix: SECONDARY.into(),
                final_prefix: FINAL.into(),
                latest_merged_path: LATEST.into(),
            },
        )
        .with_cutover(cutover.clone()),
    );
    let discovery = VideoDiscovery::new(
        store.clone(),
        Arc::new(WritingAnnotator {
            store: store.clone(),
        }),
        None,
        reconciler.clone(),
        DiscoverySettings {
            input_prefix: INPUT.into(),
            temp_output_prefix: TEMP.into(),
            video_extensions: vec!["mp4".into()],
            poll_interval: Duration::from_secs(5),
        },
    );
    (store, cutover, reconciler, discovery)
}

async fn read_json(store: &MemoryBlobStore, path: &str) -> Value {
    serde_json::from_slice(&store.get(path).await.unwrap()).unwrap()
}

#[tokio::test]
async fn segment_flows_through_annotation_into_merged_document() {
    let (store, cutover, _reconciler, mut discovery) = pipeline();
    store.put_at(
        &format!("{}temp_20250101_120000.mp4", INPUT),
        "video",
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 15).unwrap(),
    );
    store.put_at(
        &format!("{}aws_20250101_120000.json", SECONDARY),
        serde_json::to_vec(&json!({ "explicit_annotation": { "frames": [{ "time_offset": "1s" }] } }))
            .unwrap(),
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 20).unwrap(),
    );

    assert_eq!(
        discovery.tick().await,
        TickOutcome::Submitted("temp_20250101_120000.mp4".into())
    );
    discovery.drain().await;

    let merged_path = format!("{}merged_20250101_120000.json", FINAL);
    let merged = read_json(&store, &merged_path).await;
    assert_eq!(
        merged["annotation_results"][0]["explicit_annotation"],
        json!({ "frames": [{ "time_offset": "1s" }] })
    );
    assert_eq!(
        merged["annotation_results"][0]["object_annotations"][0]["entity"]["description"],
        "car"
    );
    assert_eq!(read_json(&store, LATEST).await, merged);
    assert_eq!(cutover.calls.load(Ordering::SeqCst), 1);

    let outputs = store.paths(TEMP);
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].starts_with(&format!("{}temp_20250101_120000-", TEMP)));

    // The next poll sees the same segment and leaves everything alone.
    assert_eq!(
        discovery.tick().await,
        TickOutcome::AlreadyProcessed("temp_20250101_120000.mp4".into())
    );
    assert_eq!(store.paths(FINAL).len(), 1);
}

#[tokio::test]
async fn late_secondary_is_picked_up_by_sweep() {
    let (store, cutover, reconciler, mut discovery) = pipeline();
    store.put_at(
        &format!("{}temp_20250101_120015.mp4", INPUT),
        "video",
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 30).unwrap(),
    );

    discovery.tick().await;
    discovery.drain().await;
    assert!(store.paths(FINAL).is_empty());

    store.put_at(
        &format!("{}aws_20250101_120015.json", SECONDARY),
        serde_json::to_vec(&json!({ "explicit_annotation": { "likely": true } })).unwrap(),
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 40).unwrap(),
    );

    let outcomes = reconciler.sweep().await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(&outcomes[0], MergeOutcome::Merged { key, .. } if key.as_str() == "20250101_120015"));
    assert_eq!(
        read_json(&store, LATEST).await["annotation_results"][0]["explicit_annotation"],
        json!({ "likely": true })
    );
    assert_eq!(cutover.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn segment_without_timestamp_is_never_joined() {
    let (store, cutover, _reconciler, mut discovery) = pipeline();
    store.put_at(
        &format!("{}camera_upload.mp4", INPUT),
        "video",
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
    );
    // Secondaries around the current second, where a submission-time name would land.
    let now = Local::now().naive_local();
    for offset in -3..=10 {
        let key = TimestampKey::from_datetime(now + chrono::Duration::seconds(offset));
        store.put_at(
            &format!("{}aws_{}.json", SECONDARY, key),
            "{}",
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 1).unwrap(),
        );
    }

    assert_eq!(
        discovery.tick().await,
        TickOutcome::Unkeyed("camera_upload.mp4".into())
    );
    discovery.drain().await;

    assert!(store.paths(TEMP).is_empty());
    assert!(store.paths(FINAL).is_empty());
    assert!(!store.exists(LATEST).await.unwrap());
    assert_eq!(cutover.calls.load(Ordering::SeqCst), 0);
}

use std::sync::Arc;
use std::time::Duration;

use actix_web::web;
use anyhow::Result;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use segment_reconciler::annotation::HttpAnnotationClient;
use segment_reconciler::api::{self, AppState};
use segment_reconciler::blob_store::{BlobStore, MemoryBlobStore, S3BlobStore};
use segment_reconciler::config::{Config, StorageBackend};
use segment_reconciler::discovery::{DiscoverySettings, VideoDiscovery};
use segment_reconciler::merge::{MergeLayout, MergeReconciler};
use segment_reconciler::notify::IngestNotifier;
use segment_reconciler::recorder::{FfmpegCapture, RecorderSettings, SegmentRecorder};
use segment_reconciler::relay::{self, LiveRelay};
use segment_reconciler::retention::{self, RetentionPolicy};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = Config::from_env()?;
    info!("Starting with bucket '{}' ({:?})", config.bucket, config.backend);

    let store: Arc<dyn BlobStore> = match config.backend {
        StorageBackend::S3 => Arc::new(
            S3BlobStore::new(&config.bucket, &config.region, config.s3_endpoint.as_deref()).await,
        ),
        StorageBackend::Memory => Arc::new(MemoryBlobStore::new(&config.bucket)),
    };
    let cancel = CancellationToken::new();

    let recorder = SegmentRecorder::new(
        Arc::new(FfmpegCapture::new(&config.rtsp_url, config.segment_duration)),
        store.clone(),
        RecorderSettings {
            segment_dir: config.segment_dir.clone(),
            latest_final_path: config.latest_final_path.clone(),
            input_prefix: config.prefixes.input.clone(),
            view_video_path: config.prefixes.latest_view_video_path(),
            stop_grace: Duration::from_secs(5),
        },
    );

    let reconciler = Arc::new(
        MergeReconciler::new(
            store.clone(),
            MergeLayout {
                primary_prefix: config.prefixes.temp_output.clone(),
                secondary_prefix: config.prefixes.secondary_output.clone(),
                final_prefix: config.prefixes.final_output.clone(),
                latest_merged_path: config.prefixes.latest_merged_path(),
            },
        )
        .with_cutover(Arc::new(recorder.clone())),
    );

    let discovery = VideoDiscovery::new(
        store.clone(),
        Arc::new(HttpAnnotationClient::new(
            &config.annotation_endpoint,
            config.annotation_token.clone(),
            config.annotation_poll,
            config.annotation_timeout,
        )),
        config
            .ingest_notify_url
            .as_deref()
            .map(|url| IngestNotifier::new(url, &config.bucket)),
        reconciler.clone(),
        DiscoverySettings {
            input_prefix: config.prefixes.input.clone(),
            temp_output_prefix: config.prefixes.temp_output.clone(),
            video_extensions: config.video_extensions.clone(),
            poll_interval: config.poll_interval,
        },
    );
    let relay = Arc::new(LiveRelay::default());

    let state = web::Data::new(AppState {
        recorder: recorder.clone(),
        discovery: discovery.handle(),
        reconciler: reconciler.clone(),
        relay: relay.clone(),
    });

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(discovery.run(cancel.clone())));
    if let Some(interval) = config.merge_sweep {
        tasks.push(tokio::spawn(reconciler.clone().run_sweeper(interval, cancel.clone())));
    }
    tasks.push(tokio::spawn(retention::run(
        RetentionPolicy {
            segment_dir: config.segment_dir.clone(),
            max_age: config.retention_max_age,
            interval: config.retention_interval,
        },
        recorder.clone(),
        cancel.clone(),
    )));
    tasks.push(tokio::spawn(relay::run_transcoder(
        relay,
        config.rtsp_url.clone(),
        cancel.clone(),
    )));

    if let Err(e) = recorder.start().await {
        error!("Failed to start recording: {}", e);
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
        info!("Shutdown requested");
        shutdown.cancel();
    });

    let served = api::run_api_server(state, &config.host, config.port, cancel.clone()).await;
    cancel.cancel();

    if let Err(e) = recorder.stop().await {
        error!("Failed to stop recording: {}", e);
    }
    recorder.wait_for_uploads().await;
    for task in tasks {
        let _ = task.await;
    }
    info!("Shut down");

    served?;
    Ok(())
}

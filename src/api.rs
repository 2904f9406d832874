use std::sync::Arc;

use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder};
use bytes::Bytes;
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::discovery::DiscoveryHandle;
use crate::merge::{MergeOutcome, MergeReconciler};
use crate::recorder::SegmentRecorder;
use crate::relay::LiveRelay;

/// Shared handles the control endpoints act on.
pub struct AppState {
    pub recorder: SegmentRecorder,
    pub discovery: DiscoveryHandle,
    pub reconciler: Arc<MergeReconciler>,
    pub relay: Arc<LiveRelay>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub recording: bool,
    pub current_segment: Option<String>,
    pub viewers: usize,
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

/// Cut the recording over now: stop, publish the latest finished segment, restart.
///
/// # Example
/// ```shell
/// curl http://localhost:8080/api/video/merge-complete
/// ```
#[get("/api/video/merge-complete")]
pub async fn merge_complete(state: web::Data<AppState>) -> impl Responder {
    info!("==> Merge complete signal received");
    match state.recorder.cut_over().await {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => {
            error!("Cutover failed: {}", err);
            HttpResponse::InternalServerError().body(err.to_string())
        }
    }
}

/// Run a discovery tick now instead of waiting for the next poll.
///
/// # Example
/// ```shell
/// curl -X POST http://localhost:8080/api/video/start-processing
/// ```
///
/// # Returns
/// ```json
/// { "message": "Video processing started" }
/// ```
#[post("/api/video/start-processing")]
pub async fn start_processing(state: web::Data<AppState>) -> impl Responder {
    if state.discovery.trigger() {
        HttpResponse::Ok().json(MessageResponse {
            message: "Video processing started",
        })
    } else {
        HttpResponse::ServiceUnavailable().json(MessageResponse {
            message: "Video discovery is not running",
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryReady {
    /// Name or full path of the secondary document that just landed.
    pub object_key: String,
}

#[derive(Serialize)]
pub struct ReconcileResponse {
    pub outcome: &'static str,
    pub key: Option<String>,
    pub path: Option<String>,
}

impl From<MergeOutcome> for ReconcileResponse {
    fn from(outcome: MergeOutcome) -> Self {
        let (name, key, path) = match outcome {
            MergeOutcome::Merged { key, path } => ("merged", Some(key), Some(path)),
            MergeOutcome::Unkeyed => ("unkeyed", None, None),
            MergeOutcome::NoPartner(key) => ("no_partner", Some(key), None),
            MergeOutcome::AlreadyMerged(key) => ("already_merged", Some(key), None),
            MergeOutcome::Failed(key) => ("failed", Some(key), None),
        };
        ReconcileResponse {
            outcome: name,
            key: key.map(|k| k.to_string()),
            path,
        }
    }
}

/// Reconcile a secondary document that landed after its annotation output.
///
/// # Example
/// ```shell
/// curl -X POST http://localhost:8080/api/video/secondary-ready \
///   -H 'Content-Type: application/json' \
///   -d '{"objectKey": "aws_20250101_120000.json"}'
/// ```
///
/// # Returns
/// ```json
/// { "outcome": "merged", "key": "20250101_120000", "path": "visualize-final-output-files/merged_20250101_120000.json" }
/// ```
#[post("/api/video/secondary-ready")]
pub async fn secondary_ready(
    state: web::Data<AppState>,
    body: web::Json<SecondaryReady>,
) -> impl Responder {
    info!("==> Secondary document ready: {}", body.object_key);
    let outcome = state.reconciler.on_secondary_ready(&body.object_key).await;
    let failed = matches!(outcome, MergeOutcome::Failed(_));
    let response = ReconcileResponse::from(outcome);
    if failed {
        HttpResponse::InternalServerError().json(response)
    } else {
        HttpResponse::Ok().json(response)
    }
}

/// Raw MPEG-TS chunks from the live transcoder, for as long as the client stays connected.
#[get("/api/stream/live")]
pub async fn live_stream(state: web::Data<AppState>) -> impl Responder {
    let body = state
        .relay
        .clone()
        .watch()
        .await
        .map(Ok::<Bytes, actix_web::Error>);
    HttpResponse::Ok()
        .content_type("video/mp2t")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(body)
}

/// Recording and viewer status.
///
/// # Returns
/// ```json
/// { "recording": true, "current_segment": "temp_20250101_120000.mp4", "viewers": 2 }
/// ```
#[get("/api/status")]
pub async fn status(state: web::Data<AppState>) -> impl Responder {
    let current_segment = state
        .recorder
        .current_output_path()
        .await
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
    HttpResponse::Ok().json(StatusResponse {
        recording: current_segment.is_some(),
        current_segment,
        viewers: state.relay.viewer_count().await,
    })
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(merge_complete)
        .service(start_processing)
        .service(secondary_ready)
        .service(live_stream)
        .service(status);
}

/// Run the API server until `cancel` fires.
pub async fn run_api_server(
    state: web::Data<AppState>,
    host: &str,
    port: u16,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
        .bind((host, port))?
        .disable_signals()
        .run();

    let handle = server.handle();
    tokio::spawn(async move {
        cancel.cancelled().await;
        handle.stop(true).await;
    });

    info!("API server listening on {}:{}", host, port);
    server.await
}

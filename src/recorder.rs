//! Continuous record → upload → restart cycle.
//!
//! [`SegmentRecorder`] owns the single [`RecordingSession`]. Every session
//! transition (start, natural exit, stop) happens under one async mutex, so a
//! cutover can never race a segment boundary into two live sessions.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use log::{debug, error, info, warn};
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::blob_store::{upload_file, BlobStore};
use crate::error::{Error, Result};
use crate::process::ChildProcess;
use crate::timestamp::{segment_file_name, TimestampKey};

/// One running capture subprocess.
#[async_trait]
pub trait CaptureProcess: Send {
    /// Waits for exit. `None` means the process was ended by a signal.
    async fn wait(&mut self) -> Result<Option<i32>>;

    /// Graceful interrupt, escalating to a kill after `grace`.
    async fn shutdown(&mut self, grace: Duration) -> Result<Option<i32>>;
}

/// Starts bounded-duration captures into a given file.
pub trait CaptureLauncher: Send + Sync {
    fn launch(&self, output: &Path) -> Result<Box<dyn CaptureProcess>>;
}

#[async_trait]
impl CaptureProcess for ChildProcess {
    async fn wait(&mut self) -> Result<Option<i32>> {
        ChildProcess::wait(self).await
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<Option<i32>> {
        ChildProcess::shutdown(self, grace).await
    }
}

/// Records the RTSP feed into an MP4 of fixed duration with a clock and file name overlay.
pub struct FfmpegCapture {
    rtsp_url: String,
    duration: Duration,
}

impl FfmpegCapture {
    pub fn new(rtsp_url: &str, duration: Duration) -> Self {
        Self {
            rtsp_url: rtsp_url.to_string(),
            duration,
        }
    }

    pub fn args(&self, output: &Path) -> Vec<String> {
        let file_name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let overlay = format!(
            "drawtext=text='%{{localtime}}':fontcolor=white:fontsize=24:box=1:boxcolor=black@0.5:boxborderw=5:x=10:y=10,\
             drawtext=text='Filename: {}':fontcolor=white:fontsize=24:box=1:boxcolor=black@0.5:boxborderw=5:x=10:y=40",
            file_name
        );
        let duration = self.duration.as_secs().to_string();
        let output = output.to_string_lossy().into_owned();
        vec![
            "-rtsp_transport",
            "tcp",
            "-i",
            self.rtsp_url.as_str(),
            "-t",
            duration.as_str(),
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-movflags",
            "+faststart",
            "-vf",
            overlay.as_str(),
            "-y",
            output.as_str(),
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

impl CaptureLauncher for FfmpegCapture {
    fn launch(&self, output: &Path) -> Result<Box<dyn CaptureProcess>> {
        let child = ChildProcess::spawn("recording ffmpeg", "ffmpeg", &self.args(output), false)?;
        Ok(Box::new(child))
    }
}

/// Something that can be told to cut the recording over after a merge.
#[async_trait]
pub trait Cutover: Send + Sync {
    async fn cut_over(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    /// Directory freshly time-stamped segments are written to.
    pub segment_dir: PathBuf,
    /// Well-known local copy of the most recently finished segment.
    pub latest_final_path: PathBuf,
    pub input_prefix: String,
    /// Blob path the latest finished segment is published to on cutover.
    pub view_video_path: String,
    pub stop_grace: Duration,
}

struct RecordingSession {
    id: u64,
    output_path: PathBuf,
    stop: CancellationToken,
    supervisor: JoinHandle<()>,
}

struct Inner {
    launcher: Arc<dyn CaptureLauncher>,
    store: Arc<dyn BlobStore>,
    settings: RecorderSettings,
    session: Mutex<Option<RecordingSession>>,
    last_key: Mutex<Option<TimestampKey>>,
    cutover_lock: Mutex<()>,
    uploads: Mutex<JoinSet<()>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct SegmentRecorder {
    inner: Arc<Inner>,
}

impl SegmentRecorder {
    pub fn new(
        launcher: Arc<dyn CaptureLauncher>,
        store: Arc<dyn BlobStore>,
        settings: RecorderSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                launcher,
                store,
                settings,
                session: Mutex::new(None),
                last_key: Mutex::new(None),
                cutover_lock: Mutex::new(()),
                uploads: Mutex::new(JoinSet::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Begins a new segment. Returns `Ok(false)` if a session is already active.
    pub async fn start(&self) -> Result<bool> {
        let mut slot = self.inner.session.lock().await;
        begin_session(&self.inner, &mut slot).await
    }

    /// Interrupts the active capture and clears the session. Returns `Ok(false)`
    /// when nothing was recording; otherwise returns once the subprocess is gone.
    pub async fn stop(&self) -> Result<bool> {
        let session = self.inner.session.lock().await.take();
        let Some(session) = session else {
            debug!("Stop requested with no active recording");
            return Ok(false);
        };

        info!("==> Stopping recording {}", session.output_path.display());
        session.stop.cancel();
        session
            .supervisor
            .await
            .map_err(|e| Error::Recorder(format!("recording supervisor failed: {}", e)))?;
        Ok(true)
    }

    /// Stop, publish the latest finished segment to the view path, start again.
    pub async fn cut_over(&self) -> Result<()> {
        let _serial = self.inner.cutover_lock.lock().await;
        info!("Cutting recording over");

        if let Err(e) = self.stop().await {
            error!("Failed to stop recording during cutover: {}", e);
        }
        if let Err(e) = self.publish_view().await {
            warn!("Failed to publish view video: {}", e);
        }
        self.start().await?;
        Ok(())
    }

    /// Wait for every segment upload started so far.
    pub async fn wait_for_uploads(&self) {
        let mut uploads = self.inner.uploads.lock().await;
        while let Some(joined) = uploads.join_next().await {
            if let Err(e) = joined {
                error!("Segment upload task failed: {}", e);
            }
        }
    }

    pub async fn is_active(&self) -> bool {
        self.inner.session.lock().await.is_some()
    }

    pub async fn current_output_path(&self) -> Option<PathBuf> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.output_path.clone())
    }

    pub fn latest_final_path(&self) -> &Path {
        &self.inner.settings.latest_final_path
    }

    async fn publish_view(&self) -> Result<()> {
        let settings = &self.inner.settings;
        if fs::metadata(&settings.latest_final_path).await.is_err() {
            return Err(Error::NotFound(settings.latest_final_path.display().to_string()));
        }
        upload_file(
            self.inner.store.as_ref(),
            &settings.latest_final_path,
            &settings.view_video_path,
            "video/mp4",
        )
        .await
    }
}

#[async_trait]
impl Cutover for SegmentRecorder {
    async fn cut_over(&self) -> Result<()> {
        SegmentRecorder::cut_over(self).await
    }
}

async fn begin_session(inner: &Arc<Inner>, slot: &mut Option<RecordingSession>) -> Result<bool> {
    if let Some(active) = slot.as_ref() {
        debug!(
            "Recording already active ({}), ignoring start",
            active.output_path.display()
        );
        return Ok(false);
    }

    fs::create_dir_all(&inner.settings.segment_dir).await?;
    let output_path = fresh_segment_path(inner).await;
    let child = inner.launcher.launch(&output_path)?;

    let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
    let stop = CancellationToken::new();
    let supervisor = spawn_supervisor(inner.clone(), id, child, output_path.clone(), stop.clone());

    info!("==> Recording started: {}", output_path.display());
    *slot = Some(RecordingSession {
        id,
        output_path,
        stop,
        supervisor,
    });
    Ok(true)
}

/// Segment keys have one-second resolution; two segments must never share one.
async fn fresh_segment_path(inner: &Inner) -> PathBuf {
    let mut last = inner.last_key.lock().await;
    loop {
        let key = TimestampKey::now();
        let path = inner.settings.segment_dir.join(segment_file_name(&key));
        let reused = last.as_ref().is_some_and(|prev| &key <= prev);
        if !reused && fs::metadata(&path).await.is_err() {
            *last = Some(key);
            return path;
        }
        let ms = 1000 - u64::from(Local::now().timestamp_subsec_millis().min(999));
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

// Boxed so the supervisor's future type does not feed back into `begin_session`.
fn spawn_supervisor(
    inner: Arc<Inner>,
    id: u64,
    child: Box<dyn CaptureProcess>,
    output: PathBuf,
    stop: CancellationToken,
) -> JoinHandle<()> {
    let task: Pin<Box<dyn Future<Output = ()> + Send>> =
        Box::pin(supervise(inner, id, child, output, stop));
    tokio::spawn(task)
}

async fn supervise(
    inner: Arc<Inner>,
    id: u64,
    mut child: Box<dyn CaptureProcess>,
    output: PathBuf,
    stop: CancellationToken,
) {
    let finished = tokio::select! {
        status = child.wait() => Some(status),
        _ = stop.cancelled() => None,
    };

    match finished {
        Some(status) => finish(&inner, id, output, status).await,
        None => match child.shutdown(inner.settings.stop_grace).await {
            Ok(code) => info!(
                "Recording interrupted (exit {:?}); partial segment left at {}",
                code,
                output.display()
            ),
            Err(e) => error!("Failed to stop recording {}: {}", output.display(), e),
        },
    }
}

async fn finish(inner: &Arc<Inner>, id: u64, output: PathBuf, status: Result<Option<i32>>) {
    let mut slot = inner.session.lock().await;
    let still_current = slot.as_ref().is_some_and(|s| s.id == id);
    if still_current {
        *slot = None;
    }

    match status {
        Ok(Some(0)) => {
            info!("== Recording completed == {}", output.display());
            if still_current {
                if let Err(e) = begin_session(inner, &mut slot).await {
                    error!("Failed to start next segment: {}", e);
                }
            } else {
                debug!("Recording was stopped as it completed, not restarting");
            }

            // The next segment cannot finish while the slot is held, so copies land in order.
            match replace_file(&output, &inner.settings.latest_final_path).await {
                Ok(()) => info!(
                    "Segment copied to {}",
                    inner.settings.latest_final_path.display()
                ),
                Err(e) => error!("Error copying segment to latest final: {}", e),
            }
            drop(slot);

            let task = {
                let inner = inner.clone();
                async move { upload_segment(&inner, &output).await }
            };
            let mut uploads = inner.uploads.lock().await;
            while let Some(joined) = uploads.try_join_next() {
                if let Err(e) = joined {
                    error!("Segment upload task failed: {}", e);
                }
            }
            uploads.spawn(task);
        }
        Ok(code) => {
            error!(
                "Recording process exited with code {:?}; recording halted until restarted",
                code
            );
        }
        Err(e) => {
            error!("Failed waiting on recording process: {}; recording halted", e);
        }
    }
}

/// Upload a finished segment to the input prefix. The local file is kept either way.
async fn upload_segment(inner: &Inner, output: &Path) {
    let Some(name) = output.file_name().and_then(|n| n.to_str()) else {
        error!("Segment path {} has no file name", output.display());
        return;
    };
    let object = format!("{}{}", inner.settings.input_prefix, name);

    if let Err(e) = upload_file(inner.store.as_ref(), output, &object, "video/mp4").await {
        error!(
            "==> Error uploading {}: {}; local file kept for recovery",
            output.display(),
            e
        );
    }
}

/// Copy `src` over `dst` via a sibling temp file so readers never see a partial file.
async fn replace_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    let staging = dst.with_extension("partial");
    fs::copy(src, &staging).await?;
    fs::rename(&staging, dst).await?;
    Ok(())
}

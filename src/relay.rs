//! Low-latency live view: one transcoder, many viewers.
//!
//! Each viewer gets a small bounded queue. A chunk that does not fit is
//! dropped for that viewer only, so a stalled client never back-pressures the
//! transcoder or delays anyone else.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::process::ChildProcess;

const VIEWER_BUFFER: usize = 64;
const RESTART_DELAY: Duration = Duration::from_secs(2);
const STOP_GRACE: Duration = Duration::from_secs(3);

pub struct LiveRelay {
    viewers: RwLock<HashMap<u64, mpsc::Sender<Bytes>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Default for LiveRelay {
    fn default() -> Self {
        Self::new(VIEWER_BUFFER)
    }
}

impl LiveRelay {
    /// `buffer` is the number of chunks queued per viewer before drops start.
    pub fn new(buffer: usize) -> Self {
        Self {
            viewers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Register a viewer. Dropping the receiver unsubscribes it on the next publish.
    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<Bytes>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.viewers.write().await.insert(id, tx);
        info!("Viewer {} connected", id);
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        if self.viewers.write().await.remove(&id).is_some() {
            info!("Viewer {} disconnected", id);
        }
    }

    /// Fan a chunk out to every viewer that has room. Returns how many received it.
    pub async fn publish(&self, chunk: Bytes) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let viewers = self.viewers.read().await;
            for (id, tx) in viewers.iter() {
                match tx.try_send(chunk.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut viewers = self.viewers.write().await;
            for id in closed {
                viewers.remove(&id);
                info!("Viewer {} disconnected", id);
            }
        }
        delivered
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }

    /// Subscribe and return the viewer's chunks as a stream. Dropping the stream
    /// unsubscribes the viewer right away instead of on the next publish.
    pub async fn watch(self: Arc<Self>) -> impl Stream<Item = Bytes> {
        let (id, mut rx) = self.subscribe().await;
        let guard = ViewerGuard { relay: self, id };
        async_stream::stream! {
            let _guard = guard;
            while let Some(chunk) = rx.recv().await {
                yield chunk;
            }
        }
    }
}

struct ViewerGuard {
    relay: Arc<LiveRelay>,
    id: u64,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let relay = self.relay.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { relay.unsubscribe(id).await });
        }
    }
}

/// ffmpeg arguments for the 640x360 MPEG-1 transport stream written to stdout.
pub fn transcoder_args(rtsp_url: &str) -> Vec<String> {
    vec![
        "-rtsp_transport",
        "tcp",
        "-i",
        rtsp_url,
        "-analyzeduration",
        "15000000",
        "-probesize",
        "15000000",
        "-c:v",
        "libx264",
        "-preset",
        "ultrafast",
        "-tune",
        "zerolatency",
        "-f",
        "mpegts",
        "-codec:v",
        "mpeg1video",
        "-s",
        "640x360",
        "-b:v",
        "800k",
        "-vf",
        "drawtext=text='%{localtime}':fontcolor=white:fontsize=24:box=1:boxcolor=black@0.5:boxborderw=5:x=10:y=10",
        "-r",
        "30",
        "-",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Forward `chunks` to the relay until the stream ends, fails, or `cancel` fires.
/// Returns `true` if it stopped because of `cancel`.
pub async fn pump<S>(chunks: S, relay: &LiveRelay, cancel: &CancellationToken) -> bool
where
    S: Stream<Item = io::Result<Bytes>>,
{
    tokio::pin!(chunks);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return true,
            next = chunks.next() => match next {
                Some(Ok(chunk)) => {
                    relay.publish(chunk).await;
                }
                Some(Err(e)) => {
                    warn!("Live stream read failed: {}", e);
                    return false;
                }
                None => return false,
            }
        }
    }
}

/// Keep a live transcoder running and feeding `relay`, restarting it after
/// it exits, until `cancel` fires.
pub async fn run_transcoder(relay: Arc<LiveRelay>, rtsp_url: String, cancel: CancellationToken) {
    let args = transcoder_args(&rtsp_url);
    info!("Live transcoder started for {}", rtsp_url);

    loop {
        match ChildProcess::spawn("live ffmpeg", "ffmpeg", &args, true) {
            Ok(mut child) => {
                let cancelled = match child.take_stdout() {
                    Some(stdout) => pump(stdout, &relay, &cancel).await,
                    None => false,
                };
                if cancelled {
                    if let Err(e) = child.shutdown(STOP_GRACE).await {
                        error!("Failed to stop live transcoder: {}", e);
                    }
                    break;
                }
                match child.wait().await {
                    Ok(code) => warn!("Live FFmpeg exited with code {:?}", code),
                    Err(e) => error!("Failed waiting on live FFmpeg: {}", e),
                }
            }
            Err(e) => error!("{}", e),
        }

        debug!("Restarting live transcoder in {:?}", RESTART_DELAY);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(RESTART_DELAY) => {}
        }
    }
    info!("Live transcoder stopped");
}

//! Polls the input prefix for the newest segment and submits it for
//! annotation, at most one segment per tick.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::annotation::{AnnotationJobClient, AnnotationRequest};
use crate::blob_store::{BlobEntry, BlobStore};
use crate::error::Result;
use crate::merge::MergeReconciler;
use crate::notify::IngestNotifier;
use crate::timestamp::{base_name, job_output_name, TimestampKey};

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub input_prefix: String,
    /// Where annotation jobs are told to write their output documents.
    pub temp_output_prefix: String,
    /// Lowercase, without the dot.
    pub video_extensions: Vec<String>,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No video under the input prefix.
    Empty,
    AlreadyProcessed(String),
    /// The newest video carries no timestamp key, so its output could never be joined.
    Unkeyed(String),
    Submitted(String),
    SubmitFailed(String),
    ListFailed,
}

/// Wakes the discovery loop ahead of its next scheduled tick.
#[derive(Clone)]
pub struct DiscoveryHandle {
    tx: mpsc::Sender<()>,
}

impl DiscoveryHandle {
    /// Returns `false` once the loop has shut down.
    pub fn trigger(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

pub struct VideoDiscovery {
    store: Arc<dyn BlobStore>,
    annotator: Arc<dyn AnnotationJobClient>,
    notifier: Option<IngestNotifier>,
    reconciler: Arc<MergeReconciler>,
    settings: DiscoverySettings,
    /// Segment names submitted during this process lifetime.
    processed: HashSet<String>,
    waiters: JoinSet<()>,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: mpsc::Receiver<()>,
}

impl VideoDiscovery {
    pub fn new(
        store: Arc<dyn BlobStore>,
        annotator: Arc<dyn AnnotationJobClient>,
        notifier: Option<IngestNotifier>,
        reconciler: Arc<MergeReconciler>,
        settings: DiscoverySettings,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            store,
            annotator,
            notifier,
            reconciler,
            settings,
            processed: HashSet::new(),
            waiters: JoinSet::new(),
            trigger_tx,
            trigger_rx,
        }
    }

    pub fn handle(&self) -> DiscoveryHandle {
        DiscoveryHandle {
            tx: self.trigger_tx.clone(),
        }
    }

    pub fn is_processed(&self, name: &str) -> bool {
        self.processed.contains(name)
    }

    /// Number of annotation jobs still awaiting completion.
    pub fn in_flight(&self) -> usize {
        self.waiters.len()
    }

    /// Newest video under the input prefix; creation-time ties go to the greater name.
    pub async fn latest_segment(&self) -> Result<Option<BlobEntry>> {
        let entries = self.store.list(&self.settings.input_prefix).await?;
        Ok(entries
            .into_iter()
            .filter(|e| self.is_video(&e.path))
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.path.cmp(&b.path))
            }))
    }

    fn is_video(&self, path: &str) -> bool {
        Path::new(base_name(path))
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.settings.video_extensions.iter().any(|v| *v == ext)
            })
            .unwrap_or(false)
    }

    /// One poll: find the newest segment and, if unseen, notify and submit it.
    pub async fn tick(&mut self) -> TickOutcome {
        self.reap_waiters();

        let latest = match self.latest_segment().await {
            Ok(Some(latest)) => latest,
            Ok(None) => {
                debug!("==> No videos under {}", self.settings.input_prefix);
                return TickOutcome::Empty;
            }
            Err(e) => {
                error!("Failed to list {}: {}", self.settings.input_prefix, e);
                return TickOutcome::ListFailed;
            }
        };

        let name = base_name(&latest.path).to_string();
        if self.processed.contains(&name) {
            debug!("==> Latest video: {} (already submitted)", name);
            return TickOutcome::AlreadyProcessed(name);
        }
        if TimestampKey::extract(&name).is_none() {
            warn!("==> Skipping {}: no timestamp key in its name", name);
            self.processed.insert(name.clone());
            return TickOutcome::Unkeyed(name);
        }
        info!("==> New video found: {}", name);

        if let Some(notifier) = &self.notifier {
            match notifier.notify(&name).await {
                Ok(()) => info!("Ingest notify for {} succeeded", name),
                Err(e) => warn!("Ingest notify for {} failed: {}", name, e),
            }
        }

        let output_path = format!(
            "{}{}",
            self.settings.temp_output_prefix,
            job_output_name(&name, Utc::now())
        );
        let request = AnnotationRequest {
            input_uri: self.store.uri(&latest.path),
            output_uri: self.store.uri(&output_path),
            output_path,
        };

        let handle = match self.annotator.submit(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Annotation submission for {} failed: {}", name, e);
                return TickOutcome::SubmitFailed(name);
            }
        };
        self.processed.insert(name.clone());

        let annotator = self.annotator.clone();
        let reconciler = self.reconciler.clone();
        self.waiters.spawn(async move {
            match annotator.await_completion(&handle).await {
                Ok(output) => {
                    info!("Processing complete. Results saved to: {}", output);
                    reconciler.on_annotation_ready(&output).await;
                }
                Err(e) => error!("Annotation job {} failed: {}", handle.name, e),
            }
        });

        TickOutcome::Submitted(name)
    }

    /// Tick every poll interval (or on [`DiscoveryHandle::trigger`]) until `cancel` fires.
    /// Annotation jobs still in flight at shutdown are left to finish on their own.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Video discovery started on {} (every {}s)",
            self.settings.input_prefix,
            self.settings.poll_interval.as_secs()
        );

        // A tick is never abandoned halfway, so a submitted job always gets its waiter.
        while !cancel.is_cancelled() {
            self.tick().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                Some(()) = self.trigger_rx.recv() => debug!("On-demand discovery tick"),
            }
        }

        info!(
            "Video discovery stopping with {} annotation job(s) in flight",
            self.waiters.len()
        );
        self.waiters.detach_all();
    }

    /// Wait for every in-flight annotation job and its merge to finish.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.waiters.join_next().await {
            if let Err(e) = joined {
                error!("Annotation completion task failed: {}", e);
            }
        }
    }

    fn reap_waiters(&mut self) {
        while let Some(joined) = self.waiters.try_join_next() {
            if let Err(e) = joined {
                error!("Annotation completion task failed: {}", e);
            }
        }
    }
}

//! Multi-source download coordination.
//!
//! A [`Coordinator`] starts one actor task per download. Every assignment pass
//! re-ranks the known peers, hands pending chunks to the best candidates with
//! spare capacity, and feeds each outcome back into the shared reputation
//! store. Timeouts and bad hashes are absorbed by reassignment; only a stall,
//! a cancellation or a digest mismatch ends a download early.

mod config;
mod events;
mod fetcher;
mod load;
mod task;

pub use config::{CoordinatorConfig, RacePolicy};
pub use events::{ChunkFailure, CompletedDownload, DownloadEvent, DownloadOutcome, FailureReason};
pub use fetcher::{ChunkFetcher, ChunkRequest};
pub use load::{LoadGuard, PeerLoad};
pub use task::{Assignment, ChunkState};

use crate::error::{CoordinatorError, Result};
use crate::reputation::ReputationStore;
use crate::selection::{Selector, TaskContext};
use shoal_discovery::{PeerTable, RegionId};
use shoal_files::{ChunkError, FileId, FileManifest};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use task::{DownloadTask, Shared};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Starts and tracks downloads against a shared peer table and reputation store
pub struct Coordinator {
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl Coordinator {
    /// Create a coordinator
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::Config` if `config` is invalid.
    pub fn new(
        config: CoordinatorConfig,
        fetcher: Arc<dyn ChunkFetcher>,
        peers: Arc<PeerTable>,
        reputation: Arc<ReputationStore>,
        selector: Arc<Selector>,
        local_region: Option<RegionId>,
    ) -> Result<Self> {
        config.validate()?;
        let context = TaskContext::download(local_region).with_max_candidates(config.max_candidates);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                fetcher,
                peers,
                reputation,
                selector,
                load: PeerLoad::new(),
                context,
            }),
            next_id: AtomicU64::new(1),
        })
    }

    /// Coordinator configuration
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// In-flight requests per peer, across all downloads
    #[must_use]
    pub fn load(&self) -> &PeerLoad {
        &self.shared.load
    }

    /// Start downloading the file described by `manifest`
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::Manifest` if the manifest is inconsistent
    /// or describes a file larger than `max_file_size`.
    pub fn start_download(&self, manifest: FileManifest) -> Result<DownloadHandle> {
        manifest.validate()?;
        let limit = self.shared.config.max_file_size;
        if manifest.total_size > limit {
            return Err(ChunkError::TooLarge {
                size: manifest.total_size,
                limit,
            }
            .into());
        }
        let layout = manifest.layout()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let file_id = manifest.file_id.clone();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (task, results) = DownloadTask::new(
            id,
            Arc::new(manifest),
            layout,
            self.shared.clone(),
            events_tx,
        )?;
        let join = tokio::spawn(task.run(results, cancel_rx));

        Ok(DownloadHandle {
            id,
            file_id,
            cancel: cancel_tx,
            events: Some(events_rx),
            join,
        })
    }
}

/// Handle to a running download
pub struct DownloadHandle {
    id: u64,
    file_id: FileId,
    cancel: watch::Sender<bool>,
    events: Option<mpsc::UnboundedReceiver<DownloadEvent>>,
    join: JoinHandle<DownloadOutcome>,
}

impl DownloadHandle {
    /// Download id, unique per coordinator
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// File being downloaded
    #[must_use]
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    /// Abort the download
    ///
    /// In-flight requests are abandoned and a `Failed { Aborted }` event is
    /// emitted. No effect once the download is terminal.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Next event, or `None` after the terminal event
    pub async fn next_event(&mut self) -> Option<DownloadEvent> {
        self.events.as_mut()?.recv().await
    }

    /// Take the event stream to consume elsewhere
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DownloadEvent>> {
        self.events.take()
    }

    /// Whether the download has reached a terminal state
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the terminal outcome
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::Failed` for a stalled, aborted or corrupt
    /// download, or `CoordinatorError::TaskJoin` if the task died.
    pub async fn wait(self) -> Result<CompletedDownload> {
        let Self { cancel, join, .. } = self;
        let outcome = join
            .await
            .map_err(|e| CoordinatorError::TaskJoin(e.to_string()));
        drop(cancel);
        match outcome? {
            DownloadOutcome::Completed(done) => Ok(done),
            DownloadOutcome::Failed(reason) => Err(CoordinatorError::Failed(reason)),
        }
    }
}

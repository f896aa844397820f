//! Node façade wiring discovery, reputation, selection and transfer together.
//!
//! ```text
//! rendezvous events --> PeerTable --+
//!                                   +--> Selector --> Coordinator --> ChunkFetcher
//! chunk outcomes --> ReputationStore+
//! ```

use crate::coordinator::{ChunkFetcher, Coordinator, CoordinatorConfig, DownloadHandle};
use crate::error::{ConfigError, NodeError};
use crate::reputation::{ReputationConfig, ReputationStore};
use crate::selection::{CandidateList, SelectionConfig, Selector, TaskContext};
use serde_json::Value;
use shoal_discovery::{
    ChannelState, EventReceiver, PeerId, PeerTable, RegionCatalogue, RegionId, RendezvousClient,
    RendezvousClientConfig, RendezvousEvent, now_millis,
};
use shoal_files::FileManifest;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

/// Node configuration
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Rendezvous session; its `region` is this node's region
    pub rendezvous: RendezvousClientConfig,
    /// Reputation tuning
    pub reputation: ReputationConfig,
    /// Selection weights
    pub selection: SelectionConfig,
    /// Download coordination
    pub coordinator: CoordinatorConfig,
    /// Housekeeping cadence
    pub maintenance: MaintenanceConfig,
}

/// Periodic reputation decay and peer pruning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceConfig {
    /// Interval between decay and prune passes
    pub interval: Duration,
    /// Peers not seen for this long are dropped from the table
    pub peer_stale_after: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            peer_stale_after: Duration::from_secs(120),
        }
    }
}

impl NodeConfig {
    /// Check every section
    ///
    /// # Errors
    ///
    /// Returns the first invalid section's error.
    pub fn validate(&self) -> Result<(), NodeError> {
        self.rendezvous.validate()?;
        self.reputation.validate()?;
        self.selection.validate()?;
        self.coordinator.validate()?;
        if self.maintenance.interval.is_zero() {
            return Err(ConfigError::new("maintenance interval must be non-zero").into());
        }
        Ok(())
    }
}

/// A running peer: rendezvous session plus download machinery
pub struct Node {
    client: RendezvousClient,
    region: Option<RegionId>,
    peers: Arc<PeerTable>,
    reputation: Arc<ReputationStore>,
    selector: Arc<Selector>,
    coordinator: Coordinator,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Connect to the rendezvous server and start background tasks
    ///
    /// Returns the node and a stream of application-level rendezvous events
    /// (directed messages, broadcasts, delivery failures, disconnection).
    /// Peer-list pushes are applied to the peer table and not forwarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or registration fails.
    pub async fn start(
        config: NodeConfig,
        fetcher: Arc<dyn ChunkFetcher>,
    ) -> Result<(Self, EventReceiver), NodeError> {
        config.validate()?;
        let region = config.rendezvous.region;

        let peers = Arc::new(PeerTable::new());
        let reputation = Arc::new(ReputationStore::new(config.reputation));
        let selector = Arc::new(Selector::new(
            config.selection,
            Arc::new(RegionCatalogue::default()),
        ));
        let coordinator = Coordinator::new(
            config.coordinator,
            fetcher,
            peers.clone(),
            reputation.clone(),
            selector.clone(),
            region,
        )?;

        let (client, events) = RendezvousClient::connect(config.rendezvous).await?;
        let (app_tx, app_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            tokio::spawn(pump_events(
                events,
                peers.clone(),
                client.peer_id().clone(),
                app_tx,
            )),
            tokio::spawn(maintenance_loop(
                peers.clone(),
                reputation.clone(),
                config.maintenance,
            )),
        ];

        tracing::info!(
            "Node {} started (region {:?})",
            client.peer_id().short(),
            region
        );

        Ok((
            Self {
                client,
                region,
                peers,
                reputation,
                selector,
                coordinator,
                tasks,
            },
            app_rx,
        ))
    }

    /// This node's session id
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        self.client.peer_id()
    }

    /// This node's region
    #[must_use]
    pub fn region(&self) -> Option<RegionId> {
        self.region
    }

    /// Rendezvous session state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.client.state()
    }

    /// Known peers
    #[must_use]
    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    /// Shared reputation store
    #[must_use]
    pub fn reputation(&self) -> &Arc<ReputationStore> {
        &self.reputation
    }

    /// Download coordinator
    #[must_use]
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Rank the currently known peers for `ctx`
    #[must_use]
    pub fn candidates(&self, ctx: &TaskContext) -> CandidateList {
        self.selector
            .select(ctx, &self.peers.snapshot(), &self.reputation)
    }

    /// Start downloading a file from the known peers
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest is inconsistent.
    pub fn download(&self, manifest: FileManifest) -> Result<DownloadHandle, NodeError> {
        Ok(self.coordinator.start_download(manifest)?)
    }

    /// Send a directed message through the rendezvous server
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not connected.
    pub async fn send_to(
        &self,
        to: &PeerId,
        kind: impl Into<String>,
        data: Value,
    ) -> Result<(), NodeError> {
        Ok(self.client.send_to(to, kind, data).await?)
    }

    /// Broadcast through the rendezvous server
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not connected.
    pub async fn broadcast(&self, kind: impl Into<String>, payload: Value) -> Result<(), NodeError> {
        Ok(self.client.broadcast(kind, payload).await?)
    }

    /// Close the rendezvous session
    ///
    /// Running downloads continue with the peers already known.
    pub fn disconnect(&self) {
        self.client.disconnect();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.client.disconnect();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Apply rendezvous events to the peer table and forward the rest
async fn pump_events(
    mut events: EventReceiver,
    peers: Arc<PeerTable>,
    local: PeerId,
    app: mpsc::UnboundedSender<RendezvousEvent>,
) {
    while let Some(event) = events.recv().await {
        match &event {
            RendezvousEvent::PeerList(list) => {
                peers.apply_peer_list(list, Some(&local));
                tracing::debug!("Peer table updated: {} peers", peers.len());
                continue;
            }
            RendezvousEvent::Directed { from, .. } | RendezvousEvent::Broadcast { from, .. } => {
                peers.touch(from, now_millis());
            }
            RendezvousEvent::DeliveryFailed { to } => {
                if peers.remove(to).is_some() {
                    tracing::debug!("Dropped unreachable peer {}", to.short());
                }
            }
            RendezvousEvent::Disconnected => {
                tracing::info!("Rendezvous session for {} ended", local.short());
            }
        }
        let _ = app.send(event);
    }
}

async fn maintenance_loop(
    peers: Arc<PeerTable>,
    reputation: Arc<ReputationStore>,
    config: MaintenanceConfig,
) {
    let mut ticker = time::interval(config.interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        reputation.decay_pass(Instant::now());
        let pruned = peers.prune_stale(now_millis(), config.peer_stale_after);
        if pruned > 0 {
            tracing::debug!("Pruned {} stale peers", pruned);
        }
    }
}

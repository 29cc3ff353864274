//! Supervised periodic run loop coordinating polling, discovery and sweeps

use crate::config::EngineConfig;
use crate::discovery::{self, Discovery, DirectoryApi, MasterQuery};
use crate::geo::GeoApi;
use crate::poller::Poller;
use crate::publish::PublishSink;
use crate::query::QueryClient;
use crate::registry::{PersistedTarget, TargetRegistry};
use crate::stats::{GlobalStats, ServerHistory};
use crate::storage::{JsonStore, SERVER_LIST_DOC};
use log::{debug, error, info, warn};
use shared::Record;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};

/// The assembled engine: registry, poll scheduler and tiered discovery
/// driven by interval timers until shutdown.
pub struct Engine {
    poller: Poller,
    discovery: Discovery,
    registry: Arc<RwLock<TargetRegistry>>,
    store: Arc<JsonStore>,
    config: EngineConfig,
}

impl Engine {
    /// Builds the engine, restoring the registry and derived caches from
    /// storage. Collaborator seams are injected; absent optional tiers
    /// degrade instead of failing.
    pub async fn new(
        config: EngineConfig,
        store: JsonStore,
        query: Arc<dyn QueryClient>,
        directory: Option<Arc<dyn DirectoryApi>>,
        master: Option<Arc<dyn MasterQuery>>,
        geo_api: Arc<dyn GeoApi>,
        sink: Arc<dyn PublishSink>,
    ) -> Self {
        let store = Arc::new(store);

        let registry = match store.load::<Vec<PersistedTarget>>(SERVER_LIST_DOC).await {
            Ok(Some(persisted)) => {
                info!("loaded server list with {} servers", persisted.len());
                TargetRegistry::from_persisted(persisted)
            }
            Ok(None) => TargetRegistry::new(),
            Err(e) => {
                warn!("failed to load server list ({}), starting empty", e);
                TargetRegistry::new()
            }
        };
        let registry = Arc::new(RwLock::new(registry));

        let discovery = Discovery::new(directory, master, &config);
        let mut poller = Poller::new(
            Arc::clone(&registry),
            query,
            geo_api,
            sink,
            Arc::clone(&store),
            config.clone(),
        );
        poller.load_caches().await;

        Self {
            poller,
            discovery,
            registry,
            store,
            config,
        }
    }

    /// Runs until the shutdown channel fires. Sweeps, discovers and polls
    /// once at startup, then lets the interval timers take over; a slow
    /// cycle delays the next tick rather than being preempted.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        self.sweep().await;
        self.run_discovery().await;
        self.poller.run_cycle().await;

        let mut poll_tick = interval(self.config.poll_interval);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut discovery_tick = interval(self.config.discovery_interval);
        discovery_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep_tick = interval(self.config.sweep_interval);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the immediate first tick of each interval; the startup
        // passes above already covered it
        poll_tick.tick().await;
        discovery_tick.tick().await;
        sweep_tick.tick().await;

        info!(
            "engine running: {} titles, polling every {:?}",
            self.config.app_ids.len(),
            self.config.poll_interval
        );

        loop {
            tokio::select! {
                _ = poll_tick.tick() => {
                    self.poller.run_cycle().await;
                }
                _ = discovery_tick.tick() => {
                    self.run_discovery().await;
                }
                _ = sweep_tick.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    info!("engine shutting down");
                    break;
                }
            }
        }
    }

    /// One acquisition pass over every tracked title.
    pub async fn run_discovery(&mut self) {
        let mut added = 0;
        for app_id in self.config.app_ids.clone() {
            let found = self.discovery.acquire(app_id).await;
            added += discovery::merge_into_registry(&self.registry, found, shared::now_millis()).await;
        }

        if added > 0 {
            info!("discovery added {} new servers", added);
            self.save_registry().await;
        } else {
            debug!("discovery found no new servers");
        }
    }

    /// Evicts targets whose title left the configuration or that have not
    /// answered for longer than the staleness window.
    pub async fn sweep(&mut self) {
        let evicted = {
            self.registry
                .write()
                .await
                .sweep(&self.config.app_ids, shared::now_millis())
        };
        if !evicted.is_empty() {
            info!("sweep evicted {} servers", evicted.len());
            self.save_registry().await;
        }
    }

    /// Runs a single poll cycle outside the timer loop.
    pub async fn poll_once(&mut self) {
        self.poller.run_cycle().await;
    }

    /// Last known records, for replay to newly connected subscribers.
    pub async fn snapshot_records(&self) -> Vec<Record> {
        self.registry.read().await.last_records()
    }

    pub fn stats(&self) -> &GlobalStats {
        self.poller.stats()
    }

    pub fn history(&self) -> &ServerHistory {
        self.poller.history()
    }

    async fn save_registry(&self) {
        let persisted = { self.registry.read().await.to_persisted() };
        if let Err(e) = self.store.save(SERVER_LIST_DOC, &persisted).await {
            error!("failed to save server list: {}", e);
        }
    }
}

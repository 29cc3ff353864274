//! Bounded poll scheduler and cycle aggregator
//!
//! One cycle issues one query per tracked target with a fixed parallelism
//! ceiling. Workers perform pure network I/O and report back over a
//! channel; the aggregator on the cycle's own task is the only writer of
//! the registry and the derived caches. A compare-exchange guard drops
//! overlapping cycle starts instead of queueing them, and the documents
//! are persisted exactly once per cycle no matter how many individual
//! polls failed.

use crate::geo::{GeoApi, GeoCache, GeoInfo};
use crate::publish::PublishSink;
use crate::query::QueryClient;
use crate::registry::{PollFailure, TargetRegistry};
use crate::rules;
use crate::stats::{self, GlobalStats, ServerHistory};
use crate::storage::{
    JsonStore, GEO_CACHE_DOC, GLOBAL_STATS_DOC, SERVER_HISTORY_DOC, SERVER_LIST_DOC, TAG_CACHE_DOC,
};
use crate::tags::TagCache;
use crate::config::EngineConfig;
use log::{debug, error, info, warn};
use shared::{
    Metadata, PlayerEntry, RawRules, Record, TargetAddr, HISTORY_RETENTION_DAYS,
    OFFLINE_FAILURE_THRESHOLD, STATS_RETENTION_DAYS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Everything a worker needs to poll one target. Cache decisions (skip
/// rules, skip geo) are made at snapshot time so workers never touch
/// shared state.
struct PollJob {
    addr: TargetAddr,
    app_id: u32,
    want_rules: bool,
    cached_geo: Option<GeoInfo>,
}

/// Raw sub-query results for one successfully polled target.
struct PolledData {
    metadata: Metadata,
    latency: i64,
    players: Vec<PlayerEntry>,
    rules: Option<RawRules>,
    geo: GeoInfo,
    geo_fetched: bool,
}

/// One worker's report back to the aggregator. `data` is `None` when the
/// primary metadata query failed on every probe.
struct PollOutcome {
    addr: TargetAddr,
    app_id: u32,
    data: Option<PolledData>,
}

/// Releases the single-flight flag when the cycle ends, no matter how.
struct CycleGuard(Arc<AtomicBool>);

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The poll scheduler: owns the derived caches and drives full poll
/// cycles against the shared target registry.
pub struct Poller {
    registry: Arc<RwLock<TargetRegistry>>,
    query: Arc<dyn QueryClient>,
    geo_api: Arc<dyn GeoApi>,
    sink: Arc<dyn PublishSink>,
    store: Arc<JsonStore>,
    config: EngineConfig,
    tags: TagCache,
    geo: GeoCache,
    history: ServerHistory,
    stats: GlobalStats,
    running: Arc<AtomicBool>,
    last_cycle_date: Option<String>,
}

impl Poller {
    pub fn new(
        registry: Arc<RwLock<TargetRegistry>>,
        query: Arc<dyn QueryClient>,
        geo_api: Arc<dyn GeoApi>,
        sink: Arc<dyn PublishSink>,
        store: Arc<JsonStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            query,
            geo_api,
            sink,
            store,
            config,
            tags: TagCache::new(),
            geo: GeoCache::new(),
            history: ServerHistory::new(),
            stats: GlobalStats::new(),
            running: Arc::new(AtomicBool::new(false)),
            last_cycle_date: None,
        }
    }

    /// Restores the derived cache documents from storage. Unreadable
    /// documents degrade to empty caches; a future save will heal them.
    pub async fn load_caches(&mut self) {
        match self.store.load::<TagCache>(TAG_CACHE_DOC).await {
            Ok(Some(tags)) => {
                info!("loaded tag cache with {} entries", tags.len());
                self.tags = tags;
            }
            Ok(None) => {}
            Err(e) => warn!("failed to load tag cache ({}), starting empty", e),
        }
        match self.store.load::<GeoCache>(GEO_CACHE_DOC).await {
            Ok(Some(geo)) => {
                info!("loaded geo cache with {} entries", geo.len());
                self.geo = geo;
            }
            Ok(None) => {}
            Err(e) => warn!("failed to load geo cache ({}), starting empty", e),
        }
        match self.store.load::<ServerHistory>(SERVER_HISTORY_DOC).await {
            Ok(Some(history)) => {
                info!("loaded history for {} servers", history.len());
                self.history = history;
            }
            Ok(None) => {}
            Err(e) => warn!("failed to load server history ({}), starting empty", e),
        }
        match self.store.load::<GlobalStats>(GLOBAL_STATS_DOC).await {
            Ok(Some(stats)) => {
                info!("loaded global stats for {} games", stats.games.len());
                self.stats = stats;
            }
            Ok(None) => {}
            Err(e) => warn!("failed to load global stats ({}), starting empty", e),
        }
    }

    pub fn stats(&self) -> &GlobalStats {
        &self.stats
    }

    pub fn history(&self) -> &ServerHistory {
        &self.history
    }

    /// Runs one full poll cycle. A cycle that starts while another is
    /// still running is a no-op; overlapping timer firings are dropped,
    /// not queued.
    pub async fn run_cycle(&mut self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("previous poll cycle still running, skipping this one");
            return;
        }
        let _guard = CycleGuard(Arc::clone(&self.running));

        let today = stats::local_date_string();
        if self.last_cycle_date.as_deref() != Some(today.as_str()) {
            if let Some(previous) = &self.last_cycle_date {
                info!("local day changed: {} -> {}", previous, today);
            }
            self.last_cycle_date = Some(today.clone());
        }

        let now_secs = shared::now_secs();
        let jobs: Vec<PollJob> = {
            let registry = self.registry.read().await;
            registry
                .poll_targets()
                .into_iter()
                .map(|(addr, app_id)| PollJob {
                    want_rules: self.tags.needs_refresh(&addr.to_string(), now_secs),
                    cached_geo: self.geo.cached(&addr.ip),
                    addr,
                    app_id,
                })
                .collect()
        };

        info!(
            "polling {} targets (concurrency limit {})",
            jobs.len(),
            self.config.concurrency
        );
        self.stats.reset_online();

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let (tx, mut rx) = mpsc::unbounded_channel();

        for job in jobs {
            let semaphore = Arc::clone(&semaphore);
            let query = Arc::clone(&self.query);
            let geo_api = Arc::clone(&self.geo_api);
            let tx = tx.clone();
            let timeout = self.config.info_timeout;
            let probes = self.config.latency_probes;

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let outcome = poll_target(query, geo_api, job, timeout, probes).await;
                let _ = tx.send(outcome);
            });
        }
        drop(tx);

        let mut to_publish = Vec::new();
        while let Some(outcome) = rx.recv().await {
            self.apply_outcome(outcome, &today, &mut to_publish).await;
        }

        // All targets processed: persist exactly once, then fan out
        self.persist_cycle().await;

        for record in &to_publish {
            self.sink.publish(record);
        }
        let subscribers = self.sink.subscriber_count();
        self.sink.publish_subscriber_count(subscribers);
        info!(
            "pushed {} record updates to {} subscribers, {} players online",
            to_publish.len(),
            subscribers,
            self.stats.current_online
        );
    }

    /// Applies one worker report to the registry and the derived caches.
    /// Runs on the cycle task, which is the only writer.
    async fn apply_outcome(
        &mut self,
        outcome: PollOutcome,
        today: &str,
        to_publish: &mut Vec<Record>,
    ) {
        let key = outcome.addr.to_string();
        match outcome.data {
            Some(data) => {
                let tags = match &data.rules {
                    Some(raw) => {
                        let normalized = rules::normalize(raw);
                        let candidate = rules::extract_tags(&normalized);
                        self.tags.observe(&key, candidate, shared::now_secs())
                    }
                    // Fresh cache entry (or a failed rule sub-query):
                    // republish whatever is cached
                    None => self
                        .tags
                        .current(&key)
                        .map(<[String]>::to_vec)
                        .unwrap_or_default(),
                };

                if data.geo_fetched {
                    self.geo.insert(&outcome.addr.ip, data.geo.clone());
                }

                let record = build_record(&outcome.addr, outcome.app_id, &data, tags);

                {
                    let mut registry = self.registry.write().await;
                    registry.record_success(&outcome.addr, record.clone(), shared::now_millis());
                }

                self.history.update(
                    &record,
                    today,
                    &stats::local_date_days_ago(HISTORY_RETENTION_DAYS),
                );
                {
                    let registry = self.registry.read().await;
                    self.stats.update_for_app(
                        outcome.app_id,
                        &record.game_description,
                        &registry,
                        today,
                        &stats::local_date_days_ago(STATS_RETENTION_DAYS),
                    );
                }
                self.stats.add_online(record.current_players);
                to_publish.push(record);
            }
            None => {
                let failure = { self.registry.write().await.record_failure(&outcome.addr) };
                match failure {
                    Some(PollFailure::Degraded(count)) => {
                        debug!(
                            "{} unreachable ({}/{} failures)",
                            outcome.addr, count, OFFLINE_FAILURE_THRESHOLD
                        );
                    }
                    Some(PollFailure::WentOffline(record)) => {
                        info!("{} is offline", outcome.addr);
                        to_publish.push(record);
                    }
                    Some(PollFailure::Evicted) => {
                        info!("{} removed: never produced a successful poll", outcome.addr);
                    }
                    None => {}
                }
            }
        }
    }

    /// Persists the registry and every derived document. Failures are
    /// logged and left for the next cycle to retry; in-memory state stays
    /// authoritative either way.
    async fn persist_cycle(&self) {
        let persisted = { self.registry.read().await.to_persisted() };
        if let Err(e) = self.store.save(SERVER_LIST_DOC, &persisted).await {
            error!("failed to save server list: {}", e);
        }
        if let Err(e) = self.store.save(TAG_CACHE_DOC, &self.tags).await {
            error!("failed to save tag cache: {}", e);
        }
        if let Err(e) = self.store.save(GEO_CACHE_DOC, &self.geo).await {
            error!("failed to save geo cache: {}", e);
        }
        if let Err(e) = self.store.save(SERVER_HISTORY_DOC, &self.history).await {
            error!("failed to save server history: {}", e);
        }
        if let Err(e) = self.store.save(GLOBAL_STATS_DOC, &self.stats).await {
            error!("failed to save global stats: {}", e);
        }
    }

    #[cfg(test)]
    fn force_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }
}

/// Polls one target: concurrent metadata probes (minimum latency wins),
/// then the tolerant sub-queries. Pure I/O; all cache decisions were made
/// when the job was built.
async fn poll_target(
    query: Arc<dyn QueryClient>,
    geo_api: Arc<dyn GeoApi>,
    job: PollJob,
    timeout: Duration,
    probes: usize,
) -> PollOutcome {
    let Some((metadata, latency)) = best_info_probe(&query, &job.addr, timeout, probes).await
    else {
        return PollOutcome {
            addr: job.addr,
            app_id: job.app_id,
            data: None,
        };
    };
    debug!("best probe for {}: {} ms", job.addr, latency);

    let players = match query.query_players(&job.addr, timeout).await {
        Ok(players) => players,
        Err(e) => {
            debug!("player roster query failed ({}): {}", job.addr, e);
            Vec::new()
        }
    };

    let rules = if job.want_rules {
        match query.query_rules(&job.addr, timeout).await {
            Ok(rules) => Some(rules),
            Err(e) => {
                debug!("rule query failed ({}): {}", job.addr, e);
                None
            }
        }
    } else {
        None
    };

    let (geo, geo_fetched) = match &job.cached_geo {
        Some(cached) => (cached.clone(), false),
        None => match geo_api.lookup(&job.addr.ip).await {
            Ok(lookup) => (GeoInfo::from(lookup), true),
            Err(e) => {
                warn!("geolocation lookup failed ({}): {}", job.addr.ip, e);
                (GeoInfo::unknown(), false)
            }
        },
    };

    PollOutcome {
        addr: job.addr,
        app_id: job.app_id,
        data: Some(PolledData {
            metadata,
            latency,
            players,
            rules,
            geo,
            geo_fetched,
        }),
    }
}

/// Issues the metadata probes concurrently and keeps the fastest
/// successful answer. Returns `None` when every probe failed.
async fn best_info_probe(
    query: &Arc<dyn QueryClient>,
    addr: &TargetAddr,
    timeout: Duration,
    probes: usize,
) -> Option<(Metadata, i64)> {
    let mut set = JoinSet::new();
    for attempt in 1..=probes.max(1) {
        let query = Arc::clone(query);
        let addr = addr.clone();
        set.spawn(async move {
            let started = Instant::now();
            match query.query_info(&addr, timeout).await {
                Ok(metadata) => Some((metadata, started.elapsed().as_millis() as i64)),
                Err(e) => {
                    debug!("info probe {} failed ({}): {}", attempt, addr, e);
                    None
                }
            }
        });
    }

    let mut best: Option<(Metadata, i64)> = None;
    while let Some(joined) = set.join_next().await {
        if let Ok(Some((metadata, latency))) = joined {
            if best.as_ref().map_or(true, |(_, b)| latency < *b) {
                best = Some((metadata, latency));
            }
        }
    }
    best
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

fn build_record(addr: &TargetAddr, app_id: u32, data: &PolledData, tags: Vec<String>) -> Record {
    let meta = &data.metadata;
    Record {
        ip: addr.ip.clone(),
        port: addr.port,
        app_id,
        game_description: non_empty_or(&meta.game, "-"),
        name: non_empty_or(&meta.name, "-"),
        map: non_empty_or(&meta.map, "-"),
        version: non_empty_or(&meta.version, "-"),
        current_players: meta.players,
        max_players: meta.normalized_max_players(),
        os: meta.os_label().to_string(),
        players: data.players.clone(),
        latency: data.latency,
        country: data.geo.country.clone(),
        isp: data.geo.isp.clone(),
        offline: false,
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{GeoError, GeoLookup};
    use crate::query::QueryError;
    use async_trait::async_trait;
    use shared::RuleValue;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    struct MockQuery {
        failing: Mutex<HashSet<String>>,
        players_fail: bool,
        rules: Option<RawRules>,
        info_calls: AtomicU32,
        rules_calls: AtomicU32,
        concurrent: AtomicU32,
        max_concurrent: AtomicU32,
    }

    impl MockQuery {
        fn new() -> Self {
            Self {
                failing: Mutex::new(HashSet::new()),
                players_fail: false,
                rules: None,
                info_calls: AtomicU32::new(0),
                rules_calls: AtomicU32::new(0),
                concurrent: AtomicU32::new(0),
                max_concurrent: AtomicU32::new(0),
            }
        }

        fn with_rules(rules: RawRules) -> Self {
            Self {
                rules: Some(rules),
                ..Self::new()
            }
        }

        fn fail_address(&self, addr: &TargetAddr) {
            self.failing.lock().unwrap().insert(addr.to_string());
        }

        fn recover_address(&self, addr: &TargetAddr) {
            self.failing.lock().unwrap().remove(&addr.to_string());
        }
    }

    #[async_trait]
    impl QueryClient for MockQuery {
        async fn query_info(
            &self,
            addr: &TargetAddr,
            _timeout: Duration,
        ) -> Result<Metadata, QueryError> {
            self.info_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            if self.failing.lock().unwrap().contains(&addr.to_string()) {
                return Err(QueryError::Timeout);
            }
            Ok(Metadata {
                name: format!("Server {}", addr),
                map: "de_test".into(),
                game: "Test Game".into(),
                version: "1.0".into(),
                environment: 'l',
                players: 4,
                max_players: 16,
            })
        }

        async fn query_players(
            &self,
            _addr: &TargetAddr,
            _timeout: Duration,
        ) -> Result<Vec<PlayerEntry>, QueryError> {
            if self.players_fail {
                return Err(QueryError::Protocol("truncated response".into()));
            }
            Ok(vec![PlayerEntry::from_raw("alice", 7, 120.0)])
        }

        async fn query_rules(
            &self,
            _addr: &TargetAddr,
            _timeout: Duration,
        ) -> Result<RawRules, QueryError> {
            self.rules_calls.fetch_add(1, Ordering::SeqCst);
            match &self.rules {
                Some(rules) => Ok(rules.clone()),
                None => Err(QueryError::Protocol("rules unsupported".into())),
            }
        }
    }

    struct MockGeo {
        calls: AtomicU32,
    }

    impl MockGeo {
        fn new() -> Self {
            Self { calls: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl GeoApi for MockGeo {
        async fn lookup(&self, _ip: &str) -> Result<GeoLookup, GeoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GeoLookup {
                country: Some("SE".into()),
                org: Some("AS1299 Arelion".into()),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<Record>>,
        counts: Mutex<Vec<usize>>,
    }

    impl PublishSink for RecordingSink {
        fn publish(&self, record: &Record) {
            self.records.lock().unwrap().push(record.clone());
        }

        fn publish_subscriber_count(&self, count: usize) {
            self.counts.lock().unwrap().push(count);
        }

        fn subscriber_count(&self) -> usize {
            0
        }
    }

    struct Fixture {
        poller: Poller,
        registry: Arc<RwLock<TargetRegistry>>,
        query: Arc<MockQuery>,
        geo: Arc<MockGeo>,
        sink: Arc<RecordingSink>,
        _dir: tempfile::TempDir,
    }

    async fn fixture_with(query: MockQuery, config: EngineConfig) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(RwLock::new(TargetRegistry::new()));
        let query = Arc::new(query);
        let geo = Arc::new(MockGeo::new());
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(JsonStore::new(dir.path()));

        let poller = Poller::new(
            Arc::clone(&registry),
            query.clone() as Arc<dyn QueryClient>,
            geo.clone() as Arc<dyn GeoApi>,
            sink.clone() as Arc<dyn PublishSink>,
            store,
            config,
        );

        Fixture { poller, registry, query, geo, sink, _dir: dir }
    }

    fn quick_config() -> EngineConfig {
        EngineConfig {
            latency_probes: 1,
            app_ids: vec![730],
            ..EngineConfig::default()
        }
    }

    fn addr(n: u8) -> TargetAddr {
        TargetAddr::new(format!("198.51.100.{}", n), 27015)
    }

    async fn track(fixture: &Fixture, addr: &TargetAddr) {
        fixture
            .registry
            .write()
            .await
            .insert_discovered(addr.clone(), 730, shared::now_millis());
    }

    #[tokio::test]
    async fn test_cycle_polls_all_targets_and_publishes() {
        let mut fixture = fixture_with(MockQuery::new(), quick_config()).await;
        track(&fixture, &addr(1)).await;
        track(&fixture, &addr(2)).await;

        fixture.poller.run_cycle().await;

        let records = fixture.sink.records.lock().unwrap().clone();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.offline && r.current_players == 4));

        // Both targets are online with fresh data
        let registry = fixture.registry.read().await;
        assert!(registry.get(&addr(1)).unwrap().last_data.is_some());
        assert_eq!(registry.get(&addr(2)).unwrap().failure_count, 0);

        // Aggregates followed
        assert_eq!(fixture.poller.stats().current_online, 8);
        let game = fixture.poller.stats().games.get(&730).unwrap();
        assert_eq!(game.total_servers, 2);
        assert_eq!(game.current_players, 8);

        // Subscriber count broadcast once per cycle
        assert_eq!(fixture.sink.counts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_after_three_failed_cycles() {
        let mut fixture = fixture_with(MockQuery::new(), quick_config()).await;
        track(&fixture, &addr(1)).await;

        // Establish a prior successful record
        fixture.poller.run_cycle().await;
        fixture.query.fail_address(&addr(1));

        fixture.poller.run_cycle().await;
        fixture.poller.run_cycle().await;
        assert_eq!(fixture.sink.records.lock().unwrap().len(), 1, "degraded polls publish nothing");

        fixture.poller.run_cycle().await;
        let records = fixture.sink.records.lock().unwrap().clone();
        assert_eq!(records.len(), 2);

        let offline = records.last().unwrap();
        assert!(offline.offline);
        assert_eq!(offline.current_players, 0);
        assert!(offline.players.is_empty());

        // Still tracked for recovery
        assert!(fixture.registry.read().await.contains(&addr(1)));
    }

    #[tokio::test]
    async fn test_never_successful_target_evicted_without_publish() {
        let mut fixture = fixture_with(MockQuery::new(), quick_config()).await;
        track(&fixture, &addr(1)).await;
        fixture.query.fail_address(&addr(1));

        for _ in 0..3 {
            fixture.poller.run_cycle().await;
        }

        assert!(fixture.sink.records.lock().unwrap().is_empty());
        assert!(!fixture.registry.read().await.contains(&addr(1)));
    }

    #[tokio::test]
    async fn test_recovery_resets_failure_count() {
        let mut fixture = fixture_with(MockQuery::new(), quick_config()).await;
        track(&fixture, &addr(1)).await;

        fixture.poller.run_cycle().await;
        fixture.query.fail_address(&addr(1));
        fixture.poller.run_cycle().await;
        fixture.query.recover_address(&addr(1));
        fixture.poller.run_cycle().await;

        let registry = fixture.registry.read().await;
        assert_eq!(registry.get(&addr(1)).unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn test_concurrency_stays_under_ceiling() {
        let config = EngineConfig {
            concurrency: 3,
            ..quick_config()
        };
        let mut fixture = fixture_with(MockQuery::new(), config).await;
        for n in 1..=12 {
            track(&fixture, &addr(n)).await;
        }

        fixture.poller.run_cycle().await;

        let max_seen = fixture.query.max_concurrent.load(Ordering::SeqCst);
        assert!(max_seen <= 3, "observed {} concurrent queries", max_seen);
        assert_eq!(fixture.sink.records.lock().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_single_flight_guard_drops_overlapping_cycle() {
        let mut fixture = fixture_with(MockQuery::new(), quick_config()).await;
        track(&fixture, &addr(1)).await;

        fixture.poller.force_running();
        fixture.poller.run_cycle().await;

        assert_eq!(fixture.query.info_calls.load(Ordering::SeqCst), 0);
        assert!(fixture.sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_roster_query_does_not_fail_target() {
        let query = MockQuery {
            players_fail: true,
            ..MockQuery::new()
        };
        let mut fixture = fixture_with(query, quick_config()).await;
        track(&fixture, &addr(1)).await;

        fixture.poller.run_cycle().await;

        let records = fixture.sink.records.lock().unwrap().clone();
        assert_eq!(records.len(), 1);
        assert!(!records[0].offline);
        assert!(records[0].players.is_empty());
    }

    #[tokio::test]
    async fn test_rules_queried_only_when_cache_stale() {
        let rules = RawRules::List(vec![("PVE_b".to_string(), RuleValue::Bool(true))]);
        let mut fixture = fixture_with(MockQuery::with_rules(rules), quick_config()).await;
        track(&fixture, &addr(1)).await;

        fixture.poller.run_cycle().await;
        fixture.poller.run_cycle().await;

        // Second cycle hits the fresh tag cache and skips the sub-query
        assert_eq!(fixture.query.rules_calls.load(Ordering::SeqCst), 1);

        let records = fixture.sink.records.lock().unwrap().clone();
        assert_eq!(records[0].tags, vec!["PvE"]);
        assert_eq!(records[1].tags, vec!["PvE"], "cached tags republished");
    }

    #[tokio::test]
    async fn test_geo_fetched_once_then_cached() {
        let mut fixture = fixture_with(MockQuery::new(), quick_config()).await;
        track(&fixture, &addr(1)).await;

        fixture.poller.run_cycle().await;
        fixture.poller.run_cycle().await;

        assert_eq!(fixture.geo.calls.load(Ordering::SeqCst), 1);
        let records = fixture.sink.records.lock().unwrap().clone();
        assert_eq!(records[1].country, "SE");
        assert_eq!(records[1].isp, "Arelion");
    }

    #[tokio::test]
    async fn test_cycle_persists_documents_once() {
        let mut fixture = fixture_with(MockQuery::new(), quick_config()).await;
        track(&fixture, &addr(1)).await;

        fixture.poller.run_cycle().await;

        for doc in [
            SERVER_LIST_DOC,
            TAG_CACHE_DOC,
            GEO_CACHE_DOC,
            SERVER_HISTORY_DOC,
            GLOBAL_STATS_DOC,
        ] {
            assert!(fixture._dir.path().join(doc).exists(), "{} missing", doc);
        }
    }

    #[tokio::test]
    async fn test_multiple_probes_pick_a_latency() {
        let config = EngineConfig {
            latency_probes: 5,
            ..quick_config()
        };
        let mut fixture = fixture_with(MockQuery::new(), config).await;
        track(&fixture, &addr(1)).await;

        fixture.poller.run_cycle().await;

        assert_eq!(fixture.query.info_calls.load(Ordering::SeqCst), 5);
        let records = fixture.sink.records.lock().unwrap().clone();
        assert_eq!(records.len(), 1);
        assert!(records[0].latency >= 0);
    }
}

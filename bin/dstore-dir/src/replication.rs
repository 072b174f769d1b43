//! Replication manager: failure detection and replica repair
//!
//! Three background loops share one [`ReplicationManager`]:
//! - the health checker evaluates every OSD on a fixed period and schedules
//!   repairs for the chunks of an OSD that went DOWN;
//! - the repair consumer executes queued tasks one at a time;
//! - the scanner periodically walks every file, prunes replicas on OSDs
//!   that are no longer registered and queues under-replicated chunks.

use crate::state::ClusterState;
use dstore_client::OsdClient;
use dstore_common::{ChunkId, FileMeta, OsdId, ReplicationConfig, Shutdown, ShutdownSignal};
use dstore_meta_store::MetaStore;
use dstore_placement::{HealthStatus, HealthThresholds, PlacementPolicy, Transition};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// One under-replicated chunk waiting for extra copies
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepairTask {
    pub file_key: String,
    pub file_name: String,
    pub chunk_id: ChunkId,
    pub current_replicas: usize,
    pub target_replicas: usize,
    pub created_at: Instant,
}

/// What executing a [`RepairTask`] did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The file or chunk no longer exists
    Dropped,
    /// The chunk already has enough alive replicas
    NoOp,
    /// `added` new replicas were stored and recorded
    Repaired { added: usize },
    Failed(RepairFailure),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepairFailure {
    NoAliveSource,
    NoTarget,
    FetchFailed,
    StoreFailed,
}

/// Owns the health checker, the repair engine and placement over the
/// shared [`ClusterState`].
pub struct ReplicationManager {
    state: Arc<ClusterState>,
    store: MetaStore,
    config: ReplicationConfig,
    policy: PlacementPolicy,
    thresholds: HealthThresholds,
    queue: Mutex<VecDeque<RepairTask>>,
    queue_notify: Notify,
    /// Held across every table change that is mirrored to the store, so
    /// the on-disk record follows the last table write
    persist_lock: Mutex<()>,
    repairs_succeeded: AtomicU64,
    repairs_failed: AtomicU64,
}

impl ReplicationManager {
    #[must_use]
    pub fn new(state: Arc<ClusterState>, store: MetaStore, config: ReplicationConfig) -> Self {
        Self {
            policy: PlacementPolicy::new(config.replication_factor),
            thresholds: HealthThresholds::from_config(&config),
            state,
            store,
            config,
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            persist_lock: Mutex::new(()),
            repairs_succeeded: AtomicU64::new(0),
            repairs_failed: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    #[must_use]
    pub const fn store(&self) -> &MetaStore {
        &self.store
    }

    #[must_use]
    pub fn repairs_succeeded(&self) -> u64 {
        self.repairs_succeeded.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn repairs_failed(&self) -> u64 {
        self.repairs_failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn osd_client(&self, osd_id: &OsdId) -> Option<OsdClient> {
        self.state
            .slave(osd_id)
            .map(|slave| OsdClient::for_slave(&slave).with_connect_timeout(self.config.connect_timeout()))
    }

    /// Targets for a new chunk
    #[must_use]
    pub fn pick_for_write(&self) -> Vec<OsdId> {
        self.policy.place_chunk(&self.state.candidates())
    }

    /// Persist the current in-memory metadata of a file. A file that is
    /// no longer in the table is left alone.
    pub fn persist(&self, file_key: &str) {
        let _guard = self.persist_lock.lock();
        if let Some(meta) = self.state.file(file_key) {
            self.save(&meta);
        }
    }

    /// Register a completed upload and persist it
    pub fn commit_file(&self, meta: FileMeta) {
        let _guard = self.persist_lock.lock();
        let key = meta.key();
        self.state.insert_file(meta);
        if let Some(meta) = self.state.file(&key) {
            self.save(&meta);
        }
    }

    /// Remove a file from the table and from the store
    pub fn forget_file(&self, file_key: &str) -> Option<FileMeta> {
        let _guard = self.persist_lock.lock();
        let meta = self.state.remove_file(file_key)?;
        if let Err(e) = self.store.delete(file_key) {
            error!("Failed to delete metadata of '{}': {}", file_key, e);
        }
        Some(meta)
    }

    fn save(&self, meta: &FileMeta) {
        if let Err(e) = self.store.save(meta) {
            error!("Failed to persist metadata for '{}': {}", meta.key(), e);
        }
    }

    // ---- Health checker ----

    /// Evaluate every OSD at `now` and react to the transitions.
    pub fn health_tick(&self, now: Instant) -> Vec<Transition> {
        let transitions: Vec<Transition> = {
            let mut health = self.state.health.write();
            health
                .values_mut()
                .filter_map(|h| h.evaluate(now, &self.thresholds))
                .collect()
        };

        for t in &transitions {
            let silence = t
                .silence
                .map_or_else(|| "never".to_string(), |s| format!("{}ms", s.as_millis()));
            match (t.from, t.to) {
                (_, HealthStatus::Down) => {
                    warn!("OSD {} {} -> {} (silence {})", t.osd_id, t.from, t.to, silence);
                }
                (HealthStatus::Down, HealthStatus::Up) => {
                    info!("OSD {} recovered (silence {})", t.osd_id, silence);
                }
                _ => info!("OSD {} {} -> {} (silence {})", t.osd_id, t.from, t.to, silence),
            }
            if t.is_failure() {
                let queued = self.schedule_repair_for_osd(&t.osd_id);
                info!("Queued {} repair tasks after losing {}", queued, t.osd_id);
            }
        }
        transitions
    }

    /// Queue a repair for every chunk stored on `osd_id` whose alive
    /// replicas are below the replication factor.
    pub fn schedule_repair_for_osd(&self, osd_id: &OsdId) -> usize {
        let statuses = self.state.statuses();
        let tasks: Vec<RepairTask> = {
            let files = self.state.files.read();
            files
                .iter()
                .flat_map(|(key, meta)| {
                    meta.chunk_ids
                        .iter()
                        .filter(|chunk| meta.locations(chunk).contains(osd_id))
                        .filter_map(|chunk| self.task_if_under_replicated(key, meta, chunk, &statuses))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        let count = tasks.len();
        self.enqueue_all(tasks);
        count
    }

    fn task_if_under_replicated(
        &self,
        file_key: &str,
        meta: &FileMeta,
        chunk_id: &ChunkId,
        statuses: &HashMap<OsdId, HealthStatus>,
    ) -> Option<RepairTask> {
        let alive = alive_count(meta.locations(chunk_id), statuses);
        (alive < self.config.replication_factor).then(|| RepairTask {
            file_key: file_key.to_string(),
            file_name: meta.file_name.clone(),
            chunk_id: chunk_id.clone(),
            current_replicas: alive,
            target_replicas: self.config.replication_factor,
            created_at: Instant::now(),
        })
    }

    // ---- Repair engine ----

    pub fn enqueue(&self, task: RepairTask) {
        debug!(
            "Queued repair of chunk {} of '{}' ({}/{})",
            task.chunk_id.short(),
            task.file_name,
            task.current_replicas,
            task.target_replicas
        );
        self.queue.lock().push_back(task);
        self.queue_notify.notify_one();
    }

    fn enqueue_all(&self, tasks: Vec<RepairTask>) {
        for task in tasks {
            self.enqueue(task);
        }
    }

    /// Next queued task, waiting at most `wait` for one to arrive
    pub async fn next_task(&self, wait: Duration) -> Option<RepairTask> {
        if let Some(task) = self.queue.lock().pop_front() {
            return Some(task);
        }
        let _ = tokio::time::timeout(wait, self.queue_notify.notified()).await;
        self.queue.lock().pop_front()
    }

    /// Prune replicas on unregistered OSDs and queue every chunk below
    /// the replication factor. Returns the number of tasks queued.
    pub fn full_repair_scan(&self) -> usize {
        let registered: HashSet<OsdId> = self.state.osds.read().keys().cloned().collect();
        let statuses = self.state.statuses();

        let mut pruned = Vec::new();
        let mut tasks = Vec::new();
        {
            let mut files = self.state.files.write();
            for (key, meta) in files.iter_mut() {
                let removed = meta.prune_locations(|id| registered.contains(id));
                if removed > 0 {
                    info!("Pruned {} stale replica entries from '{}'", removed, key);
                    pruned.push(key.clone());
                }
                for chunk in &meta.chunk_ids {
                    if let Some(task) = self.task_if_under_replicated(key, meta, chunk, &statuses) {
                        tasks.push(task);
                    }
                }
            }
        }

        for key in &pruned {
            self.persist(key);
        }
        let count = tasks.len();
        if count > 0 {
            info!("Repair scan found {} under-replicated chunks", count);
        }
        self.enqueue_all(tasks);
        count
    }

    fn fail(&self, task: &RepairTask, reason: RepairFailure) -> RepairOutcome {
        self.repairs_failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Repair of chunk {} of '{}' failed: {:?}",
            task.chunk_id.short(),
            task.file_name,
            reason
        );
        RepairOutcome::Failed(reason)
    }

    /// Bring one chunk back to the target replica count.
    pub async fn execute_repair(&self, task: &RepairTask) -> RepairOutcome {
        let Some(meta) = self.state.file(&task.file_key) else {
            debug!("Dropping repair for deleted file '{}'", task.file_key);
            return RepairOutcome::Dropped;
        };
        if !meta.chunk_ids.contains(&task.chunk_id) {
            return RepairOutcome::Dropped;
        }

        let holders = meta.locations(&task.chunk_id).to_vec();
        let statuses = self.state.statuses();
        let sources: Vec<OsdId> = holders
            .iter()
            .filter(|id| statuses.get(*id).is_some_and(|s| s.is_alive()))
            .cloned()
            .collect();
        if sources.is_empty() {
            return self.fail(task, RepairFailure::NoAliveSource);
        }

        let Some(needed) = task
            .target_replicas
            .checked_sub(sources.len())
            .filter(|n| *n > 0)
        else {
            return RepairOutcome::NoOp;
        };

        let targets = self
            .policy
            .place_repair(&self.state.candidates(), &holders, needed);
        if targets.is_empty() {
            return self.fail(task, RepairFailure::NoTarget);
        }

        let mut data = None;
        for source in &sources {
            let Some(client) = self.osd_client(source) else {
                continue;
            };
            match client.get_chunk(&task.chunk_id).await {
                Ok(Some(bytes)) => {
                    data = Some(bytes);
                    break;
                }
                Ok(None) => warn!("OSD {} lost chunk {}", source, task.chunk_id.short()),
                Err(e) => warn!("Fetch of chunk {} from {} failed: {}", task.chunk_id.short(), source, e),
            }
        }
        let Some(data) = data else {
            return self.fail(task, RepairFailure::FetchFailed);
        };

        let stores = targets.iter().map(|target| {
            let client = self.osd_client(target);
            let data = data.clone();
            async move {
                let Some(client) = client else {
                    return false;
                };
                match client.store_chunk(&task.chunk_id, data).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Repair store of chunk {} on {} failed: {}", task.chunk_id.short(), target, e);
                        false
                    }
                }
            }
        });
        let results = join_all(stores).await;

        let mut added = 0;
        for (target, stored) in targets.iter().zip(results) {
            if stored && self.state.add_location(&task.file_key, &task.chunk_id, target) {
                self.state.bump_chunk_count(target);
                self.repairs_succeeded.fetch_add(1, Ordering::Relaxed);
                added += 1;
            }
        }
        if added == 0 {
            return self.fail(task, RepairFailure::StoreFailed);
        }

        self.persist(&task.file_key);
        info!(
            "Repaired chunk {} of '{}': +{} replicas ({} alive before)",
            task.chunk_id.short(),
            task.file_name,
            added,
            sources.len()
        );
        RepairOutcome::Repaired { added }
    }

    // ---- Background loops ----

    /// Spawn the health checker, repair consumer and scanner. They stop when
    /// `shutdown` is triggered.
    pub fn start(self: &Arc<Self>, shutdown: &Shutdown, tasks: &mut JoinSet<()>) {
        tasks.spawn(Arc::clone(self).health_loop(shutdown.subscribe()));
        tasks.spawn(Arc::clone(self).repair_loop(shutdown.subscribe()));
        tasks.spawn(Arc::clone(self).scan_loop(shutdown.subscribe()));
        info!(
            "Replication manager started (factor {}, check every {:?}, scan every {:?})",
            self.config.replication_factor,
            self.config.health_check_interval(),
            self.config.repair_scan_interval()
        );
    }

    async fn health_loop(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(self.config.health_check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                _ = interval.tick() => {
                    self.health_tick(Instant::now());
                }
            }
        }
        debug!("Health checker stopped");
    }

    async fn repair_loop(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let wait = self.config.repair_poll_timeout();
        loop {
            let task = tokio::select! {
                () = shutdown.wait() => break,
                task = self.next_task(wait) => task,
            };
            if let Some(task) = task {
                self.execute_repair(&task).await;
            }
        }
        debug!("Repair consumer stopped");
    }

    async fn scan_loop(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let period = self.config.repair_scan_interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                _ = interval.tick() => {
                    self.full_repair_scan();
                }
            }
        }
        debug!("Repair scanner stopped");
    }

    // ---- Reports ----

    /// Text block answered to `STATS`
    #[must_use]
    pub fn stats_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Replication Stats ===");
        let _ = writeln!(out, "Factor      : {}", self.config.replication_factor);
        let _ = writeln!(out, "Repairs OK  : {}", self.repairs_succeeded());
        let _ = writeln!(out, "Repairs KO  : {}", self.repairs_failed());
        let _ = writeln!(out, "Queue size  : {}", self.queue_len());
        let _ = writeln!(out);
        let _ = writeln!(out, "=== OSD Health ===");
        for h in self.state.health_snapshot() {
            let _ = writeln!(out, "{} | {} | chunks={}", h.osd_id, h.status, h.chunk_count);
        }
        out
    }
}

fn alive_count(locations: &[OsdId], statuses: &HashMap<OsdId, HealthStatus>) -> usize {
    locations
        .iter()
        .filter(|id| statuses.get(*id).is_some_and(|s| s.is_alive()))
        .count()
}

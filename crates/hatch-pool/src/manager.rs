//! Sandbox manager facade: claim/get/list/pause/resume/kill, route syncing
//! around every transition, the periodic proxy refresh, and the startup
//! sequence (peer discovery, cache sync, pool bootstrap, timer recovery).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use hatch_store::{Cache, CacheHandler, SandboxRecord, SandboxStore};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventHandler, EventType, SandboxEvent};
use crate::pool::{ClaimOptions, Pool};
use crate::routes::{Route, RouteRegistry};
use crate::sandbox::Sandbox;
use crate::template::PoolTemplate;
use crate::timer::TimerHub;

pub struct SandboxManager {
    config: ManagerConfig,
    store: Arc<dyn SandboxStore>,
    cache: Arc<Cache>,
    pools: HashMap<String, Arc<Pool>>,
    routes: Arc<RouteRegistry>,
    timers: TimerHub,
    bus: Arc<EventBus>,
    claim_permits: Arc<Semaphore>,
    ready: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SandboxManager {
    pub fn new(
        store: Arc<dyn SandboxStore>,
        templates: Vec<PoolTemplate>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let cache = Arc::new(Cache::new(store.clone(), &config.system_namespace));
        let bus = Arc::new(EventBus::new());
        let routes = Arc::new(RouteRegistry::new(
            config.proxy_port,
            config.peer_push_timeout,
        ));
        let timers = TimerHub::new(store.clone(), cache.clone(), bus.clone());

        let mut pools = HashMap::new();
        for template in templates {
            let pool = Pool::new(
                template,
                &config.system_namespace,
                store.clone(),
                cache.clone(),
                config.max_create_qps,
            );
            pools.insert(pool.name().to_string(), pool);
        }

        let manager = Arc::new(Self {
            claim_permits: Arc::new(Semaphore::new(config.max_claim_workers)),
            config,
            store,
            cache: cache.clone(),
            pools,
            routes,
            timers,
            bus: bus.clone(),
            ready: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&manager);
        bus.register(
            EventType::SandboxCreated,
            Arc::new(CreatedHandler {
                manager: weak.clone(),
            }),
        );
        bus.register(
            EventType::SandboxKill,
            Arc::new(KillHandler {
                manager: weak.clone(),
            }),
        );
        bus.register(EventType::SandboxReady, Arc::new(ReadyDebugHandler));
        cache.add_handler(Arc::new(StreamDispatcher { manager: weak }));

        manager
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn routes(&self) -> &Arc<RouteRegistry> {
        &self.routes
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<Pool>> {
        self.pools.values()
    }

    pub fn pool(&self, template: &str) -> Option<&Arc<Pool>> {
        self.pools.get(template)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn sandbox_for(&self, record: SandboxRecord) -> Sandbox {
        Sandbox::new(
            record,
            self.store.clone(),
            self.timers.clone(),
            self.config.transition_wait_timeout,
            self.config.transition_wait_step,
        )
    }

    /// Claims a warm sandbox of the named template for `user`. Returns only
    /// after the route is present in the local registry; peer propagation is
    /// eventually consistent.
    #[instrument(skip(self, options), fields(user, template))]
    pub async fn claim_sandbox(
        &self,
        user: &str,
        template: &str,
        options: ClaimOptions,
    ) -> Result<Sandbox> {
        if user.is_empty() {
            return Err(Error::bad_request("user cannot be empty"));
        }
        let _permit = self
            .claim_permits
            .acquire()
            .await
            .map_err(|_| Error::internal("claim workers shut down"))?;

        let pool = self
            .pools
            .get(template)
            .ok_or_else(|| Error::not_found(format!("unknown template '{template}'")))?;
        let timeout = options.timeout_seconds;
        let record = pool
            .claim_sandbox(user, self.config.default_pooling_candidate_counts, &options)
            .await?;
        let sandbox = self.sandbox_for(record);

        if let Err(err) = self.sync_route(sandbox.record(), false).await {
            warn!(sandbox = %sandbox.id(), error = %err, "route sync after claim failed");
        }

        if let Some(after_seconds) = timeout {
            if let Err(err) = sandbox.save_timeout(after_seconds).await {
                warn!(sandbox = %sandbox.id(), error = %err, "failed to persist initial timeout");
            }
            if let Err(err) = sandbox.set_timeout(after_seconds) {
                warn!(sandbox = %sandbox.id(), error = %err, "failed to arm initial timeout");
            }
        }

        Ok(sandbox)
    }

    /// Fetches a claimed sandbox, enforcing ownership.
    pub fn get_claimed_sandbox(&self, user: &str, id: &str) -> Result<Sandbox> {
        let record = self
            .cache
            .get_by_id(id)
            .ok_or_else(|| Error::not_found(format!("sandbox '{id}' not found")))?;
        if !record.claimed() {
            return Err(Error::not_found(format!(
                "sandbox '{id}' is not claimed"
            )));
        }
        if record.owner != user {
            return Err(Error::not_allowed(format!(
                "sandbox '{id}' belongs to another user"
            )));
        }
        Ok(self.sandbox_for(record))
    }

    /// Claimed sandboxes owned by `user` matching `filter`, up to `limit`.
    pub fn list_sandboxes(
        &self,
        user: &str,
        limit: usize,
        filter: &hatch_store::LabelSelector,
    ) -> Vec<SandboxRecord> {
        let mut records: Vec<_> = self
            .cache
            .select(filter)
            .into_iter()
            .filter(|record| record.claimed() && record.owner == user)
            .collect();
        records.truncate(if limit == 0 { usize::MAX } else { limit });
        records
    }

    #[instrument(skip(self), fields(user, id))]
    pub async fn pause_sandbox(&self, user: &str, id: &str) -> Result<Sandbox> {
        let mut sandbox = self.get_claimed_sandbox(user, id)?;
        sandbox.pause().await?;
        if let Err(err) = self.sync_route(sandbox.record(), false).await {
            warn!(sandbox = %id, error = %err, "route sync after pause failed");
        }
        Ok(sandbox)
    }

    #[instrument(skip(self), fields(user, id))]
    pub async fn resume_sandbox(&self, user: &str, id: &str) -> Result<Sandbox> {
        let mut sandbox = self.get_claimed_sandbox(user, id)?;
        sandbox.resume().await?;
        // The IP may have moved across the resume.
        if let Err(err) = self.sync_route(sandbox.record(), true).await {
            warn!(sandbox = %id, error = %err, "route sync after resume failed");
        }
        Ok(sandbox)
    }

    #[instrument(skip(self), fields(user, id))]
    pub async fn kill_sandbox(&self, user: &str, id: &str) -> Result<()> {
        let sandbox = self.get_claimed_sandbox(user, id)?;
        sandbox.kill().await?;
        self.routes.delete_route(id);
        Ok(())
    }

    /// Arms and persists a named timer on a claimed sandbox.
    pub async fn set_sandbox_timer(
        &self,
        user: &str,
        id: &str,
        event: EventType,
        after_seconds: i64,
    ) -> Result<()> {
        let sandbox = self.get_claimed_sandbox(user, id)?;
        self.timers
            .save_timeout(sandbox.namespace(), id, event, after_seconds)
            .await?;
        self.timers
            .set_timer(sandbox.namespace(), id, event, after_seconds)
    }

    /// Writes the record's route locally, then pushes it to every peer.
    /// `refresh` re-reads the record before deriving the route.
    pub async fn sync_route(&self, record: &SandboxRecord, refresh: bool) -> Result<Route> {
        let record = if refresh {
            self.store.get(&record.namespace, &record.id).await?
        } else {
            record.clone()
        };
        let route = Route::for_record(&record);
        self.routes.set_route(route.clone());
        let failed = self.routes.sync_route_with_peers(&route).await;
        if failed > 0 {
            warn!(sandbox = %route.id, failed, "route push failed for some peers");
        }
        Ok(route)
    }

    /// Converges the route table onto the claimed records: drops routes
    /// whose record vanished or left the claimed states, rewrites diverged
    /// entries, and installs missing ones.
    pub async fn refresh_proxy(&self) {
        let mut desired: HashMap<String, Route> = self
            .cache
            .get_all()
            .into_iter()
            .filter(|record| record.claimed())
            .map(|record| (record.id.clone(), Route::for_record(&record)))
            .collect();

        for existing in self.routes.list_routes() {
            match desired.remove(&existing.id) {
                None => {
                    debug!(sandbox = %existing.id, "dropping orphaned route");
                    self.routes.delete_route(&existing.id);
                }
                Some(want) if want != existing => {
                    self.routes.set_route(want.clone());
                    self.routes.sync_route_with_peers(&want).await;
                }
                Some(_) => {}
            }
        }

        for (_, route) in desired {
            self.routes.set_route(route.clone());
            self.routes.sync_route_with_peers(&route).await;
        }
    }

    /// Starts the manager: greets every configured peer, brings the cache in
    /// sync, bootstraps the pools, recovers persisted timers and launches
    /// the periodic refresh. Peer-discovery exhaustion and a failed initial
    /// cache sync are fatal.
    pub async fn run(self: &Arc<Self>, peers: &[String]) -> Result<()> {
        for peer in peers {
            self.routes.set_peer(peer.clone());
        }
        self.greet_peers(peers).await?;

        self.cache
            .start()
            .await
            .map_err(|err| Error::internal(format!("initial cache sync failed: {err}")))?;

        for pool in self.pools.values() {
            pool.sync_from_cluster().await?;
            let runner = pool.clone();
            self.tasks.lock().push(tokio::spawn(runner.run()));
        }

        let claimed: Vec<_> = self
            .cache
            .get_all()
            .into_iter()
            .filter(|record| record.claimed())
            .collect();
        let recovered = self.timers.recover(&claimed)?;
        if recovered > 0 {
            info!(recovered, "re-armed persisted timers");
        }

        let ticker = Arc::downgrade(self);
        let period = self.config.refresh_interval;
        self.tasks.lock().push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = ticker.upgrade() else {
                    return;
                };
                manager.refresh_proxy().await;
                for pool in manager.pools.values() {
                    if let Err(err) = pool.scale().await {
                        warn!(pool = %pool.name(), error = %err, "periodic scale failed");
                    }
                }
            }
        }));

        self.ready.store(true, Ordering::SeqCst);
        info!(pools = self.pools.len(), peers = peers.len(), "sandbox manager running");
        Ok(())
    }

    async fn greet_peers(&self, peers: &[String]) -> Result<()> {
        if peers.is_empty() {
            return Ok(());
        }
        let mut remaining: Vec<String> = peers.to_vec();
        for attempt in 0..self.config.peer_greet_attempts {
            let mut still_waiting = Vec::new();
            for peer in &remaining {
                if self.routes.hello_peer(peer).await {
                    debug!(peer = %peer, "peer greeted");
                } else {
                    still_waiting.push(peer.clone());
                }
            }
            if still_waiting.is_empty() {
                return Ok(());
            }
            remaining = still_waiting;
            warn!(
                attempt,
                waiting = remaining.len(),
                "peers not ready yet, retrying"
            );
            tokio::time::sleep(self.config.peer_greet_interval).await;
        }
        Err(Error::internal(format!(
            "peer discovery never completed: {} peer(s) unreachable",
            remaining.len()
        )))
    }

    /// Tears down the ticker, pool loops, cache watcher and armed timers.
    pub fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for pool in self.pools.values() {
            pool.stop();
        }
        self.cache.stop();
        self.timers.stop();
    }
}

impl Drop for SandboxManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Translates cache mutations into pool work and bus events. Runs on the
/// watcher task, so everything heavy is pushed onto spawned tasks.
struct StreamDispatcher {
    manager: Weak<SandboxManager>,
}

impl StreamDispatcher {
    fn spawn_scale(&self, record: &SandboxRecord) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let Some(pool) = record.pool().and_then(|name| manager.pools.get(name)).cloned()
        else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = pool.scale().await {
                warn!(pool = %pool.name(), error = %err, "event-driven scale failed");
            }
        });
    }
}

impl CacheHandler for StreamDispatcher {
    fn on_add(&self, record: &SandboxRecord) {
        self.spawn_scale(record);
    }

    fn on_update(&self, old: &SandboxRecord, new: &SandboxRecord) {
        if !old.ready() && new.ready() {
            if let Some(manager) = self.manager.upgrade() {
                let event = SandboxEvent::new(EventType::SandboxCreated, new.clone());
                tokio::spawn(async move {
                    manager.bus.trigger(event).await;
                });
            }
            self.spawn_scale(new);
        }
    }

    fn on_delete(&self, record: &SandboxRecord) {
        if let Some(manager) = self.manager.upgrade() {
            let event = SandboxEvent::new(EventType::SandboxKill, record.clone());
            tokio::spawn(async move {
                manager.bus.trigger(event).await;
            });
        }
        self.spawn_scale(record);
    }
}

/// Runs when a sandbox first reports ready: publishes its route, stamps the
/// pending state and the id label, and raises the debug-ready event.
struct CreatedHandler {
    manager: Weak<SandboxManager>,
}

#[async_trait]
impl EventHandler for CreatedHandler {
    fn name(&self) -> &str {
        "route-and-pending"
    }

    async fn handle(&self, event: &SandboxEvent) -> Result<()> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        let record = &event.record;
        manager.sync_route(record, false).await?;
        // Only freshly created records enter the pool; a claimed record
        // whose ready condition flapped must keep its state.
        if record.state().is_none() {
            manager
                .store
                .patch(
                    &record.namespace,
                    &record.id,
                    serde_json::json!({
                        "labels": {
                            "state": hatch_store::SandboxState::Pending.as_str(),
                            "sandbox-id": record.id,
                        }
                    }),
                )
                .await?;
        }
        manager
            .bus
            .trigger(SandboxEvent::new(EventType::SandboxReady, record.clone()))
            .await;
        Ok(())
    }
}

/// Runs when a record disappears: drops the route and makes sure deletion
/// actually proceeds.
struct KillHandler {
    manager: Weak<SandboxManager>,
}

#[async_trait]
impl EventHandler for KillHandler {
    fn name(&self) -> &str {
        "route-drop"
    }

    async fn handle(&self, event: &SandboxEvent) -> Result<()> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        let record = &event.record;
        manager.routes.delete_route(&record.id);
        manager.timers.cancel_all(&record.namespace, &record.id);
        match manager.store.get(&record.namespace, &record.id).await {
            Ok(current) if current.deletion_timestamp.is_none() => {
                match manager.store.delete(&record.namespace, &record.id).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err.into()),
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Out-of-core hook point; only logs in this deployment.
struct ReadyDebugHandler;

#[async_trait]
impl EventHandler for ReadyDebugHandler {
    fn name(&self) -> &str {
        "ready-debug"
    }

    async fn handle(&self, event: &SandboxEvent) -> Result<()> {
        debug!(sandbox = %event.record.id, ip = %event.record.status.ip, "sandbox ready");
        Ok(())
    }
}

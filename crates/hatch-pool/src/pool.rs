//! Per-template pool controller: partitions records into lifecycle groups,
//! drives the record count toward the utilization target, garbage-collects
//! failed generations and serves claims through the store's optimistic
//! locking.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use hatch_store::{
    Cache, LabelSelector, Phase, SandboxRecord, SandboxSpec, SandboxState, SandboxStore, Throttle,
    INTERNAL_LABEL_PREFIX, LABEL_POOL, LABEL_SANDBOX_ID, LABEL_STATE, LABEL_TEMPLATE_HASH,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::template::{random_suffix, PoolTemplate};

/// Retry budget for the optimistic claim loop.
const CLAIM_MAX_ATTEMPTS: usize = 10;
/// Retry budget for generated-name collisions during scale-up.
const CREATE_NAME_ATTEMPTS: usize = 10;
/// Length of the random suffix in generated record names.
const NAME_SUFFIX_LEN: usize = 5;

/// Caller-supplied adjustments applied to a record at claim time.
#[derive(Clone, Debug, Default)]
pub struct ClaimOptions {
    pub image: Option<String>,
    /// Initial autoshutdown delay, armed by the facade after the claim.
    pub timeout_seconds: Option<i64>,
    pub extra_headers: std::collections::BTreeMap<String, String>,
    pub labels: std::collections::BTreeMap<String, String>,
}

impl ClaimOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(timeout) = self.timeout_seconds {
            if timeout <= 0 {
                return Err(Error::bad_request(format!(
                    "initial timeout must be positive, got {timeout}"
                )));
            }
        }
        for key in self.labels.keys() {
            let reserved = key.starts_with(INTERNAL_LABEL_PREFIX)
                || matches!(
                    key.as_str(),
                    LABEL_POOL | LABEL_STATE | LABEL_TEMPLATE_HASH | LABEL_SANDBOX_ID
                );
            if reserved {
                return Err(Error::bad_request(format!("label key '{key}' is reserved")));
            }
        }
        Ok(())
    }

    fn apply(&self, record: &mut SandboxRecord) {
        if let Some(image) = &self.image {
            record.spec.image = Some(image.clone());
        }
        for (key, value) in &self.extra_headers {
            record.spec.extra_headers.insert(key.clone(), value.clone());
        }
        for (key, value) in &self.labels {
            record.labels.insert(key.clone(), value.clone());
        }
    }
}

/// Lifecycle partition of one pool's records.
#[derive(Debug, Default)]
pub struct SandboxGroups {
    pub creating: Vec<SandboxRecord>,
    pub pending: Vec<SandboxRecord>,
    pub claimed: Vec<SandboxRecord>,
    pub failed: Vec<SandboxRecord>,
}

impl SandboxGroups {
    /// Records that count toward the pool's target size.
    pub fn active(&self) -> i64 {
        (self.creating.len() + self.pending.len() + self.claimed.len()) as i64
    }
}

/// Partitions `records` into lifecycle groups against the current template
/// generation. A record matching no group aborts the caller's reconcile.
pub fn group_sandboxes(
    records: Vec<SandboxRecord>,
    template_hash: &str,
) -> Result<SandboxGroups> {
    let mut groups = SandboxGroups::default();
    for record in records {
        let state = record.state();
        if record.deletion_timestamp.is_some()
            || record.status.phase.terminal()
            || state == Some(SandboxState::Killing)
        {
            groups.failed.push(record);
            continue;
        }
        // Claimed records keep serving even across a template upgrade.
        if record.claimed() {
            groups.claimed.push(record);
            continue;
        }
        if record.template_hash() != Some(template_hash) {
            groups.failed.push(record);
            continue;
        }
        if record.status.phase == Phase::Running
            && record.ready()
            && state == Some(SandboxState::Pending)
            && record.lock_token.is_empty()
        {
            groups.pending.push(record);
            continue;
        }
        if record.status.phase == Phase::Pending
            || (record.status.phase == Phase::Running && state.is_none())
        {
            groups.creating.push(record);
            continue;
        }
        return Err(Error::internal(format!(
            "record '{}' matches no lifecycle group (phase {}, state {:?})",
            record.id, record.status.phase, state
        )));
    }
    Ok(groups)
}

#[derive(Debug, Default)]
struct PoolCounters {
    creating: AtomicI64,
    pending: AtomicI64,
    claimed: AtomicI64,
    total: AtomicI64,
}

/// Point-in-time view of the status counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatusSnapshot {
    pub creating: i64,
    pub pending: i64,
    pub claimed: i64,
    pub total: i64,
}

pub struct Pool {
    template: PoolTemplate,
    namespace: String,
    store: Arc<dyn SandboxStore>,
    cache: Arc<Cache>,
    counters: PoolCounters,
    /// Desired record count; the counterpart of `spec.Replicas`.
    replicas: AtomicI64,
    reconcile_tx: mpsc::Sender<()>,
    reconcile_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown: Notify,
    create_throttle: Throttle,
}

impl Pool {
    pub fn new(
        template: PoolTemplate,
        namespace: impl Into<String>,
        store: Arc<dyn SandboxStore>,
        cache: Arc<Cache>,
        max_create_qps: u32,
    ) -> Arc<Self> {
        // Depth 1: an over-full queue collapses onto the pending request so
        // the consumer always acts on the newest state.
        let (reconcile_tx, reconcile_rx) = mpsc::channel(1);
        Arc::new(Self {
            template,
            namespace: namespace.into(),
            store,
            cache,
            counters: PoolCounters::default(),
            replicas: AtomicI64::new(0),
            reconcile_tx,
            reconcile_rx: Mutex::new(Some(reconcile_rx)),
            shutdown: Notify::new(),
            create_throttle: Throttle::new(max_create_qps, max_create_qps),
        })
    }

    pub fn template(&self) -> &PoolTemplate {
        &self.template
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn replicas(&self) -> i64 {
        self.replicas.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PoolStatusSnapshot {
        PoolStatusSnapshot {
            creating: self.counters.creating.load(Ordering::SeqCst),
            pending: self.counters.pending.load(Ordering::SeqCst),
            claimed: self.counters.claimed.load(Ordering::SeqCst),
            total: self.counters.total.load(Ordering::SeqCst),
        }
    }

    fn pool_selector(&self) -> LabelSelector {
        LabelSelector::new().with(LABEL_POOL, &self.template.name)
    }

    fn store_counters(&self, groups: &SandboxGroups) {
        self.counters
            .creating
            .store(groups.creating.len() as i64, Ordering::SeqCst);
        self.counters
            .pending
            .store(groups.pending.len() as i64, Ordering::SeqCst);
        self.counters
            .claimed
            .store(groups.claimed.len() as i64, Ordering::SeqCst);
        self.counters.total.store(groups.active(), Ordering::SeqCst);
    }

    fn clamp_replicas(&self, value: i64) -> i64 {
        value.clamp(self.template.min_pool_size, self.template.max_pool_size)
    }

    /// One-shot startup sync: derives counters and the replica target from
    /// the records observed in the cluster.
    pub async fn sync_from_cluster(&self) -> Result<()> {
        let groups = group_sandboxes(self.cache.select(&self.pool_selector()), &self.template.hash)?;
        self.store_counters(&groups);
        let target = self.clamp_replicas(groups.active());
        self.replicas.store(target, Ordering::SeqCst);
        info!(
            pool = %self.template.name,
            replicas = target,
            pending = groups.pending.len(),
            claimed = groups.claimed.len(),
            "pool synced from cluster"
        );
        self.enqueue_reconcile();
        Ok(())
    }

    /// Recomputes the replica target from the utilization servo and enqueues
    /// a reconcile when the pool should move.
    pub async fn scale(&self) -> Result<()> {
        let total = self.counters.total.load(Ordering::SeqCst);
        let pending = self.counters.pending.load(Ordering::SeqCst);
        let actual_usage = (total - pending).max(0);
        let expected_usage =
            ((self.template.expect_usage as f64 / 100.0) * total as f64).round() as i64;
        let expect_total = self.clamp_replicas(total + actual_usage - expected_usage);

        if expect_total != total {
            self.replicas.store(expect_total, Ordering::SeqCst);
            debug!(
                pool = %self.template.name,
                total,
                pending,
                expect_total,
                "scale target moved"
            );
            self.enqueue_reconcile();
        }
        Ok(())
    }

    /// Requests a reconcile. Collapses onto an already-queued request.
    pub fn enqueue_reconcile(&self) {
        let _ = self.reconcile_tx.try_send(());
    }

    /// Serves the reconcile queue until `stop`. Single consumer per pool.
    pub async fn run(self: Arc<Self>) {
        let receiver = self.reconcile_rx.lock().take();
        let Some(mut receiver) = receiver else {
            warn!(pool = %self.template.name, "pool reconcile loop already running");
            return;
        };
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                request = receiver.recv() => match request {
                    Some(()) => {
                        if let Err(err) = self.reconcile().await {
                            warn!(pool = %self.template.name, error = %err, "reconcile failed");
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(pool = %self.template.name, "pool reconcile loop stopped");
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// One reconcile pass: partition, rewrite counters, then concurrently
    /// close the size offset and collect failed records.
    #[instrument(skip(self), fields(pool = %self.template.name))]
    pub async fn reconcile(&self) -> Result<()> {
        let groups = group_sandboxes(self.cache.select(&self.pool_selector()), &self.template.hash)?;
        self.store_counters(&groups);

        let expect_total = self.replicas.load(Ordering::SeqCst);
        let offset = expect_total - groups.active();

        let scale_path = async {
            if offset > 0 {
                self.scale_up(offset).await
            } else if offset < 0 {
                self.scale_down(&groups, (-offset) as usize).await
            } else {
                Ok(())
            }
        };
        let gc_path = self.collect_failed(&groups.failed);

        let (scale_result, gc_result) = tokio::join!(scale_path, gc_path);
        join_results(scale_result, gc_result)
    }

    async fn scale_up(&self, offset: i64) -> Result<()> {
        debug!(pool = %self.template.name, offset, "scaling up");
        for _ in 0..offset {
            self.create_record().await?;
        }
        Ok(())
    }

    async fn create_record(&self) -> Result<SandboxRecord> {
        for _ in 0..CREATE_NAME_ATTEMPTS {
            let id = format!(
                "{}-{}-{}",
                self.template.name,
                self.template.hash,
                random_suffix(NAME_SUFFIX_LEN)
            );
            let mut record = SandboxRecord::new(
                &self.namespace,
                id,
                SandboxSpec {
                    template: self.template.name.clone(),
                    extra_headers: self.template.extra_headers.clone(),
                    ..Default::default()
                },
            );
            record.labels = self.template.record_labels();

            self.create_throttle.acquire().await;
            match self.store.create(record).await {
                Ok(created) => return Ok(created),
                Err(err) if err.is_already_exists() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::internal(format!(
            "could not find a free name for pool '{}' after {CREATE_NAME_ATTEMPTS} attempts",
            self.template.name
        )))
    }

    async fn scale_down(&self, groups: &SandboxGroups, excess: usize) -> Result<()> {
        debug!(pool = %self.template.name, excess, "scaling down");
        let victims = groups.pending.iter().chain(groups.creating.iter()).take(excess);
        for record in victims {
            match self.store.delete(&record.namespace, &record.id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Deletes failed records whose deletion has not already been requested.
    async fn collect_failed(&self, failed: &[SandboxRecord]) -> Result<()> {
        for record in failed {
            if record.deletion_timestamp.is_some() {
                continue;
            }
            debug!(pool = %self.template.name, sandbox = %record.id, "collecting failed record");
            match self.store.delete(&record.namespace, &record.id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn claimable(&self, record: &SandboxRecord) -> bool {
        record.state() == Some(SandboxState::Pending)
            && record.status.phase == Phase::Running
            && record.lock_token.is_empty()
            && record.template_hash() == Some(self.template.hash.as_str())
            && record.deletion_timestamp.is_none()
    }

    /// Takes one pending record out of the pool for `user`. Exclusivity
    /// rests on the store's conditional update; the lock token is a receipt.
    #[instrument(skip(self, options), fields(pool = %self.template.name, user))]
    pub async fn claim_sandbox(
        self: &Arc<Self>,
        user: &str,
        candidate_count: usize,
        options: &ClaimOptions,
    ) -> Result<SandboxRecord> {
        if self.counters.pending.load(Ordering::SeqCst) == 0 {
            return Err(Error::internal(format!(
                "no pending sandboxes in pool '{}'",
                self.template.name
            )));
        }
        options.validate()?;

        let selector = self
            .pool_selector()
            .with(LABEL_STATE, SandboxState::Pending.as_str());
        let mut skip: HashSet<String> = HashSet::new();

        for _ in 0..CLAIM_MAX_ATTEMPTS {
            let candidate = self
                .cache
                .select(&selector)
                .into_iter()
                .take(candidate_count.max(1))
                .find(|r| !skip.contains(&r.id) && self.claimable(r));
            let Some(candidate) = candidate else {
                return Err(Error::internal(format!(
                    "no stock in pool '{}'",
                    self.template.name
                )));
            };
            let id = candidate.id.clone();

            // Re-read through the store so the conditional update runs
            // against the latest revision, not the mirror's.
            let fresh = match self.store.get(&self.namespace, &id).await {
                Ok(fresh) => fresh,
                Err(err) if err.is_not_found() => {
                    skip.insert(id);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if !self.claimable(&fresh) {
                skip.insert(id);
                continue;
            }

            let mut attempt = fresh;
            options.apply(&mut attempt);
            attempt.set_state(SandboxState::Running);
            attempt.owner = user.to_string();
            attempt.lock_token = Uuid::new_v4().to_string();

            match self.store.update(attempt).await {
                Ok(claimed) => {
                    self.counters.pending.fetch_sub(1, Ordering::SeqCst);
                    self.counters.claimed.fetch_add(1, Ordering::SeqCst);
                    info!(
                        pool = %self.template.name,
                        sandbox = %claimed.id,
                        user,
                        "sandbox claimed"
                    );
                    let pool = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(err) = pool.scale().await {
                            warn!(pool = %pool.template.name, error = %err, "post-claim scale failed");
                        }
                    });
                    return Ok(claimed);
                }
                Err(err) if err.is_conflict() || err.is_not_found() => {
                    skip.insert(id);
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(Error::internal(format!(
            "failed to acquire optimistic lock in pool '{}'",
            self.template.name
        )))
    }
}

fn join_results(a: Result<()>, b: Result<()>) -> Result<()> {
    match (a, b) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
        (Err(first), Err(second)) => {
            Err(Error::internal(format!("{first}; {second}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateDefaults;
    use hatch_store::{Condition, MemoryStore, CONDITION_READY};
    use std::time::Duration;

    fn template(min: i64, max: i64, usage: u32) -> PoolTemplate {
        PoolTemplate::assemble(
            "python",
            "python:3.11",
            Some(min),
            Some(max),
            Some(usage),
            &TemplateDefaults::default(),
        )
        .unwrap()
    }

    fn record_for(template: &PoolTemplate, id: &str) -> SandboxRecord {
        let mut record = SandboxRecord::new(
            "default",
            id,
            SandboxSpec {
                template: template.name.clone(),
                ..Default::default()
            },
        );
        record.labels = template.record_labels();
        record
    }

    fn pending_record(template: &PoolTemplate, id: &str) -> SandboxRecord {
        let mut record = record_for(template, id);
        record.set_state(SandboxState::Pending);
        record.status.phase = Phase::Running;
        record.status.ip = format!("10.0.0.{}", id.len());
        record
            .status
            .set_condition(Condition::new(CONDITION_READY, true, ""));
        record
    }

    async fn fixture(template: PoolTemplate) -> (Arc<MemoryStore>, Arc<Cache>, Arc<Pool>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::new(store.clone(), "default"));
        cache.start().await.unwrap();
        let pool = Pool::new(template, "default", store.clone(), cache.clone(), 50);
        (store, cache, pool)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn grouping_partitions_by_lifecycle() {
        let template = template(2, 4, 50);

        let creating = record_for(&template, "a");
        let mut creating_running = record_for(&template, "b");
        creating_running.status.phase = Phase::Running;

        let pending = pending_record(&template, "c");

        let mut claimed = pending_record(&template, "d");
        claimed.set_state(SandboxState::Running);
        claimed.lock_token = "token".into();

        let mut failed_phase = record_for(&template, "e");
        failed_phase.status.phase = Phase::Failed;

        let mut stale = pending_record(&template, "f");
        stale
            .labels
            .insert(LABEL_TEMPLATE_HASH.to_string(), "stale".to_string());

        let mut killing = pending_record(&template, "g");
        killing.set_state(SandboxState::Killing);

        let groups = group_sandboxes(
            vec![
                creating,
                creating_running,
                pending,
                claimed,
                failed_phase,
                stale,
                killing,
            ],
            &template.hash,
        )
        .unwrap();

        assert_eq!(groups.creating.len(), 2);
        assert_eq!(groups.pending.len(), 1);
        assert_eq!(groups.claimed.len(), 1);
        assert_eq!(groups.failed.len(), 3);
    }

    #[test]
    fn grouping_keeps_claimed_records_across_upgrades() {
        let template = template(2, 4, 50);
        let mut claimed = pending_record(&template, "a");
        claimed.set_state(SandboxState::Running);
        claimed.lock_token = "token".into();
        claimed
            .labels
            .insert(LABEL_TEMPLATE_HASH.to_string(), "previous-gen".to_string());

        let groups = group_sandboxes(vec![claimed], &template.hash).unwrap();
        assert_eq!(groups.claimed.len(), 1);
        assert!(groups.failed.is_empty());
    }

    #[test]
    fn grouping_rejects_malformed_records() {
        let template = template(2, 4, 50);
        // Pending-state label with a lock token violates the claim protocol.
        let mut weird = pending_record(&template, "a");
        weird.lock_token = "token".into();
        let err = group_sandboxes(vec![weird], &template.hash).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }

    #[tokio::test]
    async fn sync_from_cluster_bootstraps_replicas() {
        let (_store, _cache, pool) = fixture(template(2, 4, 50)).await;
        pool.sync_from_cluster().await.unwrap();
        assert_eq!(pool.replicas(), 2);
    }

    #[tokio::test]
    async fn reconcile_creates_exactly_offset_records() {
        let (store, _cache, pool) = fixture(template(3, 6, 50)).await;
        pool.sync_from_cluster().await.unwrap();
        pool.reconcile().await.unwrap();

        let records = store
            .list("default", &LabelSelector::new().with(LABEL_POOL, "python"))
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        for record in &records {
            assert!(record.id.starts_with("python-"));
            assert_eq!(record.state(), None);
            assert_eq!(
                record.labels.get(LABEL_TEMPLATE_HASH).unwrap(),
                &pool.template().hash
            );
        }
    }

    #[tokio::test]
    async fn reconcile_deletes_pending_then_creating_on_shrink() {
        let template = template(0, 10, 50);
        let (store, _cache, pool) = fixture(template.clone()).await;
        store.create(pending_record(&template, "p1")).await.unwrap();
        store.create(pending_record(&template, "p2")).await.unwrap();
        store.create(record_for(&template, "c1")).await.unwrap();
        settle().await;

        pool.sync_from_cluster().await.unwrap();
        pool.replicas.store(1, Ordering::SeqCst);
        pool.reconcile().await.unwrap();

        let left = store
            .list("default", &LabelSelector::new().with(LABEL_POOL, "python"))
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        // Pending victims go first.
        assert_eq!(left[0].id, "c1");
    }

    #[tokio::test]
    async fn reconcile_collects_failed_records() {
        let template = template(0, 10, 50);
        let (store, _cache, pool) = fixture(template.clone()).await;
        let mut failed = record_for(&template, "dead");
        failed.status.phase = Phase::Failed;
        store.create(failed).await.unwrap();
        settle().await;

        pool.sync_from_cluster().await.unwrap();
        pool.reconcile().await.unwrap();

        let left = store
            .list("default", &LabelSelector::new())
            .await
            .unwrap();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn scale_respects_pool_bounds() {
        let (_store, _cache, pool) = fixture(template(2, 4, 50)).await;

        // Heavy usage pushes toward max, never beyond.
        pool.counters.total.store(4, Ordering::SeqCst);
        pool.counters.pending.store(0, Ordering::SeqCst);
        pool.scale().await.unwrap();
        assert_eq!(pool.replicas(), 4);

        // All-idle pulls toward min, never below.
        pool.counters.total.store(4, Ordering::SeqCst);
        pool.counters.pending.store(4, Ordering::SeqCst);
        pool.scale().await.unwrap();
        assert_eq!(pool.replicas(), 2);
    }

    #[tokio::test]
    async fn scale_grows_when_demand_exceeds_slack() {
        let (_store, _cache, pool) = fixture(template(1, 10, 50)).await;
        pool.counters.total.store(4, Ordering::SeqCst);
        pool.counters.pending.store(1, Ordering::SeqCst);
        pool.scale().await.unwrap();
        // actual usage 3, expected usage 2, so the servo adds one.
        assert_eq!(pool.replicas(), 5);
    }

    #[tokio::test]
    async fn claim_on_empty_pool_fails_fast() {
        let (_store, _cache, pool) = fixture(template(2, 4, 50)).await;
        let err = pool
            .claim_sandbox("alice", 100, &ClaimOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
        assert!(err.to_string().contains("no pending sandboxes"));
    }

    #[tokio::test]
    async fn claim_takes_a_pending_record() {
        let template = template(2, 4, 50);
        let (store, _cache, pool) = fixture(template.clone()).await;
        store.create(pending_record(&template, "p1")).await.unwrap();
        settle().await;
        pool.sync_from_cluster().await.unwrap();

        let options = ClaimOptions {
            image: Some("python:3.12".into()),
            ..Default::default()
        };
        let claimed = pool.claim_sandbox("alice", 100, &options).await.unwrap();
        assert_eq!(claimed.owner, "alice");
        assert_eq!(claimed.state(), Some(SandboxState::Running));
        assert!(!claimed.lock_token.is_empty());
        assert_eq!(claimed.spec.image.as_deref(), Some("python:3.12"));

        let stored = store.get("default", &claimed.id).await.unwrap();
        assert_eq!(stored.owner, "alice");
    }

    #[tokio::test]
    async fn claim_rejects_reserved_label_keys() {
        let template = template(2, 4, 50);
        let (store, _cache, pool) = fixture(template.clone()).await;
        store.create(pending_record(&template, "p1")).await.unwrap();
        settle().await;
        pool.sync_from_cluster().await.unwrap();

        let mut options = ClaimOptions::default();
        options.labels.insert(LABEL_POOL.to_string(), "evil".into());
        let err = pool.claim_sandbox("alice", 100, &options).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn claim_skips_locked_and_stale_records() {
        let template = template(2, 4, 50);
        let (store, _cache, pool) = fixture(template.clone()).await;

        // Orphaned: claimed once, owner gone; never handed out again.
        let mut orphan = pending_record(&template, "orphan");
        orphan.lock_token = "stale-token".into();
        store.create(orphan).await.unwrap();

        let mut stale = pending_record(&template, "stale");
        stale
            .labels
            .insert(LABEL_TEMPLATE_HASH.to_string(), "previous-gen".into());
        store.create(stale).await.unwrap();
        settle().await;

        // Force the fast path open so selection logic is what decides.
        pool.counters.pending.store(1, Ordering::SeqCst);
        let err = pool
            .claim_sandbox("alice", 100, &ClaimOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no stock"));
    }

    #[tokio::test]
    async fn concurrent_claims_hand_out_each_record_once() {
        let template = template(0, 10, 50);
        let (store, _cache, pool) = fixture(template.clone()).await;
        for id in ["p1", "p2", "p3"] {
            store.create(pending_record(&template, id)).await.unwrap();
        }
        settle().await;
        pool.sync_from_cluster().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..10 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.claim_sandbox(&format!("user-{i}"), 100, &ClaimOptions::default())
                    .await
            }));
        }

        let mut winners = Vec::new();
        let mut losses = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(record) => winners.push(record.id),
                Err(err) => {
                    assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
                    losses += 1;
                }
            }
        }

        winners.sort();
        winners.dedup();
        assert_eq!(winners.len(), 3);
        assert_eq!(losses, 7);
    }
}

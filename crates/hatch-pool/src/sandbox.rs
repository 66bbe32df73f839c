//! Sandbox capability object: a thin value wrapper around the cached record
//! plus handles back to the store and the timer hub. The core stays
//! agnostic to the runtime substrate behind the record.

use std::sync::Arc;
use std::time::Duration;

use hatch_store::{SandboxRecord, SandboxState, SandboxStore, VolumeMount};
use serde_json::json;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::events::EventType;
use crate::routes::Route;
use crate::timer::TimerHub;

/// Retry budget for read-modify-write spec updates.
const SPEC_WRITE_RETRIES: usize = 5;

#[derive(Clone)]
pub struct Sandbox {
    record: SandboxRecord,
    store: Arc<dyn SandboxStore>,
    timers: TimerHub,
    http: reqwest::Client,
    wait_timeout: Duration,
    wait_step: Duration,
}

impl Sandbox {
    pub(crate) fn new(
        record: SandboxRecord,
        store: Arc<dyn SandboxStore>,
        timers: TimerHub,
        wait_timeout: Duration,
        wait_step: Duration,
    ) -> Self {
        Self {
            record,
            store,
            timers,
            http: reqwest::Client::new(),
            wait_timeout,
            wait_step,
        }
    }

    pub fn record(&self) -> &SandboxRecord {
        &self.record
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn namespace(&self) -> &str {
        &self.record.namespace
    }

    pub fn get_state(&self) -> Option<SandboxState> {
        self.record.state()
    }

    pub fn get_ip(&self) -> &str {
        &self.record.status.ip
    }

    pub fn get_owner_user(&self) -> &str {
        &self.record.owner
    }

    pub fn get_template(&self) -> &str {
        &self.record.spec.template
    }

    pub fn get_route(&self) -> Route {
        Route::for_record(&self.record)
    }

    /// Re-reads the backing record in place.
    pub async fn inplace_refresh(&mut self) -> Result<()> {
        self.record = self
            .store
            .get(&self.record.namespace, &self.record.id)
            .await?;
        Ok(())
    }

    /// Freezes the sandbox: flips the spec and waits for the runtime to
    /// acknowledge through the paused condition.
    #[instrument(skip(self), fields(sandbox = %self.record.id))]
    pub async fn pause(&mut self) -> Result<()> {
        self.store
            .patch(
                &self.record.namespace,
                &self.record.id,
                json!({
                    "spec": {"paused": true},
                    "labels": {"state": SandboxState::Paused.as_str()},
                }),
            )
            .await?;
        self.await_transition(|record| record.status.paused())
            .await?;
        self.inplace_refresh().await
    }

    /// Thaws the sandbox and waits until the runtime reports it running and
    /// ready again. The IP may change across a resume.
    #[instrument(skip(self), fields(sandbox = %self.record.id))]
    pub async fn resume(&mut self) -> Result<()> {
        self.store
            .patch(
                &self.record.namespace,
                &self.record.id,
                json!({
                    "spec": {"paused": false},
                    "labels": {"state": SandboxState::Running.as_str()},
                }),
            )
            .await?;
        self.await_transition(|record| {
            record.status.phase == hatch_store::Phase::Running && record.ready()
        })
        .await?;
        self.inplace_refresh().await
    }

    /// Tears the sandbox down: cancels its timers, marks it killing and
    /// requests deletion. Deletion propagates through the change stream.
    #[instrument(skip(self), fields(sandbox = %self.record.id))]
    pub async fn kill(&self) -> Result<()> {
        self.timers.cancel_all(&self.record.namespace, &self.record.id);
        // Best effort: the record may already be gone.
        let marked = self
            .store
            .patch(
                &self.record.namespace,
                &self.record.id,
                json!({"labels": {"state": SandboxState::Killing.as_str()}}),
            )
            .await;
        if let Err(err) = marked {
            debug!(sandbox = %self.record.id, error = %err, "kill marker patch skipped");
        }
        match self.store.delete(&self.record.namespace, &self.record.id).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Arms (or resets) the in-memory autoshutdown timer.
    pub fn set_timeout(&self, after_seconds: i64) -> Result<()> {
        self.timers.set_timer(
            &self.record.namespace,
            &self.record.id,
            EventType::SandboxKill,
            after_seconds,
        )
    }

    /// Persists the autoshutdown timer so it survives restarts.
    pub async fn save_timeout(&self, after_seconds: i64) -> Result<()> {
        self.timers
            .save_timeout(
                &self.record.namespace,
                &self.record.id,
                EventType::SandboxKill,
                after_seconds,
            )
            .await
    }

    /// Re-arms in-memory timers from this record's persisted conditions.
    pub fn load_timers(&self) -> Result<usize> {
        self.timers.recover(std::slice::from_ref(&self.record))
    }

    /// Proxies a request into the sandbox address.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        port: u16,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response> {
        if self.record.status.ip.is_empty() {
            return Err(Error::internal(format!(
                "sandbox '{}' has no address yet",
                self.record.id
            )));
        }
        let method: reqwest::Method = method
            .parse()
            .map_err(|_| Error::bad_request(format!("invalid method '{method}'")))?;
        let path = path.strip_prefix('/').unwrap_or(path);
        let url = format!("http://{}:{port}/{path}", self.record.status.ip);
        let mut request = self.http.request(method, &url);
        for (key, value) in &self.record.spec.extra_headers {
            request = request.header(key, value);
        }
        if !self.record.status.access_token.is_empty() {
            request = request.bearer_auth(&self.record.status.access_token);
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        request
            .send()
            .await
            .map_err(|err| Error::internal(format!("sandbox request failed: {err}")))
    }

    /// Records a CSI mount on the spec so the runtime attaches the volume.
    pub async fn csi_mount(&mut self, driver: &str, mount: CsiMountRequest) -> Result<()> {
        if driver.is_empty() {
            return Err(Error::bad_request("csi driver cannot be empty"));
        }
        for _ in 0..SPEC_WRITE_RETRIES {
            let mut record = self
                .store
                .get(&self.record.namespace, &self.record.id)
                .await?;
            record.spec.volume_mounts.push(VolumeMount {
                driver: driver.to_string(),
                path: mount.path.clone(),
                attributes: mount.attributes.clone(),
            });
            match self.store.update(record).await {
                Ok(updated) => {
                    self.record = updated;
                    return Ok(());
                }
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::conflict(format!(
            "could not record csi mount on sandbox '{}'",
            self.record.id
        )))
    }

    /// Polls the record until `done` holds, with a fixed step and a bounded
    /// budget. Dropping the future cancels the wait.
    async fn await_transition<F>(&self, done: F) -> Result<()>
    where
        F: Fn(&SandboxRecord) -> bool,
    {
        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        loop {
            let record = self
                .store
                .get(&self.record.namespace, &self.record.id)
                .await?;
            if done(&record) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::internal(format!(
                    "sandbox '{}' did not reach the requested state within {:?}",
                    self.record.id, self.wait_timeout
                )));
            }
            tokio::time::sleep(self.wait_step).await;
        }
    }
}

/// Parameters of a CSI mount request.
#[derive(Clone, Debug, Default)]
pub struct CsiMountRequest {
    pub path: String,
    pub attributes: std::collections::BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use hatch_store::{Cache, Condition, MemoryStore, Phase, SandboxSpec, CONDITION_PAUSED};

    async fn fixture(record: SandboxRecord) -> (Arc<MemoryStore>, Sandbox) {
        let store = Arc::new(MemoryStore::new());
        let stored = store.create(record).await.unwrap();
        let cache = Arc::new(Cache::new(store.clone(), "default"));
        cache.start().await.unwrap();
        let bus = Arc::new(EventBus::new());
        let timers = TimerHub::new(store.clone(), cache, bus);
        let sandbox = Sandbox::new(
            stored,
            store.clone(),
            timers,
            Duration::from_secs(2),
            Duration::from_millis(20),
        );
        (store, sandbox)
    }

    fn running_record(id: &str) -> SandboxRecord {
        let mut record = SandboxRecord::new("default", id, SandboxSpec::default());
        record.set_state(SandboxState::Running);
        record.owner = "alice".into();
        record.status.phase = Phase::Running;
        record.status.ip = "10.0.0.1".into();
        record
    }

    #[tokio::test]
    async fn pause_waits_for_the_condition() {
        let (store, mut sandbox) = fixture(running_record("sb-1")).await;

        // Play the runtime controller: acknowledge the pause after a beat.
        let runtime_store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut record = runtime_store.get("default", "sb-1").await.unwrap();
            record.status.phase = Phase::Paused;
            record
                .status
                .set_condition(Condition::new(CONDITION_PAUSED, true, ""));
            runtime_store.update_status(record).await.unwrap();
        });

        sandbox.pause().await.unwrap();
        assert!(sandbox.record().spec.paused);
        assert_eq!(sandbox.get_state(), Some(SandboxState::Paused));
    }

    #[tokio::test]
    async fn pause_times_out_without_a_runtime() {
        let (_store, mut sandbox) = fixture(running_record("sb-1")).await;
        let err = sandbox.pause().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }

    #[tokio::test]
    async fn kill_is_idempotent_and_removes_the_record() {
        let (store, sandbox) = fixture(running_record("sb-1")).await;
        sandbox.kill().await.unwrap();
        assert!(store.get("default", "sb-1").await.is_err());
        // Second kill of a vanished record is fine.
        sandbox.kill().await.unwrap();
    }

    #[tokio::test]
    async fn csi_mount_appends_to_the_spec() {
        let (store, mut sandbox) = fixture(running_record("sb-1")).await;
        sandbox
            .csi_mount(
                "hatch.csi.example",
                CsiMountRequest {
                    path: "/mnt/data".into(),
                    attributes: Default::default(),
                },
            )
            .await
            .unwrap();

        let stored = store.get("default", "sb-1").await.unwrap();
        assert_eq!(stored.spec.volume_mounts.len(), 1);
        assert_eq!(stored.spec.volume_mounts[0].driver, "hatch.csi.example");
    }
}

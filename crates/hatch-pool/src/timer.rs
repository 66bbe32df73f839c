//! Per-sandbox expiration timers.
//!
//! Armed timers live in memory, keyed by `namespace/id/event`; their durable
//! mirror is a condition on the sandbox record so firings survive process
//! restarts. Re-arming an existing key cancels the previous timer before the
//! replacement is installed, so a replaced callback can never race its
//! replacer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hatch_store::{Cache, Condition, SandboxRecord, SandboxStore};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::{EventBus, EventType, SandboxEvent};

/// Prefix of the condition types that persist timers.
pub const TIMER_CONDITION_PREFIX: &str = "SandboxTimer.";

/// Attempts for the status write recording a firing.
const CONDITION_WRITE_RETRIES: usize = 5;

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

struct TimerInner {
    timers: Mutex<HashMap<String, TimerEntry>>,
    generations: AtomicU64,
    store: Arc<dyn SandboxStore>,
    cache: Arc<Cache>,
    bus: Arc<EventBus>,
}

#[derive(Clone)]
pub struct TimerHub {
    inner: Arc<TimerInner>,
}

impl TimerHub {
    pub fn new(store: Arc<dyn SandboxStore>, cache: Arc<Cache>, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                timers: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                store,
                cache,
                bus,
            }),
        }
    }

    fn key(namespace: &str, id: &str, event: EventType) -> String {
        format!("{namespace}/{id}/{event}")
    }

    pub fn armed(&self, namespace: &str, id: &str, event: EventType) -> bool {
        self.inner
            .timers
            .lock()
            .contains_key(&Self::key(namespace, id, event))
    }

    pub fn armed_count(&self) -> usize {
        self.inner.timers.lock().len()
    }

    /// Schedules a one-shot firing after `after_seconds`. An existing timer
    /// under the same key is cancelled and replaced.
    pub fn set_timer(
        &self,
        namespace: &str,
        id: &str,
        event: EventType,
        after_seconds: i64,
    ) -> Result<()> {
        if after_seconds <= 0 {
            return Err(Error::bad_request(format!(
                "timer delay must be positive, got {after_seconds}"
            )));
        }
        self.arm(namespace, id, event, Duration::from_secs(after_seconds as u64));
        Ok(())
    }

    fn arm(&self, namespace: &str, id: &str, event: EventType, delay: Duration) {
        let key = Self::key(namespace, id, event);
        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();
        let task_key = key.clone();
        let namespace = namespace.to_string();
        let id = id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            TimerHub::fire(inner, task_key, generation, namespace, id, event).await;
        });

        let mut timers = self.inner.timers.lock();
        if let Some(previous) = timers.insert(
            key,
            TimerEntry {
                generation,
                handle,
            },
        ) {
            previous.handle.abort();
        }
    }

    async fn fire(
        inner: Arc<TimerInner>,
        key: String,
        generation: u64,
        namespace: String,
        id: String,
        event: EventType,
    ) {
        // A replacement armed while we slept wins; bow out without firing.
        {
            let timers = inner.timers.lock();
            match timers.get(&key) {
                Some(entry) if entry.generation == generation => {}
                _ => return,
            }
        }

        let record = inner.cache.get_by_id(&id);
        let failed = match record {
            Some(record) => {
                inner
                    .bus
                    .trigger(SandboxEvent::new(event, record))
                    .await
            }
            None => {
                debug!(sandbox = %id, event = %event, "timer fired for a vanished sandbox");
                Self::remove_if_current(&inner, &key, generation);
                return;
            }
        };

        let message = if failed == 0 {
            format!("Triggered event {event} successfully")
        } else {
            format!("Triggered event {event} with {failed} handler failure(s)")
        };
        let condition = Condition::new(format!("{TIMER_CONDITION_PREFIX}{event}"), true, message);
        if let Err(err) =
            persist_condition(inner.store.as_ref(), &namespace, &id, condition).await
        {
            warn!(sandbox = %id, event = %event, error = %err, "failed to persist fired timer");
        }

        Self::remove_if_current(&inner, &key, generation);
    }

    fn remove_if_current(inner: &TimerInner, key: &str, generation: u64) {
        let mut timers = inner.timers.lock();
        if timers
            .get(key)
            .map(|entry| entry.generation == generation)
            .unwrap_or(false)
        {
            timers.remove(key);
        }
    }

    pub fn cancel(&self, namespace: &str, id: &str, event: EventType) {
        if let Some(entry) = self
            .inner
            .timers
            .lock()
            .remove(&Self::key(namespace, id, event))
        {
            entry.handle.abort();
        }
    }

    /// Cancels every timer armed for the sandbox, e.g. when it is killed.
    pub fn cancel_all(&self, namespace: &str, id: &str) {
        let prefix = format!("{namespace}/{id}/");
        let mut timers = self.inner.timers.lock();
        let keys: Vec<_> = timers
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = timers.remove(&key) {
                entry.handle.abort();
            }
        }
    }

    pub fn stop(&self) {
        let mut timers = self.inner.timers.lock();
        for (_, entry) in timers.drain() {
            entry.handle.abort();
        }
    }

    /// Persists the pending condition mirroring a timer, so a later process
    /// can re-arm it.
    pub async fn save_timeout(
        &self,
        namespace: &str,
        id: &str,
        event: EventType,
        after_seconds: i64,
    ) -> Result<()> {
        if after_seconds <= 0 {
            return Err(Error::bad_request(format!(
                "timer delay must be positive, got {after_seconds}"
            )));
        }
        let condition = Condition::new(
            format!("{TIMER_CONDITION_PREFIX}{event}"),
            false,
            pending_message(after_seconds),
        );
        persist_condition(self.inner.store.as_ref(), namespace, id, condition).await
    }

    /// Re-arms in-memory timers from the pending conditions of every claimed
    /// sandbox. The remaining delay is the persisted fire time minus now,
    /// floored at zero. Unparseable conditions are hard errors.
    pub fn recover(&self, records: &[SandboxRecord]) -> Result<usize> {
        let mut armed = 0;
        for record in records {
            if !record.claimed() {
                continue;
            }
            for condition in &record.status.conditions {
                let Some(event_name) = condition.ctype.strip_prefix(TIMER_CONDITION_PREFIX) else {
                    continue;
                };
                if condition.status {
                    continue;
                }
                let event = EventType::parse(event_name).ok_or_else(|| {
                    Error::internal(format!(
                        "sandbox '{}' carries a timer for unknown event '{event_name}'",
                        record.id
                    ))
                })?;
                let delay_seconds = parse_pending_message(&condition.message).ok_or_else(|| {
                    Error::internal(format!(
                        "sandbox '{}' timer '{}' has unparseable message '{}'",
                        record.id, condition.ctype, condition.message
                    ))
                })?;
                let fire_at =
                    condition.last_transition_time + chrono::Duration::seconds(delay_seconds);
                let remaining = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                self.arm(&record.namespace, &record.id, event, remaining);
                armed += 1;
            }
        }
        Ok(armed)
    }
}

/// Read-modify-write of a single condition through the status subresource,
/// retried on version conflicts.
async fn persist_condition(
    store: &dyn SandboxStore,
    namespace: &str,
    id: &str,
    condition: Condition,
) -> Result<()> {
    for _ in 0..CONDITION_WRITE_RETRIES {
        let mut record = match store.get(namespace, id).await {
            Ok(record) => record,
            // The sandbox may be deleted between firing and persistence.
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        record.status.set_condition(condition.clone());
        match store.update_status(record).await {
            Ok(_) => return Ok(()),
            Err(err) if err.is_conflict() => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(Error::conflict(format!(
        "could not persist condition '{}' on sandbox '{id}'",
        condition.ctype
    )))
}

pub fn pending_message(after_seconds: i64) -> String {
    format!("This timer will be triggered after {after_seconds} seconds")
}

/// Extracts the original delay from a pending-timer message. Tolerates
/// prefix variations as long as the `after N seconds` core is intact.
pub fn parse_pending_message(message: &str) -> Option<i64> {
    let start = message.find("after ")? + "after ".len();
    let rest = &message[start..];
    let end = rest.find(" second")?;
    rest[..end].trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hatch_store::{MemoryStore, SandboxSpec, SandboxState};
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl crate::events::EventHandler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }
        async fn handle(&self, _event: &SandboxEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn fixture() -> (
        Arc<MemoryStore>,
        Arc<Cache>,
        Arc<EventBus>,
        TimerHub,
        Arc<CountingHandler>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::new(store.clone(), "default"));
        cache.start().await.unwrap();
        let bus = Arc::new(EventBus::new());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        bus.register(EventType::SandboxKill, handler.clone());
        let hub = TimerHub::new(store.clone(), cache.clone(), bus.clone());
        (store, cache, bus, hub, handler)
    }

    async fn seed(store: &MemoryStore, id: &str) -> SandboxRecord {
        let mut record = SandboxRecord::new("default", id, SandboxSpec::default());
        record.set_state(SandboxState::Running);
        store.create(record).await.unwrap()
    }

    #[test]
    fn pending_message_roundtrip() {
        assert_eq!(parse_pending_message(&pending_message(30)), Some(30));
        assert_eq!(
            parse_pending_message("will be triggered after 30 seconds"),
            Some(30)
        );
        assert_eq!(parse_pending_message("gibberish"), None);
        assert_eq!(parse_pending_message("after x seconds"), None);
    }

    #[tokio::test]
    async fn rejects_non_positive_delay() {
        let (_store, _cache, _bus, hub, _handler) = fixture().await;
        let err = hub
            .set_timer("default", "sb-1", EventType::SandboxKill, 0)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);
        let err = hub
            .save_timeout("default", "sb-1", EventType::SandboxKill, -5)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn fires_once_and_persists_terminal_condition() {
        let (store, _cache, _bus, hub, handler) = fixture().await;
        seed(&store, "sb-1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        hub.set_timer("default", "sb-1", EventType::SandboxKill, 1)
            .unwrap();
        assert!(hub.armed("default", "sb-1", EventType::SandboxKill));

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(!hub.armed("default", "sb-1", EventType::SandboxKill));
        assert_eq!(hub.armed_count(), 0);

        let record = store.get("default", "sb-1").await.unwrap();
        let condition = record
            .status
            .condition("SandboxTimer.SandboxKill")
            .expect("terminal condition persisted");
        assert!(condition.status);
        assert!(condition.message.contains("successfully"));
    }

    #[tokio::test]
    async fn rearming_resets_instead_of_stacking() {
        let (store, _cache, _bus, hub, handler) = fixture().await;
        seed(&store, "sb-1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        for _ in 0..5 {
            hub.set_timer("default", "sb-1", EventType::SandboxKill, 1)
                .unwrap();
        }
        assert_eq!(hub.armed_count(), 1);

        tokio::time::sleep(Duration::from_millis(1400)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let (store, _cache, _bus, hub, handler) = fixture().await;
        seed(&store, "sb-1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        hub.set_timer("default", "sb-1", EventType::SandboxKill, 1)
            .unwrap();
        hub.cancel_all("default", "sb-1");
        assert_eq!(hub.armed_count(), 0);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn save_and_recover_restores_remaining_delay() {
        let (store, cache, _bus, hub, handler) = fixture().await;
        seed(&store, "sb-1").await;
        hub.save_timeout("default", "sb-1", EventType::SandboxKill, 2)
            .await
            .unwrap();

        let record = store.get("default", "sb-1").await.unwrap();
        let condition = record
            .status
            .condition("SandboxTimer.SandboxKill")
            .unwrap()
            .clone();
        assert!(!condition.status);
        assert_eq!(parse_pending_message(&condition.message), Some(2));

        // Simulate a restart: a fresh hub recovers from the stored record.
        drop(hub);
        let bus = Arc::new(EventBus::new());
        bus.register(EventType::SandboxKill, handler.clone());
        let recovered_hub = TimerHub::new(store.clone(), cache.clone(), bus);
        let armed = recovered_hub.recover(&[record]).unwrap();
        assert_eq!(armed, 1);
        assert!(recovered_hub.armed("default", "sb-1", EventType::SandboxKill));

        tokio::time::sleep(Duration::from_millis(2400)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(!recovered_hub.armed("default", "sb-1", EventType::SandboxKill));
    }

    #[tokio::test]
    async fn recover_rejects_unparseable_messages() {
        let (_store, _cache, _bus, hub, _handler) = fixture().await;
        let mut record = SandboxRecord::new("default", "sb-1", SandboxSpec::default());
        record.set_state(SandboxState::Running);
        record.status.set_condition(Condition::new(
            "SandboxTimer.SandboxKill",
            false,
            "no delay here",
        ));
        let err = hub.recover(&[record]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }
}

//! Label-indexed mirror of the store, populated by the change stream.
//!
//! A single watcher task applies events to the mirror and dispatches them to
//! registered handlers in stream order per record. Handlers must not block;
//! heavy work belongs on the subscriber's own tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::record::{LabelSelector, SandboxRecord};
use crate::{SandboxStore, WatchEventKind};

/// Attempts for a full resync before `refresh` gives up.
const REFRESH_ATTEMPTS: usize = 5;
const REFRESH_BACKOFF: Duration = Duration::from_millis(200);

/// Subscription hook invoked once per observed mutation.
pub trait CacheHandler: Send + Sync + 'static {
    fn on_add(&self, record: &SandboxRecord);
    fn on_update(&self, old: &SandboxRecord, new: &SandboxRecord);
    fn on_delete(&self, record: &SandboxRecord);
}

pub struct Cache {
    store: Arc<dyn SandboxStore>,
    namespace: String,
    mirror: Arc<RwLock<HashMap<String, SandboxRecord>>>,
    handlers: Arc<RwLock<Vec<Arc<dyn CacheHandler>>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    pub fn new(store: Arc<dyn SandboxStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            mirror: Arc::new(RwLock::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(Vec::new())),
            watcher: Mutex::new(None),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Registers a subscription hook. Registration happens before `start`;
    /// late registrations only see subsequent events.
    pub fn add_handler(&self, handler: Arc<dyn CacheHandler>) {
        self.handlers.write().push(handler);
    }

    /// Subscribes to the change stream, replays the store's current state
    /// into the mirror, and spawns the watcher task. The subscription is
    /// opened before the replay so no mutation is lost in between.
    pub async fn start(&self) -> Result<(), StoreError> {
        let mut events = self.store.watch(&self.namespace).await?;
        self.refresh().await?;

        let mirror = self.mirror.clone();
        let handlers = self.handlers.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let id = event.record.id.clone();
                match event.kind {
                    WatchEventKind::Added => {
                        mirror.write().insert(id, event.record.clone());
                        for handler in handlers.read().iter() {
                            handler.on_add(&event.record);
                        }
                    }
                    WatchEventKind::Modified => {
                        let old = mirror.write().insert(id, event.record.clone());
                        match old {
                            Some(old) => {
                                for handler in handlers.read().iter() {
                                    handler.on_update(&old, &event.record);
                                }
                            }
                            // An update for a record the replay never saw
                            // doubles as an add.
                            None => {
                                for handler in handlers.read().iter() {
                                    handler.on_add(&event.record);
                                }
                            }
                        }
                    }
                    WatchEventKind::Deleted => {
                        mirror.write().remove(&id);
                        for handler in handlers.read().iter() {
                            handler.on_delete(&event.record);
                        }
                    }
                }
            }
            debug!("cache watch stream ended");
        });
        *self.watcher.lock() = Some(handle);
        Ok(())
    }

    /// Blocks until the mirror has replayed the store's current state.
    /// Transient store errors are retried; the error surfaces only once the
    /// retry budget is spent.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let selector = LabelSelector::new();
        let mut last_err = None;
        for attempt in 0..REFRESH_ATTEMPTS {
            match self.store.list(&self.namespace, &selector).await {
                Ok(records) => {
                    let mut mirror = self.mirror.write();
                    mirror.clear();
                    for record in records {
                        mirror.insert(record.id.clone(), record);
                    }
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, error = %err, "cache resync failed, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(REFRESH_BACKOFF).await;
                }
            }
        }
        Err(last_err.unwrap_or(StoreError::Closed))
    }

    pub fn get_by_id(&self, id: &str) -> Option<SandboxRecord> {
        self.mirror.read().get(id).cloned()
    }

    /// Returns all mirrored records matching every key=value pair.
    pub fn select(&self, selector: &LabelSelector) -> Vec<SandboxRecord> {
        let mut records: Vec<_> = self
            .mirror
            .read()
            .values()
            .filter(|r| selector.matches(&r.labels))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn get_all(&self) -> Vec<SandboxRecord> {
        self.select(&LabelSelector::new())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::record::{SandboxSpec, LABEL_POOL};
    use parking_lot::Mutex as PlMutex;

    fn record(id: &str, pool: &str) -> SandboxRecord {
        let mut record = SandboxRecord::new("default", id, SandboxSpec::default());
        record.labels.insert(LABEL_POOL.into(), pool.into());
        record
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn mirror_follows_the_stream() {
        let store = Arc::new(MemoryStore::new());
        let cache = Cache::new(store.clone(), "default");
        cache.start().await.unwrap();

        store.create(record("sb-1", "python")).await.unwrap();
        store.create(record("sb-2", "node")).await.unwrap();
        settle().await;

        assert!(cache.get_by_id("sb-1").is_some());
        let python = cache.select(&LabelSelector::new().with(LABEL_POOL, "python"));
        assert_eq!(python.len(), 1);
        assert_eq!(cache.get_all().len(), 2);

        store.delete("default", "sb-1").await.unwrap();
        settle().await;
        assert!(cache.get_by_id("sb-1").is_none());
    }

    #[tokio::test]
    async fn refresh_replays_existing_state() {
        let store = Arc::new(MemoryStore::new());
        store.create(record("sb-1", "python")).await.unwrap();

        let cache = Cache::new(store.clone(), "default");
        cache.start().await.unwrap();
        assert!(cache.get_by_id("sb-1").is_some());
    }

    struct Recorder {
        seen: PlMutex<Vec<String>>,
    }

    impl CacheHandler for Recorder {
        fn on_add(&self, record: &SandboxRecord) {
            self.seen.lock().push(format!("add:{}", record.id));
        }
        fn on_update(&self, _old: &SandboxRecord, new: &SandboxRecord) {
            self.seen.lock().push(format!("update:{}", new.id));
        }
        fn on_delete(&self, record: &SandboxRecord) {
            self.seen.lock().push(format!("delete:{}", record.id));
        }
    }

    #[tokio::test]
    async fn handlers_observe_mutations_in_order() {
        let store = Arc::new(MemoryStore::new());
        let cache = Cache::new(store.clone(), "default");
        let recorder = Arc::new(Recorder {
            seen: PlMutex::new(Vec::new()),
        });
        cache.add_handler(recorder.clone());
        cache.start().await.unwrap();

        store.create(record("sb-1", "python")).await.unwrap();
        store
            .patch("default", "sb-1", serde_json::json!({"owner": "alice"}))
            .await
            .unwrap();
        store.delete("default", "sb-1").await.unwrap();
        settle().await;

        let seen = recorder.seen.lock().clone();
        assert_eq!(
            seen,
            vec![
                "add:sb-1".to_string(),
                "update:sb-1".to_string(),
                // The deletion marker arrives as a trailing update.
                "update:sb-1".to_string(),
                "delete:sb-1".to_string(),
            ]
        );
    }
}

//! In-process store: a namespaced record map with compare-and-set updates
//! and broadcast change notification. Default driver and test substrate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::error::StoreError;
use crate::record::{LabelSelector, SandboxRecord};
use crate::{patched_record, spawn_watch_forwarder, SandboxStore, WatchEvent, WatchEventKind};

/// Capacity of the broadcast bus feeding individual watches.
const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<(String, String), SandboxRecord>>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    fn emit(&self, kind: WatchEventKind, record: SandboxRecord) {
        // Send fails only when nobody subscribed, which is fine.
        let _ = self.events.send(WatchEvent { kind, record });
    }

    fn key(namespace: &str, id: &str) -> (String, String) {
        (namespace.to_string(), id.to_string())
    }
}

#[async_trait]
impl SandboxStore for MemoryStore {
    async fn create(&self, mut record: SandboxRecord) -> Result<SandboxRecord, StoreError> {
        let key = Self::key(&record.namespace, &record.id);
        {
            let mut inner = self.inner.write();
            if inner.contains_key(&key) {
                return Err(StoreError::already_exists(&record.namespace, &record.id));
            }
            record.version = 1;
            record.deletion_timestamp = None;
            inner.insert(key, record.clone());
        }
        self.emit(WatchEventKind::Added, record.clone());
        Ok(record)
    }

    async fn update(&self, record: SandboxRecord) -> Result<SandboxRecord, StoreError> {
        let key = Self::key(&record.namespace, &record.id);
        let updated = {
            let mut inner = self.inner.write();
            let current = inner
                .get(&key)
                .ok_or_else(|| StoreError::not_found(&record.namespace, &record.id))?;
            if current.version != record.version {
                return Err(StoreError::Conflict {
                    id: record.id.clone(),
                    expected: record.version,
                    found: current.version,
                });
            }
            let mut updated = record;
            updated.status = current.status.clone();
            updated.version = current.version + 1;
            inner.insert(key, updated.clone());
            updated
        };
        self.emit(WatchEventKind::Modified, updated.clone());
        Ok(updated)
    }

    async fn update_status(&self, record: SandboxRecord) -> Result<SandboxRecord, StoreError> {
        let key = Self::key(&record.namespace, &record.id);
        let updated = {
            let mut inner = self.inner.write();
            let current = inner
                .get(&key)
                .ok_or_else(|| StoreError::not_found(&record.namespace, &record.id))?;
            if current.version != record.version {
                return Err(StoreError::Conflict {
                    id: record.id.clone(),
                    expected: record.version,
                    found: current.version,
                });
            }
            let mut updated = current.clone();
            updated.status = record.status;
            updated.version = current.version + 1;
            inner.insert(key, updated.clone());
            updated
        };
        self.emit(WatchEventKind::Modified, updated.clone());
        Ok(updated)
    }

    async fn patch(
        &self,
        namespace: &str,
        id: &str,
        patch: Value,
    ) -> Result<SandboxRecord, StoreError> {
        let key = Self::key(namespace, id);
        let patched = {
            let mut inner = self.inner.write();
            let current = inner
                .get(&key)
                .ok_or_else(|| StoreError::not_found(namespace, id))?;
            let patched = patched_record(current, &patch)?;
            inner.insert(key, patched.clone());
            patched
        };
        self.emit(WatchEventKind::Modified, patched.clone());
        Ok(patched)
    }

    async fn delete(&self, namespace: &str, id: &str) -> Result<(), StoreError> {
        let key = Self::key(namespace, id);
        let (marked, removed) = {
            let mut inner = self.inner.write();
            let current = inner
                .get_mut(&key)
                .ok_or_else(|| StoreError::not_found(namespace, id))?;
            current.deletion_timestamp = Some(Utc::now());
            current.version += 1;
            let marked = current.clone();
            let removed = inner.remove(&key).expect("record present under lock");
            (marked, removed)
        };
        self.emit(WatchEventKind::Modified, marked);
        self.emit(WatchEventKind::Deleted, removed);
        Ok(())
    }

    async fn get(&self, namespace: &str, id: &str) -> Result<SandboxRecord, StoreError> {
        self.inner
            .read()
            .get(&Self::key(namespace, id))
            .cloned()
            .ok_or_else(|| StoreError::not_found(namespace, id))
    }

    async fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<SandboxRecord>, StoreError> {
        let mut records: Vec<_> = self
            .inner
            .read()
            .values()
            .filter(|r| r.namespace == namespace && selector.matches(&r.labels))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn watch(&self, namespace: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        Ok(spawn_watch_forwarder(
            self.events.subscribe(),
            namespace.to_string(),
        ))
    }
}

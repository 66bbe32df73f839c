//! Persistence layer for sandbox records: the store contract the lifecycle
//! manager consumes (create/update/patch/delete/list/watch with
//! compare-and-set semantics), an in-memory implementation used as the
//! default driver and test substrate, a SQLite-backed implementation, and
//! the label-indexed cache fed by the change stream.

pub mod cache;
pub mod error;
pub mod memory;
pub mod record;
pub mod sqlite;
pub mod throttle;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

pub use cache::{Cache, CacheHandler};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use record::{
    Condition, LabelSelector, Phase, SandboxRecord, SandboxSpec, SandboxState, SandboxStatus,
    VolumeMount, CONDITION_PAUSED, CONDITION_READY, INTERNAL_LABEL_PREFIX, LABEL_POOL,
    LABEL_SANDBOX_ID, LABEL_STATE, LABEL_TEMPLATE_HASH,
};
pub use sqlite::SqliteStore;
pub use throttle::{Throttle, ThrottledStore};

/// Change-stream event kinds, delivered in store order per record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

/// A single observed mutation, carrying the record after the change
/// (for deletes, the record as last stored).
#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub record: SandboxRecord,
}

/// Capacity of per-watch delivery channels.
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// The store contract the core consumes. Records are namespaced; `update`
/// and `update_status` are compare-and-set on `version` and bump it on
/// success. `update` replaces everything but `status`; `update_status`
/// replaces only `status`.
#[async_trait]
pub trait SandboxStore: Send + Sync + 'static {
    async fn create(&self, record: SandboxRecord) -> Result<SandboxRecord, StoreError>;
    async fn update(&self, record: SandboxRecord) -> Result<SandboxRecord, StoreError>;
    async fn update_status(&self, record: SandboxRecord) -> Result<SandboxRecord, StoreError>;
    /// Applies an RFC 7386 merge patch to the stored record. Patches do not
    /// carry a version and always apply to the latest revision.
    async fn patch(
        &self,
        namespace: &str,
        id: &str,
        patch: Value,
    ) -> Result<SandboxRecord, StoreError>;
    async fn delete(&self, namespace: &str, id: &str) -> Result<(), StoreError>;
    async fn get(&self, namespace: &str, id: &str) -> Result<SandboxRecord, StoreError>;
    async fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<SandboxRecord>, StoreError>;
    /// Subscribes to all mutations within a namespace. The receiver yields
    /// events in store order per record until the store shuts down.
    async fn watch(&self, namespace: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError>;
}

/// Applies an RFC 7386 JSON merge patch in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            let object = target.as_object_mut().expect("target coerced to object");
            for (key, value) in entries {
                if value.is_null() {
                    object.remove(key);
                } else {
                    merge_patch(object.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Applies a merge patch to a record, preserving identity and advancing the
/// version by one. Used by every store implementation.
pub(crate) fn patched_record(
    current: &SandboxRecord,
    patch: &Value,
) -> Result<SandboxRecord, StoreError> {
    let mut value = serde_json::to_value(current)?;
    merge_patch(&mut value, patch);
    let mut patched: SandboxRecord = serde_json::from_value(value)?;
    patched.id = current.id.clone();
    patched.namespace = current.namespace.clone();
    patched.version = current.version + 1;
    Ok(patched)
}

/// Pumps broadcast events into a per-watch channel, filtering by namespace.
/// Lagged subscribers drop the missed window and keep going; the periodic
/// cache refresh reconverges them.
pub(crate) fn spawn_watch_forwarder(
    mut source: broadcast::Receiver<WatchEvent>,
    namespace: String,
) -> mpsc::Receiver<WatchEvent> {
    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(event) => {
                    if event.record.namespace != namespace {
                        continue;
                    }
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "watch subscriber lagged, dropping events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_overwrites_and_removes() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "d": 3});
        merge_patch(&mut target, &json!({"a": {"b": 9, "c": null}, "e": 4}));
        assert_eq!(target, json!({"a": {"b": 9}, "d": 3, "e": 4}));
    }

    #[test]
    fn merge_patch_replaces_arrays_whole() {
        let mut target = json!({"items": [1, 2, 3]});
        merge_patch(&mut target, &json!({"items": [7]}));
        assert_eq!(target, json!({"items": [7]}));
    }

    #[test]
    fn patched_record_bumps_version_and_keeps_identity() {
        let record = SandboxRecord::new("default", "sb-1", SandboxSpec::default());
        let patched = patched_record(
            &record,
            &json!({"spec": {"paused": true}, "id": "evil", "version": 99}),
        )
        .unwrap();
        assert_eq!(patched.id, "sb-1");
        assert_eq!(patched.version, 1);
        assert!(patched.spec.paused);
    }
}

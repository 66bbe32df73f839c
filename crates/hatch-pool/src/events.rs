//! Type-keyed fan-out of sandbox lifecycle events.
//!
//! The bus is stateless: registration happens once at startup, `trigger`
//! runs every handler for the event's type sequentially on the caller's
//! task and reports how many of them failed. Handlers must tolerate being
//! invoked more than once for the same observation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hatch_store::SandboxRecord;
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    SandboxCreated,
    SandboxKill,
    SandboxReady,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SandboxCreated => "SandboxCreated",
            EventType::SandboxKill => "SandboxKill",
            EventType::SandboxReady => "SandboxReady",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SandboxCreated" => Some(EventType::SandboxCreated),
            "SandboxKill" => Some(EventType::SandboxKill),
            "SandboxReady" => Some(EventType::SandboxReady),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct SandboxEvent {
    pub event_type: EventType,
    pub record: SandboxRecord,
}

impl SandboxEvent {
    pub fn new(event_type: EventType, record: SandboxRecord) -> Self {
        Self { event_type, record }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn handle(&self, event: &SandboxEvent) -> Result<()>;
    /// Optional hook observing a failed `handle` call.
    fn on_error(&self, _event: &SandboxEvent, _error: &Error) {}
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers.write().entry(event_type).or_default().push(handler);
    }

    /// Invokes every handler registered for the event's type, sequentially,
    /// and returns the count of handlers that failed.
    pub async fn trigger(&self, event: SandboxEvent) -> usize {
        let handlers: Vec<_> = self
            .handlers
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(event = %event.event_type, sandbox = %event.record.id, "no handlers registered");
            return 0;
        }

        let mut failed = 0;
        for handler in handlers {
            if let Err(err) = handler.handle(&event).await {
                error!(
                    event = %event.event_type,
                    handler = handler.name(),
                    sandbox = %event.record.id,
                    error = %err,
                    "event handler failed"
                );
                handler.on_error(&event, &err);
                failed += 1;
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatch_store::SandboxSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, _event: &SandboxEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::internal("boom"))
            } else {
                Ok(())
            }
        }
    }

    fn event() -> SandboxEvent {
        SandboxEvent::new(
            EventType::SandboxKill,
            SandboxRecord::new("default", "sb-1", SandboxSpec::default()),
        )
    }

    #[tokio::test]
    async fn trigger_counts_failures() {
        let bus = EventBus::new();
        let ok = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let bad = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        bus.register(EventType::SandboxKill, ok.clone());
        bus.register(EventType::SandboxKill, bad.clone());

        let failed = bus.trigger(event()).await;
        assert_eq!(failed, 1);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn trigger_without_handlers_is_a_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.trigger(event()).await, 0);
    }

    #[test]
    fn event_type_names_roundtrip() {
        for event_type in [
            EventType::SandboxCreated,
            EventType::SandboxKill,
            EventType::SandboxReady,
        ] {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
        }
        assert_eq!(EventType::parse("bogus"), None);
    }
}

//! Client-side rate limiting for store traffic: a token bucket plus a
//! `SandboxStore` wrapper that pays one token per call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::record::{LabelSelector, SandboxRecord};
use crate::{SandboxStore, WatchEvent};

/// Token bucket with fractional refill. `acquire` waits until a token is
/// available; tokens accrue at `qps` up to `burst`.
#[derive(Clone)]
pub struct Throttle {
    inner: Arc<Mutex<ThrottleState>>,
    qps: f64,
}

struct ThrottleState {
    tokens: f64,
    burst: f64,
    refreshed: Instant,
}

impl Throttle {
    pub fn new(qps: u32, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            inner: Arc::new(Mutex::new(ThrottleState {
                tokens: burst,
                burst,
                refreshed: Instant::now(),
            })),
            qps: qps.max(1) as f64,
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.inner.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.refreshed).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.qps).min(state.burst);
                state.refreshed = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.qps))
                }
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

/// Store wrapper applying a shared token bucket to every operation except
/// `watch` (subscriptions are long lived, not request traffic).
pub struct ThrottledStore {
    inner: Arc<dyn SandboxStore>,
    throttle: Throttle,
}

impl ThrottledStore {
    pub fn new(inner: Arc<dyn SandboxStore>, throttle: Throttle) -> Self {
        Self { inner, throttle }
    }
}

#[async_trait]
impl SandboxStore for ThrottledStore {
    async fn create(&self, record: SandboxRecord) -> Result<SandboxRecord, StoreError> {
        self.throttle.acquire().await;
        self.inner.create(record).await
    }

    async fn update(&self, record: SandboxRecord) -> Result<SandboxRecord, StoreError> {
        self.throttle.acquire().await;
        self.inner.update(record).await
    }

    async fn update_status(&self, record: SandboxRecord) -> Result<SandboxRecord, StoreError> {
        self.throttle.acquire().await;
        self.inner.update_status(record).await
    }

    async fn patch(
        &self,
        namespace: &str,
        id: &str,
        patch: Value,
    ) -> Result<SandboxRecord, StoreError> {
        self.throttle.acquire().await;
        self.inner.patch(namespace, id, patch).await
    }

    async fn delete(&self, namespace: &str, id: &str) -> Result<(), StoreError> {
        self.throttle.acquire().await;
        self.inner.delete(namespace, id).await
    }

    async fn get(&self, namespace: &str, id: &str) -> Result<SandboxRecord, StoreError> {
        self.throttle.acquire().await;
        self.inner.get(namespace, id).await
    }

    async fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<SandboxRecord>, StoreError> {
        self.throttle.acquire().await;
        self.inner.list(namespace, selector).await
    }

    async fn watch(&self, namespace: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        self.inner.watch(namespace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_then_refill() {
        tokio::time::pause();
        let throttle = Throttle::new(10, 2);

        // Burst drains instantly.
        throttle.acquire().await;
        throttle.acquire().await;

        // Third token needs a 100ms refill at 10 qps.
        let start = Instant::now();
        throttle.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(90), "waited {waited:?}");
    }
}

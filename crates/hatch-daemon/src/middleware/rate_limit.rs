//! Fixed-window rate limiting per caller identity, keyed by request class.
//! Claims are the expensive path and get the tightest budget; the peer wire
//! is chatty by design and gets the widest.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;
use tower::{Layer, Service};
use tracing::warn;

/// Header carrying the caller identity for API requests.
pub const USER_HEADER: &str = "x-hatch-user";

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub claim_per_minute: u64,
    pub sandbox_per_minute: u64,
    pub peer_per_minute: u64,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            claim_per_minute: 120,
            sandbox_per_minute: 600,
            peer_per_minute: 6_000,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    fn limit_for(&self, class: RateClass) -> u64 {
        match class {
            RateClass::Claim => self.claim_per_minute,
            RateClass::Sandbox => self.sandbox_per_minute,
            RateClass::Peer => self.peer_per_minute,
        }
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    state: Arc<RateLimitState>,
}

pub fn rate_limit_layer(config: RateLimitConfig) -> RateLimitLayer {
    RateLimitLayer {
        state: Arc::new(RateLimitState::new(config)),
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: Arc<RateLimitState>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let state = self.state.clone();

        Box::pin(async move {
            match state.check(&request).await {
                Ok(()) => inner.call(request).await,
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}

#[derive(Debug)]
struct RateLimitState {
    config: RateLimitConfig,
    counters: Mutex<HashMap<RateKey, Counter>>,
}

impl RateLimitState {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    async fn check<B>(&self, request: &Request<B>) -> Result<(), RateLimitRejection> {
        let Some(class) = classify(request.method().as_str(), request.uri().path()) else {
            return Ok(());
        };
        let limit = self.config.limit_for(class);
        let identity = identity_of(request);

        let mut counters = self.counters.lock().await;
        let now = Instant::now();
        let window = self.config.window;
        let entry = counters
            .entry(RateKey {
                class,
                identity: identity.clone(),
            })
            .or_insert_with(|| Counter {
                window_start: now,
                count: 0,
            });

        let elapsed = now.saturating_duration_since(entry.window_start);
        if elapsed >= window {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            let retry_after = window
                .checked_sub(elapsed)
                .unwrap_or_default()
                .max(Duration::from_secs(1));
            warn!(
                class = class.as_str(),
                identity, limit, "rate limit exceeded"
            );
            return Err(RateLimitRejection {
                class,
                limit,
                window,
                retry_after,
            });
        }

        entry.count += 1;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RateKey {
    class: RateClass,
    identity: String,
}

#[derive(Debug)]
struct Counter {
    window_start: Instant,
    count: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum RateClass {
    Claim,
    Sandbox,
    Peer,
}

impl RateClass {
    fn as_str(self) -> &'static str {
        match self {
            RateClass::Claim => "claim",
            RateClass::Sandbox => "sandbox",
            RateClass::Peer => "peer",
        }
    }
}

#[derive(Debug)]
struct RateLimitRejection {
    class: RateClass,
    limit: u64,
    window: Duration,
    retry_after: Duration,
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let retry_after_secs = self.retry_after.as_secs().max(1);
        let body = RateLimitBody {
            error: "rate_limit_exceeded",
            class: self.class.as_str(),
            limit: self.limit,
            window_seconds: self.window.as_secs(),
            retry_after_seconds: retry_after_secs,
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
        if let Ok(value) = retry_after_secs.to_string().parse() {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

#[derive(Serialize)]
struct RateLimitBody {
    error: &'static str,
    class: &'static str,
    limit: u64,
    window_seconds: u64,
    retry_after_seconds: u64,
}

fn classify(method: &str, path: &str) -> Option<RateClass> {
    if method == "POST" && path == "/api/v1/sandboxes/claim" {
        Some(RateClass::Claim)
    } else if path.starts_with("/api/v1/sandboxes") {
        Some(RateClass::Sandbox)
    } else if path == "/routes" {
        Some(RateClass::Peer)
    } else {
        None
    }
}

fn identity_of<B>(request: &Request<B>) -> String {
    request
        .headers()
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn classify_by_method_and_path() {
        assert_eq!(
            classify("POST", "/api/v1/sandboxes/claim"),
            Some(RateClass::Claim)
        );
        assert_eq!(
            classify("GET", "/api/v1/sandboxes/abc"),
            Some(RateClass::Sandbox)
        );
        assert_eq!(classify("PUT", "/routes"), Some(RateClass::Peer));
        assert_eq!(classify("GET", "/healthz"), None);
        assert_eq!(classify("GET", "/hello"), None);
    }

    #[tokio::test]
    async fn separate_identities_have_separate_budgets() {
        let state = RateLimitState::new(RateLimitConfig {
            claim_per_minute: 1,
            sandbox_per_minute: 10,
            peer_per_minute: 10,
            window: Duration::from_secs(60),
        });

        let alice = Request::builder()
            .method("POST")
            .uri("/api/v1/sandboxes/claim")
            .header(USER_HEADER, "alice")
            .body(())
            .unwrap();
        let bob = Request::builder()
            .method("POST")
            .uri("/api/v1/sandboxes/claim")
            .header(USER_HEADER, "bob")
            .body(())
            .unwrap();

        state.check(&alice).await.unwrap();
        assert!(state.check(&alice).await.is_err());
        state.check(&bob).await.unwrap();
    }
}

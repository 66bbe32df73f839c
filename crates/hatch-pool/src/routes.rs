//! Route registry: the in-memory map from sandbox id to its address and
//! access metadata, plus best-effort replication to peer processes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use hatch_store::SandboxRecord;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One routing entry, shared by all requests targeting the sandbox.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub ip: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

impl Route {
    /// Derives the route from its backing record.
    pub fn for_record(record: &SandboxRecord) -> Self {
        Self {
            id: record.id.clone(),
            ip: record.status.ip.clone(),
            owner: record.owner.clone(),
            state: record
                .state()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            extra_headers: record.spec.extra_headers.clone(),
        }
    }
}

pub struct RouteRegistry {
    routes: RwLock<HashMap<String, Route>>,
    peers: RwLock<BTreeSet<String>>,
    client: reqwest::Client,
    proxy_port: u16,
    push_timeout: Duration,
}

impl RouteRegistry {
    pub fn new(proxy_port: u16, push_timeout: Duration) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            peers: RwLock::new(BTreeSet::new()),
            client: reqwest::Client::new(),
            proxy_port,
            push_timeout,
        }
    }

    /// Atomically installs (or replaces) the route for its id.
    pub fn set_route(&self, route: Route) {
        self.routes.write().insert(route.id.clone(), route);
    }

    pub fn load_route(&self, id: &str) -> Option<Route> {
        self.routes.read().get(id).cloned()
    }

    pub fn delete_route(&self, id: &str) -> Option<Route> {
        self.routes.write().remove(id)
    }

    /// Consistent snapshot of every route.
    pub fn list_routes(&self) -> Vec<Route> {
        let mut routes: Vec<_> = self.routes.read().values().cloned().collect();
        routes.sort_by(|a, b| a.id.cmp(&b.id));
        routes
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    pub fn set_peer(&self, peer: impl Into<String>) {
        self.peers.write().insert(peer.into());
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.read().iter().cloned().collect()
    }

    fn peer_url(&self, peer: &str, path: &str) -> String {
        if peer.contains(':') {
            format!("http://{peer}{path}")
        } else {
            format!("http://{peer}:{}{path}", self.proxy_port)
        }
    }

    /// Pushes the route to every known peer with a short deadline. Peer
    /// failures are logged, never surfaced; the periodic proxy refresh
    /// converges stragglers. Returns the count of failed pushes.
    pub async fn sync_route_with_peers(&self, route: &Route) -> usize {
        let peers = self.peers();
        let mut failed = 0;
        for peer in peers {
            let url = self.peer_url(&peer, "/routes");
            let result = self
                .client
                .put(&url)
                .timeout(self.push_timeout)
                .json(route)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(peer = %peer, sandbox = %route.id, "route pushed");
                }
                Ok(response) => {
                    warn!(peer = %peer, sandbox = %route.id, status = %response.status(), "peer rejected route push");
                    failed += 1;
                }
                Err(err) => {
                    warn!(peer = %peer, sandbox = %route.id, error = %err, "route push failed");
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Liveness probe: true when the peer answers 200 on `/hello`.
    pub async fn hello_peer(&self, peer: &str) -> bool {
        let url = self.peer_url(peer, "/hello");
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(peer = %peer, error = %err, "hello probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatch_store::{SandboxSpec, SandboxState};

    fn record(id: &str, ip: &str, owner: &str) -> SandboxRecord {
        let mut record = SandboxRecord::new("default", id, SandboxSpec::default());
        record.status.ip = ip.into();
        record.owner = owner.into();
        record.set_state(SandboxState::Running);
        record
    }

    #[test]
    fn route_derives_from_record() {
        let mut rec = record("sb-1", "10.0.0.1", "alice");
        rec.spec
            .extra_headers
            .insert("x-hatch-token".into(), "secret".into());
        let route = Route::for_record(&rec);
        assert_eq!(route.id, "sb-1");
        assert_eq!(route.ip, "10.0.0.1");
        assert_eq!(route.owner, "alice");
        assert_eq!(route.state, "running");
        assert_eq!(route.extra_headers.get("x-hatch-token").unwrap(), "secret");
    }

    #[test]
    fn set_load_delete_roundtrip() {
        let registry = RouteRegistry::new(8090, Duration::from_millis(100));
        let route = Route::for_record(&record("sb-1", "10.0.0.1", "alice"));
        registry.set_route(route.clone());

        assert_eq!(registry.load_route("sb-1").unwrap(), route);
        assert_eq!(registry.list_routes().len(), 1);

        let replaced = Route {
            ip: "10.0.0.2".into(),
            ..route.clone()
        };
        registry.set_route(replaced.clone());
        assert_eq!(registry.load_route("sb-1").unwrap().ip, "10.0.0.2");

        assert_eq!(registry.delete_route("sb-1").unwrap(), replaced);
        assert!(registry.load_route("sb-1").is_none());
    }

    #[test]
    fn peer_url_respects_explicit_port() {
        let registry = RouteRegistry::new(8090, Duration::from_millis(100));
        assert_eq!(
            registry.peer_url("10.1.0.1", "/hello"),
            "http://10.1.0.1:8090/hello"
        );
        assert_eq!(
            registry.peer_url("10.1.0.1:9999", "/hello"),
            "http://10.1.0.1:9999/hello"
        );
    }

    #[tokio::test]
    async fn push_to_unreachable_peer_is_logged_not_fatal() {
        let registry = RouteRegistry::new(1, Duration::from_millis(50));
        registry.set_peer("127.0.0.1:1");
        let route = Route::for_record(&record("sb-1", "10.0.0.1", "alice"));
        let failed = registry.sync_route_with_peers(&route).await;
        assert_eq!(failed, 1);
    }
}

//! Recognized manager options and their environment bindings.

use std::env;
use std::time::Duration;

/// Tunables for the manager, the pools and the proxy plumbing.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Namespace for peer lookup and records.
    pub system_namespace: String,
    /// Upper bound on concurrent claim calls.
    pub max_claim_workers: usize,
    /// Throttle on record creations toward the store.
    pub max_create_qps: u32,
    /// External-processor concurrency budget, consumed by the data plane.
    pub ext_proc_max_concurrency: usize,
    /// Candidate cap in claim selection when the caller does not pick one.
    pub default_pooling_candidate_counts: usize,
    /// Floor for per-template `min_pool_size` when unset.
    pub default_min_pool_size: i64,
    /// Multiplier applied when `max_pool_size` < `min_pool_size`.
    pub default_max_pool_size_factor: i64,
    /// Store-client rate limits.
    pub store_qps: u32,
    pub store_burst: u32,
    /// Port peers serve their route endpoints on.
    pub proxy_port: u16,
    pub peer_greet_attempts: u32,
    pub peer_greet_interval: Duration,
    pub peer_push_timeout: Duration,
    /// Period of the proxy refresh / pool scale ticker.
    pub refresh_interval: Duration,
    /// Budget and step for pause/resume condition waits.
    pub transition_wait_timeout: Duration,
    pub transition_wait_step: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            system_namespace: "default".to_string(),
            max_claim_workers: 32,
            max_create_qps: 50,
            ext_proc_max_concurrency: 100,
            default_pooling_candidate_counts: 100,
            default_min_pool_size: 5,
            default_max_pool_size_factor: 2,
            store_qps: 50,
            store_burst: 100,
            proxy_port: 8090,
            peer_greet_attempts: 20,
            peer_greet_interval: Duration::from_secs(6),
            peer_push_timeout: Duration::from_millis(100),
            refresh_interval: Duration::from_secs(60),
            transition_wait_timeout: Duration::from_secs(90),
            transition_wait_step: Duration::from_millis(100),
        }
    }
}

impl ManagerConfig {
    /// Reads overrides from `HATCH_*` environment variables, falling back to
    /// the defaults above for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            system_namespace: env::var("HATCH_SYSTEM_NAMESPACE")
                .unwrap_or(defaults.system_namespace),
            max_claim_workers: parse_env("HATCH_MAX_CLAIM_WORKERS")
                .unwrap_or(defaults.max_claim_workers),
            max_create_qps: parse_env("HATCH_MAX_CREATE_QPS").unwrap_or(defaults.max_create_qps),
            ext_proc_max_concurrency: parse_env("HATCH_EXT_PROC_MAX_CONCURRENCY")
                .unwrap_or(defaults.ext_proc_max_concurrency),
            default_pooling_candidate_counts: parse_env("HATCH_POOLING_CANDIDATES")
                .unwrap_or(defaults.default_pooling_candidate_counts),
            default_min_pool_size: parse_env("HATCH_DEFAULT_MIN_POOL_SIZE")
                .unwrap_or(defaults.default_min_pool_size),
            default_max_pool_size_factor: parse_env("HATCH_MAX_POOL_FACTOR")
                .unwrap_or(defaults.default_max_pool_size_factor),
            store_qps: parse_env("HATCH_STORE_QPS").unwrap_or(defaults.store_qps),
            store_burst: parse_env("HATCH_STORE_BURST").unwrap_or(defaults.store_burst),
            proxy_port: parse_env("HATCH_PROXY_PORT").unwrap_or(defaults.proxy_port),
            peer_greet_attempts: parse_env("HATCH_PEER_GREET_ATTEMPTS")
                .unwrap_or(defaults.peer_greet_attempts),
            peer_greet_interval: parse_env("HATCH_PEER_GREET_INTERVAL_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.peer_greet_interval),
            peer_push_timeout: parse_env("HATCH_PEER_PUSH_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.peer_push_timeout),
            refresh_interval: parse_env("HATCH_REFRESH_INTERVAL_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_interval),
            transition_wait_timeout: parse_env("HATCH_TRANSITION_WAIT_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.transition_wait_timeout),
            transition_wait_step: defaults.transition_wait_step,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recognized_options() {
        let config = ManagerConfig::default();
        assert_eq!(config.system_namespace, "default");
        assert_eq!(config.max_claim_workers, 32);
        assert_eq!(config.max_create_qps, 50);
        assert_eq!(config.ext_proc_max_concurrency, 100);
        assert_eq!(config.default_pooling_candidate_counts, 100);
        assert_eq!(config.default_min_pool_size, 5);
        assert_eq!(config.default_max_pool_size_factor, 2);
        assert_eq!(config.store_qps, 50);
        assert_eq!(config.store_burst, 100);
        assert_eq!(config.peer_push_timeout, Duration::from_millis(100));
        assert_eq!(config.refresh_interval, Duration::from_secs(60));
    }
}

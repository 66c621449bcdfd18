//! Liveness checker for catalog entries

use crate::proxy::http::build_client;
use crate::proxy::models::{ActiveSet, Catalog, CatalogEntry, ProxyCheckResult};
use futures::stream::{self, StreamExt};
use std::pin::pin;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default timeout for proxy checks in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default number of concurrent checks
const DEFAULT_CONCURRENCY: usize = 50;

/// Default endpoint to probe through each proxy
const DEFAULT_PROBE_URL: &str = "http://httpbin.org/ip";

/// Log progress every this many checked entries
const PROGRESS_EVERY: usize = 50;

/// Configuration for the liveness checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Timeout for each probe request
    pub timeout: Duration,
    /// Number of concurrent checks
    pub concurrency: usize,
    /// Endpoints tried in order through each proxy
    pub probe_endpoints: Vec<String>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            concurrency: DEFAULT_CONCURRENCY,
            probe_endpoints: vec![DEFAULT_PROBE_URL.to_string()],
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_probe_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.probe_endpoints = endpoints;
        self
    }
}

/// Probes catalog entries through themselves as forward proxies
#[derive(Debug, Clone, Default)]
pub struct LivenessChecker {
    config: CheckerConfig,
}

impl LivenessChecker {
    /// Create a new checker with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new checker with custom configuration
    pub fn with_config(config: CheckerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Check a single entry.
    ///
    /// Endpoints are tried in order and the first success status wins. A
    /// non-success status moves on to the next endpoint; a transport error or
    /// timeout means the proxy itself failed and ends the check.
    pub async fn check_entry(&self, entry: CatalogEntry) -> ProxyCheckResult {
        let client = match build_client(self.config.timeout, Some((&entry.proxy, entry.protocol))) {
            Ok(client) => client,
            Err(e) => return ProxyCheckResult::failed(entry, e.to_string()),
        };

        let mut last_error = String::from("no probe endpoints configured");
        for endpoint in &self.config.probe_endpoints {
            let start = Instant::now();
            match tokio::time::timeout(self.config.timeout, client.get(endpoint).send()).await {
                Ok(Ok(response)) if response.status().is_success() => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    return ProxyCheckResult::working(entry, endpoint.clone(), elapsed);
                }
                Ok(Ok(response)) => {
                    last_error = format!("HTTP status: {} from {}", response.status(), endpoint);
                }
                Ok(Err(e)) if e.is_timeout() => return ProxyCheckResult::timeout(entry),
                Ok(Err(e)) => return ProxyCheckResult::failed(entry, e.to_string()),
                Err(_) => return ProxyCheckResult::timeout(entry),
            }
        }

        ProxyCheckResult::failed(entry, last_error)
    }

    /// Check every catalog entry with bounded concurrency and keep the live ones
    pub async fn check(&self, catalog: &Catalog) -> ActiveSet {
        let total = catalog.len();
        info!(
            "Checking {} proxies: timeout={}s, workers={}",
            total,
            self.config.timeout.as_secs(),
            self.config.concurrency
        );

        let mut results = pin!(stream::iter(catalog.entries())
            .map(|entry| self.check_entry(entry))
            .buffer_unordered(self.config.concurrency.max(1)));

        let mut active = ActiveSet::new();
        let mut checked = 0;
        while let Some(result) = results.next().await {
            checked += 1;
            if checked % PROGRESS_EVERY == 0 {
                info!("Checked {}/{} proxies...", checked, total);
            }

            if result.is_working() {
                debug!(
                    "{} {} is live ({}ms)",
                    result.entry.protocol,
                    result.entry.proxy,
                    result.response_time_ms.unwrap_or_default()
                );
                active.insert_entry(result.entry);
            }
        }

        info!("{} of {} proxies are live", active.len(), total);
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::{Protocol, Proxy};
    use crate::test_support::{refused_addr, spawn_black_hole, spawn_forward_proxy};
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;

    fn checker(endpoints: &[&str]) -> LivenessChecker {
        LivenessChecker::with_config(
            CheckerConfig::new()
                .with_timeout(Duration::from_millis(500))
                .with_concurrency(4)
                .with_probe_endpoints(endpoints.iter().map(|e| e.to_string()).collect()),
        )
    }

    fn http_entry(addr: SocketAddr) -> CatalogEntry {
        CatalogEntry::new(Proxy::new(addr.to_string()), Protocol::Http)
    }

    #[test]
    fn test_checker_config_default() {
        let config = CheckerConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.probe_endpoints, vec![DEFAULT_PROBE_URL.to_string()]);
    }

    #[test]
    fn test_checker_config_builder() {
        let config = CheckerConfig::new()
            .with_timeout(Duration::from_secs(5))
            .with_concurrency(20)
            .with_probe_endpoints(vec!["http://example.com".to_string()]);

        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.probe_endpoints, vec!["http://example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_first_successful_endpoint_short_circuits() {
        let (addr, hits) = spawn_forward_proxy().await;
        let checker = checker(&["http://probe.test/ok", "http://probe.test/fail"]);

        let result = checker.check_entry(http_entry(addr)).await;

        assert!(result.is_working());
        assert_eq!(result.endpoint.as_deref(), Some("http://probe.test/ok"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_falls_through_to_next_endpoint_on_bad_status() {
        let (addr, hits) = spawn_forward_proxy().await;
        let checker = checker(&["http://probe.test/fail", "http://probe.test/ok"]);

        let result = checker.check_entry(http_entry(addr)).await;

        assert!(result.is_working());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_all_endpoints_failing_marks_dead() {
        let (addr, _) = spawn_forward_proxy().await;
        let checker = checker(&["http://probe.test/fail", "http://probe.test/also-fail"]);

        let result = checker.check_entry(http_entry(addr)).await;

        assert!(!result.is_working());
    }

    #[tokio::test]
    async fn test_timeout_marks_dead_without_retry() {
        let (addr, accepted) = spawn_black_hole().await;
        let checker = checker(&["http://probe.test/ok"]);
        let mut catalog = Catalog::new();
        catalog.insert(Protocol::Http, Proxy::new(addr.to_string()));

        let active = checker.check(&catalog).await;

        assert!(active.is_empty());
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_active_set_is_subset_of_catalog() {
        let (live, _) = spawn_forward_proxy().await;
        let refused = refused_addr().await;
        let checker = checker(&["http://probe.test/ok"]);

        let mut catalog = Catalog::new();
        catalog.insert(Protocol::Http, Proxy::new(live.to_string()));
        catalog.insert(Protocol::Http, Proxy::new(refused.to_string()));

        let active = checker.check(&catalog).await;

        assert!(active.is_subset(&catalog));
        assert_eq!(active.count(Protocol::Http), 1);
        assert!(active.contains(Protocol::Http, &Proxy::new(live.to_string())));
    }

    #[tokio::test]
    async fn test_empty_catalog() {
        let active = checker(&["http://probe.test/ok"]).check(&Catalog::new()).await;
        assert!(active.is_empty());
    }
}

//! Fetch → deduplicate → check pipeline

use crate::config::Config;
use crate::proxy::checker::{CheckerConfig, LivenessChecker};
use crate::proxy::crawler::CrawlResult;
use crate::proxy::dedup::merge;
use crate::proxy::models::{ActiveSet, Catalog, Protocol};
use crate::proxy::source::{FetchOptions, SourceAdapter};
use crate::store::{SnapshotStore, Tier};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// What one source contributed to a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSummary {
    pub name: String,
    pub entries: usize,
    pub error: Option<String>,
}

/// Counts describing one pipeline run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceSummary>,
    pub clean: BTreeMap<Protocol, usize>,
    /// None when the liveness stage did not run
    pub active: Option<BTreeMap<Protocol, usize>>,
}

impl RunSummary {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            sources: Vec::new(),
            clean: BTreeMap::new(),
            active: None,
        }
    }

    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceSummary> {
        self.sources.iter().filter(|s| s.error.is_some())
    }

    pub fn log(&self) {
        let elapsed = self.finished_at - self.started_at;
        info!(
            "Run started {} finished in {}s",
            self.started_at.to_rfc3339(),
            elapsed.num_seconds()
        );
        for source in &self.sources {
            match &source.error {
                Some(error) => warn!(
                    "  {}: {} entries, failed: {}",
                    source.name, source.entries, error
                ),
                None => info!("  {}: {} entries", source.name, source.entries),
            }
        }
        for protocol in Protocol::ALL {
            let clean = self.clean.get(&protocol).copied().unwrap_or_default();
            match &self.active {
                Some(active) => info!(
                    "  {}: {} clean, {} active",
                    protocol,
                    clean,
                    active.get(&protocol).copied().unwrap_or_default()
                ),
                None => info!("  {}: {} clean", protocol, clean),
            }
        }
    }
}

fn counts(set: &Catalog) -> BTreeMap<Protocol, usize> {
    Protocol::ALL
        .into_iter()
        .map(|protocol| (protocol, set.count(protocol)))
        .collect()
}

/// Orchestrates sources, deduplication, liveness checking and snapshots
pub struct Pipeline {
    config: Config,
    store: SnapshotStore,
    checker: LivenessChecker,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        let store = SnapshotStore::new(config.settings.output_dir.clone());
        let checker = LivenessChecker::with_config(
            CheckerConfig::new()
                .with_timeout(config.settings.check_timeout())
                .with_concurrency(config.settings.max_workers)
                .with_probe_endpoints(config.settings.probe_endpoints.clone()),
        );
        Self {
            config,
            store,
            checker,
        }
    }

    pub fn with_checker(mut self, checker: LivenessChecker) -> Self {
        self.checker = checker;
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Run every stage and publish all three tiers
    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::new(Utc::now());

        let catalog = self.fetch_and_merge(&mut summary).await?;
        let active = self.check_catalog(&catalog).await?;
        summary.active = Some(counts(&active));

        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Fetch and deduplicate only, publishing the raw and clean tiers
    pub async fn fetch(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::new(Utc::now());
        self.fetch_and_merge(&mut summary).await?;
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Re-check the published clean tier and rewrite the active tier
    pub async fn check(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::new(Utc::now());

        let catalog = self.store.read(Tier::Clean)?;
        summary.clean = counts(&catalog);
        let active = self.check_catalog(&catalog).await?;
        summary.active = Some(counts(&active));

        summary.finished_at = Utc::now();
        Ok(summary)
    }

    async fn fetch_and_merge(&self, summary: &mut RunSummary) -> Result<Catalog> {
        let results = self.fetch_sources().await;

        for result in &results {
            summary.sources.push(SourceSummary {
                name: result.source.clone(),
                entries: result.proxies.len(),
                error: result.error.clone(),
            });
            if let Err(e) = self.store.write(Tier::Source(&result.source), &result.proxies) {
                warn!("Could not save {} snapshot: {:#}", result.source, e);
            }
        }
        let names: Vec<&str> = results.iter().map(|r| r.source.as_str()).collect();
        if let Err(e) = self.store.prune_sources(&names) {
            warn!("Could not prune stale snapshots: {:#}", e);
        }

        info!("Deduplicating proxies...");
        let catalog = merge(results.iter().map(|r| &r.proxies));
        self.store.write(Tier::Clean, &catalog)?;
        summary.clean = counts(&catalog);

        Ok(catalog)
    }

    /// Fetch every configured source concurrently.
    ///
    /// Each source runs in its own task; an error or panic in one is logged
    /// and turned into a failed result without touching the others.
    pub async fn fetch_sources(&self) -> Vec<CrawlResult> {
        let rotation_pool = match self.store.read(Tier::Active) {
            Ok(previous) => previous.proxies(Protocol::Http).cloned().collect(),
            Err(e) => {
                warn!("No rotation pool available: {:#}", e);
                Vec::new()
            }
        };
        let options = Arc::new(FetchOptions {
            request_timeout: self.config.settings.request_timeout(),
            rotation_pool,
        });

        let handles: Vec<_> = self
            .config
            .sources
            .iter()
            .map(|source| {
                let adapter = SourceAdapter::from_config(source);
                let options = Arc::clone(&options);
                let name = source.name().to_string();
                (name, tokio::spawn(async move { adapter.fetch(&options).await }))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => CrawlResult::failure(name, format!("source task failed: {}", e)),
            };

            match &result.error {
                None => info!("Found {} proxies from {}", result.proxies.len(), result.source),
                Some(error) => warn!(
                    "Error fetching {} (keeping {} proxies): {}",
                    result.source,
                    result.proxies.len(),
                    error
                ),
            }
            results.push(result);
        }
        results
    }

    async fn check_catalog(&self, catalog: &Catalog) -> Result<ActiveSet> {
        info!("Checking proxies liveness...");
        let active = self.checker.check(catalog).await;
        self.store.write(Tier::Active, &active)?;
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::{Proxy, ProxySet};
    use crate::test_support::{refused_addr, spawn_http_stub};
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config_json(output_dir: &std::path::Path, sources: &str) -> Config {
        let json = format!(
            r#"{{ "settings": {{ "check_timeout": 2, "max_workers": 4, "request_timeout": 5,
                               "probe_endpoints": ["http://probe.test/ok"],
                               "output_dir": {:?} }},
                 "sources": {} }}"#,
            output_dir.display().to_string(),
            sources
        );
        Config::from_json(&json).unwrap()
    }

    fn read(path: std::path::PathBuf) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn test_empty_source_list_resets_tiers() {
        let dir = tempdir().unwrap();
        let config = config_json(dir.path(), "[]");
        let pipeline = Pipeline::new(config);

        let mut stale = ProxySet::new();
        stale.insert(Protocol::Http, Proxy::from("9.9.9.9:80"));
        pipeline.store().write(Tier::Clean, &stale).unwrap();
        pipeline.store().write(Tier::Active, &stale).unwrap();
        pipeline.store().write(Tier::Source("gone"), &stale).unwrap();

        let summary = pipeline.run().await.unwrap();

        assert!(summary.sources.is_empty());
        assert!(pipeline.store().read(Tier::Clean).unwrap().is_empty());
        assert!(pipeline.store().read(Tier::Active).unwrap().is_empty());
        assert!(!dir.path().join("gone").exists());
        for protocol in Protocol::ALL {
            assert_eq!(read(pipeline.store().tier_file(Tier::Clean, protocol)), "");
            assert_eq!(read(pipeline.store().tier_file(Tier::Active, protocol)), "");
        }
    }

    #[tokio::test]
    async fn test_two_sources_merge_into_clean_tier() {
        let (server, _) = spawn_http_stub(|line| {
            if line.contains("/a.txt") {
                (200, "1.1.1.1:80\n".to_string())
            } else if line.contains("/b.txt") {
                (200, "1.1.1.1:80\n2.2.2.2:8080\n".to_string())
            } else {
                (404, String::new())
            }
        })
        .await;
        let dir = tempdir().unwrap();
        let sources = format!(
            r#"[ {{ "name": "a", "type": "text_list",
                    "urls": [ {{ "protocol": "http", "url": "http://{server}/a.txt" }} ] }},
                 {{ "name": "b", "type": "text_list",
                    "urls": [ {{ "protocol": "http", "url": "http://{server}/b.txt" }},
                              {{ "protocol": "socks5", "url": "http://{server}/missing.txt" }} ] }} ]"#
        );
        let pipeline = Pipeline::new(config_json(dir.path(), &sources));

        let summary = pipeline.fetch().await.unwrap();

        assert_eq!(read(dir.path().join("clean/http.txt")), "1.1.1.1:80\n2.2.2.2:8080\n");
        assert_eq!(read(dir.path().join("a/http.txt")), "1.1.1.1:80\n");
        assert_eq!(read(dir.path().join("b/http.txt")), "1.1.1.1:80\n2.2.2.2:8080\n");
        assert_eq!(read(dir.path().join("b/socks5.txt")), "");
        assert_eq!(summary.clean.get(&Protocol::Http), Some(&2));
        assert!(summary.active.is_none());
        assert_eq!(summary.failed_sources().count(), 0);
    }

    #[tokio::test]
    async fn test_failing_source_is_isolated() {
        let (server, _) = spawn_http_stub(|line| {
            if line.contains("/list.txt") {
                (200, "3.3.3.3:3128\n".to_string())
            } else if line.contains("/api") && line.contains("page=1") {
                (200, r#"{ "data": [ { "ip": "4.4.4.4", "port": 1080, "protocols": ["socks5"] } ] }"#.to_string())
            } else {
                (200, "<html>blocked</html>".to_string())
            }
        })
        .await;
        let dir = tempdir().unwrap();
        let sources = format!(
            r#"[ {{ "name": "api", "type": "json_api", "url": "http://{server}/api",
                    "pagination": {{ "param": "page", "start": 1, "limit": 5 }},
                    "mapping": {{ "ip": "ip", "port": "port", "protocols": "protocols", "list_key": "data" }} }},
                 {{ "name": "list", "type": "text_list",
                    "urls": [ {{ "protocol": "http", "url": "http://{server}/list.txt" }} ] }} ]"#
        );
        let pipeline = Pipeline::new(config_json(dir.path(), &sources));

        let summary = pipeline.fetch().await.unwrap();

        let failed: Vec<&str> = summary.failed_sources().map(|s| s.name.as_str()).collect();
        assert_eq!(failed, vec!["api"]);
        // Page 1 was collected before page 2 failed to decode
        assert_eq!(read(dir.path().join("api/socks5.txt")), "4.4.4.4:1080\n");
        assert_eq!(read(dir.path().join("clean/http.txt")), "3.3.3.3:3128\n");
        assert_eq!(read(dir.path().join("clean/socks5.txt")), "4.4.4.4:1080\n");
    }

    #[tokio::test]
    async fn test_full_run_publishes_live_subset() {
        let (server, _) = spawn_http_stub(|line| {
            if line.contains("/ok") {
                (200, "ok".to_string())
            } else {
                (404, String::new())
            }
        })
        .await;
        let dead = refused_addr().await;
        let (lists, _) = spawn_http_stub(move |line| {
            if line.contains("/http.txt") {
                (200, format!("{}\n{}\n", server, dead))
            } else {
                (404, String::new())
            }
        })
        .await;

        let dir = tempdir().unwrap();
        let sources = format!(
            r#"[ {{ "name": "local", "type": "text_list",
                    "urls": [ {{ "protocol": "http", "url": "http://{lists}/http.txt" }} ] }} ]"#
        );
        let pipeline = Pipeline::new(config_json(dir.path(), &sources)).with_checker(
            LivenessChecker::with_config(
                CheckerConfig::new()
                    .with_timeout(Duration::from_secs(2))
                    .with_probe_endpoints(vec!["http://probe.test/ok".to_string()]),
            ),
        );

        let summary = pipeline.run().await.unwrap();

        assert_eq!(summary.clean.get(&Protocol::Http), Some(&2));
        assert_eq!(
            summary.active.as_ref().and_then(|a| a.get(&Protocol::Http)),
            Some(&1)
        );
        assert_eq!(read(dir.path().join("active/http.txt")), format!("{}\n", server));

        let clean = pipeline.store().read(Tier::Clean).unwrap();
        let active = pipeline.store().read(Tier::Active).unwrap();
        assert!(active.is_subset(&clean));

        // Re-checking the published clean tier gives the same active tier
        let rechecked = pipeline.check().await.unwrap();
        assert_eq!(rechecked.active, summary.active);
    }

    #[tokio::test]
    async fn test_fetch_keeps_unrelated_directories() {
        let (server, _) = spawn_http_stub(|_| (200, "1.1.1.1:80\n".to_string())).await;
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();

        let sources = format!(
            r#"[ {{ "name": "a", "type": "text_list",
                    "urls": [ {{ "protocol": "http", "url": "http://{server}/a.txt" }} ] }} ]"#
        );
        let pipeline = Pipeline::new(config_json(dir.path(), &sources));

        pipeline.fetch().await.unwrap();

        assert_eq!(read(dir.path().join("src/main.rs")), "fn main() {}");
        assert_eq!(read(dir.path().join("a/http.txt")), "1.1.1.1:80\n");
    }

    #[tokio::test]
    async fn test_rotating_source_routes_through_previous_active_tier() {
        // Forward proxy serving the table; the origin host does not resolve,
        // so a page can only arrive through the rotation pool
        let (relay, hits) = spawn_http_stub(|line| {
            if line.contains("http://origin.test/list") && line.contains("offset=0") {
                (
                    200,
                    "<table><tbody><tr><td>6.6.6.6:3128</td><td>US</td><td>1</td><td>99</td>\
                     <td>HTTP</td></tr></tbody></table>"
                        .to_string(),
                )
            } else {
                (200, "<html><body>No results</body></html>".to_string())
            }
        })
        .await;
        let dir = tempdir().unwrap();
        let sources = r#"[ { "name": "rot", "type": "html_table", "url": "http://origin.test/list",
                "pagination": { "param": "offset", "step": 15, "limit": 30, "workers": 2,
                                "rotate": true, "end_marker": "No results" } } ]"#;
        let pipeline = Pipeline::new(config_json(dir.path(), sources));

        let mut previous = ProxySet::new();
        previous.insert(Protocol::Http, Proxy::new(relay.to_string()));
        pipeline.store().write(Tier::Active, &previous).unwrap();

        let summary = pipeline.fetch().await.unwrap();

        assert!(hits.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        assert_eq!(summary.failed_sources().count(), 0);
        assert_eq!(read(dir.path().join("rot/http.txt")), "6.6.6.6:3128\n");
        assert_eq!(read(dir.path().join("clean/http.txt")), "6.6.6.6:3128\n");
    }
}

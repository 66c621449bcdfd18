//! Harvester configuration loaded from a JSON file

use crate::proxy::models::Protocol;
use crate::proxy::parser::ProtocolBits;
use crate::Result;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "proxy_sources.json";

/// Default consecutive empty/failed pages before a rotating crawl stops
pub const DEFAULT_BREAKER_THRESHOLD: usize = 20;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!(
            "Loaded {} sources from {}",
            config.sources.len(),
            path.display()
        );
        Ok(config)
    }

    /// Parse configuration; source names must be unique since each one
    /// names its own snapshot directory
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;

        let mut seen = BTreeSet::new();
        for source in &config.sources {
            if !seen.insert(source.name()) {
                bail!("Duplicate source name: {:?}", source.name());
            }
        }

        Ok(config)
    }
}

/// Run-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Liveness probe timeout in seconds
    pub check_timeout: u64,
    /// Concurrent liveness probes
    pub max_workers: usize,
    /// Source request timeout in seconds
    pub request_timeout: u64,
    /// Endpoints tried in order when probing a proxy
    pub probe_endpoints: Vec<String>,
    /// Root directory of the snapshot tiers
    pub output_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_timeout: 30,
            max_workers: 50,
            request_timeout: 20,
            probe_endpoints: vec!["http://httpbin.org/ip".to_string()],
            output_dir: PathBuf::from("proxies"),
        }
    }
}

impl Settings {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// One configured source, tagged by its `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    TextList {
        name: String,
        urls: Vec<ListUrl>,
    },
    JsonApi {
        name: String,
        url: String,
        #[serde(default)]
        params: BTreeMap<String, Value>,
        pagination: PaginationConfig,
        mapping: JsonMapping,
    },
    HtmlTable {
        name: String,
        url: String,
        #[serde(default)]
        params: BTreeMap<String, Value>,
        pagination: PaginationConfig,
        #[serde(default)]
        table: TableLayout,
    },
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        match self {
            SourceConfig::TextList { name, .. }
            | SourceConfig::JsonApi { name, .. }
            | SourceConfig::HtmlTable { name, .. } => name,
        }
    }
}

/// A protocol-specific list URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListUrl {
    pub protocol: Protocol,
    pub url: String,
}

/// Cursor parameters of a paginated source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationConfig {
    /// Query parameter carrying the cursor
    pub param: String,
    #[serde(default)]
    pub start: u64,
    #[serde(default = "default_step")]
    pub step: u64,
    /// Inclusive upper bound on the cursor value
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub breaker_threshold: Option<usize>,
    /// Concurrent workers; more than one selects the rotating crawler
    #[serde(default)]
    pub workers: Option<usize>,
    /// Route requests through the previously validated pool
    #[serde(default)]
    pub rotate: bool,
    /// Text that marks a page as past the last result
    #[serde(default)]
    pub end_marker: Option<String>,
}

fn default_step() -> u64 {
    1
}

impl PaginationConfig {
    pub fn is_concurrent(&self) -> bool {
        self.rotate || self.workers.is_some_and(|w| w > 1)
    }

    pub fn breaker_threshold(&self) -> usize {
        self.breaker_threshold
            .unwrap_or(DEFAULT_BREAKER_THRESHOLD)
            .max(1)
    }

    pub fn workers(&self) -> usize {
        self.workers.unwrap_or(1).max(1)
    }
}

/// Field mapping for JSON API records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonMapping {
    pub ip: String,
    pub port: String,
    pub protocols: String,
    /// Dot-separated path to the record list, e.g. `data.items`
    #[serde(default)]
    pub list_key: Option<String>,
    #[serde(default)]
    pub protocol_bits: ProtocolBits,
}

/// Column layout of an HTML proxy table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableLayout {
    pub row_selector: String,
    /// Column with `ip:port`, or just the ip when `port_column` is set
    pub address_column: usize,
    pub port_column: Option<usize>,
    pub protocol_column: usize,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            row_selector: "table tbody tr".to_string(),
            address_column: 0,
            port_column: None,
            protocol_column: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "settings": { "check_timeout": 10, "max_workers": 20 },
        "sources": [
            { "name": "lists", "type": "text_list",
              "urls": [ { "protocol": "socks5", "url": "https://example.com/socks5.txt" } ] },
            { "name": "api", "type": "json_api", "url": "https://example.com/api",
              "params": { "limit": 100, "sort": "lastChecked" },
              "pagination": { "param": "page", "start": 1, "limit": 10 },
              "mapping": { "ip": "ip", "port": "port", "protocols": "protocols",
                           "list_key": "data", "protocol_bits": { "1": "http", "16": "socks5" } } },
            { "name": "table", "type": "html_table", "url": "https://example.com/list",
              "pagination": { "param": "offset", "start": 0, "step": 15,
                              "workers": 8, "rotate": true, "end_marker": "No results" } }
        ]
    }"#;

    #[test]
    fn test_parse_sample_config() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert_eq!(config.settings.check_timeout(), Duration::from_secs(10));
        assert_eq!(config.settings.max_workers, 20);
        // Unset fields fall back to defaults
        assert_eq!(config.settings.request_timeout, 20);
        assert_eq!(config.settings.output_dir, PathBuf::from("proxies"));
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.sources[0].name(), "lists");
    }

    #[test]
    fn test_pagination_defaults() {
        let config = Config::from_json(SAMPLE).unwrap();
        let SourceConfig::JsonApi {
            pagination,
            mapping,
            ..
        } = &config.sources[1]
        else {
            panic!("expected json_api source");
        };
        assert_eq!(pagination.step, 1);
        assert_eq!(pagination.limit, Some(10));
        assert!(!pagination.is_concurrent());
        assert_eq!(pagination.breaker_threshold(), DEFAULT_BREAKER_THRESHOLD);
        assert_eq!(mapping.protocol_bits.decode(16), vec![Protocol::Socks5]);
        assert!(mapping.protocol_bits.decode(8).is_empty());
    }

    #[test]
    fn test_html_table_defaults() {
        let config = Config::from_json(SAMPLE).unwrap();
        let SourceConfig::HtmlTable {
            pagination, table, ..
        } = &config.sources[2]
        else {
            panic!("expected html_table source");
        };
        assert!(pagination.is_concurrent());
        assert_eq!(pagination.workers(), 8);
        assert_eq!(table.row_selector, "table tbody tr");
        assert_eq!(table.protocol_column, 4);
    }

    #[test]
    fn test_empty_config() {
        let config = Config::from_json("{}").unwrap();
        assert!(config.sources.is_empty());
        assert_eq!(config.settings.max_workers, 50);
    }

    #[test]
    fn test_unknown_source_type_rejected() {
        let json = r#"{ "sources": [ { "name": "x", "type": "ftp_dump" } ] }"#;
        assert!(Config::from_json(json).is_err());
    }

    #[test]
    fn test_duplicate_source_names_rejected() {
        let json = r#"{ "sources": [
            { "name": "a", "type": "text_list", "urls": [] },
            { "name": "a", "type": "text_list", "urls": [] }
        ] }"#;
        let err = Config::from_json(json).unwrap_err();
        assert!(err.to_string().contains("Duplicate source name"));
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = Config::load("/nonexistent/proxy_sources.json").unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/proxy_sources.json"));
    }
}

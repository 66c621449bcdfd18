//! Proxy data models

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Protocol a proxy is tagged with
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Socks4,
    Socks5,
}

impl Protocol {
    /// Every protocol a snapshot tier is written for
    pub const ALL: [Protocol; 3] = [Protocol::Http, Protocol::Socks4, Protocol::Socks5];

    /// Classify a free-form protocol label reported by a source.
    ///
    /// Matching is by substring, socks4 first, then socks5, then http/https.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.to_lowercase();
        if label.contains("socks4") {
            Some(Protocol::Socks4)
        } else if label.contains("socks5") {
            Some(Protocol::Socks5)
        } else if label.contains("http") {
            Some(Protocol::Http)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "socks4" => Ok(Protocol::Socks4),
            "socks5" => Ok(Protocol::Socks5),
            _ => Err(anyhow::anyhow!(
                "Invalid protocol: {}. Use: http, socks4, socks5",
                s
            )),
        }
    }
}

/// A proxy endpoint in `ip:port` form.
///
/// The address is opaque: two proxies are the same exactly when their strings are.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Proxy(String);

impl Proxy {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Proxy URL for the given protocol, e.g. `socks5://1.2.3.4:1080`
    pub fn url(&self, protocol: Protocol) -> String {
        format!("{}://{}", protocol, self.0)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Proxy {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// A (proxy, protocol) pair as it flows from a source through the checker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CatalogEntry {
    pub proxy: Proxy,
    pub protocol: Protocol,
}

impl CatalogEntry {
    pub fn new(proxy: Proxy, protocol: Protocol) -> Self {
        Self { proxy, protocol }
    }
}

/// Per-protocol set of proxies.
///
/// Used for a single source run, for the merged catalog and for the active set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySet {
    by_protocol: BTreeMap<Protocol, BTreeSet<Proxy>>,
}

/// Entries yielded by one source run
pub type SourceResult = ProxySet;
/// Deduplicated union of every source result
pub type Catalog = ProxySet;
/// Subset of the catalog confirmed live
pub type ActiveSet = ProxySet;

impl ProxySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, returning false if it was already present
    pub fn insert(&mut self, protocol: Protocol, proxy: Proxy) -> bool {
        self.by_protocol.entry(protocol).or_default().insert(proxy)
    }

    pub fn insert_entry(&mut self, entry: CatalogEntry) -> bool {
        self.insert(entry.protocol, entry.proxy)
    }

    /// Union another set into this one
    pub fn extend(&mut self, other: ProxySet) {
        for (protocol, proxies) in other.by_protocol {
            self.by_protocol.entry(protocol).or_default().extend(proxies);
        }
    }

    pub fn contains(&self, protocol: Protocol, proxy: &Proxy) -> bool {
        self.by_protocol
            .get(&protocol)
            .is_some_and(|set| set.contains(proxy))
    }

    /// Proxies for one protocol, in sorted order
    pub fn proxies(&self, protocol: Protocol) -> impl Iterator<Item = &Proxy> {
        self.by_protocol.get(&protocol).into_iter().flatten()
    }

    pub fn count(&self, protocol: Protocol) -> usize {
        self.by_protocol.get(&protocol).map_or(0, BTreeSet::len)
    }

    /// Total number of (proxy, protocol) entries
    pub fn len(&self) -> usize {
        self.by_protocol.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> impl Iterator<Item = CatalogEntry> + '_ {
        self.by_protocol.iter().flat_map(|(protocol, proxies)| {
            proxies
                .iter()
                .map(move |proxy| CatalogEntry::new(proxy.clone(), *protocol))
        })
    }

    pub fn is_subset(&self, other: &ProxySet) -> bool {
        self.entries()
            .all(|entry| other.contains(entry.protocol, &entry.proxy))
    }
}

impl FromIterator<CatalogEntry> for ProxySet {
    fn from_iter<I: IntoIterator<Item = CatalogEntry>>(iter: I) -> Self {
        let mut set = ProxySet::new();
        for entry in iter {
            set.insert_entry(entry);
        }
        set
    }
}

/// Result of proxy check operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProxyCheckStatus {
    Working,
    Failed(String),
    Timeout,
}

/// Detailed result of a liveness probe
#[derive(Debug, Clone)]
pub struct ProxyCheckResult {
    pub entry: CatalogEntry,
    pub status: ProxyCheckStatus,
    pub response_time_ms: Option<u64>,
    /// Probe endpoint that answered, when working
    pub endpoint: Option<String>,
}

impl ProxyCheckResult {
    pub fn working(entry: CatalogEntry, endpoint: String, response_time_ms: u64) -> Self {
        Self {
            entry,
            status: ProxyCheckStatus::Working,
            response_time_ms: Some(response_time_ms),
            endpoint: Some(endpoint),
        }
    }

    pub fn failed(entry: CatalogEntry, error: String) -> Self {
        Self {
            entry,
            status: ProxyCheckStatus::Failed(error),
            response_time_ms: None,
            endpoint: None,
        }
    }

    pub fn timeout(entry: CatalogEntry) -> Self {
        Self {
            entry,
            status: ProxyCheckStatus::Timeout,
            response_time_ms: None,
            endpoint: None,
        }
    }

    pub fn is_working(&self) -> bool {
        matches!(self.status, ProxyCheckStatus::Working)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_label() {
        assert_eq!(Protocol::from_label("SOCKS4"), Some(Protocol::Socks4));
        assert_eq!(Protocol::from_label("socks5h"), Some(Protocol::Socks5));
        assert_eq!(Protocol::from_label("HTTPS"), Some(Protocol::Http));
        assert_eq!(Protocol::from_label("http"), Some(Protocol::Http));
        assert_eq!(Protocol::from_label("ftp"), None);
    }

    #[test]
    fn test_protocol_parse_and_display() {
        for protocol in Protocol::ALL {
            assert_eq!(protocol.to_string().parse::<Protocol>().unwrap(), protocol);
        }
        assert!("https".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_proxy_url() {
        let proxy = Proxy::new("192.168.1.1:1080");
        assert_eq!(proxy.url(Protocol::Socks5), "socks5://192.168.1.1:1080");
        assert_eq!(proxy.url(Protocol::Http), "http://192.168.1.1:1080");
    }

    #[test]
    fn test_proxy_set_insert_dedups() {
        let mut set = ProxySet::new();
        assert!(set.insert(Protocol::Http, Proxy::from("1.1.1.1:80")));
        assert!(!set.insert(Protocol::Http, Proxy::from("1.1.1.1:80")));
        // Same address under another protocol is a separate entry
        assert!(set.insert(Protocol::Socks5, Proxy::from("1.1.1.1:80")));
        assert_eq!(set.len(), 2);
        assert_eq!(set.count(Protocol::Http), 1);
        assert_eq!(set.count(Protocol::Socks4), 0);
    }

    #[test]
    fn test_proxy_set_entries_and_subset() {
        let full: ProxySet = vec![
            CatalogEntry::new(Proxy::from("1.1.1.1:80"), Protocol::Http),
            CatalogEntry::new(Proxy::from("2.2.2.2:1080"), Protocol::Socks5),
        ]
        .into_iter()
        .collect();

        let mut part = ProxySet::new();
        part.insert(Protocol::Socks5, Proxy::from("2.2.2.2:1080"));

        assert!(part.is_subset(&full));
        assert!(!full.is_subset(&part));
        assert_eq!(full.entries().count(), 2);
    }

    #[test]
    fn test_proxy_check_result() {
        let entry = CatalogEntry::new(Proxy::from("127.0.0.1:8080"), Protocol::Http);

        let result = ProxyCheckResult::working(entry.clone(), "http://probe".to_string(), 100);
        assert!(result.is_working());
        assert_eq!(result.response_time_ms, Some(100));

        let result = ProxyCheckResult::failed(entry.clone(), "Connection refused".to_string());
        assert!(!result.is_working());

        let result = ProxyCheckResult::timeout(entry);
        assert!(!result.is_working());
    }
}

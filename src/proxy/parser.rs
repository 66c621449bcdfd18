//! Proxy parser module for parsing proxy entries out of source payloads

use crate::proxy::models::{Protocol, Proxy};
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Regex pattern to match IP:PORT patterns in free text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})\b")
        .expect("Invalid IP:PORT regex")
});

/// Accepts `host:port` with an optional `scheme://` prefix
static LINE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-zA-Z][a-zA-Z0-9+.-]*://)?([A-Za-z0-9.-]+):(\d{1,5})/?$")
        .expect("Invalid line regex")
});

/// Proxy parser for list payloads and table cells
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single list line
    ///
    /// Supports formats:
    /// - IP:PORT
    /// - scheme://IP:PORT
    pub fn parse_line(line: &str) -> Option<Proxy> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let caps = LINE_REGEX.captures(line)?;
        let port: u16 = caps[2].parse().ok()?;
        if port == 0 {
            return None;
        }

        Some(Proxy::new(format!("{}:{}", &caps[1], port)))
    }

    /// Build an address from separate ip and port cells
    pub fn join_address(ip: &str, port: &str) -> Option<Proxy> {
        let ip = ip.trim();
        let port: u16 = port.trim().parse().ok()?;
        if ip.is_empty() || port == 0 {
            return None;
        }
        Some(Proxy::new(format!("{}:{}", ip, port)))
    }

    /// Parse proxies from a newline-delimited list
    ///
    /// Line-by-line parsing is tried first; if no line parses, the content is
    /// scanned for embedded IP:PORT pairs instead.
    pub fn parse_list(content: &str) -> Vec<Proxy> {
        let mut proxies: Vec<Proxy> = content.lines().filter_map(Self::parse_line).collect();

        if proxies.is_empty() {
            proxies = Self::extract_with_regex(content);
        }

        proxies.sort();
        proxies.dedup();
        proxies
    }

    /// Extract IPv4 IP:PORT pairs using regex pattern matching
    pub fn extract_with_regex(content: &str) -> Vec<Proxy> {
        IP_PORT_REGEX
            .captures_iter(content)
            .filter_map(|cap| {
                let host = cap.get(1)?.as_str();
                let port: u16 = cap.get(2)?.as_str().parse().ok()?;

                for part in host.split('.') {
                    let num: u32 = part.parse().ok()?;
                    if num > 255 {
                        return None;
                    }
                }

                if port == 0 {
                    return None;
                }

                Some(Proxy::new(format!("{}:{}", host, port)))
            })
            .collect()
    }

    /// Parse proxies from a list file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<Proxy>> {
        let content = fs::read_to_string(path)?;
        Ok(content.lines().filter_map(Self::parse_line).collect())
    }
}

/// Bitmask to protocol table used by sources that report capabilities as flags.
///
/// The bit meanings differ per source, so the table is configuration rather
/// than code. Several bits may map to the same protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, Protocol>",
    into = "BTreeMap<String, Protocol>"
)]
pub struct ProtocolBits(BTreeMap<u64, Protocol>);

// JSON object keys are strings, so the table travels with string keys
impl TryFrom<BTreeMap<String, Protocol>> for ProtocolBits {
    type Error = String;

    fn try_from(table: BTreeMap<String, Protocol>) -> std::result::Result<Self, Self::Error> {
        table
            .into_iter()
            .map(|(bit, protocol)| {
                bit.trim()
                    .parse::<u64>()
                    .map(|bit| (bit, protocol))
                    .map_err(|_| format!("invalid protocol bit: {:?}", bit))
            })
            .collect::<std::result::Result<_, _>>()
            .map(Self)
    }
}

impl From<ProtocolBits> for BTreeMap<String, Protocol> {
    fn from(bits: ProtocolBits) -> Self {
        bits.0
            .into_iter()
            .map(|(bit, protocol)| (bit.to_string(), protocol))
            .collect()
    }
}

impl Default for ProtocolBits {
    fn default() -> Self {
        Self(BTreeMap::from([
            (1, Protocol::Http),
            // https has no tier of its own
            (2, Protocol::Http),
            (4, Protocol::Socks4),
            (8, Protocol::Socks5),
        ]))
    }
}

impl ProtocolBits {
    pub fn new(table: BTreeMap<u64, Protocol>) -> Self {
        Self(table)
    }

    /// Protocols whose bit is set in `mask`, deduplicated and sorted
    pub fn decode(&self, mask: u64) -> Vec<Protocol> {
        let mut protocols: Vec<Protocol> = self
            .0
            .iter()
            .filter(|(bit, _)| mask & **bit != 0)
            .map(|(_, protocol)| *protocol)
            .collect();
        protocols.sort();
        protocols.dedup();
        protocols
    }
}

/// Decode the protocol field of a JSON record.
///
/// Accepts a label string, a bitmask number, or a list of either.
pub fn protocols_from_json(value: &Value, bits: &ProtocolBits) -> Vec<Protocol> {
    let mut protocols = match value {
        Value::String(label) => Protocol::from_label(label).into_iter().collect(),
        Value::Number(n) => n.as_u64().map(|mask| bits.decode(mask)).unwrap_or_default(),
        Value::Array(items) => items
            .iter()
            .flat_map(|item| protocols_from_json(item, bits))
            .collect(),
        _ => Vec::new(),
    };
    protocols.sort();
    protocols.dedup();
    protocols
}

/// Render a scalar JSON value (string or number) as text
pub fn json_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

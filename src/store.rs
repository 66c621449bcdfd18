//! Flat-file snapshot tiers
//!
//! ```text
//! <root>/<source>/<protocol>.txt   raw output of one source
//! <root>/clean/<protocol>.txt      deduplicated union of all sources
//! <root>/active/<protocol>.txt     subset of clean confirmed live
//! ```
//!
//! Every write replaces the whole tier: all three protocol files are
//! rewritten, empty ones included, so nothing from an earlier run survives.

use crate::proxy::models::{Protocol, ProxySet};
use crate::proxy::parser::ProxyParser;
use crate::Result;
use anyhow::{bail, Context};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

fn snapshot_file_name(protocol: Protocol) -> String {
    format!("{}.txt", protocol)
}

/// Directory name of the deduplicated tier
pub const CLEAN_DIR: &str = "clean";
/// Directory name of the live tier
pub const ACTIVE_DIR: &str = "active";

/// Snapshot tier selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier<'a> {
    Source(&'a str),
    Clean,
    Active,
}

impl Tier<'_> {
    fn dir_name(&self) -> &str {
        match self {
            Tier::Source(name) => name,
            Tier::Clean => CLEAN_DIR,
            Tier::Active => ACTIVE_DIR,
        }
    }
}

/// Snapshot store rooted at one directory
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tier_dir(&self, tier: Tier<'_>) -> PathBuf {
        self.root.join(tier.dir_name())
    }

    pub fn tier_file(&self, tier: Tier<'_>, protocol: Protocol) -> PathBuf {
        self.tier_dir(tier).join(snapshot_file_name(protocol))
    }

    /// Replace a tier with the given set
    pub fn write(&self, tier: Tier<'_>, proxies: &ProxySet) -> Result<()> {
        if let Tier::Source(name) = tier {
            validate_source_name(name)?;
        }

        let dir = self.tier_dir(tier);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        for protocol in Protocol::ALL {
            let path = self.tier_file(tier, protocol);
            let mut content = String::new();
            for proxy in proxies.proxies(protocol) {
                content.push_str(proxy.as_str());
                content.push('\n');
            }
            fs::write(&path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        debug!("Wrote {} entries to {}", proxies.len(), dir.display());
        Ok(())
    }

    /// Read a tier back; missing files read as empty
    pub fn read(&self, tier: Tier<'_>) -> Result<ProxySet> {
        let mut set = ProxySet::new();
        for protocol in Protocol::ALL {
            let path = self.tier_file(tier, protocol);
            if !path.exists() {
                continue;
            }
            let proxies = ProxyParser::parse_file(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            for proxy in proxies {
                set.insert(protocol, proxy);
            }
        }
        Ok(set)
    }

    /// Remove raw source snapshots that are not in `keep`.
    ///
    /// Only directories holding nothing but protocol snapshot files are
    /// touched; anything else under the root is left alone.
    pub fn prune_sources(&self, keep: &[&str]) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }

        for dir_entry in fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list {}", self.root.display()))?
        {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if name == CLEAN_DIR || name == ACTIVE_DIR || keep.contains(&name.as_str()) {
                continue;
            }

            let dir = dir_entry.path();
            if !is_snapshot_dir(&dir)? {
                debug!("Leaving {} in place, not a snapshot directory", dir.display());
                continue;
            }

            info!("Removing stale source snapshot {}", name);
            for protocol in Protocol::ALL {
                let path = dir.join(snapshot_file_name(protocol));
                if path.exists() {
                    fs::remove_file(&path)
                        .with_context(|| format!("Failed to remove {}", path.display()))?;
                }
            }
            fs::remove_dir(&dir).with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        Ok(())
    }
}

/// True when `dir` holds at least one protocol snapshot file and nothing else
fn is_snapshot_dir(dir: &Path) -> Result<bool> {
    let known: Vec<String> = Protocol::ALL.into_iter().map(snapshot_file_name).collect();
    let mut found = false;

    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entry.file_type()?.is_file() || !known.contains(&name) {
            return Ok(false);
        }
        found = true;
    }

    Ok(found)
}

fn validate_source_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == CLEAN_DIR
        || name == ACTIVE_DIR
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
    {
        bail!("Invalid source name for a snapshot directory: {:?}", name);
    }
    Ok(())
}

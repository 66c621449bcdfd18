//! Proxy Harvest - public proxy list aggregator and checker
//!
//! Fetches proxy endpoints from configured sources, merges them into a
//! deduplicated per-protocol catalog, and checks which entries are live.

pub mod config;
pub mod logging;
pub mod pipeline;
pub mod proxy;
pub mod store;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use pipeline::{Pipeline, RunSummary};
pub use proxy::*;
pub use store::{SnapshotStore, Tier};

/// Application result type
pub type Result<T> = anyhow::Result<T>;

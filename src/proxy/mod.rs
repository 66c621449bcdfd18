//! Proxy module for acquiring and validating proxies
//!
//! This module provides functionality for:
//! - Fetching proxy entries from static lists and paginated sources
//! - Crawling paginated sources sequentially or with a rotating worker pool
//! - Merging per-source results into a deduplicated catalog
//! - Checking catalog entries for liveness with bounded concurrency

pub mod checker;
pub mod crawler;
pub mod dedup;
pub mod error;
pub mod http;
pub mod models;
pub mod parser;
pub mod source;

pub use checker::{CheckerConfig, LivenessChecker};
pub use crawler::{CrawlPlan, CrawlResult, CrawlStats, PaginatedCrawler, StopReason};
pub use dedup::merge;
pub use error::PageError;
pub use models::{
    ActiveSet, Catalog, CatalogEntry, Protocol, Proxy, ProxyCheckResult, ProxyCheckStatus,
    ProxySet, SourceResult,
};
pub use parser::{ProtocolBits, ProxyParser};
pub use source::{FetchOptions, Page, PageSource, SourceAdapter};

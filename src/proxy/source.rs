//! Source adapters
//!
//! A source yields categorized proxy entries. Three kinds exist:
//! - static lists, one request per protocol URL
//! - paginated sources crawled sequentially
//! - paginated sources crawled by a worker pool over a shared cursor,
//!   optionally routing requests through previously validated proxies
//!
//! Paginated sources only need to implement [`PageSource`]; the crawler
//! owns retries, stop conditions and concurrency.

use crate::config::{JsonMapping, ListUrl, PaginationConfig, SourceConfig, TableLayout};
use crate::proxy::crawler::{CrawlPlan, CrawlResult, PaginatedCrawler};
use crate::proxy::error::PageError;
use crate::proxy::http::{random_user_agent, ClientPool};
use crate::proxy::models::{CatalogEntry, Protocol, Proxy, SourceResult};
use crate::proxy::parser::{json_scalar, protocols_from_json, ProxyParser};
use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use reqwest::Client;
use scraper::{Html, Selector};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One fetched and parsed page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    /// Rows or records present on the page, parsable or not
    pub rows: usize,
    pub entries: Vec<CatalogEntry>,
    /// The page says there are no further results
    pub end_of_results: bool,
}

impl Page {
    pub fn with_entries(entries: Vec<CatalogEntry>) -> Self {
        Self {
            rows: entries.len(),
            entries,
            end_of_results: false,
        }
    }

    /// Empty page carrying an explicit end-of-results marker
    pub fn end() -> Self {
        Self {
            end_of_results: true,
            ..Default::default()
        }
    }

    /// Empty page with no end marker; could be a block page
    pub fn empty() -> Self {
        Self::default()
    }

    /// No rows at all. Rows whose protocol is not recognized still count as
    /// content, so such a page neither ends a crawl nor feeds the breaker.
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }
}

/// Capability to fetch one page of a paginated source
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, client: &Client, cursor: u64) -> Result<Page, PageError>;
}

/// Paginated JSON API
pub struct JsonApiPages {
    url: String,
    params: Vec<(String, String)>,
    cursor_param: String,
    mapping: JsonMapping,
    end_marker: Option<String>,
}

impl JsonApiPages {
    pub fn new(
        url: &str,
        params: &BTreeMap<String, Value>,
        pagination: &PaginationConfig,
        mapping: JsonMapping,
    ) -> Self {
        Self {
            url: url.to_string(),
            params: query_pairs(params),
            cursor_param: pagination.param.clone(),
            mapping,
            end_marker: pagination.end_marker.clone(),
        }
    }
}

#[async_trait]
impl PageSource for JsonApiPages {
    async fn fetch_page(&self, client: &Client, cursor: u64) -> Result<Page, PageError> {
        let body = get_page_body(client, &self.url, &self.params, &self.cursor_param, cursor).await?;
        parse_json_page(&body, &self.mapping, self.end_marker.as_deref())
    }
}

/// Paginated HTML table
pub struct HtmlTablePages {
    url: String,
    params: Vec<(String, String)>,
    cursor_param: String,
    layout: TableLayout,
    end_marker: Option<String>,
}

impl HtmlTablePages {
    pub fn new(
        url: &str,
        params: &BTreeMap<String, Value>,
        pagination: &PaginationConfig,
        layout: TableLayout,
    ) -> Self {
        Self {
            url: url.to_string(),
            params: query_pairs(params),
            cursor_param: pagination.param.clone(),
            layout,
            end_marker: pagination.end_marker.clone(),
        }
    }
}

#[async_trait]
impl PageSource for HtmlTablePages {
    async fn fetch_page(&self, client: &Client, cursor: u64) -> Result<Page, PageError> {
        let body = get_page_body(client, &self.url, &self.params, &self.cursor_param, cursor).await?;
        parse_html_page(&body, &self.layout, self.end_marker.as_deref())
    }
}

fn query_pairs(params: &BTreeMap<String, Value>) -> Vec<(String, String)> {
    params
        .iter()
        .filter_map(|(key, value)| json_scalar(value).map(|v| (key.clone(), v)))
        .collect()
}

async fn get_page_body(
    client: &Client,
    url: &str,
    params: &[(String, String)],
    cursor_param: &str,
    cursor: u64,
) -> Result<String, PageError> {
    let response = client
        .get(url)
        .header(USER_AGENT, random_user_agent())
        .query(params)
        .query(&[(cursor_param, cursor.to_string())])
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(PageError::Status(status.as_u16()));
    }

    Ok(response.text().await?)
}

static NULL: Value = Value::Null;

fn marks_end(body: &str, end_marker: Option<&str>) -> bool {
    end_marker.is_some_and(|marker| body.contains(marker))
}

/// Parse a JSON API page using the configured field mapping
pub fn parse_json_page(
    body: &str,
    mapping: &JsonMapping,
    end_marker: Option<&str>,
) -> Result<Page, PageError> {
    let data: Value =
        serde_json::from_str(body).map_err(|e| PageError::Decode(e.to_string()))?;

    let mut items = &data;
    if let Some(list_key) = &mapping.list_key {
        for key in list_key.split('.') {
            items = items.get(key).unwrap_or(&NULL);
        }
    }

    let records = match items {
        Value::Array(records) => records.as_slice(),
        Value::Null => &[][..],
        other => {
            return Err(PageError::Decode(format!(
                "expected a list of records, found {}",
                json_kind(other)
            )))
        }
    };

    let mut entries = Vec::new();
    for record in records {
        let (Some(ip), Some(port)) = (
            record.get(&mapping.ip).and_then(json_scalar),
            record.get(&mapping.port).and_then(json_scalar),
        ) else {
            continue;
        };
        let Some(proxy) = ProxyParser::join_address(&ip, &port) else {
            continue;
        };

        let protocols = record
            .get(&mapping.protocols)
            .map(|value| protocols_from_json(value, &mapping.protocol_bits))
            .unwrap_or_default();
        for protocol in protocols {
            entries.push(CatalogEntry::new(proxy.clone(), protocol));
        }
    }

    let rows = records.len();
    Ok(Page {
        rows,
        end_of_results: rows == 0 && marks_end(body, end_marker),
        entries,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Parse an HTML table page using the configured column layout
pub fn parse_html_page(
    body: &str,
    layout: &TableLayout,
    end_marker: Option<&str>,
) -> Result<Page, PageError> {
    let row_selector = Selector::parse(&layout.row_selector)
        .map_err(|e| PageError::Decode(format!("invalid row selector: {}", e)))?;
    let cell_selector =
        Selector::parse("td").map_err(|e| PageError::Decode(format!("invalid cell selector: {}", e)))?;

    let document = Html::parse_document(body);
    let mut rows = 0;
    let mut entries = Vec::new();

    for row in document.select(&row_selector) {
        let cells: Vec<String> = row
            .select(&cell_selector)
            .map(|cell| cell.text().collect::<String>().trim().to_string())
            .collect();
        if cells.is_empty() {
            continue;
        }
        rows += 1;

        let Some(address) = cells.get(layout.address_column) else {
            continue;
        };
        let proxy = match layout.port_column {
            Some(port_column) => cells
                .get(port_column)
                .and_then(|port| ProxyParser::join_address(address, port)),
            None => ProxyParser::parse_line(address),
        };
        let protocol = cells
            .get(layout.protocol_column)
            .and_then(|label| Protocol::from_label(label));

        if let (Some(proxy), Some(protocol)) = (proxy, protocol) {
            entries.push(CatalogEntry::new(proxy, protocol));
        }
    }

    Ok(Page {
        rows,
        end_of_results: rows == 0 && marks_end(body, end_marker),
        entries,
    })
}

/// Inputs shared by every source in a run
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub request_timeout: Duration,
    /// Previously validated HTTP proxies for rotating sources
    pub rotation_pool: Vec<Proxy>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            rotation_pool: Vec::new(),
        }
    }
}

/// A configured source, ready to fetch
pub enum SourceAdapter {
    StaticList {
        name: String,
        urls: Vec<ListUrl>,
    },
    Paginated {
        name: String,
        pages: Arc<dyn PageSource>,
        plan: CrawlPlan,
    },
    RotatingPaginated {
        name: String,
        pages: Arc<dyn PageSource>,
        plan: CrawlPlan,
        rotate: bool,
    },
}

impl SourceAdapter {
    /// Build the adapter for a source configuration
    pub fn from_config(config: &SourceConfig) -> Self {
        let (name, pages, pagination): (_, Arc<dyn PageSource>, _) = match config {
            SourceConfig::TextList { name, urls } => {
                return SourceAdapter::StaticList {
                    name: name.clone(),
                    urls: urls.clone(),
                }
            }
            SourceConfig::JsonApi {
                name,
                url,
                params,
                pagination,
                mapping,
            } => (
                name,
                Arc::new(JsonApiPages::new(url, params, pagination, mapping.clone())),
                pagination,
            ),
            SourceConfig::HtmlTable {
                name,
                url,
                params,
                pagination,
                table,
            } => (
                name,
                Arc::new(HtmlTablePages::new(url, params, pagination, table.clone())),
                pagination,
            ),
        };

        let plan = CrawlPlan::from(pagination);
        if pagination.is_concurrent() {
            SourceAdapter::RotatingPaginated {
                name: name.clone(),
                pages,
                plan,
                rotate: pagination.rotate,
            }
        } else {
            SourceAdapter::Paginated {
                name: name.clone(),
                pages,
                plan,
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SourceAdapter::StaticList { name, .. }
            | SourceAdapter::Paginated { name, .. }
            | SourceAdapter::RotatingPaginated { name, .. } => name,
        }
    }

    /// Fetch every entry this source yields.
    ///
    /// Never fails as a whole: errors are carried in the result next to
    /// whatever was collected before they happened.
    pub async fn fetch(&self, options: &FetchOptions) -> CrawlResult {
        let name = self.name().to_string();
        info!("Fetching from {}", name);

        match self {
            SourceAdapter::StaticList { urls, .. } => {
                match ClientPool::direct(options.request_timeout) {
                    Ok(clients) => fetch_static_lists(name, urls, &clients).await,
                    Err(e) => CrawlResult::failure(name, e.to_string()),
                }
            }
            SourceAdapter::Paginated { pages, plan, .. } => {
                match ClientPool::direct(options.request_timeout) {
                    Ok(clients) => {
                        let outcome = PaginatedCrawler::new(plan.clone())
                            .crawl_sequential(&**pages, &clients)
                            .await;
                        CrawlResult::from_outcome(name, outcome)
                    }
                    Err(e) => CrawlResult::failure(name, e.to_string()),
                }
            }
            SourceAdapter::RotatingPaginated {
                pages,
                plan,
                rotate,
                ..
            } => {
                let clients = if *rotate && !options.rotation_pool.is_empty() {
                    ClientPool::rotating(options.request_timeout, &options.rotation_pool)
                } else {
                    ClientPool::direct(options.request_timeout)
                };
                match clients {
                    Ok(clients) => {
                        let outcome = PaginatedCrawler::new(plan.clone())
                            .crawl_concurrent(Arc::clone(pages), Arc::new(clients))
                            .await;
                        CrawlResult::from_outcome(name, outcome)
                    }
                    Err(e) => CrawlResult::failure(name, e.to_string()),
                }
            }
        }
    }
}

async fn fetch_static_lists(name: String, urls: &[ListUrl], clients: &ClientPool) -> CrawlResult {
    let mut proxies = SourceResult::new();
    let (_, client) = clients.pick();

    for list in urls {
        let response = client
            .get(&list.url)
            .header(USER_AGENT, random_user_agent())
            .send()
            .await;

        let body = match response {
            Ok(response) if response.status().is_success() => response.text().await,
            Ok(response) => {
                warn!("Error fetching {}: HTTP status {}", list.url, response.status());
                continue;
            }
            Err(e) => Err(e),
        };

        match body {
            Ok(body) => {
                let parsed = ProxyParser::parse_list(&body);
                debug!("Fetched {} {} proxies from {}", parsed.len(), list.protocol, list.url);
                for proxy in parsed {
                    proxies.insert(list.protocol, proxy);
                }
            }
            Err(e) => warn!("Error fetching {}: {}", list.url, e),
        }
    }

    CrawlResult::success(name, proxies)
}

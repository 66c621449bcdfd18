//! Paginated crawler
//!
//! Drives a [`PageSource`] across a cursor space (offset or page number).
//!
//! The sequential crawl walks cursors one at a time and stops on the first
//! empty page, a decode failure, a cursor that keeps failing, or the
//! configured cursor limit.
//!
//! The concurrent crawl runs a pool of worker tasks over one shared cursor.
//! Each worker drains the retry queue before claiming a fresh cursor. Empty
//! pages without an end marker, and cursors dropped after their last attempt,
//! feed a circuit breaker; once it trips, or a page marks the end of results,
//! no further cursor is claimed while requests already in flight still
//! complete and merge.

use crate::config::PaginationConfig;
use crate::proxy::error::PageError;
use crate::proxy::http::ClientPool;
use crate::proxy::models::SourceResult;
use crate::proxy::source::{Page, PageSource};
use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts allowed per cursor before it is dropped
pub const MAX_ATTEMPTS: u32 = 3;

/// Pause before an idle worker looks for work again
const IDLE_WAIT: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cursor space and stop conditions of one crawl
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlPlan {
    pub start: u64,
    pub step: u64,
    /// Inclusive upper bound on the cursor value
    pub limit: Option<u64>,
    pub breaker_threshold: usize,
    pub workers: usize,
}

impl Default for CrawlPlan {
    fn default() -> Self {
        Self {
            start: 0,
            step: 1,
            limit: None,
            breaker_threshold: crate::config::DEFAULT_BREAKER_THRESHOLD,
            workers: 1,
        }
    }
}

impl From<&PaginationConfig> for CrawlPlan {
    fn from(pagination: &PaginationConfig) -> Self {
        Self {
            start: pagination.start,
            step: pagination.step.max(1),
            limit: pagination.limit,
            breaker_threshold: pagination.breaker_threshold(),
            workers: pagination.workers(),
        }
    }
}

impl CrawlPlan {
    pub fn new(start: u64, step: u64) -> Self {
        Self {
            start,
            step: step.max(1),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_breaker_threshold(mut self, threshold: usize) -> Self {
        self.breaker_threshold = threshold.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    fn within_limit(&self, cursor: u64) -> bool {
        self.limit.map_or(true, |limit| cursor <= limit)
    }
}

/// A cursor waiting for another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryItem {
    pub cursor: u64,
    /// Attempts already made
    pub attempts: u32,
}

impl RetryItem {
    fn fresh(cursor: u64) -> Self {
        Self {
            cursor,
            attempts: 0,
        }
    }

    fn next_attempt(self) -> Self {
        Self {
            cursor: self.cursor,
            attempts: self.attempts + 1,
        }
    }
}

/// Bounded FIFO of cursors to retry
#[derive(Debug)]
pub struct RetryQueue {
    items: VecDeque<RetryItem>,
    capacity: usize,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue at the back; returns false and drops the item when full
    pub fn push(&mut self, item: RetryItem) -> bool {
        if self.items.len() >= self.capacity {
            return false;
        }
        self.items.push_back(item);
        true
    }

    /// Oldest item first
    pub fn pop(&mut self) -> Option<RetryItem> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Why a crawl stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// No cursor left to claim
    #[default]
    Exhausted,
    /// A page said there are no further results
    EndOfResults,
    /// Too many consecutive empty or undecodable pages
    CircuitBreaker,
    /// The next cursor lies past the configured limit
    PageLimit,
    /// A cursor failed on every attempt
    RetriesExhausted,
    /// A page could not be decoded
    Fatal,
}

/// Counters describing one crawl
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlStats {
    /// Pages that yielded at least one row
    pub pages_fetched: usize,
    pub empty_pages: usize,
    pub failed_requests: usize,
    /// Cursors given up on after running out of attempts or queue space
    pub dropped_cursors: usize,
    pub stop_reason: StopReason,
}

/// Entries and bookkeeping of one crawl
#[derive(Debug, Clone, Default)]
pub struct CrawlOutcome {
    pub proxies: SourceResult,
    pub stats: CrawlStats,
    pub error: Option<String>,
}

/// Result of fetching a single source
#[derive(Debug, Clone)]
pub struct CrawlResult {
    /// The source that was fetched
    pub source: String,
    /// Entries collected, including those gathered before a failure
    pub proxies: SourceResult,
    pub stats: CrawlStats,
    /// Error message if the source failed
    pub error: Option<String>,
}

impl CrawlResult {
    /// Create a successful crawl result
    pub fn success(source: String, proxies: SourceResult) -> Self {
        Self {
            source,
            proxies,
            stats: CrawlStats::default(),
            error: None,
        }
    }

    /// Create a failed crawl result with nothing collected
    pub fn failure(source: String, error: String) -> Self {
        Self {
            source,
            proxies: SourceResult::new(),
            stats: CrawlStats {
                stop_reason: StopReason::Fatal,
                ..Default::default()
            },
            error: Some(error),
        }
    }

    pub fn from_outcome(source: String, outcome: CrawlOutcome) -> Self {
        Self {
            source,
            proxies: outcome.proxies,
            stats: outcome.stats,
            error: outcome.error,
        }
    }

    /// Check if the crawl was successful
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// State shared by the workers of one concurrent crawl.
///
/// Each field has its own guard and no code path holds two at once.
struct CrawlState {
    next_cursor: Mutex<u64>,
    retry_queue: Mutex<RetryQueue>,
    consecutive_failures: AtomicUsize,
    stop: AtomicBool,
    stop_reason: Mutex<StopReason>,
    in_flight: AtomicUsize,
    results: Mutex<SourceResult>,
    pages_fetched: AtomicUsize,
    empty_pages: AtomicUsize,
    failed_requests: AtomicUsize,
    dropped_cursors: AtomicUsize,
}

enum Claim {
    Work(RetryItem),
    /// Nothing to claim now, but a peer may still requeue
    Wait,
    Done,
}

impl CrawlState {
    fn new(plan: &CrawlPlan) -> Self {
        Self {
            next_cursor: Mutex::new(plan.start),
            retry_queue: Mutex::new(RetryQueue::new(plan.workers * MAX_ATTEMPTS as usize)),
            consecutive_failures: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            stop_reason: Mutex::new(StopReason::Exhausted),
            in_flight: AtomicUsize::new(0),
            results: Mutex::new(SourceResult::new()),
            pages_fetched: AtomicUsize::new(0),
            empty_pages: AtomicUsize::new(0),
            failed_requests: AtomicUsize::new(0),
            dropped_cursors: AtomicUsize::new(0),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Raise the stop flag; only the first caller records its reason
    fn signal_stop(&self, reason: StopReason) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            *lock(&self.stop_reason) = reason;
        }
    }

    fn claim(&self, plan: &CrawlPlan) -> Claim {
        loop {
            if self.is_stopped() {
                return Claim::Done;
            }
            let popped = lock(&self.retry_queue).pop();
            match popped {
                Some(item) if item.attempts >= MAX_ATTEMPTS => {
                    debug!("Dropping cursor {} after {} attempts", item.cursor, item.attempts);
                    self.drop_cursor(plan.breaker_threshold);
                }
                Some(item) => {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    return Claim::Work(item);
                }
                None => break,
            }
        }

        let fresh = {
            let mut next = lock(&self.next_cursor);
            // A peer may have tripped the breaker since the check above
            if self.is_stopped() {
                return Claim::Done;
            }
            if plan.within_limit(*next) {
                let cursor = *next;
                *next += plan.step;
                Some(cursor)
            } else {
                None
            }
        };
        if let Some(cursor) = fresh {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            return Claim::Work(RetryItem::fresh(cursor));
        }

        if self.in_flight.load(Ordering::SeqCst) > 0 {
            Claim::Wait
        } else {
            Claim::Done
        }
    }

    fn requeue(&self, item: RetryItem, threshold: usize) {
        let pushed = lock(&self.retry_queue).push(item.next_attempt());
        if !pushed {
            warn!("Retry queue full, dropping cursor {}", item.cursor);
            self.drop_cursor(threshold);
        }
    }

    /// A cursor given up on counts once toward the breaker, not per attempt
    fn drop_cursor(&self, threshold: usize) {
        self.dropped_cursors.fetch_add(1, Ordering::SeqCst);
        self.count_failure(threshold);
    }

    fn count_failure(&self, threshold: usize) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= threshold {
            if !self.is_stopped() {
                info!("Circuit breaker tripped after {} consecutive failures", failures);
            }
            self.signal_stop(StopReason::CircuitBreaker);
        }
    }

    fn record(&self, item: RetryItem, outcome: Result<Page, PageError>, plan: &CrawlPlan) {
        match outcome {
            Ok(page) if !page.is_empty() => {
                debug!(
                    "Cursor {} yielded {} entries from {} rows",
                    item.cursor,
                    page.entries.len(),
                    page.rows
                );
                self.pages_fetched.fetch_add(1, Ordering::SeqCst);
                {
                    let mut results = lock(&self.results);
                    for entry in page.entries {
                        results.insert_entry(entry);
                    }
                }
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            Ok(page) if page.end_of_results => {
                debug!("Cursor {} marks the end of results", item.cursor);
                self.signal_stop(StopReason::EndOfResults);
            }
            Ok(_) => {
                debug!("Cursor {} returned an empty page", item.cursor);
                self.empty_pages.fetch_add(1, Ordering::SeqCst);
                self.requeue(item, plan.breaker_threshold);
                self.count_failure(plan.breaker_threshold);
            }
            Err(PageError::Decode(e)) => {
                // A block page in place of the expected body
                debug!("Cursor {} could not be decoded: {}", item.cursor, e);
                self.empty_pages.fetch_add(1, Ordering::SeqCst);
                self.requeue(item, plan.breaker_threshold);
                self.count_failure(plan.breaker_threshold);
            }
            Err(e) => {
                debug!("Cursor {} failed: {}", item.cursor, e);
                self.failed_requests.fetch_add(1, Ordering::SeqCst);
                self.requeue(item, plan.breaker_threshold);
            }
        }
    }

    /// Collect the results once every worker has finished
    fn take_outcome(&self) -> CrawlOutcome {
        CrawlOutcome {
            proxies: std::mem::take(&mut *lock(&self.results)),
            stats: CrawlStats {
                pages_fetched: self.pages_fetched.load(Ordering::SeqCst),
                empty_pages: self.empty_pages.load(Ordering::SeqCst),
                failed_requests: self.failed_requests.load(Ordering::SeqCst),
                dropped_cursors: self.dropped_cursors.load(Ordering::SeqCst),
                stop_reason: *lock(&self.stop_reason),
            },
            error: None,
        }
    }
}

/// Releases one in-flight slot when dropped, even if the fetch panicked
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Crawler for one paginated source
pub struct PaginatedCrawler {
    plan: CrawlPlan,
}

impl PaginatedCrawler {
    pub fn new(plan: CrawlPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &CrawlPlan {
        &self.plan
    }

    /// Walk the cursor space one page at a time
    pub async fn crawl_sequential(&self, pages: &dyn PageSource, clients: &ClientPool) -> CrawlOutcome {
        let mut outcome = CrawlOutcome::default();
        let mut cursor = self.plan.start;

        outcome.stats.stop_reason = loop {
            if !self.plan.within_limit(cursor) {
                break StopReason::PageLimit;
            }

            let mut attempts = 0;
            let fetched = loop {
                attempts += 1;
                let (_, client) = clients.pick();
                match pages.fetch_page(client, cursor).await {
                    Err(e) if e.is_transient() && attempts < MAX_ATTEMPTS => {
                        debug!("Cursor {} attempt {} failed: {}", cursor, attempts, e);
                        outcome.stats.failed_requests += 1;
                    }
                    other => break other,
                }
            };

            match fetched {
                Ok(page) if page.is_empty() => {
                    outcome.stats.empty_pages += 1;
                    break if page.end_of_results {
                        StopReason::EndOfResults
                    } else {
                        StopReason::Exhausted
                    };
                }
                Ok(page) => {
                    info!("Cursor {} done. Found {} rows", cursor, page.rows);
                    outcome.stats.pages_fetched += 1;
                    for entry in page.entries {
                        outcome.proxies.insert_entry(entry);
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!("Giving up on cursor {} after {} attempts: {}", cursor, attempts, e);
                    outcome.stats.failed_requests += 1;
                    outcome.stats.dropped_cursors += 1;
                    break StopReason::RetriesExhausted;
                }
                Err(e) => {
                    warn!("Stopping at cursor {}: {}", cursor, e);
                    outcome.error = Some(e.to_string());
                    break StopReason::Fatal;
                }
            }

            cursor += self.plan.step;
        };

        outcome
    }

    /// Crawl with a pool of worker tasks racing over a shared cursor
    pub async fn crawl_concurrent(
        &self,
        pages: Arc<dyn PageSource>,
        clients: Arc<ClientPool>,
    ) -> CrawlOutcome {
        let state = Arc::new(CrawlState::new(&self.plan));
        info!(
            "Starting {} workers from cursor {} (step {}){}",
            self.plan.workers,
            self.plan.start,
            self.plan.step,
            if clients.is_rotating() {
                format!(" through {} rotating proxies", clients.len())
            } else {
                String::new()
            }
        );

        let handles: Vec<_> = (0..self.plan.workers)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    self.plan.clone(),
                    Arc::clone(&state),
                    Arc::clone(&pages),
                    Arc::clone(&clients),
                ))
            })
            .collect();

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                warn!("Crawl worker failed: {}", e);
            }
        }

        let outcome = state.take_outcome();
        info!(
            "Crawl finished: {} pages, {} entries, stopped by {:?}",
            outcome.stats.pages_fetched,
            outcome.proxies.len(),
            outcome.stats.stop_reason
        );
        outcome
    }
}

async fn run_worker(
    worker: usize,
    plan: CrawlPlan,
    state: Arc<CrawlState>,
    pages: Arc<dyn PageSource>,
    clients: Arc<ClientPool>,
) {
    loop {
        let item = match state.claim(&plan) {
            Claim::Work(item) => item,
            Claim::Wait => {
                tokio::time::sleep(IDLE_WAIT).await;
                continue;
            }
            Claim::Done => break,
        };
        let _slot = InFlight(&state.in_flight);

        let (via, client) = clients.pick();
        if let Some(proxy) = via {
            debug!("Worker {} fetching cursor {} via {}", worker, item.cursor, proxy);
        }

        let fetched = pages.fetch_page(client, item.cursor).await;
        state.record(item, fetched, &plan);
    }
}

//! The paginated query controller.
//!
//! [`QueryController`] ties the pieces together: it normalizes incoming
//! parameters into a [`QueryKey`], consults the [`CacheStore`], runs
//! deduplicated, cancellable fetches through the [`FetchExecutor`], warms
//! the next page after a success, and projects everything into a
//! [`PageView`] for the UI.
//!
//! Every list screen configures an instance with its service and config
//! instead of hand-rolling fetch/cache/cancel logic. The controller never
//! retries on its own; callers bind a visible "try again" action to
//! [`QueryController::refetch`].

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CacheEntry, CachePolicy, CacheStatsSnapshot, CacheStore, EntryState, ErrorInfo};
use crate::config::ControllerConfig;
use crate::debounce::FilterGate;
use crate::fetch::FetchExecutor;
use crate::inflight::{FetchSlot, InFlightRegistry};
use crate::key::{QueryKey, normalize};
use crate::params::{IdentityContext, QueryParameters};
use crate::remote::{Incident, IncidentService, PageResponse};
use crate::{Error, Result};

/// UI-facing projection of one query's state.
///
/// Derived on every call from cache plus in-flight state, never stored.
#[derive(Debug, Clone)]
pub struct PageView {
    /// Records for the current page.
    pub records: Vec<Incident>,
    /// Total matching rows across all pages.
    pub total_count: u64,
    /// 1-based page the view addresses.
    pub current_page: u32,
    /// Derived page count, `ceil(total_count / page_size)`.
    pub total_pages: u32,
    /// No data has ever arrived for this key (covers both a first fetch
    /// in flight and an unresolved identity).
    pub is_loading: bool,
    /// A request is in flight right now; data may already be shown.
    pub is_fetching: bool,
    /// The most recent fetch failed in a user-visible way.
    pub is_error: bool,
    /// Displayable failure detail when `is_error` is set.
    pub error: Option<ErrorInfo>,
}

impl PageView {
    fn awaiting_identity(params: &QueryParameters) -> Self {
        Self {
            records: Vec::new(),
            total_count: 0,
            current_page: params.page_index,
            total_pages: 0,
            is_loading: true,
            is_fetching: false,
            is_error: false,
            error: None,
        }
    }
}

fn total_pages(total_count: u64, page_size: u32) -> u32 {
    let pages = total_count.div_ceil(u64::from(page_size));
    u32::try_from(pages).unwrap_or(u32::MAX)
}

/// Paginated query cache and prefetch controller for one list screen.
///
/// Create one per consumer; teardown ([`QueryController::shutdown`] or
/// drop) cancels every outstanding request unconditionally.
pub struct QueryController<S> {
    cache: Arc<CacheStore>,
    inflight: Arc<InFlightRegistry>,
    executor: Arc<FetchExecutor<S>>,
    config: ControllerConfig,
    current_key: Mutex<Option<QueryKey>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl<S: IncidentService + 'static> QueryController<S> {
    /// Create a controller over the given service.
    ///
    /// Must be called from within a tokio runtime; the retention sweep is
    /// spawned here.
    #[must_use]
    pub fn new(service: Arc<S>, config: ControllerConfig) -> Self {
        let cache = Arc::new(CacheStore::new(config.cache_policy()));
        let executor = Arc::new(FetchExecutor::new(service, config.request_timeout()));

        let sweep = {
            let cache = Arc::clone(&cache);
            let interval = config.sweep_interval();
            // Create the interval here, not inside the task, so its
            // schedule is anchored at construction rather than at the
            // task's first poll.
            let mut ticker = tokio::time::interval(interval);
            tokio::spawn(async move {
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    cache.sweep_expired().await;
                }
            })
        };

        Self {
            cache,
            inflight: Arc::new(InFlightRegistry::new()),
            executor,
            config,
            current_key: Mutex::new(None),
            sweep: Mutex::new(Some(sweep)),
        }
    }

    /// Create a controller with default configuration.
    #[must_use]
    pub fn with_defaults(service: Arc<S>) -> Self {
        Self::new(service, ControllerConfig::default())
    }

    /// Resolve the current view for a set of parameters.
    ///
    /// Serving order: an unresolved identity yields a loading view without
    /// touching the network; a fresh cache entry is served with zero
    /// network calls; a stale or errored entry is served immediately while
    /// one background revalidation runs; a key with no data at all drives
    /// the fetch inline and waits for it.
    ///
    /// # Errors
    ///
    /// Only [`Error::InvalidParams`] — everything else (transport
    /// failures, cancellations) is folded into the returned view.
    pub async fn query(&self, params: &QueryParameters) -> Result<PageView> {
        params.validate()?;
        if params.identity.is_none() {
            debug!("identity unresolved, skipping fetch");
            return Ok(PageView::awaiting_identity(params));
        }
        let key = normalize(params)?;
        self.track_transition(&key);

        match self.cache.get(&key).await {
            Some(entry) if entry.has_data() && entry.state == EntryState::Fresh => {
                Ok(self.project(&key, Some(&entry)))
            },
            Some(entry) if entry.has_data() => {
                // Stale-while-revalidate: the caller sees the old page now,
                // one background fetch refreshes it. The registry, not the
                // entry state, says whether a fetch is already running.
                if !self.inflight.is_in_flight(&key) {
                    self.cache.note_revalidation();
                    self.spawn_fetch(key.clone(), true);
                }
                Ok(self.project(&key, Some(&entry)))
            },
            Some(entry) if entry.state == EntryState::Error => {
                // First fetch failed and nothing is displayable. The error
                // view is served as-is; hitting the network again is an
                // explicit refetch, not a side effect of re-rendering.
                Ok(self.project(&key, Some(&entry)))
            },
            _ => self.fetch_and_project(&key).await,
        }
    }

    /// Forced revalidation ignoring the freshness window.
    ///
    /// Still deduplicated: if a fetch for the same key is already in
    /// flight, this awaits it instead of issuing a second call.
    pub async fn refetch(&self, params: &QueryParameters) -> Result<PageView> {
        params.validate()?;
        if params.identity.is_none() {
            return Ok(PageView::awaiting_identity(params));
        }
        let key = normalize(params)?;
        self.track_transition(&key);
        self.fetch_and_project(&key).await
    }

    /// Manually warm the page after the one `params` addresses.
    ///
    /// A no-op unless the current page has data and a next page exists.
    pub async fn prefetch_next_page(&self, params: &QueryParameters) -> Result<()> {
        params.validate()?;
        let key = normalize(params)?;
        if let Some(entry) = self.cache.get(&key).await {
            if entry.has_data() {
                self.spawn_prefetch(&key, entry.total_count);
            }
        }
        Ok(())
    }

    /// Evict every cache entry and cancel every request scoped to
    /// `previous`. Called on role/scope switch; returns the number of
    /// entries dropped.
    pub async fn on_identity_changed(&self, previous: &IdentityContext) -> usize {
        info!(role = %previous.role, scope = previous.scope_id, "identity changed, dropping scoped state");
        self.inflight
            .cancel_matching(|key| key.identity() == previous);
        self.cache
            .invalidate(|key| key.identity() == previous)
            .await
    }

    /// Drop every cache entry, e.g. after a mutation that touches an
    /// unknown subset of pages.
    pub async fn invalidate_all(&self) -> usize {
        self.cache.invalidate(|_| true).await
    }

    /// A debounced input gate wired to this controller's quiet period.
    /// Values drained from the receiver are ready for a `query` call.
    #[must_use]
    pub fn filter_gate<T: Send + 'static>(&self) -> (FilterGate<T>, mpsc::UnboundedReceiver<T>) {
        FilterGate::new(self.config.debounce_window())
    }

    /// Cache behavior counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    /// Cache policy in effect.
    #[must_use]
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache.policy()
    }

    /// Tear down: cancel all outstanding requests and stop the retention
    /// sweep. Idempotent; also runs on drop. After this, no fetch can
    /// start and no late response can mutate state.
    pub fn shutdown(&self) {
        self.inflight.cancel_all();
        if let Ok(mut sweep) = self.sweep.lock() {
            if let Some(task) = sweep.take() {
                task.abort();
            }
        }
    }

    /// Whether this controller has been torn down.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inflight.is_shut_down()
    }

    /// Record the key transition and cancel the superseded key's fetch.
    /// Cancellation stays scoped to the old key; other keys' requests
    /// (prefetches included) are untouched.
    fn track_transition(&self, key: &QueryKey) {
        let Ok(mut current) = self.current_key.lock() else {
            return;
        };
        if let Some(previous) = current.replace(key.clone()) {
            if previous != *key {
                self.inflight.cancel_key(&previous);
            }
        }
    }

    /// Drive the fetch for `key` inline and project the resulting state.
    async fn fetch_and_project(&self, key: &QueryKey) -> Result<PageView> {
        match run_fetch(&self.cache, &self.inflight, &self.executor, key).await {
            Ok(Some(page)) => {
                if self.config.prefetch_enabled {
                    self.spawn_prefetch(key, page.total_count);
                }
            },
            // Joined a fetch someone else led; the cache now has its
            // outcome. Cancellations stay silent by contract.
            Ok(None) | Err(_) => {},
        }
        let entry = self.cache.get(key).await;
        Ok(self.project(key, entry.as_ref()))
    }

    /// Fetch `key` in the background; on success optionally chain a
    /// prefetch of the following page.
    fn spawn_fetch(&self, key: QueryKey, chain_prefetch: bool) {
        let cache = Arc::clone(&self.cache);
        let inflight = Arc::clone(&self.inflight);
        let executor = Arc::clone(&self.executor);
        let prefetch = chain_prefetch && self.config.prefetch_enabled;
        tokio::spawn(async move {
            match run_fetch(&cache, &inflight, &executor, &key).await {
                Ok(Some(page)) if prefetch => {
                    prefetch_following_page(&cache, &inflight, &executor, &key, page.total_count);
                },
                Ok(_) => {},
                Err(err) if err.is_user_visible() => {
                    debug!(key = %key, error = %err, "background fetch failed");
                },
                Err(_) => {},
            }
        });
    }

    /// Warm the page after `key` if one exists.
    fn spawn_prefetch(&self, key: &QueryKey, total_count: u64) {
        prefetch_following_page(&self.cache, &self.inflight, &self.executor, key, total_count);
    }

    /// Derive the view model from cache plus in-flight state.
    fn project(&self, key: &QueryKey, entry: Option<&CacheEntry>) -> PageView {
        let is_fetching = self.inflight.is_in_flight(key);
        match entry {
            None => PageView {
                records: Vec::new(),
                total_count: 0,
                current_page: key.page_index(),
                total_pages: 0,
                is_loading: true,
                is_fetching,
                is_error: false,
                error: None,
            },
            Some(entry) => {
                let is_error = entry.state == EntryState::Error && entry.error.is_some();
                PageView {
                    records: entry.records.clone(),
                    total_count: entry.total_count,
                    current_page: key.page_index(),
                    total_pages: total_pages(entry.total_count, key.page_size()),
                    is_loading: !entry.has_data(),
                    is_fetching,
                    is_error,
                    error: entry.error.clone(),
                }
            },
        }
    }
}

impl<S> Drop for QueryController<S> {
    fn drop(&mut self) {
        self.inflight.cancel_all();
        if let Ok(mut sweep) = self.sweep.lock() {
            if let Some(task) = sweep.take() {
                task.abort();
            }
        }
    }
}

/// Run one deduplicated fetch for `key` through the shared pipeline.
///
/// The first caller leads and drives the network call; concurrent callers
/// for the same key await the leader and read its outcome from the cache
/// (`Ok(None)`). Cache write and in-flight release happen back to back
/// with no await between them, so no caller can observe a settled request
/// whose result is missing.
async fn run_fetch<S: IncidentService>(
    cache: &CacheStore,
    inflight: &InFlightRegistry,
    executor: &FetchExecutor<S>,
    key: &QueryKey,
) -> Result<Option<PageResponse>> {
    let slot = inflight
        .begin(key)
        .ok_or_else(|| Error::Cancelled("controller torn down".to_string()))?;

    let guard = match slot {
        FetchSlot::Join(request) => {
            request.settled().await;
            return Ok(None);
        },
        FetchSlot::Lead(guard) => guard,
    };

    cache.mark_pending(key).await;
    let token = guard.token();
    let result = executor.execute(key, &token).await;

    match &result {
        Ok(page) if !token.is_cancelled() => {
            cache
                .complete(key, page.incidents.clone(), page.total_count)
                .await;
        },
        // Late success after cancellation: discard the result and roll the
        // entry back so the key is not left looking mid-fetch.
        Ok(_) => cache.abandon_pending(key).await,
        Err(err) if err.is_user_visible() => {
            cache.fail(key, err).await;
        },
        // Cancellation rolls the pending mark back the same way; an entry
        // with prior data becomes stale and revalidates on its next read.
        Err(_) => cache.abandon_pending(key).await,
    }
    guard.finish();

    match result {
        Ok(page) if !token.is_cancelled() => Ok(Some(page)),
        Ok(_) => Err(Error::Cancelled(format!("fetch for {key} superseded"))),
        Err(err) => Err(err),
    }
}

/// Spawn a silent cache-warming fetch for the page after `key`, when the
/// total says one exists. Never chains further prefetches.
fn prefetch_following_page<S: IncidentService + 'static>(
    cache: &Arc<CacheStore>,
    inflight: &Arc<InFlightRegistry>,
    executor: &Arc<FetchExecutor<S>>,
    key: &QueryKey,
    total_count: u64,
) {
    let next = key.next_page();
    if next.page_index() > total_pages(total_count, key.page_size()) {
        return;
    }
    debug!(key = %next, "prefetching next page");
    let cache = Arc::clone(cache);
    let inflight = Arc::clone(inflight);
    let executor = Arc::clone(executor);
    tokio::spawn(async move {
        // Results land in the cache for later instant use; failures and
        // cancellations are simply dropped.
        let _ = run_fetch(&cache, &inflight, &executor, &next).await;
    });
}

//! End-to-end controller behavior against a scripted service.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use incq_core::{
    ControllerConfig, Error, Filters, IdentityContext, Incident, IncidentService, PageRequest,
    PageResponse, QueryController, QueryParameters, Result,
};
use tokio::sync::watch;

/// Scripted incident service: records every call's offset, can hold
/// selected offsets until released, and can be flipped into failure mode.
struct TestService {
    total: u64,
    fail: AtomicBool,
    held_offsets: std::sync::Mutex<HashSet<u64>>,
    release: watch::Receiver<bool>,
    calls: std::sync::Mutex<Vec<u64>>,
}

impl TestService {
    fn new(total: u64) -> (Arc<Self>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Arc::new(Self {
                total,
                fail: AtomicBool::new(false),
                held_offsets: std::sync::Mutex::new(HashSet::new()),
                release: rx,
                calls: std::sync::Mutex::new(Vec::new()),
            }),
            tx,
        )
    }

    fn hold_offset(&self, offset: u64) {
        self.held_offsets.lock().unwrap().insert(offset);
    }

    fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl IncidentService for TestService {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResponse> {
        self.calls.lock().unwrap().push(request.page_offset);

        let held = self
            .held_offsets
            .lock()
            .unwrap()
            .contains(&request.page_offset);
        if held {
            let mut release = self.release.clone();
            while !*release.borrow() {
                if release.changed().await.is_err() {
                    break;
                }
            }
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Transport("incident service unavailable".to_string()));
        }

        let remaining = self.total.saturating_sub(request.page_offset);
        let rows = remaining.min(u64::from(request.page_size)) as usize;
        Ok(PageResponse {
            incidents: (0..rows)
                .map(|i| Incident {
                    id: request.page_offset as i64 + i as i64 + 1,
                    fields: serde_json::Map::new(),
                })
                .collect(),
            total_count: self.total,
            execution_time_ms: Some(3.0),
        })
    }
}

fn config(prefetch: bool) -> ControllerConfig {
    ControllerConfig {
        freshness_secs: 30,
        retention_secs: 300,
        debounce_ms: 300,
        request_timeout_secs: 15,
        prefetch_enabled: prefetch,
        sweep_interval_secs: 60,
    }
}

fn params(page_index: u32) -> QueryParameters {
    QueryParameters {
        page_size: 25,
        page_index,
        identity: Some(IdentityContext {
            role: "safety_officer".to_string(),
            scope_id: 7,
        }),
        filters: Filters::default(),
    }
}

async fn drain_background_tasks() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn two_concurrent_queries_share_one_network_call() {
    let (service, release) = TestService::new(143);
    service.hold_offset(0);
    let ctl = Arc::new(QueryController::new(Arc::clone(&service), config(false)));

    let a = tokio::spawn({
        let ctl = Arc::clone(&ctl);
        async move { ctl.query(&params(1)).await.unwrap() }
    });
    let b = tokio::spawn({
        let ctl = Arc::clone(&ctl);
        async move { ctl.query(&params(1)).await.unwrap() }
    });
    drain_background_tasks().await;

    assert_eq!(service.call_count(), 1, "identical in-flight reads must coalesce");

    release.send(true).unwrap();
    let (view_a, view_b) = (a.await.unwrap(), b.await.unwrap());
    assert_eq!(view_a.records.len(), 25);
    assert_eq!(view_b.records.len(), 25);
    assert_eq!(service.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn superseded_request_never_lands_in_the_cache() {
    let (service, release) = TestService::new(143);
    service.hold_offset(0); // page 1 hangs
    let ctl = Arc::new(QueryController::new(Arc::clone(&service), config(false)));

    // Request A: page 1, stuck at the service.
    let a = tokio::spawn({
        let ctl = Arc::clone(&ctl);
        async move { ctl.query(&params(1)).await.unwrap() }
    });
    drain_background_tasks().await;
    assert_eq!(service.calls(), vec![0]);

    // Request B supersedes with page 2; its response arrives first.
    let view_b = ctl.query(&params(2)).await.unwrap();
    assert_eq!(view_b.current_page, 2);
    assert_eq!(view_b.records.first().unwrap().id, 26);

    // A's response finally arrives, after cancellation.
    release.send(true).unwrap();
    let view_a = a.await.unwrap();
    assert!(view_a.is_loading, "cancelled first load stays silent, no error banner");
    assert!(!view_a.is_error);

    // Page 2's entry is untouched and still served without a new call.
    let calls_before = service.call_count();
    let again = ctl.query(&params(2)).await.unwrap();
    assert_eq!(again.records.first().unwrap().id, 26);
    assert_eq!(service.call_count(), calls_before);
}

#[tokio::test(start_paused = true)]
async fn fresh_entry_serves_with_zero_network_calls() {
    let (service, _release) = TestService::new(143);
    let ctl = QueryController::new(Arc::clone(&service), config(false));

    let first = ctl.query(&params(1)).await.unwrap();
    assert_eq!(first.records.len(), 25);
    assert_eq!(service.call_count(), 1);

    tokio::time::advance(Duration::from_secs(5)).await;
    let second = ctl.query(&params(1)).await.unwrap();
    assert_eq!(second.records.len(), 25);
    assert!(!second.is_fetching);
    assert_eq!(service.call_count(), 1, "fresh entry must not refetch");
}

#[tokio::test(start_paused = true)]
async fn stale_entry_serves_immediately_and_revalidates_once() {
    let (service, _release) = TestService::new(143);
    let ctl = QueryController::new(Arc::clone(&service), config(false));

    ctl.query(&params(1)).await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;

    let stale = ctl.query(&params(1)).await.unwrap();
    assert_eq!(stale.records.len(), 25, "stale data is served, not withheld");

    drain_background_tasks().await;
    assert_eq!(service.call_count(), 2, "exactly one background revalidation");
    assert_eq!(ctl.cache_stats().revalidations, 1);
}

#[tokio::test(start_paused = true)]
async fn successful_page_fetch_warms_the_next_page() {
    let (service, _release) = TestService::new(143);
    let ctl = QueryController::new(Arc::clone(&service), config(true));

    let view = ctl.query(&params(1)).await.unwrap();
    assert_eq!(view.total_pages, 6);
    drain_background_tasks().await;

    assert_eq!(service.calls(), vec![0, 25], "page 2 prefetched under identical filters");

    // Navigating to the prefetched page resolves with zero extra calls.
    let page2 = ctl.query(&params(2)).await.unwrap();
    assert_eq!(page2.records.first().unwrap().id, 26);
    assert_eq!(page2.current_page, 2);
    assert_eq!(service.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn no_prefetch_past_the_last_page() {
    let (service, _release) = TestService::new(143);
    let ctl = QueryController::new(Arc::clone(&service), config(true));

    let view = ctl.query(&params(6)).await.unwrap();
    assert_eq!(view.records.len(), 18);
    drain_background_tasks().await;

    assert_eq!(service.calls(), vec![125], "page 7 does not exist, nothing to warm");
}

#[tokio::test(start_paused = true)]
async fn prefetch_chain_does_not_cascade() {
    let (service, _release) = TestService::new(143);
    let ctl = QueryController::new(Arc::clone(&service), config(true));

    ctl.query(&params(1)).await.unwrap();
    drain_background_tasks().await;

    // Page 2's prefetch completes but must not itself prefetch page 3.
    assert_eq!(service.calls(), vec![0, 25]);
}

#[tokio::test(start_paused = true)]
async fn failed_revalidation_keeps_the_previous_page_visible() {
    let (service, _release) = TestService::new(143);
    let ctl = QueryController::new(Arc::clone(&service), config(false));

    ctl.query(&params(1)).await.unwrap();
    service.set_failing(true);
    tokio::time::advance(Duration::from_secs(31)).await;

    ctl.query(&params(1)).await.unwrap();
    drain_background_tasks().await;

    let view = ctl.query(&params(1)).await.unwrap();
    assert!(view.is_error, "failure is surfaced");
    assert_eq!(view.records.len(), 25, "previous good page is never blanked");
    assert_eq!(view.error.unwrap().category, "transport");
}

#[tokio::test(start_paused = true)]
async fn cancelled_revalidation_does_not_wedge_stale_serving() {
    let (service, release) = TestService::new(143);
    let ctl = QueryController::new(Arc::clone(&service), config(false));

    ctl.query(&params(1)).await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;

    // The stale read kicks off a revalidation that hangs at the service.
    service.hold_offset(0);
    ctl.query(&params(1)).await.unwrap();
    drain_background_tasks().await;
    assert_eq!(service.calls(), vec![0, 0]);

    // Page 2 supersedes and cancels the held revalidation.
    ctl.query(&params(2)).await.unwrap();
    drain_background_tasks().await;

    // Once stale again, page 1 must revalidate rather than stay stuck
    // behind the cancelled attempt.
    release.send(true).unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;
    let view = ctl.query(&params(1)).await.unwrap();
    assert_eq!(view.records.len(), 25, "stale data stays visible meanwhile");
    drain_background_tasks().await;

    let page_one_calls = service.calls().iter().filter(|&&offset| offset == 0).count();
    assert_eq!(page_one_calls, 3, "a cancelled revalidation must not block later ones");
}

#[tokio::test(start_paused = true)]
async fn first_fetch_failure_serves_error_without_refetching() {
    let (service, _release) = TestService::new(143);
    let ctl = QueryController::new(Arc::clone(&service), config(false));

    service.set_failing(true);
    let view = ctl.query(&params(1)).await.unwrap();
    assert!(view.is_error);
    assert_eq!(service.call_count(), 1);

    // A render loop re-querying the same key must not hammer a failing
    // backend; retrying is refetch's job.
    let view = ctl.query(&params(1)).await.unwrap();
    assert!(view.is_error);
    assert_eq!(service.call_count(), 1);

    service.set_failing(false);
    let view = ctl.refetch(&params(1)).await.unwrap();
    assert!(!view.is_error);
    assert_eq!(view.records.len(), 25);
    assert_eq!(service.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn refetch_ignores_freshness_but_still_deduplicates() {
    let (service, _release) = TestService::new(143);
    let ctl = QueryController::new(Arc::clone(&service), config(false));

    ctl.query(&params(1)).await.unwrap();
    assert_eq!(service.call_count(), 1);

    // Entry is fresh; a plain query would not hit the network.
    let view = ctl.refetch(&params(1)).await.unwrap();
    assert_eq!(view.records.len(), 25);
    assert_eq!(service.call_count(), 2, "refetch forces a revalidation");
}

#[tokio::test(start_paused = true)]
async fn teardown_cancels_in_flight_work_and_blocks_late_writes() {
    let (service, release) = TestService::new(143);
    service.hold_offset(0);
    let ctl = Arc::new(QueryController::new(Arc::clone(&service), config(false)));

    let pending = tokio::spawn({
        let ctl = Arc::clone(&ctl);
        async move { ctl.query(&params(1)).await.unwrap() }
    });
    drain_background_tasks().await;
    assert_eq!(service.call_count(), 1);

    ctl.shutdown();
    assert!(ctl.is_shut_down());

    // The held response arrives after teardown and must be discarded.
    release.send(true).unwrap();
    let view = pending.await.unwrap();
    assert!(view.is_loading, "late response must not materialize as data");
    assert!(!view.is_error, "teardown is silent");
}

#[tokio::test(start_paused = true)]
async fn identity_switch_drops_the_old_scope_entirely() {
    let (service, _release) = TestService::new(143);
    let ctl = QueryController::new(Arc::clone(&service), config(false));

    let old_identity = IdentityContext {
        role: "safety_officer".to_string(),
        scope_id: 7,
    };
    ctl.query(&params(1)).await.unwrap();
    assert_eq!(service.call_count(), 1);

    let dropped = ctl.on_identity_changed(&old_identity).await;
    assert_eq!(dropped, 1);

    // Same parameters under the old identity hit the network again;
    // nothing cached survived the switch.
    ctl.query(&params(1)).await.unwrap();
    assert_eq!(service.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn debounced_filter_burst_produces_one_transition() {
    let (service, _release) = TestService::new(143);
    let ctl = QueryController::new(Arc::clone(&service), config(false));

    let (gate, mut rx) = ctl.filter_gate::<String>();
    for i in 0..10 {
        gate.submit(format!("ladder fall {i}"));
        tokio::time::advance(Duration::from_millis(20)).await;
    }
    tokio::time::advance(Duration::from_millis(300)).await;

    let resolved = rx.recv().await.unwrap();
    assert_eq!(resolved, "ladder fall 9");
    assert!(rx.try_recv().is_err(), "burst collapses to the last value");

    let mut filtered = params(1);
    filtered.filters.free_text = Some(resolved);
    let view = ctl.query(&filtered).await.unwrap();
    assert_eq!(view.current_page, 1);
    assert_eq!(service.call_count(), 1, "one burst, one fetch");
}

#[tokio::test(start_paused = true)]
async fn manual_prefetch_trigger_warms_the_next_page() {
    let (service, _release) = TestService::new(143);
    let ctl = QueryController::new(Arc::clone(&service), config(false));

    ctl.query(&params(1)).await.unwrap();
    assert_eq!(service.call_count(), 1, "automatic prefetch is off");

    ctl.prefetch_next_page(&params(1)).await.unwrap();
    drain_background_tasks().await;
    assert_eq!(service.calls(), vec![0, 25]);
}

#[tokio::test(start_paused = true)]
async fn retention_sweep_evicts_idle_entries() {
    let (service, _release) = TestService::new(143);
    let ctl = QueryController::new(Arc::clone(&service), config(false));

    ctl.query(&params(1)).await.unwrap();
    assert_eq!(ctl.cache_stats().evictions, 0);

    // Sit idle past the retention window; the sweep task runs on its own.
    tokio::time::advance(Duration::from_secs(400)).await;
    drain_background_tasks().await;

    assert_eq!(ctl.cache_stats().evictions, 1);
    ctl.query(&params(1)).await.unwrap();
    assert_eq!(service.call_count(), 2, "evicted entry refetches on next read");
}

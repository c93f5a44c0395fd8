//! In-flight request tracking: de-duplication and cancellation.
//!
//! At most one request runs per query key. The first caller for a key
//! becomes the *leader* and receives a [`FetchGuard`]; concurrent callers
//! for the same key become *followers* that await the leader's completion
//! and then re-read the cache, so two identical reads never produce two
//! network calls.
//!
//! Cancellation is one primitive, [`CancelToken`]: supersession, teardown,
//! and timeouts all fire the same signal. Observation is cooperative; a
//! cancelled fetch discards its result silently rather than erroring.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::debug;

use crate::key::QueryKey;

/// A set-once flag that async tasks can await.
#[derive(Debug, Default)]
struct Flag {
    set: AtomicBool,
    notify: Notify,
}

impl Flag {
    fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            // Register before checking, otherwise a notify_waiters between
            // the check and the await would be lost.
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}

/// Cooperative cancellation signal for one request.
///
/// Cloning shares the signal. Once cancelled, a token stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<Flag>,
}

impl CancelToken {
    /// Create an unfired token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.flag.set();
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.is_set()
    }

    /// Resolve when the signal fires; resolves immediately if it already
    /// has.
    pub async fn cancelled(&self) {
        self.flag.wait().await;
    }
}

/// One tracked request. Shared between the leader's guard and any
/// followers awaiting it.
#[derive(Debug)]
pub struct InFlightRequest {
    key: QueryKey,
    cancel: CancelToken,
    settled: Flag,
    /// When the leader registered this request.
    pub started_at: Instant,
}

impl InFlightRequest {
    /// Cancellation token scoped strictly to this request's key.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Await the leader finishing (success, failure, or cancellation),
    /// then re-read the cache for the outcome.
    pub async fn settled(&self) {
        self.settled.wait().await;
    }
}

/// Outcome of asking to start a fetch for a key.
pub enum FetchSlot {
    /// No request was in flight; the caller must drive the fetch and
    /// settle the guard.
    Lead(FetchGuard),
    /// A request for the same key is already running; await it instead of
    /// duplicating the network call.
    Join(Arc<InFlightRequest>),
}

/// Leader's handle on a registered request.
///
/// Dropping the guard without [`FetchGuard::finish`] cancels the request
/// and releases the key, so a panicking or aborted leader never wedges
/// followers.
pub struct FetchGuard {
    requests: Arc<Mutex<HashMap<QueryKey, Arc<InFlightRequest>>>>,
    request: Arc<InFlightRequest>,
    finished: bool,
}

impl FetchGuard {
    /// Cancellation token for the fetch this guard leads.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        self.request.token()
    }

    /// Release the key and wake followers. Call after the cache write so
    /// no follower can observe "settled but no result" for this key.
    pub fn finish(mut self) {
        self.release();
        self.finished = true;
    }

    fn release(&self) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.remove(&self.request.key);
        }
        self.request.settled.set();
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.request.cancel.cancel();
            self.release();
        }
    }
}

/// Registry of in-flight requests for one controller instance.
///
/// Owns the teardown contract: [`InFlightRegistry::cancel_all`] fires
/// every outstanding token unconditionally and marks the registry shut
/// down so nothing can start afterwards.
#[derive(Default)]
pub struct InFlightRegistry {
    requests: Arc<Mutex<HashMap<QueryKey, Arc<InFlightRequest>>>>,
    shutdown: Flag,
}

impl InFlightRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to start a fetch for `key`.
    ///
    /// Returns `None` after [`InFlightRegistry::cancel_all`]; a torn-down
    /// controller must not begin new requests.
    pub fn begin(&self, key: &QueryKey) -> Option<FetchSlot> {
        if self.shutdown.is_set() {
            return None;
        }
        let mut requests = self.requests.lock().ok()?;
        if let Some(existing) = requests.get(key) {
            debug!(key = %key, "joining in-flight request");
            return Some(FetchSlot::Join(Arc::clone(existing)));
        }
        let request = Arc::new(InFlightRequest {
            key: key.clone(),
            cancel: CancelToken::new(),
            settled: Flag::default(),
            started_at: Instant::now(),
        });
        requests.insert(key.clone(), Arc::clone(&request));
        Some(FetchSlot::Lead(FetchGuard {
            requests: Arc::clone(&self.requests),
            request,
            finished: false,
        }))
    }

    /// Cancel the in-flight request for one key, if any. Used when a newer
    /// key supersedes it; the signal never touches other keys' requests.
    pub fn cancel_key(&self, key: &QueryKey) {
        if let Ok(requests) = self.requests.lock() {
            if let Some(request) = requests.get(key) {
                debug!(key = %key, "cancelling superseded request");
                request.cancel.cancel();
            }
        }
    }

    /// Cancel every in-flight request whose key matches the predicate.
    /// Used when identity changes, so a prior role's late responses cannot
    /// re-enter the cache.
    pub fn cancel_matching<F>(&self, predicate: F)
    where
        F: Fn(&QueryKey) -> bool,
    {
        if let Ok(requests) = self.requests.lock() {
            for (key, request) in requests.iter() {
                if predicate(key) {
                    debug!(key = %key, "cancelling request for invalidated identity");
                    request.cancel.cancel();
                }
            }
        }
    }

    /// Whether a request for `key` is currently running.
    pub fn is_in_flight(&self, key: &QueryKey) -> bool {
        self.requests
            .lock()
            .map(|requests| requests.contains_key(key))
            .unwrap_or(false)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.requests.lock().map(|requests| requests.len()).unwrap_or(0)
    }

    /// Whether no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Teardown: cancel every outstanding request and refuse new ones.
    pub fn cancel_all(&self) {
        self.shutdown.set();
        if let Ok(requests) = self.requests.lock() {
            for request in requests.values() {
                request.cancel.cancel();
            }
        }
    }

    /// Whether teardown has happened.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_set()
    }
}

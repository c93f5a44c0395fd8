//! Fetch execution: one remote call per logical fetch.
//!
//! [`FetchExecutor::execute`] converts a normalized key into the service's
//! wire request (the only place 1-based page math becomes a 0-based
//! offset), issues the call, and classifies the outcome. Timeouts reuse
//! the request's own cancellation token rather than racing a second
//! mechanism: after the deadline the executor fires the token and reports
//! a transport failure, so a slow backend response that lands later is
//! discarded by the same signal everything else honors.
//!
//! No retries happen here. Paginated incident reads are user-driven and
//! idempotent; an old transparent-retry policy turned a slow backend into
//! 30+ second pile-ups, so retry is an explicit caller action.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::inflight::CancelToken;
use crate::key::QueryKey;
use crate::params::PageRequest;
use crate::remote::{IncidentService, PageResponse};
use crate::{Error, Result};

/// Convert a normalized key into the wire request shape.
pub(crate) fn wire_request(key: &QueryKey) -> PageRequest {
    PageRequest {
        page_size: key.page_size(),
        page_offset: u64::from(key.page_index() - 1) * u64::from(key.page_size()),
        filters: key.filters().clone(),
        identity: key.identity().clone(),
    }
}

/// Executes single fetches against the incident service under a
/// cancellation token and a token-driven timeout.
pub struct FetchExecutor<S> {
    service: Arc<S>,
    timeout: Duration,
}

impl<S: IncidentService> FetchExecutor<S> {
    /// Create an executor over the given service with a per-fetch timeout.
    pub fn new(service: Arc<S>, timeout: Duration) -> Self {
        Self { service, timeout }
    }

    /// Run one fetch for `key`.
    ///
    /// Returns [`Error::Cancelled`] if the token fires before the service
    /// responds; the caller must not treat that as a failure. A response
    /// arriving after cancellation is discarded, never surfaced.
    pub async fn execute(&self, key: &QueryKey, token: &CancelToken) -> Result<PageResponse> {
        if token.is_cancelled() {
            return Err(Error::Cancelled(format!("fetch for {key} superseded before start")));
        }

        let request = wire_request(key);
        debug!(key = %key, offset = request.page_offset, "executing fetch");

        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!(key = %key, "fetch cancelled in flight");
                Err(Error::Cancelled(format!("fetch for {key} cancelled")))
            },
            () = tokio::time::sleep(self.timeout) => {
                // Timeout is just a deferred cancellation of the same token.
                token.cancel();
                warn!(key = %key, timeout_secs = self.timeout.as_secs(), "fetch timed out");
                Err(Error::Transport(format!(
                    "incident service did not respond within {}s",
                    self.timeout.as_secs()
                )))
            },
            result = self.service.fetch_page(&request) => result,
        };

        let response = outcome?;
        if token.is_cancelled() {
            return Err(Error::Cancelled(format!(
                "fetch for {key} completed after cancellation, result discarded"
            )));
        }

        validate_page(key, &response)?;
        Ok(response)
    }
}

/// Enforce the result-shape invariants the cache relies on.
fn validate_page(key: &QueryKey, response: &PageResponse) -> Result<()> {
    let rows = response.incidents.len();
    if rows > key.page_size() as usize {
        return Err(Error::MalformedResponse(format!(
            "service returned {rows} rows for a page size of {}",
            key.page_size()
        )));
    }
    if response.total_count > 0 && response.total_count < rows as u64 {
        return Err(Error::MalformedResponse(format!(
            "totalCount {} is smaller than the {rows} rows returned",
            response.total_count
        )));
    }
    Ok(())
}

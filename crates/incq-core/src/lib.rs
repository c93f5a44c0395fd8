//! # incq-core
//!
//! Core data-access layer for the incq incident dashboard: a paginated
//! query cache and prefetch controller over the remote incident service.
//!
//! Every list screen in the dashboard needs the same machinery — turn a
//! set of filter/page parameters into a cached, deduplicated, cancellable
//! read, and expose a stable "current page + total count + loading/error
//! state" view model. This crate provides that once, parameterized by a
//! service implementation and a configuration, instead of each screen
//! hand-rolling its own fetch/cache/cancel logic.
//!
//! ## Architecture
//!
//! - **Normalization** ([`key`]): canonical, hashable identity for a
//!   logical query; identical requests share cache state.
//! - **Caching** ([`cache`]): per-key entries with freshness and retention
//!   windows, served stale-while-revalidate so the UI never blocks on the
//!   network when any prior result exists.
//! - **De-duplication & cancellation** ([`inflight`]): one request per key,
//!   one cancellation primitive shared by supersession, timeout, and
//!   teardown.
//! - **Fetching** ([`remote`], [`fetch`]): the narrow service interface,
//!   its HTTP implementation, and strict response validation.
//! - **Debouncing** ([`debounce`]): keystroke bursts collapse to a single
//!   query-key transition.
//! - **Orchestration** ([`controller`]): ties it together and projects the
//!   UI view model.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use incq_core::{
//!     ControllerConfig, Filters, HttpIncidentService, IdentityContext, QueryController,
//!     QueryParameters,
//! };
//!
//! # async fn example() -> incq_core::Result<()> {
//! let service = Arc::new(HttpIncidentService::new("https://api.example.com/rpc/incidents/search")?);
//! let controller = QueryController::new(service, ControllerConfig::default());
//!
//! let view = controller
//!     .query(&QueryParameters {
//!         page_size: 25,
//!         page_index: 1,
//!         identity: Some(IdentityContext { role: "safety_officer".into(), scope_id: 7 }),
//!         filters: Filters::default(),
//!     })
//!     .await?;
//!
//! println!("{} of {} incidents", view.records.len(), view.total_count);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`]. Cancellation is flow
//! control, never a user-visible failure, and nothing in this crate
//! retries automatically — resilience is an explicit, user-visible
//! `refetch` at the call site.

/// Keyed result cache with freshness and retention windows
pub mod cache;
/// Controller configuration with TOML file loading
pub mod config;
/// Query orchestration, prefetching, and view-model projection
pub mod controller;
/// Debounced filter input gate
pub mod debounce;
/// Error types and result aliases
pub mod error;
/// Fetch execution with token-driven timeouts
pub mod fetch;
/// In-flight request de-duplication and cancellation
pub mod inflight;
/// Canonical query-key derivation
pub mod key;
/// Query parameter and wire request types
pub mod params;
/// Remote incident-service interface and HTTP implementation
pub mod remote;

// Re-export commonly used types
pub use cache::{CacheEntry, CachePolicy, CacheStatsSnapshot, CacheStore, EntryState, ErrorInfo};
pub use config::ControllerConfig;
pub use controller::{PageView, QueryController};
pub use debounce::FilterGate;
pub use error::{Error, Result};
pub use fetch::FetchExecutor;
pub use inflight::{CancelToken, FetchSlot, InFlightRegistry, InFlightRequest};
pub use key::{QueryKey, normalize};
pub use params::{
    ArchiveState, DateRange, Filters, IdentityContext, PageRequest, QueryParameters,
};
pub use remote::{HttpIncidentService, Incident, IncidentService, PageResponse};

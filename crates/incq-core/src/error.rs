//! Error types and handling for incq-core operations.
//!
//! Errors follow the taxonomy the dashboard needs at the UI boundary:
//!
//! - **Cancelled**: a request was superseded or its controller was torn
//!   down. Never shown to the user as a failure.
//! - **Transport**: connectivity problems, non-2xx responses, timeouts.
//!   Shown to the user, but never allowed to blank out previously
//!   displayed data.
//! - **MalformedResponse**: the remote service violated its contract.
//!   Displayed like a transport error but logged distinctly, since it
//!   points at the backend rather than the network.
//! - **AuthorizationPending**: the caller's identity has not resolved yet,
//!   so no fetch may be issued at all.
//!
//! ## Recovery Hints
//!
//! Errors report whether a manual retry might succeed:
//!
//! ```rust
//! use incq_core::Error;
//!
//! let err = Error::Transport("connection reset".to_string());
//! assert!(err.is_recoverable());
//! assert_eq!(err.category(), "transport");
//! ```

use thiserror::Error;

/// The main error type for incq-core operations.
///
/// All public functions in incq-core return `Result<T, Error>` for
/// consistent error handling. None of the variants trigger automatic
/// retries anywhere in this crate: an earlier transparent-retry policy
/// caused multi-second pile-ups on a slow backend, so retry is an
/// explicit, user-visible action bound to `refetch()` at the call site.
#[derive(Error, Debug)]
pub enum Error {
    /// Request was cancelled before completion.
    ///
    /// Raised when a newer query key supersedes an in-flight request, or
    /// when the owning controller is torn down. The view model treats this
    /// as a non-event: no error banner, no state change.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// Network-level failure: connection error, non-2xx status, timeout.
    ///
    /// The message is user-displayable. A previously cached page for the
    /// same key stays visible; only the error flag is raised.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote service returned a response missing required fields.
    ///
    /// Missing `incidents` or a non-numeric `totalCount` is a contract
    /// violation with the backend, never silently coerced to an empty
    /// page.
    #[error("malformed response from incident service: {0}")]
    MalformedResponse(String),

    /// Caller identity has not been resolved yet.
    ///
    /// The controller refuses to fetch in this state so the UI never
    /// flashes "no incidents found" before authorization settles.
    #[error("identity context not yet resolved")]
    AuthorizationPending,

    /// Query parameters are invalid (zero page size, inverted date range).
    ///
    /// Rejected before key normalization; the normalizer itself never
    /// sees invalid input.
    #[error("invalid query parameters: {0}")]
    InvalidParams(String),

    /// Configuration is invalid or inaccessible.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed (config file access).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a manual retry of the same operation might succeed.
    ///
    /// Transport problems are usually transient; contract violations and
    /// invalid parameters are not. Cancellation is not a failure, so a
    /// retry is meaningless rather than harmful.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::AuthorizationPending)
    }

    /// Whether the error should surface in the view model as a failure.
    ///
    /// Cancellations and pending authorization are flow control, not
    /// failures.
    #[must_use]
    pub const fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Cancelled(_) | Self::AuthorizationPending)
    }

    /// Stable category label used in logs and metrics.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Cancelled(_) => "cancelled",
            Self::Transport(_) => "transport",
            Self::MalformedResponse(_) => "malformed_response",
            Self::AuthorizationPending => "authorization_pending",
            Self::InvalidParams(_) => "invalid_params",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport(format!("request timed out: {err}"))
        } else if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A specialized Result type for incq-core operations.
pub type Result<T> = std::result::Result<T, Error>;

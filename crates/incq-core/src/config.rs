//! Controller configuration.
//!
//! Tuning knobs for the query controller, loadable from a TOML file so
//! deployments can adjust cache windows without a rebuild:
//!
//! ```toml
//! freshness_secs = 30
//! retention_secs = 300
//! debounce_ms = 300
//! request_timeout_secs = 15
//! prefetch_enabled = true
//! sweep_interval_secs = 60
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::cache::CachePolicy;
use crate::{Error, Result};

/// Tuning knobs for one [`crate::controller::QueryController`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Entries younger than this are served without any network call.
    pub freshness_secs: u64,

    /// Entries unread for this long are evicted by the retention sweep.
    pub retention_secs: u64,

    /// Quiet period for the debounced filter gate.
    pub debounce_ms: u64,

    /// Upper bound on one fetch. Implemented by firing the fetch's own
    /// cancellation token after this long, so timeout and cancellation
    /// share a single mechanism.
    pub request_timeout_secs: u64,

    /// Whether successful page fetches warm the next page.
    pub prefetch_enabled: bool,

    /// How often the background sweep checks the retention window.
    pub sweep_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            freshness_secs: 30,
            retention_secs: 300,
            debounce_ms: 300,
            request_timeout_secs: 15,
            prefetch_enabled: true,
            sweep_interval_secs: 60,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a TOML file, validating ranges.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the windows make sense together.
    pub fn validate(&self) -> Result<()> {
        if self.freshness_secs == 0 {
            return Err(Error::Config("freshness_secs must be positive".to_string()));
        }
        if self.retention_secs < self.freshness_secs {
            return Err(Error::Config(format!(
                "retention_secs ({}) must not be shorter than freshness_secs ({})",
                self.retention_secs, self.freshness_secs
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Cache policy derived from the windows.
    #[must_use]
    pub const fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            freshness_window: Duration::from_secs(self.freshness_secs),
            retention_window: Duration::from_secs(self.retention_secs),
        }
    }

    /// Quiet period for the filter gate.
    #[must_use]
    pub const fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Per-fetch timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Retention sweep cadence.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

//! Query parameter types for the paginated incident list.
//!
//! [`QueryParameters`] is the full set of UI inputs that identify one
//! logical page read: pagination, caller identity, and filters. Two
//! parameter sets with equal field values are the same logical query and
//! share one cache entry (see [`crate::key::normalize`]).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Opaque caller identity used by the remote service for row-level
/// authorization. The controller forwards it untouched; it participates in
/// the query key so one identity's rows can never be served to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityContext {
    /// Role name as resolved by the session layer (e.g. `"safety_officer"`).
    pub role: String,
    /// Scope the role is bound to (site, employer, or region id).
    #[serde(rename = "scopeId")]
    pub scope_id: i64,
}

/// Archive visibility filter for incident records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveState {
    /// Only live incidents.
    #[default]
    Active,
    /// Only archived incidents.
    Archived,
    /// Only soft-deleted incidents.
    Deleted,
    /// No archive filtering.
    All,
}

/// Inclusive date range over the incident occurrence date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    /// First day included.
    pub start: NaiveDate,
    /// Last day included.
    pub end: NaiveDate,
}

/// Filter fields for the incident list.
///
/// Absent optional fields mean "no constraint" and normalize identically
/// regardless of how the caller expressed absence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filters {
    /// Restrict to one employer.
    #[serde(rename = "employerId", skip_serializing_if = "Option::is_none")]
    pub employer_id: Option<i64>,
    /// Restrict to one worker.
    #[serde(rename = "workerId", skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<i64>,
    /// Restrict to an inclusive occurrence-date range.
    #[serde(rename = "dateRange", skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    /// Archive visibility.
    #[serde(rename = "archiveState", default)]
    pub archive_state: ArchiveState,
    /// Free-text search over incident descriptions.
    #[serde(rename = "freeText", skip_serializing_if = "Option::is_none")]
    pub free_text: Option<String>,
}

/// Full input for one logical paginated query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryParameters {
    /// Rows per page; must be positive.
    pub page_size: u32,
    /// 1-based page number as shown in the UI.
    pub page_index: u32,
    /// Caller identity, `None` while the session layer is still resolving
    /// it. The controller refuses to fetch until this is `Some`.
    pub identity: Option<IdentityContext>,
    /// Active filter set.
    pub filters: Filters,
}

impl QueryParameters {
    /// Validate pagination and filter ranges.
    ///
    /// Rejection happens here, at the call site, so the key normalizer can
    /// stay a total, pure function over already-valid input.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::InvalidParams("page_size must be positive".to_string()));
        }
        if self.page_index == 0 {
            return Err(Error::InvalidParams(
                "page_index is 1-based and must be positive".to_string(),
            ));
        }
        if let Some(range) = &self.filters.date_range {
            if range.start > range.end {
                return Err(Error::InvalidParams(format!(
                    "date range start {} is after end {}",
                    range.start, range.end
                )));
            }
        }
        Ok(())
    }

    /// The same parameters advanced to the next page, for prefetching.
    #[must_use]
    pub fn next_page(&self) -> Self {
        let mut next = self.clone();
        next.page_index += 1;
        next
    }
}

/// Wire request shape consumed by the remote incident service: one call
/// per logical fetch, no batching. Built from a normalized key by the
/// fetch executor, which owns the page-index-to-offset conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    /// Rows per page.
    #[serde(rename = "pageSize")]
    pub page_size: u32,
    /// 0-based row offset.
    #[serde(rename = "pageOffset")]
    pub page_offset: u64,
    /// Filter predicates, applied server-side.
    #[serde(flatten)]
    pub filters: Filters,
    /// Identity forwarded for server-side RBAC filtering.
    #[serde(rename = "identityContext")]
    pub identity: IdentityContext,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn identity() -> IdentityContext {
        IdentityContext {
            role: "safety_officer".to_string(),
            scope_id: 7,
        }
    }

    fn params() -> QueryParameters {
        QueryParameters {
            page_size: 25,
            page_index: 1,
            identity: Some(identity()),
            filters: Filters::default(),
        }
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let mut p = params();
        p.page_size = 0;
        assert!(matches!(p.validate(), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn zero_page_index_is_rejected() {
        let mut p = params();
        p.page_index = 0;
        assert!(matches!(p.validate(), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn inverted_date_range_is_rejected() {
        let mut p = params();
        p.filters.date_range = Some(DateRange {
            start: NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        });
        assert!(matches!(p.validate(), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn next_page_only_advances_the_index() {
        let p = params();
        let next = p.next_page();
        assert_eq!(next.page_index, 2);
        assert_eq!(next.page_size, p.page_size);
        assert_eq!(next.filters, p.filters);
        assert_eq!(next.identity, p.identity);
    }

    #[test]
    fn request_serializes_with_wire_field_names() {
        let req = PageRequest {
            page_size: 25,
            page_offset: 0,
            filters: Filters::default(),
            identity: identity(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["pageSize"], 25);
        assert_eq!(json["pageOffset"], 0);
        assert_eq!(json["archiveState"], "active");
        assert_eq!(json["identityContext"]["scopeId"], 7);
        // Absent optional filters stay off the wire entirely.
        assert!(json.get("employerId").is_none());
    }
}

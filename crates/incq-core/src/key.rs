//! Canonical query-key derivation.
//!
//! A [`QueryKey`] is the hashable identity of one logical page read.
//! Every field of [`QueryParameters`] participates: page size, page index,
//! caller identity, and all filters. Identical logical requests always
//! produce an identical key; any single differing field produces a
//! different one. Because identity is part of the key, cached rows from a
//! prior role/scope are unreachable the instant identity changes.

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::params::{Filters, IdentityContext, QueryParameters};
use crate::{Error, Result};

/// Canonical identity of a logical paginated query.
///
/// Construction goes through [`normalize`]; equality and hashing cover
/// every parameter field. The digest is a stable fingerprint derived from
/// the same fields, used for log lines rather than equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    page_size: u32,
    page_index: u32,
    identity: IdentityContext,
    filters: Filters,
    digest: String,
}

impl QueryKey {
    /// Rows per page this key was normalized with.
    #[must_use]
    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    /// 1-based page index this key addresses.
    #[must_use]
    pub const fn page_index(&self) -> u32 {
        self.page_index
    }

    /// Identity the key is scoped to.
    #[must_use]
    pub const fn identity(&self) -> &IdentityContext {
        &self.identity
    }

    /// Normalized filter set.
    #[must_use]
    pub const fn filters(&self) -> &Filters {
        &self.filters
    }

    /// Stable fingerprint for logging.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Key for the next page under the same filters and identity. Used by
    /// the prefetcher; filters are already normalized so no re-validation
    /// is needed.
    #[must_use]
    pub fn next_page(&self) -> Self {
        let mut next = self.clone();
        next.page_index += 1;
        next.digest = fingerprint(&Canonical {
            page_size: next.page_size,
            page_index: next.page_index,
            identity: &next.identity,
            filters: &next.filters,
        });
        next
    }

    /// Whether `other` is the same query at a different page.
    #[must_use]
    pub fn same_filter_set(&self, other: &Self) -> bool {
        self.page_size == other.page_size
            && self.identity == other.identity
            && self.filters == other.filters
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}@{}#{}", self.page_index, self.page_size, &self.digest[..12])
    }
}

/// Derive the canonical key for a set of query parameters.
///
/// Pure: no I/O, no clock, no side effects. Free-text input is trimmed and
/// an empty string collapses to "absent", so `None` and `Some("")` (and
/// `Some("  ")`) are the same logical filter. Invalid pagination is the
/// caller's problem ([`QueryParameters::validate`]); the normalizer only
/// refuses parameters whose identity has not resolved, since an
/// identity-free key could collide across callers.
pub fn normalize(params: &QueryParameters) -> Result<QueryKey> {
    let identity = params.identity.clone().ok_or(Error::AuthorizationPending)?;

    let mut filters = params.filters.clone();
    filters.free_text = filters
        .free_text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    let digest = fingerprint(&Canonical {
        page_size: params.page_size,
        page_index: params.page_index,
        identity: &identity,
        filters: &filters,
    });

    Ok(QueryKey {
        page_size: params.page_size,
        page_index: params.page_index,
        identity,
        filters,
        digest,
    })
}

/// Serialization shape for the digest. Field order is fixed by the struct,
/// which keeps the fingerprint stable across runs.
#[derive(Serialize)]
struct Canonical<'a> {
    page_size: u32,
    page_index: u32,
    identity: &'a IdentityContext,
    filters: &'a Filters,
}

fn fingerprint(canonical: &Canonical<'_>) -> String {
    let mut hasher = Sha256::new();
    // Canonical is a closed struct of serializable fields; serialization
    // cannot fail.
    let bytes = serde_json::to_vec(canonical).unwrap_or_default();
    hasher.update(&bytes);
    STANDARD.encode(hasher.finalize())
}

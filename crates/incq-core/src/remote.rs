//! Remote incident-service interface and HTTP implementation.
//!
//! The controller only ever sees [`IncidentService`]: one call per logical
//! fetch, taking the wire-shaped [`PageRequest`] and returning a validated
//! [`PageResponse`]. [`HttpIncidentService`] is the production
//! implementation, a JSON POST against the dashboard's RPC endpoint.
//!
//! Response validation is strict where the contract says so: a payload
//! without an `incidents` array or without a numeric `totalCount` is a
//! [`crate::Error::MalformedResponse`], never coerced to an empty page.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::params::PageRequest;
use crate::{Error, Result};

/// One incident row. Opaque to the controller beyond its identifier; the
/// remaining columns ride along untyped for the view layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// Stable record identifier.
    pub id: i64,
    /// All other columns, passed through untouched.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

/// Validated page of results from the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResponse {
    /// Records for the requested page, in service order.
    pub incidents: Vec<Incident>,
    /// Total matching rows across all pages.
    pub total_count: u64,
    /// Server-side query time, when the service reports it.
    pub execution_time_ms: Option<f64>,
}

/// Narrow read interface the controller consumes.
///
/// Implementations must not retry internally; retry is an explicit caller
/// decision surfaced through the controller's `refetch`.
#[async_trait]
pub trait IncidentService: Send + Sync {
    /// Fetch exactly one page of incidents matching the request.
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResponse>;
}

/// HTTP client for the incident service's paginated search RPC.
pub struct HttpIncidentService {
    client: Client,
    endpoint: Url,
    bearer_token: Option<String>,
}

impl HttpIncidentService {
    /// Creates a service client against the given RPC endpoint URL.
    ///
    /// No overall request timeout is set on the client: the fetch pipeline
    /// injects timeouts through its cancellation signal so there is a
    /// single cancellation mechanism, not two racing ones. Only the TCP
    /// connect phase gets a bound here.
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid incident service endpoint: {e}")))?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("incq-core/", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            bearer_token: None,
        })
    }

    /// Attach a bearer token forwarded on every request.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

#[async_trait]
impl IncidentService for HttpIncidentService {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResponse> {
        debug!(
            offset = request.page_offset,
            page_size = request.page_size,
            "fetching incident page"
        );

        let mut http = self.client.post(self.endpoint.clone()).json(request);
        if let Some(token) = &self.bearer_token {
            http = http.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = http.send().await?;
        let status = response.status();

        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(Error::Transport(format!(
                    "incident service rejected credentials ({status})"
                )));
            }
            return Err(Error::Transport(format!(
                "incident service returned {status}"
            )));
        }

        let body: Value = response.json().await?;
        let page = parse_page_response(&body)?;
        debug!(
            rows = page.incidents.len(),
            total = page.total_count,
            "incident page received"
        );
        Ok(page)
    }
}

/// Validate and convert a raw service payload.
///
/// Split out of the HTTP path so the contract checks are testable without
/// a server.
pub fn parse_page_response(body: &Value) -> Result<PageResponse> {
    let incidents_value = body.get("incidents").ok_or_else(|| {
        warn!("incident service payload missing 'incidents'");
        Error::MalformedResponse("missing 'incidents' field".to_string())
    })?;
    let incidents_array = incidents_value.as_array().ok_or_else(|| {
        warn!("incident service payload has non-array 'incidents'");
        Error::MalformedResponse("'incidents' is not an array".to_string())
    })?;

    let total_count = body
        .get("totalCount")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            warn!("incident service payload missing numeric 'totalCount'");
            Error::MalformedResponse("missing or non-numeric 'totalCount'".to_string())
        })?;

    let incidents = incidents_array
        .iter()
        .map(|row| {
            serde_json::from_value::<Incident>(row.clone()).map_err(|e| {
                Error::MalformedResponse(format!("incident row missing identifier: {e}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PageResponse {
        incidents,
        total_count,
        execution_time_ms: body.get("executionTimeMs").and_then(Value::as_f64),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::params::{Filters, IdentityContext};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_request() -> PageRequest {
        PageRequest {
            page_size: 25,
            page_offset: 0,
            filters: Filters::default(),
            identity: IdentityContext {
                role: "safety_officer".to_string(),
                scope_id: 7,
            },
        }
    }

    fn sample_body(rows: usize, total: u64) -> Value {
        let incidents: Vec<Value> = (0..rows)
            .map(|i| json!({"id": i as i64 + 1, "summary": format!("incident {i}")}))
            .collect();
        json!({
            "incidents": incidents,
            "totalCount": total,
            "pageSize": 25,
            "pageOffset": 0,
            "executionTimeMs": 12.5,
        })
    }

    #[test]
    fn parses_valid_payload() {
        let page = parse_page_response(&sample_body(3, 143)).unwrap();
        assert_eq!(page.incidents.len(), 3);
        assert_eq!(page.total_count, 143);
        assert_eq!(page.execution_time_ms, Some(12.5));
        assert_eq!(page.incidents[0].id, 1);
        assert_eq!(page.incidents[0].fields["summary"], "incident 0");
    }

    #[test]
    fn missing_incidents_is_malformed() {
        let body = json!({"totalCount": 10});
        assert!(matches!(
            parse_page_response(&body),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn non_numeric_total_count_is_malformed_not_empty() {
        let body = json!({"incidents": [], "totalCount": "many"});
        assert!(matches!(
            parse_page_response(&body),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn row_without_identifier_is_malformed() {
        let body = json!({"incidents": [{"summary": "no id"}], "totalCount": 1});
        assert!(matches!(
            parse_page_response(&body),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn empty_page_is_valid() {
        let body = json!({"incidents": [], "totalCount": 0});
        let page = parse_page_response(&body).unwrap();
        assert!(page.incidents.is_empty());
        assert_eq!(page.total_count, 0);
    }

    #[tokio::test]
    async fn posts_request_shape_and_parses_response() -> anyhow::Result<()> {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rpc/incidents/search"))
            .and(header("authorization", "Bearer tok-123"))
            .and(body_partial_json(json!({
                "pageSize": 25,
                "pageOffset": 0,
                "archiveState": "active",
                "identityContext": {"role": "safety_officer", "scopeId": 7},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_body(25, 143)))
            .mount(&server)
            .await;

        let service = HttpIncidentService::new(&format!("{}/rpc/incidents/search", server.uri()))?
            .with_bearer_token("tok-123");

        let page = service.fetch_page(&sample_request()).await?;
        assert_eq!(page.incidents.len(), 25);
        assert_eq!(page.total_count, 143);
        Ok(())
    }

    #[tokio::test]
    async fn server_error_maps_to_transport() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let service = HttpIncidentService::new(&server.uri())?;
        match service.fetch_page(&sample_request()).await {
            Err(Error::Transport(msg)) => assert!(msg.contains("500")),
            other => panic!("expected transport error, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn malformed_payload_from_server_is_flagged() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": []})))
            .mount(&server)
            .await;

        let service = HttpIncidentService::new(&server.uri())?;
        assert!(matches!(
            service.fetch_page(&sample_request()).await,
            Err(Error::MalformedResponse(_))
        ));
        Ok(())
    }

    #[test]
    fn invalid_endpoint_is_config_error() {
        assert!(matches!(
            HttpIncidentService::new("not a url"),
            Err(Error::Config(_))
        ));
    }
}

//! HTTP implementation of the remote store.
//!
//! Endpoints, relative to the configured base URL:
//! - `POST /tables/{table}` insert
//! - `PATCH /tables/{table}/{id}` update
//! - `DELETE /tables/{table}/{id}` delete
//! - `GET /families/{family_id}/graph` graph snapshot (404 means unknown family)
//! - `GET /health` reachability probe

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use super::{ApiError, RemoteStore};
use crate::models::FamilyGraph;
use crate::sync::NetworkMonitor;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Timeout for the reachability probe; kept short so connectivity flips quickly.
const PROBE_TIMEOUT_SECS: u64 = 5;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// HTTP client for the remote store.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    rate_limit_backoff: Duration,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limit_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{}/tables/{}/{}", self.base_url, table, id),
            None => format!("{}/tables/{}", self.base_url, table),
        }
    }

    fn graph_url(&self, family_id: &str) -> String {
        format!("{}/families/{}/graph", self.base_url, family_id)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status() == StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Send a request, backing off exponentially while the server rate-limits us.
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Response, ApiError> {
        let mut retries = 0;
        let mut backoff = self.rate_limit_backoff;

        loop {
            let mut request: RequestBuilder = self.client.request(method.clone(), url);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    /// Parse a response body as JSON, treating an empty body as null.
    async fn json_body(response: Response, url: &str) -> Result<Value, ApiError> {
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", url, e)))
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn insert(&self, table: &str, data: &Value) -> Result<Value, ApiError> {
        let url = self.table_url(table, None);
        match self.send(Method::POST, &url, Some(data)).await {
            Ok(response) => {
                debug!(table, "Inserted remote row");
                Self::json_body(response, &url).await
            }
            // Rows carry client-generated ids, so a conflict means an earlier
            // attempt already landed, e.g. before a crash
            Err(ApiError::Conflict(body)) => {
                debug!(table, body = %body, "Remote row already present");
                Ok(Value::Null)
            }
            Err(e) => Err(e),
        }
    }

    async fn update(&self, table: &str, id: &str, data: &Value) -> Result<Value, ApiError> {
        let url = self.table_url(table, Some(id));
        let response = self.send(Method::PATCH, &url, Some(data)).await?;
        debug!(table, id, "Updated remote row");
        Self::json_body(response, &url).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), ApiError> {
        let url = self.table_url(table, Some(id));
        match self.send(Method::DELETE, &url, None).await {
            Ok(_) => {
                debug!(table, id, "Deleted remote row");
                Ok(())
            }
            // Already gone remotely, e.g. removed by a server-side cascade
            Err(ApiError::NotFound(_)) => {
                debug!(table, id, "Remote row already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_graph(&self, family_id: &str) -> Result<Option<FamilyGraph>, ApiError> {
        let url = self.graph_url(family_id);
        match self.send(Method::GET, &url, None).await {
            Ok(response) => {
                let graph = response.json().await?;
                Ok(Some(graph))
            }
            Err(ApiError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl NetworkMonitor for HttpRemote {
    async fn is_reachable(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .send()
            .await
        {
            // A failing health endpoint counts as offline; 4xx still proves the host answers
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                debug!(error = %e, "Reachability probe failed");
                false
            }
        }
    }
}

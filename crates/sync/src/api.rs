//! REST client for the scan snapshot endpoints.
//!
//! [`SnapshotSource`] is what the poll channel depends on; [`ScanApi`]
//! implements it over HTTP with [`reqwest`].

use async_trait::async_trait;

use scanwatch_core::{JobId, JobSnapshot};

/// Result of fetching one job's snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Found(JobSnapshot),
    /// The server does not know this job id.
    NotFound,
}

/// Where authoritative job snapshots come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_snapshot(&self, job_id: &JobId) -> Result<PollOutcome, ApiError>;

    /// Every job visible to the caller, for list views.
    async fn fetch_all(&self) -> Result<Vec<JobSnapshot>, ApiError>;
}

/// HTTP client for the scan API.
pub struct ScanApi {
    client: reqwest::Client,
    api_url: String,
}

/// Errors from the snapshot REST layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, decode).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code other than 404.
    #[error("Scan API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl ScanApi {
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8000/api`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// `GET /scans/{id}`. A 404 is a normal outcome, not an error.
    pub async fn get_scan(&self, job_id: &str) -> Result<PollOutcome, ApiError> {
        let response = self
            .client
            .get(format!("{}/scans/{}", self.api_url, job_id))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(PollOutcome::NotFound);
        }
        Ok(PollOutcome::Found(Self::parse_response(response).await?))
    }

    /// `GET /scans`.
    pub async fn list_scans(&self) -> Result<Vec<JobSnapshot>, ApiError> {
        let response = self
            .client
            .get(format!("{}/scans", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl SnapshotSource for ScanApi {
    async fn fetch_snapshot(&self, job_id: &JobId) -> Result<PollOutcome, ApiError> {
        self.get_scan(job_id).await
    }

    async fn fetch_all(&self) -> Result<Vec<JobSnapshot>, ApiError> {
        self.list_scans().await
    }
}

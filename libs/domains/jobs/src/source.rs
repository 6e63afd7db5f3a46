//! Data sources producing listing chunks.

use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_parse, env_required};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domains::ListingDomain;
use crate::error::{JobError, JobResult};

/// One chunk of items, plus the overall count when the source knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPage<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// Domain persistence seen by a listing processor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChunkSource<D: ListingDomain>: Send + Sync {
    /// Items `[offset, offset + limit)` of the user's result set.
    async fn fetch_chunk(
        &self,
        user_id: &str,
        params: &D::Params,
        offset: u64,
        limit: u64,
    ) -> JobResult<ChunkPage<D::Item>>;
}

/// Internal data API connection settings.
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Bearer token for the internal API
    pub token: Option<String>,
}

impl HttpSourceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(10),
            token: None,
        }
    }
}

impl FromEnv for HttpSourceConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(env_required("CORE_API_URL")?);
        config.timeout = Duration::from_millis(env_parse("CORE_API_TIMEOUT_MS", 10_000u64)?);
        config.token = std::env::var("CORE_API_TOKEN").ok().filter(|t| !t.is_empty());
        Ok(config)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkRequest<'a, P> {
    user_id: &'a str,
    offset: u64,
    limit: u64,
    params: &'a P,
}

/// [`ChunkSource`] over the core API's internal endpoints.
///
/// `POST {base_url}{D::SOURCE_PATH}` with `{userId, offset, limit, params}`.
#[derive(Clone)]
pub struct HttpChunkSource {
    client: Client,
    config: HttpSourceConfig,
}

impl HttpChunkSource {
    pub fn new(config: HttpSourceConfig) -> JobResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| JobError::upstream_permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

/// 5xx, 408 and 429 are worth retrying; any other rejection is final.
fn classify_status(status: StatusCode, body: &str) -> JobError {
    let message = format!("data API responded {status}: {body}");
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
        JobError::upstream_transient(message)
    } else {
        JobError::upstream_permanent(message)
    }
}

fn classify_transport(err: reqwest::Error) -> JobError {
    if err.is_decode() || err.is_builder() {
        JobError::upstream_permanent(err.to_string())
    } else {
        JobError::upstream_transient(err.to_string())
    }
}

#[async_trait]
impl<D: ListingDomain> ChunkSource<D> for HttpChunkSource {
    async fn fetch_chunk(
        &self,
        user_id: &str,
        params: &D::Params,
        offset: u64,
        limit: u64,
    ) -> JobResult<ChunkPage<D::Item>> {
        let url = format!("{}{}", self.config.base_url, D::SOURCE_PATH);
        debug!(url = %url, offset, limit, domain = D::NAME, "Fetching chunk");

        let mut request = self.client.post(&url).json(&ChunkRequest {
            user_id,
            offset,
            limit,
            params,
        });
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %url, status = %status, domain = D::NAME, "Data API rejected chunk request");
            return Err(classify_status(status, &body));
        }

        response.json::<ChunkPage<D::Item>>().await.map_err(classify_transport)
    }
}

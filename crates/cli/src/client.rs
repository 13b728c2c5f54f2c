//! API client for the telemetry gate admin endpoints

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use telemetry_lib::LimiterConfig;
use thiserror::Error;
use url::Url;

/// Failures reported by the gate itself
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("admin token missing or rejected (set --token or TGCTL_TOKEN)")]
    Unauthorized,

    #[error("refused by the gate: {0}")]
    Forbidden(String),

    #[error("API error ({status}): {message}")]
    Api { status: StatusCode, message: String },
}

/// API client for the gate
pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .context("Failed to send request")?;

        Self::parse(response).await
    }

    /// Make a POST request with JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .authorized(self.client.post(url).json(body))
            .send()
            .await
            .context("Failed to send request")?;

        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            let err = match status {
                StatusCode::UNAUTHORIZED => ClientError::Unauthorized,
                StatusCode::FORBIDDEN => ClientError::Forbidden(message),
                _ => ClientError::Api { status, message },
            };
            return Err(err.into());
        }

        response.json().await.context("Failed to parse response")
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStats {
    pub count: usize,
    pub error_count: usize,
    pub rejected_count: usize,
    pub error_rate: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    pub route: String,
    pub classification: String,
    pub stats: EndpointStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterTable {
    pub default: LimiterConfig,
    #[serde(default)]
    pub routes: BTreeMap<String, LimiterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    pub enabled: bool,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub tracked_keys: usize,
    #[serde(default)]
    pub top_blocked_keys: Vec<(String, u64)>,
    #[serde(default)]
    pub top_endpoints: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionSummary {
    pub cart_additions: usize,
    pub cart_removals: usize,
    pub checkout_starts: usize,
    pub checkout_completions: usize,
    pub conversion_rate: f64,
    pub average_order_value: f64,
    pub cart_abandonment_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminReport {
    pub generated_at: i64,
    pub environment: String,
    pub routes: Vec<RouteStatus>,
    pub limits: LimiterTable,
    pub limiter: LimiterStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion: Option<ConversionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub route: String,
    pub classification: String,
    pub current: LimiterConfig,
    pub recommended: LimiterConfig,
    pub reason: String,
    pub stats: EndpointStats,
}

impl Recommendation {
    pub fn changes_limit(&self) -> bool {
        self.current != self.recommended
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub dry_run: bool,
    pub applied: Vec<Recommendation>,
    pub limits: LimiterTable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    pub cleared: usize,
    pub cleared_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

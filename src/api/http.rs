//! HTTP transport using reqwest.

use crate::api::transport::{ApiRequest, ApiResponse, Method, RequestBody, RequestTransport};
use crate::config::ServerConfig;
use crate::error::{CoachError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Supplies the bearer token for API calls. Authentication itself happens elsewhere.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Token fixed at startup (config file or `COACHSH_TOKEN`).
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.trim().is_empty()))
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// REST transport over reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl ReqwestTransport {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoachError::Other(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            tokens,
        })
    }

    pub fn from_config(server: &ServerConfig) -> Result<Self> {
        Self::new(
            server.api_url.clone(),
            server.request_timeout(),
            Arc::new(StaticToken::new(server.token.clone())),
        )
    }

    fn is_absolute(path: &str) -> bool {
        path.starts_with("http://") || path.starts_with("https://")
    }

    /// Resolve a request path against the API base URL.
    pub fn url_for(&self, path: &str) -> String {
        if Self::is_absolute(path) {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl RequestTransport for ReqwestTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        let url = self.url_for(&request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        // Only our own API gets the token; absolute URLs may point at a CDN.
        if !Self::is_absolute(&request.path)
            && let Some(token) = self.tokens.token()
        {
            builder = builder.bearer_auth(token);
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart {
                field,
                file_name,
                mime_type,
                data,
            } => {
                let part = reqwest::multipart::Part::bytes(data)
                    .file_name(file_name)
                    .mime_str(&mime_type)
                    .map_err(|e| CoachError::RemoteRequest {
                        status: None,
                        message: format!("Invalid upload content type {mime_type}: {e}"),
                    })?;
                builder.multipart(reqwest::multipart::Form::new().part(field, part))
            }
        };

        tracing::debug!(method = %request.method, url = %url, "api request");
        let response = builder.send().await.map_err(|e| CoachError::RemoteRequest {
            status: e.status().map(|s| s.as_u16()),
            message: format!("{} {} failed: {e}", request.method, url),
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| CoachError::RemoteRequest {
                status: Some(status),
                message: format!("Failed to read response body: {e}"),
            })?
            .to_vec();

        tracing::debug!(status, bytes = body.len(), "api response");
        Ok(ApiResponse {
            status,
            content_type,
            body,
        })
    }
}

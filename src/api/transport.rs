//! Request/response transport abstraction for the REST backend.

use crate::error::{CoachError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    /// Single-file multipart form
    Multipart {
        field: String,
        file_name: String,
        mime_type: String,
        data: Vec<u8>,
    },
}

/// One REST call. `path` is relative to the API base URL unless it is an
/// absolute `http(s)://` URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            ..Self::get(path)
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_json(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn with_file(
        mut self,
        field: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.body = RequestBody::Multipart {
            field: field.into(),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data,
        };
        self
    }

    /// JSON body, if any. Mostly useful in tests.
    pub fn json_body(&self) -> Option<&serde_json::Value> {
        match &self.body {
            RequestBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: u16, content_type: Option<&str>, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: content_type.map(str::to_string),
            body,
        }
    }

    /// JSON response with `application/json` content type.
    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self::new(status, Some("application/json"), value.to_string().into_bytes())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Human-readable error text: FastAPI's `detail` field when present,
    /// otherwise the (truncated) body.
    pub fn error_message(&self) -> String {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&self.body)
            && let Some(detail) = value.get("detail")
        {
            return match detail.as_str() {
                Some(text) => text.to_string(),
                None => detail.to_string(),
            };
        }
        let text = String::from_utf8_lossy(&self.body);
        let text = text.trim();
        if text.is_empty() {
            format!("HTTP {}", self.status)
        } else {
            text.chars().take(200).collect()
        }
    }

    /// Turn a non-2xx response into `RemoteRequest`.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(CoachError::RemoteRequest {
                status: Some(self.status),
                message: self.error_message(),
            })
        }
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| CoachError::RemoteRequest {
            status: Some(self.status),
            message: format!("Unexpected response body: {}", e),
        })
    }
}

/// Executes REST calls against the backend.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    /// Perform one request. Network failures are `RemoteRequest { status: None }`;
    /// HTTP error statuses are returned as responses, not errors.
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse>;
}

#[derive(Debug, Clone)]
enum MockReply {
    Response(ApiResponse),
    NetworkError(String),
}

#[derive(Default)]
struct MockRoutes {
    routes: HashMap<(Method, String), VecDeque<MockReply>>,
    requests: Vec<ApiRequest>,
}

/// Mock request transport for testing
///
/// Replies are registered per method and path. Several replies for one route
/// are used in order and the last one repeats. Unregistered routes answer 404.
#[derive(Clone, Default)]
pub struct MockRequestTransport {
    inner: Arc<Mutex<MockRoutes>>,
}

impl MockRequestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reply for `method path`.
    pub fn respond(&self, method: Method, path: &str, response: ApiResponse) -> &Self {
        self.push(method, path, MockReply::Response(response));
        self
    }

    /// Register a network failure for `method path`.
    pub fn fail(&self, method: Method, path: &str, message: &str) -> &Self {
        self.push(method, path, MockReply::NetworkError(message.to_string()));
        self
    }

    /// Every request executed so far.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.inner
            .lock()
            .map(|r| r.requests.clone())
            .unwrap_or_default()
    }

    /// Requests to one path, in order.
    pub fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    fn push(&self, method: Method, path: &str, reply: MockReply) {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .routes
                .entry((method, path.to_string()))
                .or_default()
                .push_back(reply);
        }
    }
}

#[async_trait]
impl RequestTransport for MockRequestTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        let reply = {
            let mut inner = self.inner.lock().map_err(|e| CoachError::Other(e.to_string()))?;
            inner.requests.push(request.clone());
            match inner.routes.get_mut(&(request.method, request.path.clone())) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply {
            Some(MockReply::Response(response)) => Ok(response),
            Some(MockReply::NetworkError(message)) => Err(CoachError::RemoteRequest {
                status: None,
                message,
            }),
            None => Ok(ApiResponse::json(
                404,
                serde_json::json!({"detail": "Not Found"}),
            )),
        }
    }
}

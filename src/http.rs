//! Transport collaborator and the reqwest-backed `HttpService`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request handed to a transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpRequest {
    pub uri: String,
    pub method: Method,
    /// JSON object of query parameters.
    pub query: Value,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
    /// Transport-specific options (e.g. `timeout_ms`).
    pub options: Value,
}

impl HttpRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method,
            query: Value::Object(Default::default()),
            body: None,
            headers: BTreeMap::new(),
            options: Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub data: Value,
    pub status: u16,
}

/// Executes requests for request actions.
///
/// Cancellation is handled by the engine racing the returned future, so
/// implementations only need to resolve or fail.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// reqwest-backed transport with a base URL and JSON bodies.
///
/// Non-2xx responses become `TransportError` with the HTTP status, a message
/// read from the error body and an optional business code.
pub struct HttpService {
    client: reqwest::Client,
    base_url: String,
    headers: BTreeMap<String, String>,
    message_field: String,
    business_code_field: Option<String>,
}

impl HttpService {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::new(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            headers: BTreeMap::new(),
            message_field: "message".to_string(),
            business_code_field: None,
        })
    }

    /// Header sent with every request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Error body field holding a human-readable message.
    pub fn message_field(mut self, field: impl Into<String>) -> Self {
        self.message_field = field.into();
        self
    }

    /// Error body field holding an application-level error code.
    pub fn business_code_field(mut self, field: impl Into<String>) -> Self {
        self.business_code_field = Some(field.into());
        self
    }

    fn url(&self, request: &HttpRequest) -> Result<reqwest::Url, TransportError> {
        let raw = if request.uri.starts_with("http://") || request.uri.starts_with("https://") {
            request.uri.clone()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                request.uri.trim_start_matches('/')
            )
        };
        let mut url = reqwest::Url::parse(&raw)
            .map_err(|e| TransportError::new(format!("Invalid URL '{}': {}", raw, e)))?;
        if let Some(params) = request.query.as_object() {
            if !params.is_empty() {
                let mut pairs = url.query_pairs_mut();
                for (name, value) in params {
                    match value {
                        Value::Null => {}
                        Value::String(s) => {
                            pairs.append_pair(name, s);
                        }
                        other => {
                            pairs.append_pair(name, &other.to_string());
                        }
                    }
                }
            }
        }
        Ok(url)
    }

    fn error_from_body(&self, status: u16, body: Value) -> TransportError {
        let message = body
            .get(&self.message_field)
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .or_else(|| body.get("error").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| format!("HTTP {}", status));
        let mut err = TransportError::new(message).with_status(status);
        if let Some(field) = &self.business_code_field {
            if let Some(code) = body.get(field) {
                let code = match code {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                err = err.with_business_code(code);
            }
        }
        err.with_response(body)
    }
}

fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[async_trait]
impl Transport for HttpService {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = self.url(&request)?;
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, url);
        for (name, value) in self.headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.options.get("timeout_ms").and_then(|t| t.as_u64()) {
            builder = builder.timeout(Duration::from_millis(timeout));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::warn!(uri = %request.uri, error = %e, "HTTP request failed");
            TransportError::new(e.to_string())
        })?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::new(e.to_string()).with_status(status))?;
        let data = parse_body(&bytes);

        if !(200..300).contains(&status) {
            return Err(self.error_from_body(status, data));
        }
        Ok(HttpResponse { data, status })
    }
}

//! HTTP invoker for JSON analysis endpoints
//!
//! POSTs each payload as a JSON body, authenticates with a single secret
//! header and maps HTTP status codes onto [`InvokeError`] variants:
//! - 429 → `RateLimited` (with `Retry-After` when present)
//! - 408, 5xx → `Server`
//! - any other 4xx → `Rejected`

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::{InvokeError, InvokeResponse, InvokeResult, Invoker};

/// HTTP connect timeout (seconds) - time to establish TCP connection
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default overall request timeout. The dispatcher applies its own per-call
/// timeout on top; this one only guards direct use of the invoker.
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 120;

/// JSON pointer to the cost field in Messages-style responses
pub const DEFAULT_COST_POINTER: &str = "/usage/output_tokens";

/// Error bodies are truncated to this many characters before being stored
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Errors raised while configuring an [`HttpInvoker`]
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// Header name or value is not valid HTTP
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Endpoint URL cannot be parsed
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// HTTP client construction failed
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Secret header used to authenticate against the service.
///
/// Read once at startup. `Debug` output is redacted and the header value is
/// marked sensitive so it never reaches logs.
#[derive(Clone)]
pub struct ApiCredentials {
    header: HeaderName,
    value: HeaderValue,
}

impl ApiCredentials {
    /// Build credentials from a header name and secret
    pub fn new(header: &str, secret: impl AsRef<str>) -> Result<Self, SetupError> {
        let header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|e| SetupError::InvalidHeader(format!("{header}: {e}")))?;
        let mut value = HeaderValue::from_str(secret.as_ref())
            .map_err(|_| SetupError::InvalidHeader(format!("{header}: value is not valid")))?;
        value.set_sensitive(true);
        Ok(Self { header, value })
    }

    /// Header the secret is sent in
    pub fn header(&self) -> &HeaderName {
        &self.header
    }
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("header", &self.header)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Builder for [`HttpInvoker`]
#[derive(Debug)]
pub struct HttpInvokerBuilder {
    endpoint: String,
    credentials: ApiCredentials,
    timeout: Duration,
    cost_pointer: String,
    headers: Vec<(String, String)>,
    estimated_cost: Option<u64>,
}

impl HttpInvokerBuilder {
    /// Overall request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// JSON pointer to the cost field of a successful response
    pub fn cost_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.cost_pointer = pointer.into();
        self
    }

    /// Additional static header sent with every request
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Fixed cost reserved per call
    pub fn estimated_cost(mut self, cost: u64) -> Self {
        self.estimated_cost = Some(cost);
        self
    }

    /// Build the invoker
    pub fn build(self) -> Result<HttpInvoker, SetupError> {
        let endpoint = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| SetupError::InvalidEndpoint(format!("{}: {e}", self.endpoint)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SetupError::InvalidHeader(format!("{name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SetupError::InvalidHeader(format!("{name}: {e}")))?;
            headers.insert(name, value);
        }
        headers.insert(
            self.credentials.header.clone(),
            self.credentials.value.clone(),
        );

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(self.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| SetupError::Client(e.to_string()))?;

        Ok(HttpInvoker {
            client,
            endpoint,
            timeout: self.timeout,
            cost_pointer: self.cost_pointer,
            estimated_cost: self.estimated_cost,
        })
    }
}

/// [`Invoker`] that POSTs payloads to a JSON HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    client: Client,
    endpoint: reqwest::Url,
    timeout: Duration,
    cost_pointer: String,
    estimated_cost: Option<u64>,
}

impl HttpInvoker {
    /// Start building an invoker for `endpoint`
    pub fn builder(endpoint: impl Into<String>, credentials: ApiCredentials) -> HttpInvokerBuilder {
        HttpInvokerBuilder {
            endpoint: endpoint.into(),
            credentials,
            timeout: Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS),
            cost_pointer: DEFAULT_COST_POINTER.to_string(),
            headers: Vec::new(),
            estimated_cost: None,
        }
    }

    /// Target endpoint
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    fn map_transport_error(&self, err: reqwest::Error) -> InvokeError {
        if err.is_timeout() {
            InvokeError::Timeout(self.timeout)
        } else if err.is_builder() {
            InvokeError::Malformed(err.to_string())
        } else {
            InvokeError::Network(err.to_string())
        }
    }
}

#[async_trait::async_trait]
impl Invoker for HttpInvoker {
    async fn invoke(&self, payload: &Value) -> InvokeResult<InvokeResponse> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(payload)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        let text = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !status.is_success() {
            let err = error_from_status(status, &text, retry_after);
            debug!(status = status.as_u16(), error = %err, "Analysis call failed");
            return Err(err);
        }

        match serde_json::from_str::<Value>(&text) {
            Ok(body) => {
                let cost_units = extract_cost(&body, &self.cost_pointer);
                if cost_units.is_none() {
                    debug!(pointer = %self.cost_pointer, "Response carries no cost field");
                }
                Ok(InvokeResponse::new(body, cost_units))
            }
            Err(e) => {
                warn!(error = %e, "Response is not valid JSON, keeping raw text");
                Ok(InvokeResponse::degraded(text, None))
            }
        }
    }

    fn estimate_cost(&self, _payload: &Value) -> Option<u64> {
        self.estimated_cost
    }
}

/// Map a non-success status and its body onto the error taxonomy
pub fn error_from_status(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> InvokeError {
    let message = truncate(body.trim(), MAX_ERROR_BODY_CHARS);
    let code = status.as_u16();
    if status == StatusCode::TOO_MANY_REQUESTS {
        InvokeError::RateLimited {
            retry_after,
            message,
        }
    } else if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        InvokeError::Server {
            status: code,
            message,
        }
    } else {
        InvokeError::Rejected {
            status: code,
            message,
        }
    }
}

/// Parse a `Retry-After` header given in delta-seconds.
/// HTTP-date values are ignored; the retry policy's own backoff applies then.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn extract_cost(body: &Value, pointer: &str) -> Option<u64> {
    body.pointer(pointer).and_then(Value::as_u64)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

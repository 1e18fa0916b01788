//! Conveyor action service client.
//!
//! Every block type maps to one logical action endpoint behind a uniform
//! request/response contract: `POST <base>/v1/actions/<endpoint>` with a JSON
//! body of type-specific fields plus a process-unique `request_id`, answered
//! by a JSON success payload or a failure status. This module provides:
//!
//! - Constructing an HTTP client with sensible defaults
//! - Discovering credentials from `CONVEYOR_ACTIONS_TOKEN`
//! - Validating `CONVEYOR_ACTIONS_BASE` for safety
//! - Issuing action calls and partitioning transport, status, and payload
//!
//! The primary entry point is [`ActionClient`]. Create an instance via
//! [`ActionClient::from_env`], then issue calls with [`ActionClient::invoke`].
//!
//! # Example
//!
//! ```ignore
//! use conveyor_api::{ActionClient, ActionEndpoint};
//! use serde_json::Map;
//!
//! # async fn demo() -> Result<(), conveyor_api::ActionError> {
//! let client = ActionClient::from_env()?;
//! let mut fields = Map::new();
//! fields.insert("prompt".into(), "Summarize the report".into());
//! let outcome = client.invoke(ActionEndpoint::Model, fields, 1, None).await?;
//! println!("payload: {}", outcome.payload);
//! # Ok(())
//! # }
//! ```

use std::env;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode, header};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Environment variable overriding the action service base URL.
pub const ACTIONS_BASE_ENV: &str = "CONVEYOR_ACTIONS_BASE";

/// Environment variable supplying a bearer token for the action service.
pub const ACTIONS_TOKEN_ENV: &str = "CONVEYOR_ACTIONS_TOKEN";

/// Default base URL: a locally running action service.
pub const DEFAULT_ACTIONS_BASE: &str = "http://localhost:8787";

/// Baseline transport allowance for a single action call.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Hostnames allowed with any scheme; everything else must use HTTPS.
const LOCALHOST_DOMAINS: &[&str] = &["localhost", "127.0.0.1"];

/// Maximum length of a response body snippet carried in an error.
const ERROR_SNIPPET_LEN: usize = 200;

/// Logical endpoints, one per block type that performs an external action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionEndpoint {
    Model,
    WebFetch,
    Code,
    Message,
    Search,
    DocDiff,
    Chart,
    Webhook,
}

impl ActionEndpoint {
    /// The path component under the action service's versioned prefix.
    pub fn path(self) -> &'static str {
        match self {
            ActionEndpoint::Model => "/v1/actions/model",
            ActionEndpoint::WebFetch => "/v1/actions/web-fetch",
            ActionEndpoint::Code => "/v1/actions/code",
            ActionEndpoint::Message => "/v1/actions/message",
            ActionEndpoint::Search => "/v1/actions/search",
            ActionEndpoint::DocDiff => "/v1/actions/doc-diff",
            ActionEndpoint::Chart => "/v1/actions/chart",
            ActionEndpoint::Webhook => "/v1/actions/webhook",
        }
    }
}

impl std::fmt::Display for ActionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionEndpoint::Model => "model",
            ActionEndpoint::WebFetch => "web-fetch",
            ActionEndpoint::Code => "code",
            ActionEndpoint::Message => "message",
            ActionEndpoint::Search => "search",
            ActionEndpoint::DocDiff => "doc-diff",
            ActionEndpoint::Chart => "chart",
            ActionEndpoint::Webhook => "webhook",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by action calls.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The request never produced an HTTP response.
    #[error("network error calling {endpoint}: {source}")]
    Transport {
        endpoint: ActionEndpoint,
        #[source]
        source: reqwest::Error,
    },
    /// The service answered with a non-success status.
    #[error("action {endpoint} failed with HTTP {status}: {detail}")]
    Status {
        endpoint: ActionEndpoint,
        status: u16,
        detail: String,
    },
    /// The configured base URL is unusable.
    #[error("invalid action base URL '{base}': {reason}")]
    InvalidBase { base: String, reason: String },
}

/// Result of a successful action call.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionOutcome {
    /// Echo of the request id the call was issued with.
    pub request_id: u64,
    /// Parsed JSON payload, or the raw body as a string when not JSON.
    pub payload: Value,
}

/// Thin wrapper around a configured `reqwest::Client` for action calls.
#[derive(Debug, Clone)]
pub struct ActionClient {
    pub base_url: String,
    pub http: Client,
}

impl ActionClient {
    /// Construct a client for the given base URL.
    ///
    /// Localhost bases may use any scheme; anything else must be HTTPS. A
    /// bearer token from `CONVEYOR_ACTIONS_TOKEN` is attached when present.
    pub fn new(base_url: &str) -> Result<Self, ActionError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        validate_base_url(&base_url)?;

        let mut default_headers = header::HeaderMap::new();
        if let Ok(token) = env::var(ACTIONS_TOKEN_ENV)
            && !token.trim().is_empty()
        {
            let bearer = format!("Bearer {}", token.trim());
            if let Ok(value) = header::HeaderValue::from_str(&bearer) {
                default_headers.insert(header::AUTHORIZATION, value);
            }
        }

        let http = Client::builder()
            .default_headers(default_headers)
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|error| ActionError::InvalidBase {
                base: base_url.clone(),
                reason: format!("could not build HTTP client: {error}"),
            })?;

        Ok(Self { base_url, http })
    }

    /// Construct a client from `CONVEYOR_ACTIONS_BASE`, falling back to the
    /// local default.
    pub fn from_env() -> Result<Self, ActionError> {
        let base = env::var(ACTIONS_BASE_ENV).unwrap_or_else(|_| DEFAULT_ACTIONS_BASE.into());
        Self::new(&base)
    }

    /// Issue one action call.
    ///
    /// `fields` carries the type-specific request body; `request_id` is
    /// inserted alongside them. `wait` widens the transport allowance for
    /// actions the caller knows are slow (multi-page fetches); it is an
    /// allowance, not a retry or polling schedule. The client never retries.
    pub async fn invoke(
        &self,
        endpoint: ActionEndpoint,
        mut fields: Map<String, Value>,
        request_id: u64,
        wait: Option<Duration>,
    ) -> Result<ActionOutcome, ActionError> {
        let start = Instant::now();
        fields.insert("request_id".into(), Value::from(request_id));
        let url = format!("{}{}", self.base_url, endpoint.path());
        debug!(
            endpoint = %endpoint,
            request_id,
            field_count = fields.len(),
            "action request started"
        );

        let mut builder = self.http.post(&url).json(&Value::Object(fields));
        if let Some(wait) = wait {
            builder = builder.timeout(wait.max(DEFAULT_TIMEOUT));
        }

        let response = builder
            .send()
            .await
            .map_err(|source| ActionError::Transport { endpoint, source })?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!(
                endpoint = %endpoint,
                request_id,
                status = %status,
                duration_ms = start.elapsed().as_millis(),
                "action request failed"
            );
            return Err(ActionError::Status {
                endpoint,
                status: status.as_u16(),
                detail: snippet(&body),
            });
        }

        debug!(
            endpoint = %endpoint,
            request_id,
            status = %status,
            duration_ms = start.elapsed().as_millis(),
            "action request completed"
        );
        Ok(ActionOutcome {
            request_id,
            payload: parse_payload(&body, status),
        })
    }
}

/// Validate that a base URL is acceptable for use by the client.
///
/// Rules:
/// - `localhost` or `127.0.0.1`: any scheme is allowed
/// - otherwise: the scheme must be HTTPS
fn validate_base_url(base: &str) -> Result<(), ActionError> {
    let parsed = Url::parse(base).map_err(|error| ActionError::InvalidBase {
        base: base.to_string(),
        reason: error.to_string(),
    })?;

    let host = parsed.host_str().ok_or_else(|| ActionError::InvalidBase {
        base: base.to_string(),
        reason: "missing host".into(),
    })?;

    if LOCALHOST_DOMAINS.iter().any(|&allowed| host.eq_ignore_ascii_case(allowed)) {
        return Ok(());
    }

    if parsed.scheme() != "https" {
        return Err(ActionError::InvalidBase {
            base: base.to_string(),
            reason: format!("non-localhost hosts must use https, got '{}://'", parsed.scheme()),
        });
    }

    Ok(())
}

fn parse_payload(body: &str, status: StatusCode) -> Value {
    if body.trim().is_empty() {
        // Some actions (message delivery, webhooks) answer with no body.
        return Value::String(status.to_string());
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= ERROR_SNIPPET_LEN {
        return trimmed.to_string();
    }
    let truncated: String = trimmed.chars().take(ERROR_SNIPPET_LEN.saturating_sub(3)).collect();
    format!("{}...", truncated.trim_end())
}

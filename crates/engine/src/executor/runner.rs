//! The action invocation seam.
//!
//! The engine owns sequencing and result routing; an [`ActionRunner`] owns
//! transport. Swapping the runner is how tests and offline runs avoid the
//! network.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use conveyor_api::{ActionClient, ActionEndpoint, ActionError};
use conveyor_util::next_request_id;

use super::prepare::PreparedBlock;

/// How prepared blocks reach their external actions.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Invoke one action and return its raw success payload.
    async fn invoke(
        &self,
        endpoint: ActionEndpoint,
        fields: Map<String, Value>,
        wait: Option<Duration>,
    ) -> Result<Value, ActionError>;
}

/// Invokes actions over HTTP against the actions service.
pub struct HttpActionRunner {
    client: ActionClient,
}

impl HttpActionRunner {
    pub fn new(client: ActionClient) -> Self {
        Self { client }
    }

    pub fn from_env() -> Result<Self, ActionError> {
        Ok(Self {
            client: ActionClient::from_env()?,
        })
    }

    /// Point the runner at an explicit service base URL.
    pub fn with_base_url(base_url: &str) -> Result<Self, ActionError> {
        Ok(Self {
            client: ActionClient::new(base_url)?,
        })
    }
}

#[async_trait]
impl ActionRunner for HttpActionRunner {
    async fn invoke(
        &self,
        endpoint: ActionEndpoint,
        fields: Map<String, Value>,
        wait: Option<Duration>,
    ) -> Result<Value, ActionError> {
        let outcome = self.client.invoke(endpoint, fields, next_request_id(), wait).await?;
        Ok(outcome.payload)
    }
}

/// Echoes a deterministic payload without leaving the process. Used for
/// previews, offline runs, and unit tests that do not need a real service.
pub struct NoopActionRunner;

#[async_trait]
impl ActionRunner for NoopActionRunner {
    async fn invoke(
        &self,
        endpoint: ActionEndpoint,
        fields: Map<String, Value>,
        _wait: Option<Duration>,
    ) -> Result<Value, ActionError> {
        Ok(json!({
            "status": "ok",
            "endpoint": endpoint.to_string(),
            "echo": Value::Object(fields),
        }))
    }
}

/// Invoke a prepared block's action and reduce the payload for storage.
///
/// Check-in blocks never reach this; the run driver handles them without an
/// action call, and a prepared check-in short-circuits to empty output here.
pub async fn execute_prepared(prepared: &PreparedBlock, runner: &dyn ActionRunner) -> Result<String, ActionError> {
    let Some(endpoint) = prepared.endpoint else {
        return Ok(String::new());
    };
    let payload = runner.invoke(endpoint, prepared.fields.clone(), prepared.wait).await?;
    Ok(display_payload(&payload))
}

/// Reduce a type-specific success payload to the single display string that
/// gets stored. Well-known text fields win; anything else renders as JSON.
pub fn display_payload(payload: &Value) -> String {
    const TEXT_FIELDS: [&str; 6] = ["text", "result", "summary", "output", "message", "body"];
    match payload {
        Value::String(text) => text.clone(),
        Value::Object(fields) => {
            for name in TEXT_FIELDS {
                if let Some(Value::String(text)) = fields.get(name) {
                    return text.clone();
                }
            }
            payload.to_string()
        }
        other => other.to_string(),
    }
}

//! Client for the downstream task-creation API and the handler built on it.
//!
//! `TaskClient` posts task parameters as JSON with a bearer token.
//! `ForwardingHandler` turns a queued webhook into task parameters, filling
//! in per-route defaults, and submits them. Source-specific field mapping is
//! left to dedicated handlers.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{QueueError, Result},
    handler::{HandlerContext, HandlerError, WebhookHandler},
};

/// Default task API request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Configuration for the task API client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskClientConfig {
    /// Task creation endpoint.
    pub url: String,
    /// Bearer token sent with every request.
    pub token: String,
    /// Request timeout.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl TaskClientConfig {
    /// Creates a configuration with the default timeout and user agent.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("hookline/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// HTTP client for the task-creation API.
#[derive(Debug, Clone)]
pub struct TaskClient {
    client: reqwest::Client,
    config: TaskClientConfig,
}

impl TaskClient {
    /// Creates a task client.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Configuration` if the URL is empty or the HTTP
    /// client cannot be built.
    pub fn new(config: TaskClientConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(QueueError::configuration("task url is required"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| QueueError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Submits task parameters and returns the API's JSON answer.
    ///
    /// An empty response body yields `Value::Null`.
    ///
    /// # Errors
    ///
    /// - `Timeout` if the request exceeds the configured timeout
    /// - `Network` for connection failures or an unparseable answer
    /// - `TaskRejected` for any non-2xx status, carrying the body text
    pub async fn create_task(&self, params: &Value) -> Result<Value> {
        let span = info_span!("create_task", url = %self.config.url);

        async move {
            let response = self
                .client
                .post(&self.config.url)
                .bearer_auth(&self.config.token)
                .json(params)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        QueueError::timeout(self.config.timeout.as_secs())
                    } else {
                        QueueError::network(e.to_string())
                    }
                })?;

            let status = response.status();
            let body = response.bytes().await.map_err(|e| QueueError::network(e.to_string()))?;

            if !status.is_success() {
                let text = String::from_utf8_lossy(&body).into_owned();
                warn!(status = status.as_u16(), "task request rejected");
                return Err(QueueError::task_rejected(status.as_u16(), text));
            }

            debug!(status = status.as_u16(), "task created");

            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(Value::Null);
            }
            serde_json::from_slice(&body)
                .map_err(|e| QueueError::network(format!("invalid task response: {e}")))
        }
        .instrument(span)
        .await
    }
}

/// Per-route values added to task parameters when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefaults {
    /// Tags to attach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Pipeline name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    /// Project name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Lead source label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_source: Option<String>,
}

impl TaskDefaults {
    /// Fills in every default whose key is missing from `params`.
    ///
    /// Keys already present, even with a null value, are left alone.
    pub fn apply(&self, params: &mut Map<String, Value>) {
        if let Some(tags) = &self.tags {
            params.entry("tags").or_insert_with(|| Value::from(tags.clone()));
        }
        if let Some(pipeline) = &self.pipeline {
            params.entry("pipeline").or_insert_with(|| Value::from(pipeline.clone()));
        }
        if let Some(project) = &self.project {
            params.entry("project").or_insert_with(|| Value::from(project.clone()));
        }
        if let Some(lead_source) = &self.lead_source {
            params.entry("leadSource").or_insert_with(|| Value::from(lead_source.clone()));
        }
    }
}

/// Handler that forwards the webhook body to the task API.
#[derive(Debug, Clone)]
pub struct ForwardingHandler {
    client: TaskClient,
    defaults: TaskDefaults,
}

impl ForwardingHandler {
    /// Creates a forwarding handler.
    pub fn new(client: TaskClient, defaults: TaskDefaults) -> Self {
        Self { client, defaults }
    }

    /// Builds task parameters from a queued payload.
    ///
    /// Uses the payload's `body` object when it has one, the payload itself
    /// otherwise. Non-object bodies are wrapped as `{"body": ...}`.
    pub fn task_params(&self, payload: &Value) -> Value {
        let source = match payload.get("body") {
            Some(body @ Value::Object(_)) => body,
            _ => payload,
        };

        let mut params = match source {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("body".to_string(), other.clone());
                map
            },
        };

        self.defaults.apply(&mut params);
        Value::Object(params)
    }
}

#[async_trait]
impl WebhookHandler for ForwardingHandler {
    async fn handle(
        &self,
        payload: &Value,
        ctx: &HandlerContext,
    ) -> std::result::Result<Value, HandlerError> {
        let params = self.task_params(payload);
        debug!(
            entry_id = %ctx.entry_id,
            source = %ctx.source,
            attempts = ctx.attempts,
            "forwarding webhook"
        );
        Ok(self.client.create_task(&params).await?)
    }
}

use crate::agent::{Agent, AgentDescriptor, AgentInput, AgentState, AgentStatus, StepDefinition};
use async_trait::async_trait;
use conductor_core::AgentError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

const TASK_ID_HEADER: &str = "X-Conductor-Task-Id";
const ATTEMPT_HEADER: &str = "X-Conductor-Attempt";
const STEP_HEADER: &str = "X-Conductor-Step";

/// Declarative webhook agent, as read from the `[[agents.webhooks]]` config table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookAgentConfig {
    /// Registry key.
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Reported agent version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Endpoint every execution is POSTed to.
    pub url: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,
    /// Capability tags for discovery.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Named steps for COMPLEX tasks; each step is one POST.
    #[serde(default)]
    pub steps: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl WebhookAgentConfig {
    /// Descriptor to register the agent with.
    pub fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            version: self.version.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

/// Agent that forwards each execution to an HTTP endpoint as a JSON POST.
///
/// The request body is the task payload; for workflow steps it is wrapped
/// as `{"step", "checkpoint", "payload"}`. A JSON response body becomes the
/// result. 4xx responses are permanent failures, 5xx and transport errors
/// are retryable.
pub struct WebhookAgent {
    url: String,
    headers: HashMap<String, String>,
    timeout: Duration,
    steps: Vec<String>,
    client: RwLock<Option<reqwest::Client>>,
    state: RwLock<AgentState>,
    calls: AtomicU64,
}

impl WebhookAgent {
    /// A webhook agent with default timeout and no steps.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            timeout: Duration::from_millis(default_request_timeout_ms()),
            steps: Vec::new(),
            client: RwLock::new(None),
            state: RwLock::new(AgentState::Created),
            calls: AtomicU64::new(0),
        }
    }

    /// Build an agent from its config table.
    pub fn from_config(config: &WebhookAgentConfig) -> Self {
        let mut agent = Self::new(config.url.clone()).with_timeout(Duration::from_millis(config.timeout_ms));
        agent.headers = config.headers.clone();
        agent.steps = config.steps.clone();
        agent
    }

    /// Send an extra header with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// HTTP request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Declare workflow steps, in order.
    pub fn with_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps = steps.into_iter().map(Into::into).collect();
        self
    }

    fn request_body(input: &AgentInput) -> Value {
        match &input.step {
            Some(step) => json!({
                "step": step.name,
                "checkpoint": step.checkpoint,
                "payload": input.payload,
            }),
            None => input.payload.clone(),
        }
    }
}

#[async_trait]
impl Agent for WebhookAgent {
    async fn initialize(&self, _options: &Value) -> Result<(), AgentError> {
        let parsed = reqwest::Url::parse(&self.url)
            .map_err(|e| AgentError::init(format!("invalid webhook url '{}': {e}", self.url)).non_retryable())?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AgentError::init(format!(
                    "unsupported scheme '{scheme}', only http/https allowed"
                ))
                .non_retryable());
            }
        }

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| AgentError::init(format!("failed to build HTTP client: {e}")))?;

        *self.client.write() = Some(client);
        *self.state.write() = AgentState::Ready;
        info!(url = %self.url, "Webhook agent ready");
        Ok(())
    }

    async fn execute(&self, input: AgentInput) -> Result<Value, AgentError> {
        let client = self
            .client
            .read()
            .clone()
            .ok_or_else(|| AgentError::exec("webhook agent is not initialized"))?;
        self.calls.fetch_add(1, Ordering::Relaxed);

        let mut request = client
            .post(&self.url)
            .header(TASK_ID_HEADER, input.task_id.to_string())
            .header(ATTEMPT_HEADER, input.attempt.to_string())
            .json(&Self::request_body(&input));
        if let Some(step) = input.step_name() {
            request = request.header(STEP_HEADER, step);
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::exec(format!("webhook request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AgentError::exec(format!("failed to read webhook response: {e}")))?;

        if status.is_client_error() {
            warn!(url = %self.url, status = status.as_u16(), "Webhook rejected request");
            return Err(
                AgentError::exec(format!("webhook returned {status}: {body}")).non_retryable(),
            );
        }
        if !status.is_success() {
            warn!(url = %self.url, status = status.as_u16(), "Webhook failed");
            return Err(AgentError::exec(format!("webhook returned {status}: {body}")));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }

    async fn stop(&self) -> Result<(), AgentError> {
        self.client.write().take();
        *self.state.write() = AgentState::Stopped;
        Ok(())
    }

    fn status(&self) -> AgentStatus {
        AgentStatus::new(*self.state.read()).with_details(json!({
            "url": self.url,
            "calls": self.calls.load(Ordering::Relaxed),
        }))
    }

    fn workflow_steps(&self) -> Vec<StepDefinition> {
        if self.steps.is_empty() {
            return vec![StepDefinition::new(crate::agent::DEFAULT_STEP)];
        }
        self.steps.iter().map(StepDefinition::new).collect()
    }
}

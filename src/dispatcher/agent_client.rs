//! Master -> Agent delivery client
//!
//! Assignments go out-of-band over HTTP to the Agent's task handler,
//! using the shared response envelope and the shorter outbound deadline.
//! The trait seam lets dispatcher tests swap in a recording fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain_types::{Agent, Task, TaskId};
use crate::error::{FleetError, FleetResult};

/// Body POSTed to the Agent's task handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentPayload {
    pub task_id: TaskId,
    pub task_type: String,
    pub priority: u8,
    pub config: serde_json::Value,
}

impl AssignmentPayload {
    /// Builds the wire payload for one task
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.task_id,
            task_type: task.task_type.clone(),
            priority: task.priority.as_u8(),
            config: task.config.clone(),
        }
    }
}

/// Subset of the Agent-side response envelope the Master inspects
#[derive(Debug, Deserialize)]
struct AgentReply {
    status: String,
    #[serde(default)]
    message: String,
}

/// Delivery seam between the dispatcher and the transport
#[async_trait]
pub trait TaskDeliverer: Send + Sync {
    /// Hands an assignment to the Agent; an error means the binding
    /// must be reverted and the task re-queued
    async fn deliver(&self, agent: &Agent, task: &Task) -> FleetResult<()>;

    /// Best-effort cancellation notice; failures are logged, not surfaced
    async fn cancel(&self, agent: &Agent, task_id: &TaskId) -> FleetResult<()>;
}

/// HTTP deliverer speaking the Agent task API
pub struct HttpAgentClient {
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpAgentClient {
    /// Builds a client with the outbound Agent deadline.
    ///
    /// # Errors
    ///
    /// Returns `invalid_input` if the underlying client cannot be built.
    pub fn new(timeout_secs: u64, token: Option<String>) -> FleetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|e| FleetError::invalid_input(format!("agent client: {e}")))?;
        Ok(Self { client, token })
    }

    fn task_url(agent: &Agent, task_id: Option<&TaskId>) -> String {
        let base = format!(
            "http://{}:{}/{}/tasks",
            agent.hostname,
            agent.port.as_u16(),
            agent.agent_id
        );
        match task_id {
            Some(task_id) => format!("{base}/{task_id}"),
            None => base,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn undeliverable(agent: &Agent) -> FleetError {
        FleetError::Undeliverable {
            agent_id: agent.agent_id.to_string(),
            attempts: 0,
        }
    }
}

#[async_trait]
impl TaskDeliverer for HttpAgentClient {
    async fn deliver(&self, agent: &Agent, task: &Task) -> FleetResult<()> {
        let url = Self::task_url(agent, None);
        debug!(agent_id = %agent.agent_id, task_id = %task.task_id, %url, "delivering assignment");

        let response = self
            .authorize(self.client.post(&url))
            .json(&AssignmentPayload::from_task(task))
            .send()
            .await
            .map_err(|err| {
                warn!(agent_id = %agent.agent_id, error = %err, "assignment send failed");
                Self::undeliverable(agent)
            })?;

        if !response.status().is_success() {
            warn!(agent_id = %agent.agent_id, status = %response.status(), "agent rejected assignment");
            return Err(Self::undeliverable(agent));
        }
        let reply: AgentReply = response
            .json()
            .await
            .map_err(|_| Self::undeliverable(agent))?;
        if reply.status != "success" {
            warn!(agent_id = %agent.agent_id, message = %reply.message, "agent reported failure");
            return Err(Self::undeliverable(agent));
        }
        Ok(())
    }

    async fn cancel(&self, agent: &Agent, task_id: &TaskId) -> FleetResult<()> {
        let url = Self::task_url(agent, Some(task_id));
        let response = self
            .authorize(self.client.delete(&url))
            .send()
            .await
            .map_err(|_| Self::undeliverable(agent))?;
        if !response.status().is_success() {
            return Err(Self::undeliverable(agent));
        }
        Ok(())
    }
}

/// In-memory deliverer for tests: records calls and fails on demand
#[derive(Debug, Default)]
pub struct RecordingDeliverer {
    delivered: std::sync::Mutex<Vec<(String, TaskId)>>,
    cancelled: std::sync::Mutex<Vec<(String, TaskId)>>,
    fail_deliveries: std::sync::atomic::AtomicBool,
}

impl RecordingDeliverer {
    /// Creates a deliverer that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent deliveries fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.fail_deliveries
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    /// Assignments accepted so far as `(agent_id, task_id)`
    pub fn delivered(&self) -> Vec<(String, TaskId)> {
        self.delivered.lock().expect("deliverer mutex").clone()
    }

    /// Cancellation notices observed so far
    pub fn cancelled(&self) -> Vec<(String, TaskId)> {
        self.cancelled.lock().expect("deliverer mutex").clone()
    }
}

#[async_trait]
impl TaskDeliverer for RecordingDeliverer {
    async fn deliver(&self, agent: &Agent, task: &Task) -> FleetResult<()> {
        if self.fail_deliveries.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(FleetError::Undeliverable {
                agent_id: agent.agent_id.to_string(),
                attempts: 0,
            });
        }
        self.delivered
            .lock()
            .expect("deliverer mutex")
            .push((agent.agent_id.to_string(), task.task_id));
        Ok(())
    }

    async fn cancel(&self, agent: &Agent, task_id: &TaskId) -> FleetResult<()> {
        self.cancelled
            .lock()
            .expect("deliverer mutex")
            .push((agent.agent_id.to_string(), *task_id));
        Ok(())
    }
}

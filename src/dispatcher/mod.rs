//! Task dispatcher (selection, ownership binding, lifecycle control)
//!
//! Dispatch is capability intersection, liveness filtering, load-aware
//! scoring, then an atomic compare-and-set on the task row. Losing the
//! CAS drops to the next-best candidate up to the retry bound; a failed
//! delivery reverts the binding and re-queues the task until its attempt
//! cap is spent.
//!
//! # Submodules
//!
//! - `queue` - bounded priority FIFO for retries
//! - `selector` - pure candidate scoring
//! - `agent_client` - Master->Agent HTTP delivery

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::catalog::CatalogResolver;
use crate::config::DispatcherConfig;
use crate::domain_types::{
    Agent, AgentKey, AgentStatus, CapabilityId, ProgressPercent, StaleAfterSecs, TagId, Task,
    TaskId, TaskPriority, TaskStatus,
};
use crate::error::{FleetError, FleetResult};
use crate::events::{EventSender, FleetEvent};
use crate::storage::{AgentStore, MetricsStore, TaskStore};
use crate::time_provider::SharedTimeProvider;

pub mod agent_client;
pub mod queue;
pub mod selector;

pub use agent_client::{AssignmentPayload, HttpAgentClient, RecordingDeliverer, TaskDeliverer};
pub use queue::{QueuedTask, TaskQueue};
pub use selector::{Candidate, rank, recency, score};

/// Failure reasons stamped on terminal dispatch outcomes
const REASON_NO_CAPACITY: &str = "no_capacity";
const REASON_UNDELIVERABLE: &str = "undeliverable";

/// A task submission from the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(alias = "type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, alias = "required_caps")]
    pub required_capabilities: Vec<CapabilityId>,
    #[serde(default)]
    pub required_tags: Vec<TagId>,
}

/// Control commands accepted on the task endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    Start,
    Stop,
    Pause,
    Resume,
    Cancel,
}

impl ControlCommand {
    /// Parses the path segment form used by the REST routes
    ///
    /// # Errors
    ///
    /// Returns `invalid_input` for an unknown command.
    pub fn parse(s: &str) -> FleetResult<Self> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "cancel" => Ok(Self::Cancel),
            other => Err(FleetError::invalid_input(format!(
                "unknown control command: {other}"
            ))),
        }
    }

    /// The transition this command performs: allowed source states and
    /// the destination
    fn transition(self) -> (&'static [TaskStatus], TaskStatus) {
        use TaskStatus::*;
        match self {
            Self::Start => (&[Assigned], Running),
            Self::Pause => (&[Running], Paused),
            Self::Resume => (&[Paused], Running),
            // stop is cancel restricted to tasks already on an Agent
            Self::Stop => (&[Running, Paused], Cancelled),
            Self::Cancel => (&[Pending, Queued, Assigned, Running, Paused], Cancelled),
        }
    }
}

/// Progress callback from the owning Agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum AgentReport {
    Started,
    Progress {
        progress: u8,
    },
    Failed {
        #[serde(default)]
        error: String,
    },
}

/// What one dispatch attempt did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Bound and delivered to this Agent
    Assigned(AgentKey),
    /// Delivery failed; binding reverted and the task re-queued
    Requeued { attempts: u32 },
}

/// The task dispatcher service
pub struct TaskDispatcher {
    tasks: Arc<dyn TaskStore>,
    agents: Arc<dyn AgentStore>,
    metrics: Arc<dyn MetricsStore>,
    catalog: Arc<CatalogResolver>,
    deliverer: Arc<dyn TaskDeliverer>,
    config: DispatcherConfig,
    stale_after: StaleAfterSecs,
    queue: Mutex<TaskQueue>,
    queue_wakeup: Notify,
    events: EventSender,
    time: SharedTimeProvider,
}

impl TaskDispatcher {
    /// Creates the dispatcher service
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        agents: Arc<dyn AgentStore>,
        metrics: Arc<dyn MetricsStore>,
        catalog: Arc<CatalogResolver>,
        deliverer: Arc<dyn TaskDeliverer>,
        config: DispatcherConfig,
        stale_after: StaleAfterSecs,
        events: EventSender,
        time: SharedTimeProvider,
    ) -> Self {
        let queue = TaskQueue::new(config.queue_capacity);
        Self {
            tasks,
            agents,
            metrics,
            catalog,
            deliverer,
            config,
            stale_after,
            queue: Mutex::new(queue),
            queue_wakeup: Notify::new(),
            events,
            time,
        }
    }

    fn emit_transition(&self, task_id: TaskId, from: TaskStatus, to: TaskStatus) {
        let _ = self.events.send(FleetEvent::TaskTransition {
            task_id,
            from,
            to,
            at: self.time.now(),
        });
    }

    async fn load_task(&self, task_id: &TaskId) -> FleetResult<Task> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or_else(|| FleetError::not_found("task", task_id.to_string()))
    }

    /// Accepts a task and attempts dispatch inline.
    ///
    /// # Errors
    ///
    /// `no_capacity` when no eligible Agent could be bound within the
    /// retry budget (the task is failed with that reason), and
    /// `undeliverable` when the attempt cap was spent on the first
    /// delivery.
    #[instrument(skip(self, new_task), fields(task_type = %new_task.task_type))]
    pub async fn submit(&self, new_task: NewTask) -> FleetResult<Task> {
        for capability in &new_task.required_capabilities {
            if !self.catalog.validate_capability(capability).await? {
                return Err(FleetError::invalid_reference(
                    "capability",
                    capability.as_str(),
                ));
            }
        }
        for tag in &new_task.required_tags {
            if !self.catalog.validate_tag(tag).await? {
                return Err(FleetError::invalid_reference("tag", tag.as_str()));
            }
        }

        let now = self.time.now();
        let task = Task {
            task_id: TaskId::generate(),
            task_type: new_task.task_type,
            priority: new_task.priority,
            status: TaskStatus::Pending,
            owner_agent_id: None,
            config: new_task.config,
            required_capabilities: new_task.required_capabilities.into_iter().collect(),
            required_tags: new_task.required_tags.into_iter().collect(),
            progress: ProgressPercent::default(),
            attempts: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.tasks.insert(&task).await?;
        info!(task_id = %task.task_id, "task accepted");

        match self.dispatch_task(&task).await {
            Ok(outcome) => {
                debug!(task_id = %task.task_id, ?outcome, "dispatch settled");
                self.load_task(&task.task_id).await
            }
            Err(FleetError::NoCapacity { task_id }) => {
                self.tasks
                    .transition(
                        &task.task_id,
                        &[TaskStatus::Pending],
                        TaskStatus::Failed,
                        Some(REASON_NO_CAPACITY),
                        self.time.now(),
                    )
                    .await?;
                self.emit_transition(task.task_id, TaskStatus::Pending, TaskStatus::Failed);
                Err(FleetError::NoCapacity { task_id })
            }
            Err(err) => Err(err),
        }
    }

    /// Runs the 7-step selection for one pending task.
    async fn dispatch_task(&self, task: &Task) -> FleetResult<DispatchOutcome> {
        // Steps 1-2: required capability set, from the task or its type.
        let mut required: HashSet<CapabilityId> = task.required_capabilities.clone();
        if required.is_empty() {
            if let Some(capability) = self.catalog.capability_for_name(&task.task_type).await? {
                required.insert(capability);
            }
        }

        // Step 3: intersect with the online fleet.
        let online = self.agents.list_by_status(AgentStatus::Online).await?;
        // Step 4: capability/tag predicates, AND semantics.
        let eligible: Vec<Agent> = online
            .into_iter()
            .filter(|agent| required.is_subset(&agent.capabilities))
            .filter(|agent| task.required_tags.is_subset(&agent.tags))
            .collect();

        if eligible.is_empty() {
            return Err(FleetError::NoCapacity {
                task_id: task.task_id.to_string(),
            });
        }

        // Step 5: score on load, free slots, and heartbeat recency.
        let ids: Vec<AgentKey> = eligible.iter().map(|a| a.agent_id.clone()).collect();
        let snapshots = self.metrics.by_agent_ids(&ids).await?;
        let by_agent: std::collections::HashMap<&str, _> = snapshots
            .iter()
            .map(|s| (s.agent_id.as_str(), s))
            .collect();

        let max_concurrent = self.config.max_concurrent_tasks;
        let mut candidates = Vec::with_capacity(eligible.len());
        for agent in &eligible {
            // The snapshot lags by a heartbeat interval; the task store
            // knows what this dispatcher already bound.
            let owned = self.tasks.count_active_owned(&agent.agent_id).await?;
            let reported = by_agent
                .get(agent.agent_id.as_str())
                .map(|s| u64::from(s.running_tasks))
                .unwrap_or(0);
            let running = owned.max(reported);
            if running >= u64::from(max_concurrent.as_u16()) {
                continue;
            }
            match by_agent.get(agent.agent_id.as_str()) {
                Some(snapshot) => candidates.push(Candidate {
                    agent_id: agent.agent_id.clone(),
                    cpu_usage: snapshot.cpu_usage,
                    running_tasks: u32::try_from(running).unwrap_or(u32::MAX),
                    last_heartbeat: agent.last_heartbeat,
                }),
                None => {
                    let mut candidate = Candidate::without_snapshot(
                        agent.agent_id.clone(),
                        agent.last_heartbeat,
                    );
                    candidate.running_tasks = u32::try_from(running).unwrap_or(u32::MAX);
                    candidates.push(candidate);
                }
            }
        }

        let now = self.time.now();
        let ranked = rank(
            candidates,
            self.config.weights,
            max_concurrent,
            now,
            self.stale_after,
        );

        // Step 6: CAS binding, next-best on a lost race.
        let retry_limit = usize::from(self.config.retry_limit.as_u8());
        for candidate in ranked.iter().take(retry_limit) {
            let bound = self
                .tasks
                .try_assign(&task.task_id, &candidate.agent_id, self.time.now())
                .await?;
            if !bound {
                debug!(task_id = %task.task_id, agent_id = %candidate.agent_id, "lost assignment race");
                continue;
            }
            self.emit_transition(task.task_id, TaskStatus::Pending, TaskStatus::Assigned);

            // Step 7: out-of-band delivery; revert and re-queue on failure.
            let Some(agent) = eligible.iter().find(|a| a.agent_id == candidate.agent_id) else {
                continue;
            };
            let mut assigned = task.clone();
            assigned.status = TaskStatus::Assigned;
            assigned.owner_agent_id = Some(candidate.agent_id.clone());

            match self.deliverer.deliver(agent, &assigned).await {
                Ok(()) => {
                    info!(task_id = %task.task_id, agent_id = %candidate.agent_id, "task assigned");
                    return Ok(DispatchOutcome::Assigned(candidate.agent_id.clone()));
                }
                Err(_) => {
                    let at = self.time.now();
                    self.tasks
                        .release_assignment(&task.task_id, &candidate.agent_id, at)
                        .await?;
                    self.emit_transition(task.task_id, TaskStatus::Assigned, TaskStatus::Pending);

                    let current = self.load_task(&task.task_id).await?;
                    let _ = self.events.send(FleetEvent::DeliveryFailed {
                        task_id: task.task_id,
                        agent_id: candidate.agent_id.clone(),
                        attempts: current.attempts,
                        at,
                    });

                    if current.attempts >= u32::from(self.config.delivery_attempt_cap.as_u8()) {
                        self.tasks
                            .transition(
                                &task.task_id,
                                &[TaskStatus::Pending],
                                TaskStatus::Failed,
                                Some(REASON_UNDELIVERABLE),
                                self.time.now(),
                            )
                            .await?;
                        self.emit_transition(
                            task.task_id,
                            TaskStatus::Pending,
                            TaskStatus::Failed,
                        );
                        return Err(FleetError::Undeliverable {
                            agent_id: candidate.agent_id.to_string(),
                            attempts: current.attempts,
                        });
                    }

                    self.requeue(&current).await?;
                    return Ok(DispatchOutcome::Requeued {
                        attempts: current.attempts,
                    });
                }
            }
        }

        Err(FleetError::NoCapacity {
            task_id: task.task_id.to_string(),
        })
    }

    async fn requeue(&self, task: &Task) -> FleetResult<()> {
        self.tasks
            .transition(
                &task.task_id,
                &[TaskStatus::Pending],
                TaskStatus::Queued,
                None,
                self.time.now(),
            )
            .await?;
        self.queue
            .lock()
            .await
            .push(task.task_id, task.priority, task.created_at)?;
        self.queue_wakeup.notify_one();
        Ok(())
    }

    /// Re-enqueues tasks left pending or queued by a previous run;
    /// returns how many were recovered
    pub async fn recover_backlog(&self) -> FleetResult<u64> {
        let backlog = self
            .tasks
            .list_by_statuses(&[TaskStatus::Pending, TaskStatus::Queued])
            .await?;
        let mut recovered = 0u64;
        for task in backlog {
            if task.status == TaskStatus::Pending {
                self.tasks
                    .transition(
                        &task.task_id,
                        &[TaskStatus::Pending],
                        TaskStatus::Queued,
                        None,
                        self.time.now(),
                    )
                    .await?;
            }
            self.queue
                .lock()
                .await
                .push(task.task_id, task.priority, task.created_at)?;
            recovered += 1;
        }
        if recovered > 0 {
            self.queue_wakeup.notify_waiters();
            info!(recovered, "recovered task backlog");
        }
        Ok(recovered)
    }

    async fn process_queued(&self, entry: QueuedTask) -> FleetResult<()> {
        // Cancelled tasks keep their queue entries; the guard skips them.
        let claimed = self
            .tasks
            .transition(
                &entry.task_id,
                &[TaskStatus::Queued],
                TaskStatus::Pending,
                None,
                self.time.now(),
            )
            .await?;
        if !claimed {
            return Ok(());
        }
        let task = self.load_task(&entry.task_id).await?;
        match self.dispatch_task(&task).await {
            Ok(_) => Ok(()),
            Err(FleetError::NoCapacity { .. }) => {
                self.tasks
                    .transition(
                        &entry.task_id,
                        &[TaskStatus::Pending],
                        TaskStatus::Failed,
                        Some(REASON_NO_CAPACITY),
                        self.time.now(),
                    )
                    .await?;
                self.emit_transition(entry.task_id, TaskStatus::Pending, TaskStatus::Failed);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// One dispatch worker: drains the retry queue until cancelled
    pub async fn worker_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let entry = {
                let mut queue = self.queue.lock().await;
                queue.pop()
            };
            let entry = match entry {
                Some(entry) => entry,
                None => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = self.queue_wakeup.notified() => continue,
                    }
                }
            };
            if let Err(err) = self.process_queued(entry).await {
                warn!(error = %err, "queued dispatch failed");
            }
        }
    }

    /// Spawns the dispatch worker pool
    pub fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|_| {
                let dispatcher = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(dispatcher.worker_loop(cancel))
            })
            .collect()
    }

    /// Reads one task (status endpoint)
    pub async fn status(&self, task_id: &TaskId) -> FleetResult<Task> {
        self.load_task(task_id).await
    }

    /// Applies a control command, validating the lifecycle table.
    ///
    /// # Errors
    ///
    /// Returns `invalid_transition` when the task is not in a state the
    /// command may leave from.
    #[instrument(skip(self), fields(task_id = %task_id, command = ?command))]
    pub async fn control(&self, task_id: &TaskId, command: ControlCommand) -> FleetResult<Task> {
        let task = self.load_task(task_id).await?;
        let (allowed_from, to) = command.transition();
        if !allowed_from.contains(&task.status) {
            return Err(FleetError::InvalidTransition {
                from: task.status.as_str().to_string(),
                command: format!("{command:?}").to_lowercase(),
            });
        }

        let moved = self
            .tasks
            .transition(task_id, allowed_from, to, None, self.time.now())
            .await?;
        if !moved {
            let current = self.load_task(task_id).await?;
            return Err(FleetError::InvalidTransition {
                from: current.status.as_str().to_string(),
                command: format!("{command:?}").to_lowercase(),
            });
        }
        self.emit_transition(*task_id, task.status, to);

        // Best-effort notify for cancellations; the task is already
        // terminal on our side.
        if to == TaskStatus::Cancelled {
            if let Some(owner) = &task.owner_agent_id {
                if let Ok(Some(agent)) = self.agents.get(owner).await {
                    if let Err(err) = self.deliverer.cancel(&agent, task_id).await {
                        warn!(task_id = %task_id, agent_id = %owner, error = %err, "cancel notify failed");
                    }
                }
            }
        }

        self.load_task(task_id).await
    }

    /// Applies a progress report from the owning Agent
    #[instrument(skip(self, report), fields(task_id = %task_id))]
    pub async fn report(&self, task_id: &TaskId, report: AgentReport) -> FleetResult<Task> {
        let task = self.load_task(task_id).await?;
        match report {
            AgentReport::Started => {
                let moved = self
                    .tasks
                    .transition(
                        task_id,
                        &[TaskStatus::Assigned],
                        TaskStatus::Running,
                        None,
                        self.time.now(),
                    )
                    .await?;
                if !moved {
                    return Err(FleetError::InvalidTransition {
                        from: task.status.as_str().to_string(),
                        command: "started".to_string(),
                    });
                }
                self.emit_transition(*task_id, task.status, TaskStatus::Running);
            }
            AgentReport::Progress { progress } if progress >= 100 => {
                let moved = self
                    .tasks
                    .transition(
                        task_id,
                        &[TaskStatus::Running, TaskStatus::Paused],
                        TaskStatus::Completed,
                        None,
                        self.time.now(),
                    )
                    .await?;
                if !moved {
                    return Err(FleetError::InvalidTransition {
                        from: task.status.as_str().to_string(),
                        command: "progress=100".to_string(),
                    });
                }
                self.emit_transition(*task_id, task.status, TaskStatus::Completed);
            }
            AgentReport::Progress { progress } => {
                let moved = self
                    .tasks
                    .set_progress(task_id, progress, self.time.now())
                    .await?;
                if !moved {
                    return Err(FleetError::InvalidTransition {
                        from: task.status.as_str().to_string(),
                        command: format!("progress={progress}"),
                    });
                }
            }
            AgentReport::Failed { error } => {
                let moved = self
                    .tasks
                    .transition(
                        task_id,
                        &[TaskStatus::Running, TaskStatus::Paused],
                        TaskStatus::Failed,
                        Some(&error),
                        self.time.now(),
                    )
                    .await?;
                if !moved {
                    return Err(FleetError::InvalidTransition {
                        from: task.status.as_str().to_string(),
                        command: "failed".to_string(),
                    });
                }
                self.emit_transition(*task_id, task.status, TaskStatus::Failed);
            }
        }
        self.load_task(task_id).await
    }

    /// Drops every queued task (assigned/running work is untouched);
    /// returns how many were cancelled
    pub async fn clear_queue(&self) -> FleetResult<u64> {
        let drained = self.queue.lock().await.clear();
        let mut cancelled = 0u64;
        for entry in drained {
            let moved = self
                .tasks
                .transition(
                    &entry.task_id,
                    &[TaskStatus::Queued],
                    TaskStatus::Cancelled,
                    None,
                    self.time.now(),
                )
                .await?;
            if moved {
                cancelled += 1;
                self.emit_transition(entry.task_id, TaskStatus::Queued, TaskStatus::Cancelled);
            }
        }
        Ok(cancelled)
    }

    /// Queued entries per priority band
    pub async fn queue_stats(&self) -> std::collections::BTreeMap<u8, usize> {
        self.queue.lock().await.stats()
    }
}

//! Fleet state-change events
//!
//! The heartbeat processor, liveness sweeper, and dispatcher emit events
//! on an unbounded channel; a spawned consumer logs them. Tests subscribe
//! to the same channel to observe transitions without polling storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain_types::{AgentKey, AgentStatus, TaskId, TaskStatus};

/// Event types emitted by the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FleetEvent {
    /// An Agent's lifecycle status changed
    AgentStatusChanged {
        agent_id: AgentKey,
        from: AgentStatus,
        to: AgentStatus,
        at: DateTime<Utc>,
    },
    /// The liveness sweeper evicted a stale Agent
    AgentEvicted {
        agent_id: AgentKey,
        last_heartbeat: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    /// A task changed lifecycle state
    TaskTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        at: DateTime<Utc>,
    },
    /// An assignment could not be delivered and was re-queued
    DeliveryFailed {
        task_id: TaskId,
        agent_id: AgentKey,
        attempts: u32,
        at: DateTime<Utc>,
    },
}

/// Sending half handed to every emitting component
pub type EventSender = mpsc::UnboundedSender<FleetEvent>;

/// Receiving half consumed by the logger (or a test)
pub type EventReceiver = mpsc::UnboundedReceiver<FleetEvent>;

/// Creates the event channel
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Consumes events and logs them until the channel closes
pub async fn run_event_logger(mut rx: EventReceiver) {
    while let Some(event) = rx.recv().await {
        match &event {
            FleetEvent::AgentStatusChanged {
                agent_id, from, to, ..
            } => {
                info!(agent_id = %agent_id, from = from.as_str(), to = to.as_str(), "agent status changed");
            }
            FleetEvent::AgentEvicted { agent_id, .. } => {
                warn!(agent_id = %agent_id, "agent evicted as stale");
            }
            FleetEvent::TaskTransition {
                task_id, from, to, ..
            } => {
                info!(task_id = %task_id, from = from.as_str(), to = to.as_str(), "task transition");
            }
            FleetEvent::DeliveryFailed {
                task_id,
                agent_id,
                attempts,
                ..
            } => {
                warn!(task_id = %task_id, agent_id = %agent_id, attempts, "assignment delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::AgentKey;

    #[tokio::test]
    async fn test_should_deliver_events_in_emission_order() {
        let (tx, mut rx) = event_channel();
        let agent = AgentKey::try_new("a1".to_string()).unwrap();

        tx.send(FleetEvent::AgentStatusChanged {
            agent_id: agent.clone(),
            from: AgentStatus::Offline,
            to: AgentStatus::Online,
            at: Utc::now(),
        })
        .unwrap();
        tx.send(FleetEvent::AgentEvicted {
            agent_id: agent,
            last_heartbeat: None,
            at: Utc::now(),
        })
        .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(FleetEvent::AgentStatusChanged { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(FleetEvent::AgentEvicted { .. })
        ));
    }
}

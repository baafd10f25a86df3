//! Heartbeat processor (liveness control plane ingress)
//!
//! Applies the Agent status state machine and upserts the metrics
//! snapshot. Heartbeats for the same Agent may arrive in parallel; a
//! keyed lock serializes them so transitions are linearized, while the
//! storage-level timestamp guard makes the snapshot last-writer-wins
//! regardless of arrival order. Heartbeats for different Agents proceed
//! in parallel.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

use crate::domain_types::{AgentKey, AgentStatus, MetricsSnapshot, WorkStatus};
use crate::error::{FleetError, FleetResult};
use crate::events::{EventSender, FleetEvent};
use crate::storage::{AgentStore, MetricsStore};
use crate::time_provider::SharedTimeProvider;

/// Metrics carried on a heartbeat; every gauge defaults so partial
/// reports stay valid
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HeartbeatMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_bytes_sent: u64,
    pub network_bytes_recv: u64,
    pub active_connections: u32,
    pub running_tasks: u32,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub work_status: WorkStatus,
    pub scan_type: Option<String>,
    pub plugin_status: Option<serde_json::Value>,
    /// Snapshot instant by the Agent's clock; defaults to receive time
    pub timestamp: Option<DateTime<Utc>>,
}

/// One heartbeat message from an Agent
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HeartbeatRequest {
    pub status: Option<AgentStatus>,
    pub metrics: Option<HeartbeatMetrics>,
}

/// What a processed heartbeat did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatOutcome {
    pub status: AgentStatus,
    pub status_changed: bool,
    pub snapshot_applied: bool,
}

/// Pure state-machine step: what the Agent's status becomes when a
/// heartbeat carrying `reported` (and optionally a work status) arrives.
///
/// Error and maintenance are sticky: only an explicit reported status
/// moves an Agent out of them.
pub fn next_status(
    current: AgentStatus,
    reported: Option<AgentStatus>,
    work_status: Option<WorkStatus>,
) -> AgentStatus {
    match reported {
        Some(explicit) => explicit,
        None => match current {
            AgentStatus::Error => AgentStatus::Error,
            AgentStatus::Maintenance => AgentStatus::Maintenance,
            AgentStatus::Busy => {
                if work_status == Some(WorkStatus::Idle) {
                    AgentStatus::Online
                } else {
                    AgentStatus::Busy
                }
            }
            AgentStatus::Online | AgentStatus::Offline => AgentStatus::Online,
        },
    }
}

/// Serializes per-Agent heartbeat handling and fans out state changes
pub struct HeartbeatProcessor {
    agents: Arc<dyn AgentStore>,
    metrics: Arc<dyn MetricsStore>,
    locks: DashMap<AgentKey, Arc<tokio::sync::Mutex<()>>>,
    events: EventSender,
    time: SharedTimeProvider,
}

impl HeartbeatProcessor {
    /// Creates a processor over the given stores
    pub fn new(
        agents: Arc<dyn AgentStore>,
        metrics: Arc<dyn MetricsStore>,
        events: EventSender,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            agents,
            metrics,
            locks: DashMap::new(),
            events,
            time,
        }
    }

    fn lock_for(&self, agent_id: &AgentKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(agent_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Ingests one heartbeat.
    ///
    /// # Errors
    ///
    /// Returns `invalid_reference` for an unknown Agent; heartbeats never
    /// auto-register.
    #[instrument(skip(self, request), fields(agent_id = %agent_id))]
    pub async fn process_heartbeat(
        &self,
        agent_id: &AgentKey,
        request: HeartbeatRequest,
    ) -> FleetResult<HeartbeatOutcome> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let agent = self
            .agents
            .get(agent_id)
            .await?
            .ok_or_else(|| FleetError::invalid_reference("agent", agent_id.as_str()))?;

        let work_status = request.metrics.as_ref().map(|m| m.work_status);
        let next = next_status(agent.status, request.status, work_status);

        // An Agent-stamped snapshot time doubles as the heartbeat instant
        // so staleness math follows the reporting clock.
        let now = self.time.now();
        let heartbeat_at = request
            .metrics
            .as_ref()
            .and_then(|m| m.timestamp)
            .unwrap_or(now);

        self.agents
            .record_heartbeat(agent_id, next, heartbeat_at)
            .await?;

        let snapshot_applied = if let Some(metrics) = request.metrics {
            let snapshot = MetricsSnapshot {
                agent_id: agent_id.clone(),
                cpu_usage: metrics.cpu_usage,
                memory_usage: metrics.memory_usage,
                disk_usage: metrics.disk_usage,
                network_bytes_sent: metrics.network_bytes_sent,
                network_bytes_recv: metrics.network_bytes_recv,
                active_connections: metrics.active_connections,
                running_tasks: metrics.running_tasks,
                completed_tasks: metrics.completed_tasks,
                failed_tasks: metrics.failed_tasks,
                work_status: metrics.work_status,
                scan_type: metrics.scan_type,
                plugin_status: metrics.plugin_status,
                timestamp: metrics.timestamp.unwrap_or(now),
            };
            self.metrics.upsert(&snapshot).await?
        } else {
            false
        };

        let status_changed = next != agent.status;
        if status_changed {
            let _ = self.events.send(FleetEvent::AgentStatusChanged {
                agent_id: agent_id.clone(),
                from: agent.status,
                to: next,
                at: heartbeat_at,
            });
        }

        Ok(HeartbeatOutcome {
            status: next,
            status_changed,
            snapshot_applied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect_for_testing;
    use crate::domain_types::{Agent, HostName, PortNumber};
    use crate::events::event_channel;
    use crate::storage::{SqliteAgentStore, SqliteMetricsStore};
    use crate::time_provider::MockTimeProvider;
    use std::collections::HashSet;
    use tempfile::tempdir;

    #[test]
    fn test_should_follow_state_machine_when_stepping_status() {
        use AgentStatus::*;
        // Bare heartbeats bring offline/online agents online.
        assert_eq!(next_status(Offline, None, None), Online);
        assert_eq!(next_status(Online, None, None), Online);
        // Busy clears on an idle work report.
        assert_eq!(next_status(Busy, None, Some(WorkStatus::Idle)), Online);
        assert_eq!(next_status(Busy, None, Some(WorkStatus::Scanning)), Busy);
        // Error and maintenance are sticky without an explicit exit.
        assert_eq!(next_status(Error, None, None), Error);
        assert_eq!(next_status(Maintenance, None, None), Maintenance);
        assert_eq!(next_status(Maintenance, Some(Online), None), Online);
        // Explicit reports always win.
        assert_eq!(next_status(Online, Some(Busy), None), Busy);
        assert_eq!(next_status(Online, Some(Error), None), Error);
        assert_eq!(next_status(Busy, Some(Maintenance), None), Maintenance);
    }

    struct Fixture {
        processor: HeartbeatProcessor,
        agents: Arc<SqliteAgentStore>,
        metrics: Arc<SqliteMetricsStore>,
        events: crate::events::EventReceiver,
        agent_id: AgentKey,
    }

    async fn fixture(dir: &std::path::Path) -> Fixture {
        let db = connect_for_testing(dir).await;
        let agents = Arc::new(SqliteAgentStore::new(db.clone()));
        let metrics = Arc::new(SqliteMetricsStore::new(db));
        let (tx, rx) = event_channel();

        let now = Utc::now();
        let agent_id = AgentKey::try_new("a1".to_string()).unwrap();
        agents
            .insert(&Agent {
                agent_id: agent_id.clone(),
                hostname: HostName::try_new("h".to_string()).unwrap(),
                port: PortNumber::try_new(9000).unwrap(),
                ip_address: None,
                version: None,
                remark: None,
                status: AgentStatus::Offline,
                capabilities: HashSet::new(),
                tags: HashSet::new(),
                last_heartbeat: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let processor = HeartbeatProcessor::new(
            agents.clone(),
            metrics.clone(),
            tx,
            Arc::new(MockTimeProvider::new()),
        );
        Fixture {
            processor,
            agents,
            metrics,
            events: rx,
            agent_id,
        }
    }

    #[tokio::test]
    async fn test_should_reject_heartbeat_from_unknown_agent() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path()).await;

        let ghost = AgentKey::try_new("ghost".to_string()).unwrap();
        let err = f
            .processor
            .process_heartbeat(&ghost, HeartbeatRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidReference { kind: "agent", .. }));
        // No auto-registration happened.
        assert!(f.agents.get(&ghost).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_should_bring_agent_online_and_emit_event_on_first_heartbeat() {
        let dir = tempdir().unwrap();
        let mut f = fixture(dir.path()).await;

        let stamp = "2025-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let outcome = f
            .processor
            .process_heartbeat(
                &f.agent_id,
                HeartbeatRequest {
                    status: Some(AgentStatus::Online),
                    metrics: Some(HeartbeatMetrics {
                        cpu_usage: 0.1,
                        timestamp: Some(stamp),
                        ..Default::default()
                    }),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, AgentStatus::Online);
        assert!(outcome.status_changed);
        assert!(outcome.snapshot_applied);

        let stored = f.agents.get(&f.agent_id).await.unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Online);
        assert_eq!(stored.last_heartbeat, Some(stamp));

        match f.events.recv().await {
            Some(FleetEvent::AgentStatusChanged { from, to, .. }) => {
                assert_eq!(from, AgentStatus::Offline);
                assert_eq!(to, AgentStatus::Online);
            }
            other => panic!("expected status-change event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_should_apply_newest_snapshot_when_heartbeats_arrive_out_of_order() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path()).await;

        let t1 = "2025-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let t2 = t1 + chrono::Duration::seconds(30);

        let newer = f
            .processor
            .process_heartbeat(
                &f.agent_id,
                HeartbeatRequest {
                    status: None,
                    metrics: Some(HeartbeatMetrics {
                        cpu_usage: 0.2,
                        timestamp: Some(t2),
                        ..Default::default()
                    }),
                },
            )
            .await
            .unwrap();
        assert!(newer.snapshot_applied);

        let stale = f
            .processor
            .process_heartbeat(
                &f.agent_id,
                HeartbeatRequest {
                    status: None,
                    metrics: Some(HeartbeatMetrics {
                        cpu_usage: 0.9,
                        timestamp: Some(t1),
                        ..Default::default()
                    }),
                },
            )
            .await
            .unwrap();
        assert!(!stale.snapshot_applied, "older snapshot must lose");

        let snapshot = f.metrics.get(&f.agent_id).await.unwrap().unwrap();
        assert!((snapshot.cpu_usage - 0.2).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_should_serialize_concurrent_heartbeats_for_one_agent() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path()).await;
        let processor = Arc::new(f.processor);

        let base = Utc::now();
        let mut handles = Vec::new();
        for i in 0..16i64 {
            let processor = Arc::clone(&processor);
            let agent_id = f.agent_id.clone();
            handles.push(tokio::spawn(async move {
                processor
                    .process_heartbeat(
                        &agent_id,
                        HeartbeatRequest {
                            status: None,
                            metrics: Some(HeartbeatMetrics {
                                cpu_usage: i as f64 / 16.0,
                                timestamp: Some(base + chrono::Duration::seconds(i)),
                                ..Default::default()
                            }),
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // The snapshot with the largest timestamp wins.
        let snapshot = f.metrics.get(&f.agent_id).await.unwrap().unwrap();
        assert_eq!(
            snapshot.timestamp.timestamp_millis(),
            (base + chrono::Duration::seconds(15)).timestamp_millis()
        );
    }
}

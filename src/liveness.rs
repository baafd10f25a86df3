//! Background liveness sweeper
//!
//! Every `T_sweep` the sweeper transitions Agents whose last heartbeat
//! is older than `T_stale` to offline. Agents in maintenance or error
//! are exempt; they only leave those states on an explicit report.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::LivenessConfig;
use crate::domain_types::AgentStatus;
use crate::error::FleetResult;
use crate::events::{EventSender, FleetEvent};
use crate::storage::AgentStore;
use crate::time_provider::SharedTimeProvider;

/// Periodic staleness sweeper over the agent registry
pub struct LivenessSweeper {
    agents: Arc<dyn AgentStore>,
    config: LivenessConfig,
    events: EventSender,
    time: SharedTimeProvider,
}

impl LivenessSweeper {
    /// Creates a sweeper with the given cadence and staleness bound
    pub fn new(
        agents: Arc<dyn AgentStore>,
        config: LivenessConfig,
        events: EventSender,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            agents,
            config,
            events,
            time,
        }
    }

    /// Runs one sweep pass; returns how many Agents were evicted.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; the run loop logs and keeps going.
    pub async fn sweep_once(&self) -> FleetResult<u64> {
        let now = self.time.now();
        let cutoff = now - self.config.stale_after_secs.as_chrono();
        let stale = self.agents.list_stale(cutoff).await?;

        let mut evicted = 0u64;
        for agent in stale {
            if self
                .agents
                .update_status(&agent.agent_id, AgentStatus::Offline, now)
                .await?
            {
                evicted += 1;
                let _ = self.events.send(FleetEvent::AgentStatusChanged {
                    agent_id: agent.agent_id.clone(),
                    from: agent.status,
                    to: AgentStatus::Offline,
                    at: now,
                });
                let _ = self.events.send(FleetEvent::AgentEvicted {
                    agent_id: agent.agent_id,
                    last_heartbeat: agent.last_heartbeat,
                    at: now,
                });
            }
        }
        Ok(evicted)
    }

    /// Sweeps until the cancellation token fires
    pub async fn run(self, cancel: CancellationToken) {
        let interval =
            std::time::Duration::from_secs(self.config.sweep_interval_secs.as_u64());
        info!(
            stale_after_secs = self.config.stale_after_secs.as_u64(),
            sweep_interval_secs = self.config.sweep_interval_secs.as_u64(),
            "liveness sweeper started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.time.sleep(interval) => {}
            }
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(evicted) => info!(evicted, "liveness sweep evicted stale agents"),
                Err(err) => warn!(error = %err, "liveness sweep failed"),
            }
        }
        info!("liveness sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect_for_testing;
    use crate::domain_types::{Agent, AgentKey, HostName, PortNumber, StaleAfterSecs, SweepIntervalSecs};
    use crate::events::event_channel;
    use crate::storage::SqliteAgentStore;
    use crate::time_provider::MockTimeProvider;
    use chrono::Utc;
    use std::collections::HashSet;
    use tempfile::tempdir;

    async fn seed_agent(store: &SqliteAgentStore, id: &str, status: AgentStatus) -> AgentKey {
        let now = Utc::now();
        let key = AgentKey::try_new(id.to_string()).unwrap();
        store
            .insert(&Agent {
                agent_id: key.clone(),
                hostname: HostName::try_new(format!("{id}-host")).unwrap(),
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
        store.record_heartbeat(&key, status, now).await.unwrap();
        key
    }

    #[tokio::test]
    async fn test_should_evict_agent_when_heartbeat_older_than_stale_bound() {
        let dir = tempdir().unwrap();
        let agents = Arc::new(SqliteAgentStore::new(connect_for_testing(dir.path()).await));
        let clock = MockTimeProvider::new();
        let (tx, mut rx) = event_channel();

        let stale_agent = seed_agent(&agents, "a2", AgentStatus::Online).await;
        let sweeper = LivenessSweeper::new(
            agents.clone(),
            LivenessConfig {
                stale_after_secs: StaleAfterSecs::try_new(90).unwrap(),
                sweep_interval_secs: SweepIntervalSecs::try_new(15).unwrap(),
            },
            tx,
            Arc::new(clock.clone()),
        );

        // Inside the window nothing happens.
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

        // t0 + 91s: past T_stale, the agent goes offline.
        clock.advance_secs(91);
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        let stored = agents.get(&stale_agent).await.unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Offline);

        assert!(matches!(
            rx.recv().await,
            Some(FleetEvent::AgentStatusChanged { .. })
        ));
        assert!(matches!(rx.recv().await, Some(FleetEvent::AgentEvicted { .. })));
    }

    #[tokio::test]
    async fn test_should_exempt_maintenance_and_error_agents_from_eviction() {
        let dir = tempdir().unwrap();
        let agents = Arc::new(SqliteAgentStore::new(connect_for_testing(dir.path()).await));
        let clock = MockTimeProvider::new();
        let (tx, _rx) = event_channel();

        let maintenance = seed_agent(&agents, "m1", AgentStatus::Maintenance).await;
        let errored = seed_agent(&agents, "e1", AgentStatus::Error).await;
        let busy = seed_agent(&agents, "b1", AgentStatus::Busy).await;

        let sweeper = LivenessSweeper::new(
            agents.clone(),
            LivenessConfig::default(),
            tx,
            Arc::new(clock.clone()),
        );

        clock.advance_secs(1_000);
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1, "only the busy agent");
        assert_eq!(
            agents.get(&maintenance).await.unwrap().unwrap().status,
            AgentStatus::Maintenance
        );
        assert_eq!(
            agents.get(&errored).await.unwrap().unwrap().status,
            AgentStatus::Error
        );
        assert_eq!(
            agents.get(&busy).await.unwrap().unwrap().status,
            AgentStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_should_stop_run_loop_when_cancelled() {
        let dir = tempdir().unwrap();
        let agents = Arc::new(SqliteAgentStore::new(connect_for_testing(dir.path()).await));
        let (tx, _rx) = event_channel();
        let sweeper = LivenessSweeper::new(
            agents,
            LivenessConfig::default(),
            tx,
            Arc::new(MockTimeProvider::new()),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sweeper.run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("run loop should exit promptly")
            .unwrap();
    }
}

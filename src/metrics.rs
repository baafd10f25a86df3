//! Metrics aggregator (analytic reads over the snapshot table)
//!
//! Serves "latest value" queries and on-demand fleet aggregates. The
//! aggregator runs no scheduler of its own; consumers poll.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain_types::{AgentKey, MetricsSnapshot, PageNumber, PageSize, StaleAfterSecs};
use crate::error::{FleetError, FleetResult};
use crate::storage::{MetricsListFilter, MetricsStore, PagedRows};
use crate::time_provider::SharedTimeProvider;

/// On-demand fleet aggregate derived from the latest snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSummary {
    pub total_agents: u64,
    /// Agents with a snapshot inside the staleness window
    pub online_agents: u64,
    pub avg_cpu_usage: f64,
    pub avg_memory_usage: f64,
    pub running_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
}

/// Read front over the single-row-per-agent snapshot store
pub struct MetricsAggregator {
    store: Arc<dyn MetricsStore>,
    time: SharedTimeProvider,
}

impl MetricsAggregator {
    /// Creates an aggregator over the snapshot store
    pub fn new(store: Arc<dyn MetricsStore>, time: SharedTimeProvider) -> Self {
        Self { store, time }
    }

    /// Latest snapshot for one Agent
    ///
    /// # Errors
    ///
    /// Returns `not_found` when the Agent has never reported metrics.
    pub async fn get_latest(&self, agent_id: &AgentKey) -> FleetResult<MetricsSnapshot> {
        self.store
            .get(agent_id)
            .await?
            .ok_or_else(|| FleetError::not_found("metrics snapshot", agent_id.as_str()))
    }

    /// Paged snapshot listing ordered `timestamp DESC`
    pub async fn list(
        &self,
        filter: &MetricsListFilter,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<MetricsSnapshot>> {
        self.store.list(filter, page, page_size).await
    }

    /// Full snapshot set for Master-side aggregations
    pub async fn all(&self) -> FleetResult<Vec<MetricsSnapshot>> {
        self.store.all().await
    }

    /// Snapshots with `timestamp >= t`
    pub async fn since(&self, t: DateTime<Utc>) -> FleetResult<Vec<MetricsSnapshot>> {
        self.store.since(t).await
    }

    /// Snapshots for a group of Agents
    pub async fn by_agent_ids(&self, ids: &[AgentKey]) -> FleetResult<Vec<MetricsSnapshot>> {
        self.store.by_agent_ids(ids).await
    }

    /// Snapshots for a group of Agents inside a window
    pub async fn by_agent_ids_since(
        &self,
        ids: &[AgentKey],
        t: DateTime<Utc>,
    ) -> FleetResult<Vec<MetricsSnapshot>> {
        self.store.by_agent_ids_since(ids, t).await
    }

    /// Fleet-level aggregate: counts, load averages, task throughput
    pub async fn fleet_summary(&self, stale_after: StaleAfterSecs) -> FleetResult<FleetSummary> {
        let all = self.store.all().await?;
        let cutoff = self.time.now() - stale_after.as_chrono();
        let online: Vec<&MetricsSnapshot> =
            all.iter().filter(|s| s.timestamp >= cutoff).collect();

        let online_count = online.len() as u64;
        let (avg_cpu, avg_memory) = if online.is_empty() {
            (0.0, 0.0)
        } else {
            let count = online.len() as f64;
            (
                online.iter().map(|s| s.cpu_usage).sum::<f64>() / count,
                online.iter().map(|s| s.memory_usage).sum::<f64>() / count,
            )
        };

        Ok(FleetSummary {
            total_agents: all.len() as u64,
            online_agents: online_count,
            avg_cpu_usage: avg_cpu,
            avg_memory_usage: avg_memory,
            running_tasks: all.iter().map(|s| u64::from(s.running_tasks)).sum(),
            completed_tasks: all.iter().map(|s| s.completed_tasks).sum(),
            failed_tasks: all.iter().map(|s| s.failed_tasks).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect_for_testing;
    use crate::domain_types::WorkStatus;
    use crate::storage::SqliteMetricsStore;
    use crate::time_provider::{MockTimeProvider, TimeProvider};
    use tempfile::tempdir;

    fn snapshot(agent: &str, cpu: f64, running: u32, at: DateTime<Utc>) -> MetricsSnapshot {
        MetricsSnapshot {
            agent_id: AgentKey::try_new(agent.to_string()).unwrap(),
            cpu_usage: cpu,
            memory_usage: 0.5,
            disk_usage: 0.0,
            network_bytes_sent: 0,
            network_bytes_recv: 0,
            active_connections: 0,
            running_tasks: running,
            completed_tasks: 4,
            failed_tasks: 1,
            work_status: WorkStatus::Idle,
            scan_type: None,
            plugin_status: None,
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn test_should_report_not_found_for_agent_without_snapshot() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteMetricsStore::new(connect_for_testing(dir.path()).await));
        let aggregator = MetricsAggregator::new(store, Arc::new(MockTimeProvider::new()));

        let missing = AgentKey::try_new("nobody".to_string()).unwrap();
        assert!(matches!(
            aggregator.get_latest(&missing).await.unwrap_err(),
            FleetError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_should_aggregate_online_fleet_inside_staleness_window() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteMetricsStore::new(connect_for_testing(dir.path()).await));
        let clock = MockTimeProvider::new();
        let now = clock.now();

        store.upsert(&snapshot("a1", 0.2, 1, now)).await.unwrap();
        store.upsert(&snapshot("a2", 0.6, 2, now)).await.unwrap();
        store
            .upsert(&snapshot("a3", 1.0, 3, now - chrono::Duration::seconds(600)))
            .await
            .unwrap();

        let aggregator = MetricsAggregator::new(store, Arc::new(clock));
        let summary = aggregator
            .fleet_summary(StaleAfterSecs::try_new(90).unwrap())
            .await
            .unwrap();

        assert_eq!(summary.total_agents, 3);
        assert_eq!(summary.online_agents, 2);
        assert!((summary.avg_cpu_usage - 0.4).abs() < 1e-9);
        assert_eq!(summary.running_tasks, 6);
        assert_eq!(summary.completed_tasks, 12);
        assert_eq!(summary.failed_tasks, 3);
    }
}

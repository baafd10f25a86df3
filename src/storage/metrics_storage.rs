//! `SQLite` implementation of the metrics snapshot store.
//!
//! One row per Agent. The upsert carries the last-writer-wins guard in
//! SQL: an incoming snapshot older than the stored `timestamp` changes
//! nothing, regardless of arrival order. Plugin-status JSON is preserved
//! when the incoming value is null.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, sqlite::SqliteRow};

use crate::database::DatabaseConnection;
use crate::domain_types::{AgentKey, MetricsSnapshot, PageNumber, PageSize, WorkStatus};
use crate::error::{FleetError, FleetResult};
use crate::storage::{MetricsListFilter, MetricsStore, PagedRows, from_millis, to_millis};

const SELECT_SNAPSHOT_COLUMNS: &str = r"
    SELECT agent_id, cpu_usage, memory_usage, disk_usage,
           network_bytes_sent, network_bytes_recv, active_connections,
           running_tasks, completed_tasks, failed_tasks,
           work_status, scan_type, plugin_status, timestamp
    FROM agent_metrics
";

// The WHERE clause on excluded.timestamp makes stale writes no-ops; the
// CASE on plugin_status keeps the stored map when the update carries none.
const UPSERT_SNAPSHOT: &str = r"
    INSERT INTO agent_metrics (
        agent_id, cpu_usage, memory_usage, disk_usage,
        network_bytes_sent, network_bytes_recv, active_connections,
        running_tasks, completed_tasks, failed_tasks,
        work_status, scan_type, plugin_status, timestamp
    )
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
    ON CONFLICT (agent_id) DO UPDATE SET
        cpu_usage = excluded.cpu_usage,
        memory_usage = excluded.memory_usage,
        disk_usage = excluded.disk_usage,
        network_bytes_sent = excluded.network_bytes_sent,
        network_bytes_recv = excluded.network_bytes_recv,
        active_connections = excluded.active_connections,
        running_tasks = excluded.running_tasks,
        completed_tasks = excluded.completed_tasks,
        failed_tasks = excluded.failed_tasks,
        work_status = excluded.work_status,
        scan_type = excluded.scan_type,
        plugin_status = CASE
            WHEN excluded.plugin_status IS NULL THEN agent_metrics.plugin_status
            ELSE excluded.plugin_status
        END,
        timestamp = excluded.timestamp
    WHERE excluded.timestamp >= agent_metrics.timestamp
";

const DELETE_SNAPSHOT: &str = r"
    DELETE FROM agent_metrics WHERE agent_id = ?1
";

/// SQLite-backed metrics snapshot store
pub struct SqliteMetricsStore {
    db: DatabaseConnection,
}

impl SqliteMetricsStore {
    /// Create a store over an initialized database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn map_row(row: &SqliteRow) -> FleetResult<MetricsSnapshot> {
        let agent_id: String = row.get("agent_id");
        let work_status: String = row.get("work_status");
        let plugin_status: Option<String> = row.get("plugin_status");
        let plugin_status = plugin_status
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| {
                    FleetError::StorageFatal(format!("corrupt plugin status JSON: {e}"))
                })
            })
            .transpose()?;

        Ok(MetricsSnapshot {
            agent_id: AgentKey::try_new(agent_id)
                .map_err(|e| FleetError::StorageFatal(format!("corrupt agent id: {e}")))?,
            cpu_usage: row.get("cpu_usage"),
            memory_usage: row.get("memory_usage"),
            disk_usage: row.get("disk_usage"),
            network_bytes_sent: row.get::<i64, _>("network_bytes_sent").max(0) as u64,
            network_bytes_recv: row.get::<i64, _>("network_bytes_recv").max(0) as u64,
            active_connections: row.get::<i64, _>("active_connections").max(0) as u32,
            running_tasks: row.get::<i64, _>("running_tasks").max(0) as u32,
            completed_tasks: row.get::<i64, _>("completed_tasks").max(0) as u64,
            failed_tasks: row.get::<i64, _>("failed_tasks").max(0) as u64,
            work_status: WorkStatus::parse(&work_status).map_err(|_| {
                FleetError::StorageFatal(format!("corrupt work status: {work_status}"))
            })?,
            scan_type: row.get("scan_type"),
            plugin_status,
            timestamp: from_millis(row.get("timestamp"))?,
        })
    }

    async fn fetch_mapped(
        &self,
        builder: &mut QueryBuilder<'_, Sqlite>,
    ) -> FleetResult<Vec<MetricsSnapshot>> {
        let rows = builder
            .build()
            .fetch_all(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        rows.iter().map(Self::map_row).collect()
    }

    fn push_id_list(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[AgentKey]) {
        builder.push(" agent_id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str().to_string());
        }
        builder.push(")");
    }
}

#[async_trait]
impl MetricsStore for SqliteMetricsStore {
    async fn upsert(&self, snapshot: &MetricsSnapshot) -> FleetResult<bool> {
        let plugin_status = snapshot
            .plugin_status
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(UPSERT_SNAPSHOT)
            .bind(snapshot.agent_id.as_str())
            .bind(snapshot.cpu_usage)
            .bind(snapshot.memory_usage)
            .bind(snapshot.disk_usage)
            .bind(i64::try_from(snapshot.network_bytes_sent).unwrap_or(i64::MAX))
            .bind(i64::try_from(snapshot.network_bytes_recv).unwrap_or(i64::MAX))
            .bind(i64::from(snapshot.active_connections))
            .bind(i64::from(snapshot.running_tasks))
            .bind(i64::try_from(snapshot.completed_tasks).unwrap_or(i64::MAX))
            .bind(i64::try_from(snapshot.failed_tasks).unwrap_or(i64::MAX))
            .bind(snapshot.work_status.as_str())
            .bind(snapshot.scan_type.as_deref())
            .bind(plugin_status)
            .bind(to_millis(snapshot.timestamp))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, agent_id: &AgentKey) -> FleetResult<Option<MetricsSnapshot>> {
        let row = sqlx::query(&format!("{SELECT_SNAPSHOT_COLUMNS} WHERE agent_id = ?1"))
            .bind(agent_id.as_str())
            .fetch_optional(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list(
        &self,
        filter: &MetricsListFilter,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<MetricsSnapshot>> {
        let push_filter = |builder: &mut QueryBuilder<'_, Sqlite>| {
            if let Some(work_status) = filter.work_status {
                builder
                    .push(" AND work_status = ")
                    .push_bind(work_status.as_str());
            }
            if let Some(scan_type) = &filter.scan_type {
                builder
                    .push(" AND scan_type = ")
                    .push_bind(scan_type.clone());
            }
            if let Some(keyword) = &filter.keyword {
                builder
                    .push(" AND agent_id LIKE ")
                    .push_bind(format!("%{keyword}%"));
            }
        };

        let mut count_builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM agent_metrics WHERE 1=1");
        push_filter(&mut count_builder);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;

        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("{SELECT_SNAPSHOT_COLUMNS} WHERE 1=1"));
        push_filter(&mut builder);
        builder
            .push(" ORDER BY timestamp DESC LIMIT ")
            .push_bind(i64::from(page_size.as_u32()))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset(page_size)));

        let items = self.fetch_mapped(&mut builder).await?;
        Ok(PagedRows {
            items,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    async fn all(&self) -> FleetResult<Vec<MetricsSnapshot>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "{SELECT_SNAPSHOT_COLUMNS} ORDER BY timestamp DESC"
        ));
        self.fetch_mapped(&mut builder).await
    }

    async fn since(&self, t: DateTime<Utc>) -> FleetResult<Vec<MetricsSnapshot>> {
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("{SELECT_SNAPSHOT_COLUMNS} WHERE timestamp >= "));
        builder
            .push_bind(to_millis(t))
            .push(" ORDER BY timestamp DESC");
        self.fetch_mapped(&mut builder).await
    }

    async fn by_agent_ids(&self, ids: &[AgentKey]) -> FleetResult<Vec<MetricsSnapshot>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("{SELECT_SNAPSHOT_COLUMNS} WHERE"));
        Self::push_id_list(&mut builder, ids);
        builder.push(" ORDER BY timestamp DESC");
        self.fetch_mapped(&mut builder).await
    }

    async fn by_agent_ids_since(
        &self,
        ids: &[AgentKey],
        t: DateTime<Utc>,
    ) -> FleetResult<Vec<MetricsSnapshot>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("{SELECT_SNAPSHOT_COLUMNS} WHERE"));
        Self::push_id_list(&mut builder, ids);
        builder.push(" AND timestamp >= ").push_bind(to_millis(t));
        builder.push(" ORDER BY timestamp DESC");
        self.fetch_mapped(&mut builder).await
    }

    async fn delete(&self, agent_id: &AgentKey) -> FleetResult<bool> {
        let result = sqlx::query(DELETE_SNAPSHOT)
            .bind(agent_id.as_str())
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect_for_testing;
    use tempfile::tempdir;

    fn snapshot(agent: &str, cpu: f64, at: DateTime<Utc>) -> MetricsSnapshot {
        MetricsSnapshot {
            agent_id: AgentKey::try_new(agent.to_string()).unwrap(),
            cpu_usage: cpu,
            memory_usage: 0.4,
            disk_usage: 0.1,
            network_bytes_sent: 100,
            network_bytes_recv: 200,
            active_connections: 3,
            running_tasks: 1,
            completed_tasks: 10,
            failed_tasks: 0,
            work_status: WorkStatus::Scanning,
            scan_type: Some("portscan".to_string()),
            plugin_status: Some(serde_json::json!({"portscan": "ok"})),
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn test_should_keep_newest_snapshot_when_older_write_arrives_later() {
        let dir = tempdir().unwrap();
        let store = SqliteMetricsStore::new(connect_for_testing(dir.path()).await);
        let agent = AgentKey::try_new("a1".to_string()).unwrap();

        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(10);

        assert!(store.upsert(&snapshot("a1", 0.2, t2)).await.unwrap());
        // The older snapshot loses regardless of arrival order.
        assert!(!store.upsert(&snapshot("a1", 0.9, t1)).await.unwrap());

        let stored = store.get(&agent).await.unwrap().unwrap();
        assert!((stored.cpu_usage - 0.2).abs() < f64::EPSILON);
        assert_eq!(stored.timestamp.timestamp_millis(), t2.timestamp_millis());
    }

    #[tokio::test]
    async fn test_should_preserve_plugin_status_when_incoming_value_is_null() {
        let dir = tempdir().unwrap();
        let store = SqliteMetricsStore::new(connect_for_testing(dir.path()).await);
        let agent = AgentKey::try_new("a1".to_string()).unwrap();

        let t1 = Utc::now();
        store.upsert(&snapshot("a1", 0.2, t1)).await.unwrap();

        let mut next = snapshot("a1", 0.3, t1 + chrono::Duration::seconds(5));
        next.plugin_status = None;
        assert!(store.upsert(&next).await.unwrap());

        let stored = store.get(&agent).await.unwrap().unwrap();
        assert!((stored.cpu_usage - 0.3).abs() < f64::EPSILON);
        assert_eq!(
            stored.plugin_status,
            Some(serde_json::json!({"portscan": "ok"}))
        );
    }

    #[tokio::test]
    async fn test_should_filter_snapshots_by_window_and_agent_set() {
        let dir = tempdir().unwrap();
        let store = SqliteMetricsStore::new(connect_for_testing(dir.path()).await);

        let now = Utc::now();
        store
            .upsert(&snapshot("a1", 0.1, now - chrono::Duration::seconds(120)))
            .await
            .unwrap();
        store.upsert(&snapshot("a2", 0.2, now)).await.unwrap();
        store.upsert(&snapshot("a3", 0.3, now)).await.unwrap();

        let online = store
            .since(now - chrono::Duration::seconds(90))
            .await
            .unwrap();
        assert_eq!(online.len(), 2);

        let ids = vec![
            AgentKey::try_new("a1".to_string()).unwrap(),
            AgentKey::try_new("a3".to_string()).unwrap(),
        ];
        let subset = store.by_agent_ids(&ids).await.unwrap();
        assert_eq!(subset.len(), 2);

        let recent_subset = store
            .by_agent_ids_since(&ids, now - chrono::Duration::seconds(90))
            .await
            .unwrap();
        assert_eq!(recent_subset.len(), 1);
        assert_eq!(recent_subset[0].agent_id.as_str(), "a3");
    }

    #[tokio::test]
    async fn test_should_keep_single_row_per_agent_when_upserting_repeatedly() {
        let dir = tempdir().unwrap();
        let store = SqliteMetricsStore::new(connect_for_testing(dir.path()).await);

        let base = Utc::now();
        for i in 0..5 {
            store
                .upsert(&snapshot("a1", 0.1, base + chrono::Duration::seconds(i)))
                .await
                .unwrap();
        }
        assert_eq!(store.all().await.unwrap().len(), 1);
    }
}

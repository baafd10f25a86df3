//! `SQLite` implementation of the agent registry store.
//!
//! Capability and tag sets live in JSON array columns; set-containment
//! filters use the engine's `json_each` table-valued function so AND
//! semantics are evaluated inside the query.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, sqlite::SqliteRow};
use std::collections::HashSet;
use tracing::instrument;

use crate::database::DatabaseConnection;
use crate::domain_types::{
    Agent, AgentKey, AgentStatus, CapabilityId, HostName, PageNumber, PageSize, PortNumber, TagId,
};
use crate::error::{FleetError, FleetResult};
use crate::storage::{
    AgentListFilter, AgentStore, PagedRows, decode_id_list, encode_id_set, from_millis,
    from_millis_opt, to_millis,
};

const SELECT_AGENT_COLUMNS: &str = r"
    SELECT agent_id, hostname, port, ip_address, version, remark, status,
           capabilities, tags, last_heartbeat, created_at, updated_at
    FROM agents
";

const INSERT_AGENT: &str = r"
    INSERT INTO agents (agent_id, hostname, port, ip_address, version, remark,
                        status, capabilities, tags, last_heartbeat,
                        created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
";

const UPDATE_AGENT: &str = r"
    UPDATE agents
    SET hostname = ?2, port = ?3, ip_address = ?4, version = ?5, remark = ?6,
        status = ?7, capabilities = ?8, tags = ?9, updated_at = ?10
    WHERE agent_id = ?1
";

const RECORD_HEARTBEAT: &str = r"
    UPDATE agents SET status = ?2, last_heartbeat = ?3, updated_at = ?3
    WHERE agent_id = ?1
";

const UPDATE_STATUS: &str = r"
    UPDATE agents SET status = ?2, updated_at = ?3 WHERE agent_id = ?1
";

const SET_CAPABILITIES: &str = r"
    UPDATE agents SET capabilities = ?2, updated_at = ?3 WHERE agent_id = ?1
";

const SET_TAGS: &str = r"
    UPDATE agents SET tags = ?2, updated_at = ?3 WHERE agent_id = ?1
";

const DELETE_AGENT: &str = r"
    DELETE FROM agents WHERE agent_id = ?1
";

const SELECT_STALE: &str = r"
    SELECT agent_id, hostname, port, ip_address, version, remark, status,
           capabilities, tags, last_heartbeat, created_at, updated_at
    FROM agents
    WHERE status IN ('online', 'busy')
      AND (last_heartbeat IS NULL OR last_heartbeat < ?1)
    ORDER BY agent_id
";

/// SQLite-backed agent registry store
pub struct SqliteAgentStore {
    db: DatabaseConnection,
}

impl SqliteAgentStore {
    /// Create a store over an initialized database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn map_row(row: &SqliteRow) -> FleetResult<Agent> {
        let agent_id: String = row.get("agent_id");
        let hostname: String = row.get("hostname");
        let port: i64 = row.get("port");
        let status: String = row.get("status");
        let capabilities_raw: String = row.get("capabilities");
        let tags_raw: String = row.get("tags");

        let capabilities = decode_id_list(&capabilities_raw)?
            .into_iter()
            .map(|id| {
                CapabilityId::try_new(id)
                    .map_err(|e| FleetError::StorageFatal(format!("corrupt capability id: {e}")))
            })
            .collect::<FleetResult<HashSet<_>>>()?;
        let tags = decode_id_list(&tags_raw)?
            .into_iter()
            .map(|id| {
                TagId::try_new(id)
                    .map_err(|e| FleetError::StorageFatal(format!("corrupt tag id: {e}")))
            })
            .collect::<FleetResult<HashSet<_>>>()?;

        Ok(Agent {
            agent_id: AgentKey::try_new(agent_id)
                .map_err(|e| FleetError::StorageFatal(format!("corrupt agent id: {e}")))?,
            hostname: HostName::try_new(hostname)
                .map_err(|e| FleetError::StorageFatal(format!("corrupt hostname: {e}")))?,
            port: PortNumber::try_new(u16::try_from(port).unwrap_or(0))
                .map_err(|e| FleetError::StorageFatal(format!("corrupt port: {e}")))?,
            ip_address: row.get("ip_address"),
            version: row.get("version"),
            remark: row.get("remark"),
            status: AgentStatus::parse(&status)
                .map_err(|_| FleetError::StorageFatal(format!("corrupt status: {status}")))?,
            capabilities,
            tags,
            last_heartbeat: from_millis_opt(row.get("last_heartbeat"))?,
            created_at: from_millis(row.get("created_at"))?,
            updated_at: from_millis(row.get("updated_at"))?,
        })
    }

    fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &AgentListFilter) {
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(keyword) = &filter.keyword {
            let pattern = format!("%{keyword}%");
            builder
                .push(" AND (agent_id LIKE ")
                .push_bind(pattern.clone())
                .push(" OR hostname LIKE ")
                .push_bind(pattern.clone())
                .push(" OR COALESCE(ip_address, '') LIKE ")
                .push_bind(pattern.clone())
                .push(" OR COALESCE(remark, '') LIKE ")
                .push_bind(pattern)
                .push(")");
        }
        for tag in &filter.tags {
            builder
                .push(" AND EXISTS (SELECT 1 FROM json_each(agents.tags) WHERE json_each.value = ")
                .push_bind(tag.as_str().to_string())
                .push(")");
        }
        for capability in &filter.capabilities {
            builder
                .push(
                    " AND EXISTS (SELECT 1 FROM json_each(agents.capabilities) \
                     WHERE json_each.value = ",
                )
                .push_bind(capability.as_str().to_string())
                .push(")");
        }
    }
}

#[async_trait]
impl AgentStore for SqliteAgentStore {
    async fn get(&self, agent_id: &AgentKey) -> FleetResult<Option<Agent>> {
        let row = sqlx::query(&format!("{SELECT_AGENT_COLUMNS} WHERE agent_id = ?1"))
            .bind(agent_id.as_str())
            .fetch_optional(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn get_by_hostname_port(
        &self,
        hostname: &str,
        port: u16,
    ) -> FleetResult<Option<Agent>> {
        let row = sqlx::query(&format!(
            "{SELECT_AGENT_COLUMNS} WHERE hostname = ?1 AND port = ?2"
        ))
        .bind(hostname)
        .bind(i64::from(port))
        .fetch_optional(self.db.pool())
        .await
        .map_err(FleetError::from_sqlx)?;
        row.as_ref().map(Self::map_row).transpose()
    }

    #[instrument(skip(self, agent), fields(agent_id = %agent.agent_id))]
    async fn insert(&self, agent: &Agent) -> FleetResult<()> {
        sqlx::query(INSERT_AGENT)
            .bind(agent.agent_id.as_str())
            .bind(agent.hostname.as_str())
            .bind(i64::from(agent.port.as_u16()))
            .bind(agent.ip_address.as_deref())
            .bind(agent.version.as_deref())
            .bind(agent.remark.as_deref())
            .bind(agent.status.as_str())
            .bind(encode_id_set(agent.capabilities.iter().map(CapabilityId::as_str))?)
            .bind(encode_id_set(agent.tags.iter().map(TagId::as_str))?)
            .bind(agent.last_heartbeat.map(to_millis))
            .bind(to_millis(agent.created_at))
            .bind(to_millis(agent.updated_at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(())
    }

    #[instrument(skip(self, agent), fields(agent_id = %agent.agent_id))]
    async fn update(&self, agent: &Agent) -> FleetResult<()> {
        sqlx::query(UPDATE_AGENT)
            .bind(agent.agent_id.as_str())
            .bind(agent.hostname.as_str())
            .bind(i64::from(agent.port.as_u16()))
            .bind(agent.ip_address.as_deref())
            .bind(agent.version.as_deref())
            .bind(agent.remark.as_deref())
            .bind(agent.status.as_str())
            .bind(encode_id_set(agent.capabilities.iter().map(CapabilityId::as_str))?)
            .bind(encode_id_set(agent.tags.iter().map(TagId::as_str))?)
            .bind(to_millis(agent.updated_at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(())
    }

    async fn list(
        &self,
        filter: &AgentListFilter,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<Agent>> {
        let mut count_builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM agents WHERE 1=1");
        Self::push_filter(&mut count_builder, filter);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!("{SELECT_AGENT_COLUMNS} WHERE 1=1"));
        Self::push_filter(&mut builder, filter);
        builder
            .push(" ORDER BY agent_id LIMIT ")
            .push_bind(i64::from(page_size.as_u32()))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset(page_size)));

        let rows = builder
            .build()
            .fetch_all(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        let items = rows
            .iter()
            .map(Self::map_row)
            .collect::<FleetResult<Vec<_>>>()?;
        Ok(PagedRows {
            items,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    async fn record_heartbeat(
        &self,
        agent_id: &AgentKey,
        status: AgentStatus,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let result = sqlx::query(RECORD_HEARTBEAT)
            .bind(agent_id.as_str())
            .bind(status.as_str())
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_status(
        &self,
        agent_id: &AgentKey,
        status: AgentStatus,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let result = sqlx::query(UPDATE_STATUS)
            .bind(agent_id.as_str())
            .bind(status.as_str())
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_capabilities(
        &self,
        agent_id: &AgentKey,
        capabilities: &HashSet<CapabilityId>,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let result = sqlx::query(SET_CAPABILITIES)
            .bind(agent_id.as_str())
            .bind(encode_id_set(capabilities.iter().map(CapabilityId::as_str))?)
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_tags(
        &self,
        agent_id: &AgentKey,
        tags: &HashSet<TagId>,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let result = sqlx::query(SET_TAGS)
            .bind(agent_id.as_str())
            .bind(encode_id_set(tags.iter().map(TagId::as_str))?)
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(agent_id = %agent_id))]
    async fn delete(&self, agent_id: &AgentKey) -> FleetResult<bool> {
        let result = sqlx::query(DELETE_AGENT)
            .bind(agent_id.as_str())
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_by_status(&self, status: AgentStatus) -> FleetResult<Vec<Agent>> {
        let rows = sqlx::query(&format!(
            "{SELECT_AGENT_COLUMNS} WHERE status = ?1 ORDER BY agent_id"
        ))
        .bind(status.as_str())
        .fetch_all(self.db.pool())
        .await
        .map_err(FleetError::from_sqlx)?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> FleetResult<Vec<Agent>> {
        let rows = sqlx::query(SELECT_STALE)
            .bind(to_millis(cutoff))
            .fetch_all(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        rows.iter().map(Self::map_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect_for_testing;
    use tempfile::tempdir;

    fn sample_agent(id: &str, hostname: &str, port: u16) -> Agent {
        let now = Utc::now();
        Agent {
            agent_id: AgentKey::try_new(id.to_string()).unwrap(),
            hostname: HostName::try_new(hostname.to_string()).unwrap(),
            port: PortNumber::try_new(port).unwrap(),
            ip_address: Some("10.0.0.5".to_string()),
            version: Some("1.2.0".to_string()),
            remark: None,
            status: AgentStatus::Offline,
            capabilities: [CapabilityId::try_new("1".to_string()).unwrap()]
                .into_iter()
                .collect(),
            tags: [TagId::try_new("t1".to_string()).unwrap()]
                .into_iter()
                .collect(),
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_should_round_trip_agent_row_when_inserting() {
        let dir = tempdir().unwrap();
        let store = SqliteAgentStore::new(connect_for_testing(dir.path()).await);

        let agent = sample_agent("a1", "h", 9000);
        store.insert(&agent).await.unwrap();

        let loaded = store.get(&agent.agent_id).await.unwrap().unwrap();
        assert_eq!(loaded.hostname.as_str(), "h");
        assert_eq!(loaded.port.as_u16(), 9000);
        assert_eq!(loaded.status, AgentStatus::Offline);
        assert_eq!(loaded.capabilities, agent.capabilities);
        assert_eq!(loaded.tags, agent.tags);

        let by_endpoint = store.get_by_hostname_port("h", 9000).await.unwrap();
        assert!(by_endpoint.is_some());
    }

    #[tokio::test]
    async fn test_should_filter_by_tag_and_capability_containment_when_listing() {
        let dir = tempdir().unwrap();
        let store = SqliteAgentStore::new(connect_for_testing(dir.path()).await);

        let mut a = sample_agent("a1", "h1", 9000);
        a.capabilities = ["1", "2"]
            .iter()
            .map(|c| CapabilityId::try_new((*c).to_string()).unwrap())
            .collect();
        let b = sample_agent("a2", "h2", 9000);
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        let filter = AgentListFilter {
            capabilities: vec![
                CapabilityId::try_new("1".to_string()).unwrap(),
                CapabilityId::try_new("2".to_string()).unwrap(),
            ],
            ..Default::default()
        };
        let page = store
            .list(&filter, PageNumber::default(), PageSize::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].agent_id.as_str(), "a1");
    }

    #[tokio::test]
    async fn test_should_match_keyword_over_identity_fields_when_listing() {
        let dir = tempdir().unwrap();
        let store = SqliteAgentStore::new(connect_for_testing(dir.path()).await);

        store
            .insert(&sample_agent("edge-scanner", "h1", 9000))
            .await
            .unwrap();
        store.insert(&sample_agent("core", "h2", 9001)).await.unwrap();

        let filter = AgentListFilter {
            keyword: Some("edge".to_string()),
            ..Default::default()
        };
        let page = store
            .list(&filter, PageNumber::default(), PageSize::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].agent_id.as_str(), "edge-scanner");
    }

    #[tokio::test]
    async fn test_should_return_stale_agents_when_heartbeat_is_old() {
        let dir = tempdir().unwrap();
        let store = SqliteAgentStore::new(connect_for_testing(dir.path()).await);

        let agent = sample_agent("a1", "h1", 9000);
        store.insert(&agent).await.unwrap();

        let t0 = Utc::now();
        store
            .record_heartbeat(&agent.agent_id, AgentStatus::Online, t0)
            .await
            .unwrap();

        let fresh_cutoff = t0 - chrono::Duration::seconds(1);
        assert!(store.list_stale(fresh_cutoff).await.unwrap().is_empty());

        let stale_cutoff = t0 + chrono::Duration::seconds(91);
        let stale = store.list_stale(stale_cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].agent_id.as_str(), "a1");
    }

    #[tokio::test]
    async fn test_should_enforce_hostname_port_uniqueness_when_inserting_twice() {
        let dir = tempdir().unwrap();
        let store = SqliteAgentStore::new(connect_for_testing(dir.path()).await);

        store.insert(&sample_agent("a1", "h", 9000)).await.unwrap();
        let duplicate = store.insert(&sample_agent("a2", "h", 9000)).await;
        assert!(duplicate.is_err(), "duplicate (hostname, port) must be rejected");
    }
}

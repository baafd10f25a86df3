//! `SQLite` implementation of the task store.
//!
//! Ownership binding is a guarded UPDATE: the row moves from `pending`
//! with no owner to `assigned` with an owner in one statement, so no
//! reader can ever observe `assigned` without an owner or the reverse.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, sqlite::SqliteRow};
use std::collections::HashSet;
use tracing::instrument;

use crate::database::DatabaseConnection;
use crate::domain_types::{
    AgentKey, CapabilityId, ProgressPercent, TagId, Task, TaskId, TaskPriority, TaskStatus,
};
use crate::error::{FleetError, FleetResult};
use crate::storage::{TaskStore, decode_id_list, encode_id_set, from_millis, to_millis};

const SELECT_TASK_COLUMNS: &str = r"
    SELECT task_id, task_type, priority, status, owner_agent_id, config,
           required_capabilities, required_tags, progress, attempts,
           failure_reason, created_at, updated_at
    FROM tasks
";

const INSERT_TASK: &str = r"
    INSERT INTO tasks (task_id, task_type, priority, status, owner_agent_id,
                       config, required_capabilities, required_tags, progress,
                       attempts, failure_reason, created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
";

// The ownership CAS. rows_affected == 0 means another dispatcher won.
const TRY_ASSIGN: &str = r"
    UPDATE tasks
    SET owner_agent_id = ?2, status = 'assigned', updated_at = ?3
    WHERE task_id = ?1 AND status = 'pending' AND owner_agent_id IS NULL
";

const RELEASE_ASSIGNMENT: &str = r"
    UPDATE tasks
    SET owner_agent_id = NULL, status = 'pending',
        attempts = attempts + 1, updated_at = ?3
    WHERE task_id = ?1 AND status = 'assigned' AND owner_agent_id = ?2
";

const SET_PROGRESS: &str = r"
    UPDATE tasks SET progress = ?2, updated_at = ?3
    WHERE task_id = ?1 AND status = 'running'
";

const COUNT_ACTIVE_OWNED: &str = r"
    SELECT COUNT(*) FROM tasks
    WHERE owner_agent_id = ?1 AND status IN ('assigned', 'running', 'paused')
";

const FAIL_OWNED_BY: &str = r"
    UPDATE tasks
    SET status = 'failed', owner_agent_id = NULL,
        failure_reason = ?2, updated_at = ?3
    WHERE owner_agent_id = ?1 AND status IN ('assigned', 'running', 'paused')
";

/// SQLite-backed task store
pub struct SqliteTaskStore {
    db: DatabaseConnection,
}

impl SqliteTaskStore {
    /// Create a store over an initialized database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn map_row(row: &SqliteRow) -> FleetResult<Task> {
        let task_id: String = row.get("task_id");
        let status: String = row.get("status");
        let owner: Option<String> = row.get("owner_agent_id");
        let config_raw: String = row.get("config");
        let caps_raw: String = row.get("required_capabilities");
        let tags_raw: String = row.get("required_tags");

        let required_capabilities = decode_id_list(&caps_raw)?
            .into_iter()
            .map(|id| {
                CapabilityId::try_new(id)
                    .map_err(|e| FleetError::StorageFatal(format!("corrupt capability id: {e}")))
            })
            .collect::<FleetResult<HashSet<_>>>()?;
        let required_tags = decode_id_list(&tags_raw)?
            .into_iter()
            .map(|id| {
                TagId::try_new(id)
                    .map_err(|e| FleetError::StorageFatal(format!("corrupt tag id: {e}")))
            })
            .collect::<FleetResult<HashSet<_>>>()?;

        Ok(Task {
            task_id: TaskId::parse(&task_id)
                .map_err(|_| FleetError::StorageFatal(format!("corrupt task id: {task_id}")))?,
            task_type: row.get("task_type"),
            priority: TaskPriority::try_new(row.get::<i64, _>("priority").clamp(0, 9) as u8)
                .map_err(|e| FleetError::StorageFatal(format!("corrupt priority: {e}")))?,
            status: TaskStatus::parse(&status)
                .map_err(|_| FleetError::StorageFatal(format!("corrupt status: {status}")))?,
            owner_agent_id: owner
                .map(|o| {
                    AgentKey::try_new(o)
                        .map_err(|e| FleetError::StorageFatal(format!("corrupt owner: {e}")))
                })
                .transpose()?,
            config: serde_json::from_str(&config_raw)
                .map_err(|e| FleetError::StorageFatal(format!("corrupt task config: {e}")))?,
            required_capabilities,
            required_tags,
            progress: ProgressPercent::try_new(row.get::<i64, _>("progress").clamp(0, 100) as u8)
                .map_err(|e| FleetError::StorageFatal(format!("corrupt progress: {e}")))?,
            attempts: row.get::<i64, _>("attempts").max(0) as u32,
            failure_reason: row.get("failure_reason"),
            created_at: from_millis(row.get("created_at"))?,
            updated_at: from_millis(row.get("updated_at"))?,
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self, task), fields(task_id = %task.task_id))]
    async fn insert(&self, task: &Task) -> FleetResult<()> {
        sqlx::query(INSERT_TASK)
            .bind(task.task_id.to_string())
            .bind(&task.task_type)
            .bind(i64::from(task.priority.as_u8()))
            .bind(task.status.as_str())
            .bind(task.owner_agent_id.as_ref().map(AgentKey::as_str))
            .bind(serde_json::to_string(&task.config)?)
            .bind(encode_id_set(
                task.required_capabilities.iter().map(CapabilityId::as_str),
            )?)
            .bind(encode_id_set(task.required_tags.iter().map(TagId::as_str))?)
            .bind(i64::from(task.progress.as_u8()))
            .bind(i64::from(task.attempts))
            .bind(task.failure_reason.as_deref())
            .bind(to_millis(task.created_at))
            .bind(to_millis(task.updated_at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> FleetResult<Option<Task>> {
        let row = sqlx::query(&format!("{SELECT_TASK_COLUMNS} WHERE task_id = ?1"))
            .bind(task_id.to_string())
            .fetch_optional(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        row.as_ref().map(Self::map_row).transpose()
    }

    #[instrument(skip(self), fields(task_id = %task_id, agent_id = %agent_id))]
    async fn try_assign(
        &self,
        task_id: &TaskId,
        agent_id: &AgentKey,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let result = sqlx::query(TRY_ASSIGN)
            .bind(task_id.to_string())
            .bind(agent_id.as_str())
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(task_id = %task_id, agent_id = %agent_id))]
    async fn release_assignment(
        &self,
        task_id: &TaskId,
        agent_id: &AgentKey,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let result = sqlx::query(RELEASE_ASSIGNMENT)
            .bind(task_id.to_string())
            .bind(agent_id.as_str())
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        from: &[TaskStatus],
        to: TaskStatus,
        failure_reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE tasks SET status = ");
        builder.push_bind(to.as_str());
        if !to.requires_owner() {
            builder.push(", owner_agent_id = NULL");
        }
        if to == TaskStatus::Completed {
            builder.push(", progress = 100");
        }
        if let Some(reason) = failure_reason {
            builder
                .push(", failure_reason = ")
                .push_bind(reason.to_string());
        }
        builder.push(", updated_at = ").push_bind(to_millis(at));
        builder.push(" WHERE task_id = ").push_bind(task_id.to_string());
        builder.push(" AND status IN (");
        let mut separated = builder.separated(", ");
        for status in from {
            separated.push_bind(status.as_str());
        }
        builder.push(")");

        let result = builder
            .build()
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_progress(
        &self,
        task_id: &TaskId,
        progress: u8,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let result = sqlx::query(SET_PROGRESS)
            .bind(task_id.to_string())
            .bind(i64::from(progress.min(100)))
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(agent_id = %agent_id))]
    async fn fail_owned_by(
        &self,
        agent_id: &AgentKey,
        reason: &str,
        at: DateTime<Utc>,
    ) -> FleetResult<u64> {
        let result = sqlx::query(FAIL_OWNED_BY)
            .bind(agent_id.as_str())
            .bind(reason)
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn count_active_owned(&self, agent_id: &AgentKey) -> FleetResult<u64> {
        let count: i64 = sqlx::query_scalar(COUNT_ACTIVE_OWNED)
            .bind(agent_id.as_str())
            .fetch_one(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn list_by_statuses(&self, statuses: &[TaskStatus]) -> FleetResult<Vec<Task>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("{SELECT_TASK_COLUMNS} WHERE status IN ("));
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        builder.push(") ORDER BY created_at, task_id");

        let rows = builder
            .build()
            .fetch_all(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        rows.iter().map(Self::map_row).collect()
    }
}

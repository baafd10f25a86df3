//! `SQLite` implementation of the ETL error store.
//!
//! Rows move `new -> retrying` under a guard so a replay pass cannot
//! double-submit, then land in `resolved`, `abandoned`, or back in `new`
//! for the next pass.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, sqlite::SqliteRow};
use tracing::instrument;

use crate::database::DatabaseConnection;
use crate::domain_types::{EtlError, EtlErrorStatus, EtlStage, PageNumber, PageSize};
use crate::error::{FleetError, FleetResult};
use crate::storage::{EtlErrorFilter, EtlErrorStore, NewEtlError, PagedRows, from_millis, to_millis};

const SELECT_ERROR_COLUMNS: &str = r"
    SELECT id, task_id, result_type, error_stage, status, raw_ref,
           replay_count, err_msg, created_at, updated_at
    FROM etl_errors
";

const INSERT_ERROR: &str = r"
    INSERT INTO etl_errors (task_id, result_type, error_stage, status,
                            raw_ref, replay_count, err_msg, created_at, updated_at)
    VALUES (?1, ?2, ?3, 'new', ?4, 0, ?5, ?6, ?6)
";

const MARK_RETRYING: &str = r"
    UPDATE etl_errors
    SET status = 'retrying', replay_count = replay_count + 1, updated_at = ?2
    WHERE id = ?1 AND status = 'new'
";

const MARK_RESOLVED: &str = r"
    UPDATE etl_errors SET status = 'resolved', updated_at = ?2
    WHERE id = ?1 AND status = 'retrying'
";

const MARK_ABANDONED: &str = r"
    UPDATE etl_errors SET status = 'abandoned', updated_at = ?2
    WHERE id = ?1 AND status = 'retrying'
";

const REVERT_TO_NEW: &str = r"
    UPDATE etl_errors SET status = 'new', err_msg = ?2, updated_at = ?3
    WHERE id = ?1 AND status = 'retrying'
";

const SELECT_NEW: &str = r"
    SELECT id, task_id, result_type, error_stage, status, raw_ref,
           replay_count, err_msg, created_at, updated_at
    FROM etl_errors
    WHERE status = 'new'
    ORDER BY id
";

/// SQLite-backed ETL error store
pub struct SqliteEtlErrorStore {
    db: DatabaseConnection,
}

impl SqliteEtlErrorStore {
    /// Create a store over an initialized database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn map_row(row: &SqliteRow) -> FleetResult<EtlError> {
        let stage: String = row.get("error_stage");
        let status: String = row.get("status");
        Ok(EtlError {
            id: row.get("id"),
            task_id: row.get("task_id"),
            result_type: row.get("result_type"),
            error_stage: EtlStage::parse(&stage)
                .map_err(|_| FleetError::StorageFatal(format!("corrupt stage: {stage}")))?,
            status: EtlErrorStatus::parse(&status)
                .map_err(|_| FleetError::StorageFatal(format!("corrupt status: {status}")))?,
            raw_ref: row.get("raw_ref"),
            replay_count: row.get::<i64, _>("replay_count").max(0) as u32,
            err_msg: row.get("err_msg"),
            created_at: from_millis(row.get("created_at"))?,
            updated_at: from_millis(row.get("updated_at"))?,
        })
    }
}

#[async_trait]
impl EtlErrorStore for SqliteEtlErrorStore {
    #[instrument(skip(self, error), fields(stage = error.stage.as_str(), raw_ref = error.raw_ref))]
    async fn insert(&self, error: &NewEtlError, at: DateTime<Utc>) -> FleetResult<i64> {
        let result = sqlx::query(INSERT_ERROR)
            .bind(error.task_id.as_deref())
            .bind(&error.result_type)
            .bind(error.stage.as_str())
            .bind(error.raw_ref)
            .bind(&error.err_msg)
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.last_insert_rowid())
    }

    async fn list(
        &self,
        filter: &EtlErrorFilter,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<EtlError>> {
        let push_filter = |builder: &mut QueryBuilder<'_, Sqlite>| {
            if let Some(status) = filter.status {
                builder.push(" AND status = ").push_bind(status.as_str());
            }
            if let Some(stage) = filter.stage {
                builder.push(" AND error_stage = ").push_bind(stage.as_str());
            }
            if let Some(result_type) = &filter.result_type {
                builder
                    .push(" AND result_type = ")
                    .push_bind(result_type.clone());
            }
        };

        let mut count_builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM etl_errors WHERE 1=1");
        push_filter(&mut count_builder);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!("{SELECT_ERROR_COLUMNS} WHERE 1=1"));
        push_filter(&mut builder);
        builder
            .push(" ORDER BY id DESC LIMIT ")
            .push_bind(i64::from(page_size.as_u32()))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset(page_size)));
        let rows = builder
            .build()
            .fetch_all(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;

        Ok(PagedRows {
            items: rows.iter().map(Self::map_row).collect::<FleetResult<_>>()?,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    async fn list_new(&self) -> FleetResult<Vec<EtlError>> {
        let rows = sqlx::query(SELECT_NEW)
            .fetch_all(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn mark_retrying(&self, id: i64, at: DateTime<Utc>) -> FleetResult<bool> {
        let result = sqlx::query(MARK_RETRYING)
            .bind(id)
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_resolved(&self, id: i64, at: DateTime<Utc>) -> FleetResult<bool> {
        let result = sqlx::query(MARK_RESOLVED)
            .bind(id)
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_abandoned(&self, id: i64, at: DateTime<Utc>) -> FleetResult<bool> {
        let result = sqlx::query(MARK_ABANDONED)
            .bind(id)
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn revert_to_new(&self, id: i64, err_msg: &str, at: DateTime<Utc>) -> FleetResult<bool> {
        let result = sqlx::query(REVERT_TO_NEW)
            .bind(id)
            .bind(err_msg)
            .bind(to_millis(at))
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

    fn parse_failure(raw_ref: i64) -> NewEtlError {
        NewEtlError {
            task_id: None,
            result_type: "asset".to_string(),
            stage: EtlStage::Parse,
            raw_ref,
            err_msg: "payload is not JSON".to_string(),
        }
    }

    #[tokio::test]
    async fn test_should_walk_replay_states_with_guards() {
        let dir = tempdir().unwrap();
        let store = SqliteEtlErrorStore::new(connect_for_testing(dir.path()).await);
        let now = Utc::now();

        let id = store.insert(&parse_failure(7), now).await.unwrap();
        assert_eq!(store.list_new().await.unwrap().len(), 1);

        assert!(store.mark_retrying(id, now).await.unwrap());
        // A second replay pass must not grab it again.
        assert!(!store.mark_retrying(id, now).await.unwrap());
        assert!(store.list_new().await.unwrap().is_empty());

        assert!(store.revert_to_new(id, "still broken", now).await.unwrap());
        assert!(store.mark_retrying(id, now).await.unwrap());
        assert!(store.mark_abandoned(id, now).await.unwrap());

        let page = store
            .list(
                &EtlErrorFilter {
                    status: Some(EtlErrorStatus::Abandoned),
                    ..Default::default()
                },
                PageNumber::default(),
                PageSize::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].replay_count, 2);
        assert_eq!(page.items[0].err_msg, "still broken");
    }

    #[tokio::test]
    async fn test_should_filter_by_stage_when_listing() {
        let dir = tempdir().unwrap();
        let store = SqliteEtlErrorStore::new(connect_for_testing(dir.path()).await);
        let now = Utc::now();

        store.insert(&parse_failure(1), now).await.unwrap();
        let mut validate = parse_failure(2);
        validate.stage = EtlStage::Validate;
        store.insert(&validate, now).await.unwrap();

        let page = store
            .list(
                &EtlErrorFilter {
                    stage: Some(EtlStage::Validate),
                    ..Default::default()
                },
                PageNumber::default(),
                PageSize::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].error_stage, EtlStage::Validate);
    }
}

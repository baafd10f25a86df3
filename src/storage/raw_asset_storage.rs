//! `SQLite` implementation of the raw ingest staging store.
//!
//! Append-only ingress: rows arrive `pending` and only their status and
//! error columns ever change afterwards, preserving payloads for replay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, sqlite::SqliteRow};
use tracing::instrument;

use crate::database::DatabaseConnection;
use crate::domain_types::{
    ApprovalStatus, BatchId, PageNumber, PageSize, RawAsset, RawAssetNetwork, RawAssetStatus,
};
use crate::error::{FleetError, FleetResult};
use crate::storage::{PagedRows, RawAssetStore, from_millis, to_millis};

const SELECT_ASSET_COLUMNS: &str = r"
    SELECT id, batch_id, source_type, payload, status, err_msg,
           created_at, updated_at
    FROM raw_assets
";

const SELECT_NETWORK_COLUMNS: &str = r"
    SELECT id, batch_id, source_type, payload, status, approval_status,
           err_msg, created_at, updated_at
    FROM raw_asset_networks
";

const INSERT_ASSET: &str = r"
    INSERT INTO raw_assets (batch_id, source_type, payload, status,
                            created_at, updated_at)
    VALUES (?1, ?2, ?3, 'pending', ?4, ?4)
";

const INSERT_NETWORK: &str = r"
    INSERT INTO raw_asset_networks (batch_id, source_type, payload, status,
                                    approval_status, created_at, updated_at)
    VALUES (?1, ?2, ?3, 'pending', 'pending_review', ?4, ?4)
";

const CLAIM_ASSET: &str = r"
    UPDATE raw_assets SET status = 'processing', updated_at = ?2
    WHERE id = ?1 AND status = 'pending'
";

const CLAIM_NETWORK: &str = r"
    UPDATE raw_asset_networks SET status = 'processing', updated_at = ?2
    WHERE id = ?1 AND status = 'pending'
";

const MARK_ASSET: &str = r"
    UPDATE raw_assets SET status = ?2, err_msg = ?3, updated_at = ?4
    WHERE id = ?1
";

const MARK_NETWORK: &str = r"
    UPDATE raw_asset_networks SET status = ?2, err_msg = ?3, updated_at = ?4
    WHERE id = ?1
";

const SET_NETWORK_APPROVAL: &str = r"
    UPDATE raw_asset_networks SET approval_status = ?3, updated_at = ?4
    WHERE id = ?1 AND approval_status = ?2
";

const SELECT_PENDING_IN_BATCH: &str = r"
    SELECT id, batch_id, source_type, payload, status, err_msg,
           created_at, updated_at
    FROM raw_assets
    WHERE batch_id = ?1 AND status = 'pending'
    ORDER BY id
";

const SELECT_PENDING_APPROVED_NETWORKS: &str = r"
    SELECT id, batch_id, source_type, payload, status, approval_status,
           err_msg, created_at, updated_at
    FROM raw_asset_networks
    WHERE status = 'pending' AND approval_status = 'approved'
    ORDER BY id
";

/// SQLite-backed raw ingest staging store
pub struct SqliteRawAssetStore {
    db: DatabaseConnection,
}

impl SqliteRawAssetStore {
    /// Create a store over an initialized database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn map_asset(row: &SqliteRow) -> FleetResult<RawAsset> {
        let batch_id: String = row.get("batch_id");
        let status: String = row.get("status");
        Ok(RawAsset {
            id: row.get("id"),
            batch_id: BatchId::parse(&batch_id)
                .map_err(|_| FleetError::StorageFatal(format!("corrupt batch id: {batch_id}")))?,
            source_type: row.get("source_type"),
            payload: row.get("payload"),
            status: RawAssetStatus::parse(&status)
                .map_err(|_| FleetError::StorageFatal(format!("corrupt status: {status}")))?,
            err_msg: row.get("err_msg"),
            created_at: from_millis(row.get("created_at"))?,
            updated_at: from_millis(row.get("updated_at"))?,
        })
    }

    fn map_network(row: &SqliteRow) -> FleetResult<RawAssetNetwork> {
        let batch_id: String = row.get("batch_id");
        let status: String = row.get("status");
        let approval: String = row.get("approval_status");
        Ok(RawAssetNetwork {
            id: row.get("id"),
            batch_id: BatchId::parse(&batch_id)
                .map_err(|_| FleetError::StorageFatal(format!("corrupt batch id: {batch_id}")))?,
            source_type: row.get("source_type"),
            payload: row.get("payload"),
            status: RawAssetStatus::parse(&status)
                .map_err(|_| FleetError::StorageFatal(format!("corrupt status: {status}")))?,
            approval_status: ApprovalStatus::parse(&approval)
                .map_err(|_| FleetError::StorageFatal(format!("corrupt approval: {approval}")))?,
            err_msg: row.get("err_msg"),
            created_at: from_millis(row.get("created_at"))?,
            updated_at: from_millis(row.get("updated_at"))?,
        })
    }
}

#[async_trait]
impl RawAssetStore for SqliteRawAssetStore {
    #[instrument(skip(self, payloads), fields(batch_id = %batch_id, rows = payloads.len()))]
    async fn insert_assets(
        &self,
        batch_id: BatchId,
        source_type: &str,
        payloads: &[String],
        at: DateTime<Utc>,
    ) -> FleetResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let result = sqlx::query(INSERT_ASSET)
                .bind(batch_id.to_string())
                .bind(source_type)
                .bind(payload)
                .bind(to_millis(at))
                .execute(self.db.pool())
                .await
                .map_err(FleetError::from_sqlx)?;
            ids.push(result.last_insert_rowid());
        }
        Ok(ids)
    }

    #[instrument(skip(self, payloads), fields(batch_id = %batch_id, rows = payloads.len()))]
    async fn insert_networks(
        &self,
        batch_id: BatchId,
        source_type: &str,
        payloads: &[String],
        at: DateTime<Utc>,
    ) -> FleetResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let result = sqlx::query(INSERT_NETWORK)
                .bind(batch_id.to_string())
                .bind(source_type)
                .bind(payload)
                .bind(to_millis(at))
                .execute(self.db.pool())
                .await
                .map_err(FleetError::from_sqlx)?;
            ids.push(result.last_insert_rowid());
        }
        Ok(ids)
    }

    async fn get_asset(&self, id: i64) -> FleetResult<Option<RawAsset>> {
        let row = sqlx::query(&format!("{SELECT_ASSET_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        row.as_ref().map(Self::map_asset).transpose()
    }

    async fn get_network(&self, id: i64) -> FleetResult<Option<RawAssetNetwork>> {
        let row = sqlx::query(&format!("{SELECT_NETWORK_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        row.as_ref().map(Self::map_network).transpose()
    }

    async fn list_assets(
        &self,
        status: Option<RawAssetStatus>,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<RawAsset>> {
        let push_filter = |builder: &mut QueryBuilder<'_, Sqlite>| {
            if let Some(status) = status {
                builder.push(" AND status = ").push_bind(status.as_str());
            }
        };

        let mut count_builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM raw_assets WHERE 1=1");
        push_filter(&mut count_builder);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!("{SELECT_ASSET_COLUMNS} WHERE 1=1"));
        push_filter(&mut builder);
        builder
            .push(" ORDER BY id LIMIT ")
            .push_bind(i64::from(page_size.as_u32()))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset(page_size)));
        let rows = builder
            .build()
            .fetch_all(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;

        Ok(PagedRows {
            items: rows.iter().map(Self::map_asset).collect::<FleetResult<_>>()?,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    async fn list_networks(
        &self,
        approval: Option<ApprovalStatus>,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<RawAssetNetwork>> {
        let push_filter = |builder: &mut QueryBuilder<'_, Sqlite>| {
            if let Some(approval) = approval {
                builder
                    .push(" AND approval_status = ")
                    .push_bind(approval.as_str());
            }
        };

        let mut count_builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM raw_asset_networks WHERE 1=1");
        push_filter(&mut count_builder);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;

        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("{SELECT_NETWORK_COLUMNS} WHERE 1=1"));
        push_filter(&mut builder);
        builder
            .push(" ORDER BY id LIMIT ")
            .push_bind(i64::from(page_size.as_u32()))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset(page_size)));
        let rows = builder
            .build()
            .fetch_all(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;

        Ok(PagedRows {
            items: rows
                .iter()
                .map(Self::map_network)
                .collect::<FleetResult<_>>()?,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    async fn next_pending_batch(&self, exclude: &[BatchId]) -> FleetResult<Option<BatchId>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT batch_id FROM raw_assets WHERE status = 'pending'",
        );
        if !exclude.is_empty() {
            builder.push(" AND batch_id NOT IN (");
            let mut separated = builder.separated(", ");
            for batch in exclude {
                separated.push_bind(batch.to_string());
            }
            builder.push(")");
        }
        builder.push(" GROUP BY batch_id ORDER BY MIN(id) LIMIT 1");

        let row: Option<String> = builder
            .build_query_scalar()
            .fetch_optional(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        row.map(|raw| {
            BatchId::parse(&raw)
                .map_err(|_| FleetError::StorageFatal(format!("corrupt batch id: {raw}")))
        })
        .transpose()
    }

    async fn pending_assets_in_batch(&self, batch_id: BatchId) -> FleetResult<Vec<RawAsset>> {
        let rows = sqlx::query(SELECT_PENDING_IN_BATCH)
            .bind(batch_id.to_string())
            .fetch_all(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        rows.iter().map(Self::map_asset).collect()
    }

    async fn pending_approved_networks(&self) -> FleetResult<Vec<RawAssetNetwork>> {
        let rows = sqlx::query(SELECT_PENDING_APPROVED_NETWORKS)
            .fetch_all(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        rows.iter().map(Self::map_network).collect()
    }

    async fn claim_asset(&self, id: i64, at: DateTime<Utc>) -> FleetResult<bool> {
        let result = sqlx::query(CLAIM_ASSET)
            .bind(id)
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_network(&self, id: i64, at: DateTime<Utc>) -> FleetResult<bool> {
        let result = sqlx::query(CLAIM_NETWORK)
            .bind(id)
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_asset(
        &self,
        id: i64,
        status: RawAssetStatus,
        err_msg: Option<&str>,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let result = sqlx::query(MARK_ASSET)
            .bind(id)
            .bind(status.as_str())
            .bind(err_msg)
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_network(
        &self,
        id: i64,
        status: RawAssetStatus,
        err_msg: Option<&str>,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let result = sqlx::query(MARK_NETWORK)
            .bind(id)
            .bind(status.as_str())
            .bind(err_msg)
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn set_network_approval(
        &self,
        id: i64,
        from: ApprovalStatus,
        to: ApprovalStatus,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let result = sqlx::query(SET_NETWORK_APPROVAL)
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
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

    #[tokio::test]
    async fn test_should_stage_rows_as_pending_when_ingesting_batch() {
        let dir = tempdir().unwrap();
        let store = SqliteRawAssetStore::new(connect_for_testing(dir.path()).await);

        let batch = BatchId::generate();
        let ids = store
            .insert_assets(
                batch,
                "portscan",
                &["{\"ip\":\"10.0.0.1\"}".to_string(), "{}".to_string()],
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let rows = store.pending_assets_in_batch(batch).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id), "id order");
        assert!(rows.iter().all(|r| r.status == RawAssetStatus::Pending));
    }

    #[tokio::test]
    async fn test_should_pick_earliest_batch_and_honor_exclusions() {
        let dir = tempdir().unwrap();
        let store = SqliteRawAssetStore::new(connect_for_testing(dir.path()).await);

        let first = BatchId::generate();
        let second = BatchId::generate();
        store
            .insert_assets(first, "s", &["{}".to_string()], Utc::now())
            .await
            .unwrap();
        store
            .insert_assets(second, "s", &["{}".to_string()], Utc::now())
            .await
            .unwrap();

        assert_eq!(store.next_pending_batch(&[]).await.unwrap(), Some(first));
        assert_eq!(
            store.next_pending_batch(&[first]).await.unwrap(),
            Some(second)
        );
        assert_eq!(store.next_pending_batch(&[first, second]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_should_guard_approval_transition_from_expected_state() {
        let dir = tempdir().unwrap();
        let store = SqliteRawAssetStore::new(connect_for_testing(dir.path()).await);

        let ids = store
            .insert_networks(
                BatchId::generate(),
                "discovery",
                &["{\"cidr\":\"10.1.0.0/24\"}".to_string()],
                Utc::now(),
            )
            .await
            .unwrap();
        let id = ids[0];

        assert!(store
            .set_network_approval(
                id,
                ApprovalStatus::PendingReview,
                ApprovalStatus::Approved,
                Utc::now()
            )
            .await
            .unwrap());
        // Second approve from pending_review must miss the guard.
        assert!(!store
            .set_network_approval(
                id,
                ApprovalStatus::PendingReview,
                ApprovalStatus::Rejected,
                Utc::now()
            )
            .await
            .unwrap());

        let row = store.get_network(id).await.unwrap().unwrap();
        assert_eq!(row.approval_status, ApprovalStatus::Approved);

        let approved = store.pending_approved_networks().await.unwrap();
        assert_eq!(approved.len(), 1);
    }

    #[tokio::test]
    async fn test_should_record_failure_detail_when_marking_failed() {
        let dir = tempdir().unwrap();
        let store = SqliteRawAssetStore::new(connect_for_testing(dir.path()).await);

        let ids = store
            .insert_assets(BatchId::generate(), "s", &["oops".to_string()], Utc::now())
            .await
            .unwrap();
        store
            .mark_asset(
                ids[0],
                RawAssetStatus::Failed,
                Some("payload is not JSON"),
                Utc::now(),
            )
            .await
            .unwrap();

        let row = store.get_asset(ids[0]).await.unwrap().unwrap();
        assert_eq!(row.status, RawAssetStatus::Failed);
        assert_eq!(row.err_msg.as_deref(), Some("payload is not JSON"));
    }
}

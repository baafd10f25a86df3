//! `SQLite` implementation of the unified asset store.
//!
//! The merge upsert runs read-merge-write inside one transaction so
//! concurrent writers on the same `(project_id, ip, port)` key serialize
//! on the row. A racing INSERT is retried once as an UPDATE; a lock-wait
//! failure is retried once with jitter before surfacing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::{QueryBuilder, Row, Sqlite, sqlite::SqliteRow};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::database::DatabaseConnection;
use crate::domain_types::{PageNumber, PageSize, ProjectId, UnifiedAsset};
use crate::error::{FleetError, FleetResult};
use crate::etl::{NormalizedAsset, merge_unified};
use crate::storage::{PagedRows, UnifiedAssetStore, from_millis, to_millis};

const SELECT_UNIFIED_COLUMNS: &str = r"
    SELECT id, project_id, ip, port, service, product, component, is_web,
           metadata, created_at, updated_at
    FROM asset_unified
";

const INSERT_UNIFIED: &str = r"
    INSERT INTO asset_unified (project_id, ip, port, service, product,
                               component, is_web, metadata, created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
";

const UPDATE_UNIFIED: &str = r"
    UPDATE asset_unified
    SET service = ?2, product = ?3, component = ?4, is_web = ?5,
        metadata = ?6, updated_at = ?7
    WHERE id = ?1
";

// Satellite upserts merge in SQL: empty incoming strings preserve the
// stored value, mirroring the unified-row rule.
const UPSERT_HOST: &str = r"
    INSERT INTO asset_host (project_id, ip, hostname, os, created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?5)
    ON CONFLICT (project_id, ip) DO UPDATE SET
        hostname = CASE WHEN excluded.hostname = '' THEN asset_host.hostname
                        ELSE excluded.hostname END,
        os = CASE WHEN excluded.os = '' THEN asset_host.os ELSE excluded.os END,
        updated_at = excluded.updated_at
";

const UPSERT_SERVICE: &str = r"
    INSERT INTO asset_service (unified_id, name, version, banner, created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?5)
    ON CONFLICT (unified_id, name) DO UPDATE SET
        version = CASE WHEN excluded.version = '' THEN asset_service.version
                       ELSE excluded.version END,
        banner = CASE WHEN excluded.banner = '' THEN asset_service.banner
                      ELSE excluded.banner END,
        updated_at = excluded.updated_at
";

const UPSERT_WEB: &str = r"
    INSERT INTO asset_web (unified_id, url, title, server, created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?5)
    ON CONFLICT (unified_id, url) DO UPDATE SET
        title = CASE WHEN excluded.title = '' THEN asset_web.title
                     ELSE excluded.title END,
        server = CASE WHEN excluded.server = '' THEN asset_web.server
                      ELSE excluded.server END,
        updated_at = excluded.updated_at
    RETURNING id
";

const UPSERT_WEB_DETAIL: &str = r"
    INSERT INTO asset_web_detail (web_id, status_code, headers, body_digest, created_at)
    VALUES (?1, ?2, '{}', '', ?3)
    ON CONFLICT (web_id) DO UPDATE SET
        status_code = COALESCE(excluded.status_code, asset_web_detail.status_code)
";

const UPSERT_VULN: &str = r"
    INSERT INTO asset_vuln (unified_id, name, severity, source, detail,
                            created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
    ON CONFLICT (unified_id, name) DO UPDATE SET
        severity = CASE WHEN excluded.severity = '' THEN asset_vuln.severity
                        ELSE excluded.severity END,
        source = CASE WHEN excluded.source = '' THEN asset_vuln.source
                      ELSE excluded.source END,
        detail = CASE WHEN excluded.detail = '' THEN asset_vuln.detail
                      ELSE excluded.detail END,
        updated_at = excluded.updated_at
";

const SKIP_LISTED: &str = r"
    SELECT EXISTS (SELECT 1 FROM asset_skip_policy WHERE ip = ?1)
";

const INSERT_SKIP_POLICY: &str = r"
    INSERT OR IGNORE INTO asset_skip_policy (ip, reason, created_at)
    VALUES (?1, ?2, ?3)
";

/// SQLite-backed unified asset store
pub struct SqliteUnifiedAssetStore {
    db: DatabaseConnection,
}

impl SqliteUnifiedAssetStore {
    /// Create a store over an initialized database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn map_row(row: &SqliteRow) -> FleetResult<UnifiedAsset> {
        let project_id: String = row.get("project_id");
        let metadata_raw: String = row.get("metadata");
        Ok(UnifiedAsset {
            id: row.get("id"),
            project_id: ProjectId::try_new(project_id)
                .map_err(|e| FleetError::StorageFatal(format!("corrupt project id: {e}")))?,
            ip: row.get("ip"),
            port: u16::try_from(row.get::<i64, _>("port")).unwrap_or(0),
            service: row.get("service"),
            product: row.get("product"),
            component: row.get("component"),
            is_web: row.get::<i64, _>("is_web") != 0,
            metadata: serde_json::from_str(&metadata_raw)
                .map_err(|e| FleetError::StorageFatal(format!("corrupt metadata JSON: {e}")))?,
            created_at: from_millis(row.get("created_at"))?,
            updated_at: from_millis(row.get("updated_at"))?,
        })
    }

    async fn upsert_in_tx(
        &self,
        incoming: &NormalizedAsset,
        at: DateTime<Utc>,
    ) -> FleetResult<i64> {
        let mut tx = self.db.pool().begin().await.map_err(FleetError::from_sqlx)?;

        let existing = sqlx::query(&format!(
            "{SELECT_UNIFIED_COLUMNS} WHERE project_id = ?1 AND ip = ?2 AND port = ?3"
        ))
        .bind(incoming.project_id.as_str())
        .bind(&incoming.ip)
        .bind(i64::from(incoming.port))
        .fetch_optional(&mut *tx)
        .await
        .map_err(FleetError::from_sqlx)?;

        let unified_id = match existing {
            Some(row) => {
                let mut stored = Self::map_row(&row)?;
                merge_unified(&mut stored, incoming);
                sqlx::query(UPDATE_UNIFIED)
                    .bind(stored.id)
                    .bind(&stored.service)
                    .bind(&stored.product)
                    .bind(&stored.component)
                    .bind(i64::from(stored.is_web))
                    .bind(serde_json::to_string(&stored.metadata)?)
                    .bind(to_millis(at))
                    .execute(&mut *tx)
                    .await
                    .map_err(FleetError::from_sqlx)?;
                stored.id
            }
            None => {
                let insert = sqlx::query(INSERT_UNIFIED)
                    .bind(incoming.project_id.as_str())
                    .bind(&incoming.ip)
                    .bind(i64::from(incoming.port))
                    .bind(&incoming.service)
                    .bind(&incoming.product)
                    .bind(&incoming.component)
                    .bind(i64::from(incoming.is_web.unwrap_or(false)))
                    .bind(serde_json::to_string(&incoming.metadata)?)
                    .bind(to_millis(at))
                    .execute(&mut *tx)
                    .await;
                match insert {
                    Ok(result) => result.last_insert_rowid(),
                    // A writer slipped in between our read and write:
                    // retry the conflict as an update on the fresh row.
                    Err(err) if FleetError::is_unique_violation(&err) => {
                        debug!(ip = %incoming.ip, port = incoming.port, "unique conflict, retrying as update");
                        let row = sqlx::query(&format!(
                            "{SELECT_UNIFIED_COLUMNS} WHERE project_id = ?1 AND ip = ?2 AND port = ?3"
                        ))
                        .bind(incoming.project_id.as_str())
                        .bind(&incoming.ip)
                        .bind(i64::from(incoming.port))
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(FleetError::from_sqlx)?;
                        let mut stored = Self::map_row(&row)?;
                        merge_unified(&mut stored, incoming);
                        sqlx::query(UPDATE_UNIFIED)
                            .bind(stored.id)
                            .bind(&stored.service)
                            .bind(&stored.product)
                            .bind(&stored.component)
                            .bind(i64::from(stored.is_web))
                            .bind(serde_json::to_string(&stored.metadata)?)
                            .bind(to_millis(at))
                            .execute(&mut *tx)
                            .await
                            .map_err(FleetError::from_sqlx)?;
                        stored.id
                    }
                    Err(err) => return Err(FleetError::from_sqlx(err)),
                }
            }
        };

        if !incoming.hostname.is_empty() || !incoming.os.is_empty() {
            sqlx::query(UPSERT_HOST)
                .bind(incoming.project_id.as_str())
                .bind(&incoming.ip)
                .bind(&incoming.hostname)
                .bind(&incoming.os)
                .bind(to_millis(at))
                .execute(&mut *tx)
                .await
                .map_err(FleetError::from_sqlx)?;
        }

        for service in &incoming.services {
            if service.name.is_empty() {
                continue;
            }
            sqlx::query(UPSERT_SERVICE)
                .bind(unified_id)
                .bind(&service.name)
                .bind(&service.version)
                .bind(&service.banner)
                .bind(to_millis(at))
                .execute(&mut *tx)
                .await
                .map_err(FleetError::from_sqlx)?;
        }

        if let Some(web) = &incoming.web {
            let web_id: i64 = sqlx::query_scalar(UPSERT_WEB)
                .bind(unified_id)
                .bind(&web.url)
                .bind(&web.title)
                .bind(&web.server)
                .bind(to_millis(at))
                .fetch_one(&mut *tx)
                .await
                .map_err(FleetError::from_sqlx)?;
            sqlx::query(UPSERT_WEB_DETAIL)
                .bind(web_id)
                .bind(web.status_code.map(i64::from))
                .bind(to_millis(at))
                .execute(&mut *tx)
                .await
                .map_err(FleetError::from_sqlx)?;
        }

        for vuln in &incoming.vulns {
            if vuln.name.is_empty() {
                continue;
            }
            sqlx::query(UPSERT_VULN)
                .bind(unified_id)
                .bind(&vuln.name)
                .bind(&vuln.severity)
                .bind(&vuln.source)
                .bind(&vuln.detail)
                .bind(to_millis(at))
                .execute(&mut *tx)
                .await
                .map_err(FleetError::from_sqlx)?;
        }

        tx.commit().await.map_err(FleetError::from_sqlx)?;
        Ok(unified_id)
    }
}

#[async_trait]
impl UnifiedAssetStore for SqliteUnifiedAssetStore {
    #[instrument(skip(self, incoming), fields(ip = %incoming.ip, port = incoming.port))]
    async fn upsert(&self, incoming: &NormalizedAsset, at: DateTime<Utc>) -> FleetResult<i64> {
        match self.upsert_in_tx(incoming, at).await {
            Ok(id) => Ok(id),
            Err(err) if err.is_transient() => {
                let jitter_ms = rand::thread_rng().gen_range(10..=60);
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                self.upsert_in_tx(incoming, at).await
            }
            Err(err) => Err(err),
        }
    }

    async fn get_by_key(
        &self,
        project_id: &str,
        ip: &str,
        port: u16,
    ) -> FleetResult<Option<UnifiedAsset>> {
        let row = sqlx::query(&format!(
            "{SELECT_UNIFIED_COLUMNS} WHERE project_id = ?1 AND ip = ?2 AND port = ?3"
        ))
        .bind(project_id)
        .bind(ip)
        .bind(i64::from(port))
        .fetch_optional(self.db.pool())
        .await
        .map_err(FleetError::from_sqlx)?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list(
        &self,
        project_id: Option<&str>,
        ip: Option<&str>,
        port: Option<u16>,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<UnifiedAsset>> {
        let push_filter = |builder: &mut QueryBuilder<'_, Sqlite>| {
            if let Some(project_id) = project_id {
                builder
                    .push(" AND project_id = ")
                    .push_bind(project_id.to_string());
            }
            if let Some(ip) = ip {
                builder.push(" AND ip = ").push_bind(ip.to_string());
            }
            if let Some(port) = port {
                builder.push(" AND port = ").push_bind(i64::from(port));
            }
        };

        let mut count_builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM asset_unified WHERE 1=1");
        push_filter(&mut count_builder);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;

        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("{SELECT_UNIFIED_COLUMNS} WHERE 1=1"));
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
            items: rows.iter().map(Self::map_row).collect::<FleetResult<_>>()?,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    async fn is_skip_listed(&self, ip: &str) -> FleetResult<bool> {
        let listed: i64 = sqlx::query_scalar(SKIP_LISTED)
            .bind(ip)
            .fetch_one(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(listed != 0)
    }

    async fn add_skip_policy(&self, ip: &str, reason: &str, at: DateTime<Utc>) -> FleetResult<()> {
        sqlx::query(INSERT_SKIP_POLICY)
            .bind(ip)
            .bind(reason)
            .bind(to_millis(at))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(())
    }
}

//! `SQLite` implementation of the capability/tag catalog store.
//!
//! Catalog rows are reference data: scan types are immutable except for
//! `is_active`, and inactive rows are retained for historical reads.

use async_trait::async_trait;
use sqlx::{Row, sqlite::SqliteRow};

use crate::database::DatabaseConnection;
use crate::domain_types::{CapabilityId, ScanType, TagId, TagType};
use crate::error::{FleetError, FleetResult};
use crate::storage::CatalogStore;

const INSERT_SCAN_TYPE: &str = r"
    INSERT INTO agent_scan_type (id, name, is_active, tag_id)
    VALUES (?1, ?2, ?3, ?4)
";

const SET_SCAN_TYPE_ACTIVE: &str = r"
    UPDATE agent_scan_type SET is_active = ?2 WHERE id = ?1
";

const SELECT_SCAN_TYPES: &str = r"
    SELECT id, name, is_active, tag_id FROM agent_scan_type ORDER BY id
";

const INSERT_TAG: &str = r"
    INSERT INTO agent_tag_type (id, name, category) VALUES (?1, ?2, ?3)
";

const SELECT_TAGS: &str = r"
    SELECT id, name, category FROM agent_tag_type ORDER BY id
";

/// SQLite-backed catalog store
pub struct SqliteCatalogStore {
    db: DatabaseConnection,
}

impl SqliteCatalogStore {
    /// Create a store over an initialized database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn map_scan_type(row: &SqliteRow) -> FleetResult<ScanType> {
        let id: String = row.get("id");
        let tag_id: String = row.get("tag_id");
        Ok(ScanType {
            id: CapabilityId::try_new(id)
                .map_err(|e| FleetError::StorageFatal(format!("corrupt scan type id: {e}")))?,
            name: row.get("name"),
            is_active: row.get::<i64, _>("is_active") != 0,
            tag_id: TagId::try_new(tag_id)
                .map_err(|e| FleetError::StorageFatal(format!("corrupt tag id: {e}")))?,
        })
    }

    fn map_tag(row: &SqliteRow) -> FleetResult<TagType> {
        let id: String = row.get("id");
        Ok(TagType {
            id: TagId::try_new(id)
                .map_err(|e| FleetError::StorageFatal(format!("corrupt tag id: {e}")))?,
            name: row.get("name"),
            category: row.get("category"),
        })
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalogStore {
    async fn insert_scan_type(&self, scan_type: &ScanType) -> FleetResult<()> {
        sqlx::query(INSERT_SCAN_TYPE)
            .bind(scan_type.id.as_str())
            .bind(&scan_type.name)
            .bind(i64::from(scan_type.is_active))
            .bind(scan_type.tag_id.as_str())
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(())
    }

    async fn set_scan_type_active(&self, id: &CapabilityId, active: bool) -> FleetResult<bool> {
        let result = sqlx::query(SET_SCAN_TYPE_ACTIVE)
            .bind(id.as_str())
            .bind(i64::from(active))
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_scan_types(&self) -> FleetResult<Vec<ScanType>> {
        let rows = sqlx::query(SELECT_SCAN_TYPES)
            .fetch_all(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        rows.iter().map(Self::map_scan_type).collect()
    }

    async fn insert_tag(&self, tag: &TagType) -> FleetResult<()> {
        sqlx::query(INSERT_TAG)
            .bind(tag.id.as_str())
            .bind(&tag.name)
            .bind(&tag.category)
            .execute(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        Ok(())
    }

    async fn list_tags(&self) -> FleetResult<Vec<TagType>> {
        let rows = sqlx::query(SELECT_TAGS)
            .fetch_all(self.db.pool())
            .await
            .map_err(FleetError::from_sqlx)?;
        rows.iter().map(Self::map_tag).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect_for_testing;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_should_persist_catalog_rows_and_flip_active_flag() {
        let dir = tempdir().unwrap();
        let store = SqliteCatalogStore::new(connect_for_testing(dir.path()).await);

        let id = CapabilityId::try_new("1".to_string()).unwrap();
        store
            .insert_scan_type(&ScanType {
                id: id.clone(),
                name: "portscan".to_string(),
                is_active: true,
                tag_id: TagId::try_new("t1".to_string()).unwrap(),
            })
            .await
            .unwrap();
        store
            .insert_tag(&TagType {
                id: TagId::try_new("t1".to_string()).unwrap(),
                name: "portscan".to_string(),
                category: "capability".to_string(),
            })
            .await
            .unwrap();

        assert!(store.set_scan_type_active(&id, false).await.unwrap());
        let types = store.list_scan_types().await.unwrap();
        assert_eq!(types.len(), 1);
        assert!(!types[0].is_active);
        assert_eq!(store.list_tags().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_should_reject_duplicate_scan_type_name() {
        let dir = tempdir().unwrap();
        let store = SqliteCatalogStore::new(connect_for_testing(dir.path()).await);

        let row = ScanType {
            id: CapabilityId::try_new("1".to_string()).unwrap(),
            name: "webfinger".to_string(),
            is_active: true,
            tag_id: TagId::try_new("t1".to_string()).unwrap(),
        };
        store.insert_scan_type(&row).await.unwrap();

        let mut dup = row.clone();
        dup.id = CapabilityId::try_new("2".to_string()).unwrap();
        assert!(store.insert_scan_type(&dup).await.is_err());
    }
}

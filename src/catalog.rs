//! Capability/tag resolver (the catalog front)
//!
//! Bridges three identifier spaces: capability ID, capability name, and
//! the tag associated with each capability. Catalog rows change rarely,
//! so reads go through a TTL cache that writes invalidate explicitly.
//! The cache is deliberately not kept consistent across processes.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::domain_types::{
    AgentKey, CapabilityId, PageNumber, PageSize, ScanType, TagId, TagType,
};
use crate::error::{FleetError, FleetResult};
use crate::storage::{AgentListFilter, AgentStore, CatalogStore};
use crate::time_provider::SharedTimeProvider;

/// Materialized catalog state served from memory
#[derive(Debug, Clone)]
struct CachedCatalog {
    loaded_at: chrono::DateTime<chrono::Utc>,
    scan_types_by_id: HashMap<CapabilityId, ScanType>,
    capability_by_name: HashMap<String, CapabilityId>,
    tags_by_id: HashMap<TagId, TagType>,
}

/// Resolver over the capability/tag catalog with a TTL cache
pub struct CatalogResolver {
    store: Arc<dyn CatalogStore>,
    agents: Arc<dyn AgentStore>,
    cache: RwLock<Option<Arc<CachedCatalog>>>,
    ttl: chrono::Duration,
    time: SharedTimeProvider,
}

impl CatalogResolver {
    /// Creates a resolver with the given cache TTL in seconds
    pub fn new(
        store: Arc<dyn CatalogStore>,
        agents: Arc<dyn AgentStore>,
        cache_ttl_secs: u64,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            store,
            agents,
            cache: RwLock::new(None),
            ttl: chrono::Duration::seconds(cache_ttl_secs.min(i64::MAX as u64) as i64),
            time,
        }
    }

    async fn snapshot(&self) -> FleetResult<Arc<CachedCatalog>> {
        let now = self.time.now();
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if now - cached.loaded_at < self.ttl {
                    return Ok(Arc::clone(cached));
                }
            }
        }

        let scan_types = self.store.list_scan_types().await?;
        let tags = self.store.list_tags().await?;
        let fresh = Arc::new(CachedCatalog {
            loaded_at: now,
            capability_by_name: scan_types
                .iter()
                .map(|s| (s.name.clone(), s.id.clone()))
                .collect(),
            scan_types_by_id: scan_types.into_iter().map(|s| (s.id.clone(), s)).collect(),
            tags_by_id: tags.into_iter().map(|t| (t.id.clone(), t)).collect(),
        });
        debug!(
            scan_types = fresh.scan_types_by_id.len(),
            tags = fresh.tags_by_id.len(),
            "catalog cache reloaded"
        );
        *self.cache.write().await = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Drops the cached catalog; the next read reloads from storage
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Resolves capability names to their routing tags, active rows only.
    /// Unknown or inactive names are filtered out, not errors.
    pub async fn resolve_names(&self, names: &[String]) -> FleetResult<Vec<TagId>> {
        let catalog = self.snapshot().await?;
        Ok(names
            .iter()
            .filter_map(|name| catalog.capability_by_name.get(name))
            .filter_map(|id| catalog.scan_types_by_id.get(id))
            .filter(|scan_type| scan_type.is_active)
            .map(|scan_type| scan_type.tag_id.clone())
            .collect())
    }

    /// Resolves capability IDs to their routing tags, active rows only
    pub async fn resolve_ids(&self, ids: &[CapabilityId]) -> FleetResult<Vec<TagId>> {
        let catalog = self.snapshot().await?;
        Ok(ids
            .iter()
            .filter_map(|id| catalog.scan_types_by_id.get(id))
            .filter(|scan_type| scan_type.is_active)
            .map(|scan_type| scan_type.tag_id.clone())
            .collect())
    }

    /// Whether a capability ID names an active catalog row
    pub async fn validate_capability(&self, id: &CapabilityId) -> FleetResult<bool> {
        let catalog = self.snapshot().await?;
        Ok(catalog
            .scan_types_by_id
            .get(id)
            .is_some_and(|scan_type| scan_type.is_active))
    }

    /// Whether an active capability carries this name
    pub async fn capability_for_name(&self, name: &str) -> FleetResult<Option<CapabilityId>> {
        let catalog = self.snapshot().await?;
        Ok(catalog
            .capability_by_name
            .get(name)
            .filter(|id| {
                catalog
                    .scan_types_by_id
                    .get(*id)
                    .is_some_and(|scan_type| scan_type.is_active)
            })
            .cloned())
    }

    /// Whether a tag ID exists in the catalog
    pub async fn validate_tag(&self, id: &TagId) -> FleetResult<bool> {
        let catalog = self.snapshot().await?;
        Ok(catalog.tags_by_id.contains_key(id))
    }

    /// Agents holding every one of the given tags (AND mode)
    #[instrument(skip(self))]
    pub async fn agents_with_tags(&self, tag_ids: &[TagId]) -> FleetResult<Vec<AgentKey>> {
        let filter = AgentListFilter {
            tags: tag_ids.to_vec(),
            ..Default::default()
        };
        let page_size = PageSize::try_new(500)
            .map_err(|e| FleetError::invalid_input(format!("page size: {e}")))?;
        let mut results = Vec::new();
        let mut page_number = 1u32;
        loop {
            let page = PageNumber::try_new(page_number)
                .map_err(|e| FleetError::invalid_input(format!("page number: {e}")))?;
            let rows = self.agents.list(&filter, page, page_size).await?;
            let fetched = rows.items.len();
            results.extend(rows.items.into_iter().map(|a| a.agent_id));
            if results.len() as u64 >= rows.total || fetched == 0 {
                break;
            }
            page_number += 1;
        }
        Ok(results)
    }

    /// Creates a scan type after checking its routing tag exists.
    /// Invalidate-on-write keeps this process's cache honest.
    pub async fn create_scan_type(&self, scan_type: &ScanType) -> FleetResult<()> {
        if !self.validate_tag(&scan_type.tag_id).await? {
            return Err(FleetError::invalid_reference(
                "tag",
                scan_type.tag_id.as_str(),
            ));
        }
        self.store.insert_scan_type(scan_type).await?;
        self.invalidate().await;
        Ok(())
    }

    /// Flips a scan type's active flag
    pub async fn set_scan_type_active(
        &self,
        id: &CapabilityId,
        active: bool,
    ) -> FleetResult<()> {
        if !self.store.set_scan_type_active(id, active).await? {
            return Err(FleetError::not_found("scan type", id.as_str()));
        }
        self.invalidate().await;
        Ok(())
    }

    /// Creates a tag
    pub async fn create_tag(&self, tag: &TagType) -> FleetResult<()> {
        self.store.insert_tag(tag).await?;
        self.invalidate().await;
        Ok(())
    }

    /// All scan types, active and inactive
    pub async fn list_scan_types(&self) -> FleetResult<Vec<ScanType>> {
        self.store.list_scan_types().await
    }

    /// All tags
    pub async fn list_tags(&self) -> FleetResult<Vec<TagType>> {
        self.store.list_tags().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect_for_testing;
    use crate::storage::{SqliteAgentStore, SqliteCatalogStore};
    use crate::time_provider::MockTimeProvider;
    use tempfile::tempdir;

    async fn resolver_with_clock(
        dir: &std::path::Path,
        clock: MockTimeProvider,
    ) -> (CatalogResolver, Arc<SqliteCatalogStore>) {
        let db = connect_for_testing(dir).await;
        let store = Arc::new(SqliteCatalogStore::new(db.clone()));
        let agents = Arc::new(SqliteAgentStore::new(db));
        let resolver = CatalogResolver::new(store.clone(), agents, 60, Arc::new(clock));
        (resolver, store)
    }

    fn scan_type(id: &str, name: &str, tag: &str, active: bool) -> ScanType {
        ScanType {
            id: CapabilityId::try_new(id.to_string()).unwrap(),
            name: name.to_string(),
            is_active: active,
            tag_id: TagId::try_new(tag.to_string()).unwrap(),
        }
    }

    fn tag(id: &str, name: &str) -> TagType {
        TagType {
            id: TagId::try_new(id.to_string()).unwrap(),
            name: name.to_string(),
            category: "capability".to_string(),
        }
    }

    #[tokio::test]
    async fn test_should_resolve_only_active_capabilities_to_tags() {
        let dir = tempdir().unwrap();
        let (resolver, _) = resolver_with_clock(dir.path(), MockTimeProvider::new()).await;

        resolver.create_tag(&tag("t1", "portscan")).await.unwrap();
        resolver.create_tag(&tag("t2", "webfinger")).await.unwrap();
        resolver
            .create_scan_type(&scan_type("1", "portscan", "t1", true))
            .await
            .unwrap();
        resolver
            .create_scan_type(&scan_type("2", "webfinger", "t2", false))
            .await
            .unwrap();

        let tags = resolver
            .resolve_names(&["portscan".to_string(), "webfinger".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(tags, vec![TagId::try_new("t1".to_string()).unwrap()]);

        assert!(resolver
            .validate_capability(&CapabilityId::try_new("1".to_string()).unwrap())
            .await
            .unwrap());
        assert!(!resolver
            .validate_capability(&CapabilityId::try_new("2".to_string()).unwrap())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_should_reject_scan_type_with_unknown_tag() {
        let dir = tempdir().unwrap();
        let (resolver, _) = resolver_with_clock(dir.path(), MockTimeProvider::new()).await;

        let err = resolver
            .create_scan_type(&scan_type("1", "portscan", "ghost", true))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidReference { kind: "tag", .. }));
    }

    #[tokio::test]
    async fn test_should_serve_stale_cache_until_ttl_or_write() {
        let dir = tempdir().unwrap();
        let clock = MockTimeProvider::new();
        let (resolver, store) = resolver_with_clock(dir.path(), clock.clone()).await;

        resolver.create_tag(&tag("t1", "portscan")).await.unwrap();
        resolver
            .create_scan_type(&scan_type("1", "portscan", "t1", true))
            .await
            .unwrap();
        // Prime the cache.
        assert_eq!(resolver.list_scan_types().await.unwrap().len(), 1);
        let cap = CapabilityId::try_new("1".to_string()).unwrap();
        assert!(resolver.validate_capability(&cap).await.unwrap());

        // A write that bypasses the resolver is invisible inside the TTL...
        store.set_scan_type_active(&cap, false).await.unwrap();
        assert!(resolver.validate_capability(&cap).await.unwrap());

        // ...and picked up once the TTL elapses.
        clock.advance_secs(61);
        assert!(!resolver.validate_capability(&cap).await.unwrap());
    }

    #[tokio::test]
    async fn test_should_reload_immediately_after_resolver_write() {
        let dir = tempdir().unwrap();
        let (resolver, _) = resolver_with_clock(dir.path(), MockTimeProvider::new()).await;

        resolver.create_tag(&tag("t1", "portscan")).await.unwrap();
        resolver
            .create_scan_type(&scan_type("1", "portscan", "t1", true))
            .await
            .unwrap();
        let cap = CapabilityId::try_new("1".to_string()).unwrap();
        assert!(resolver.validate_capability(&cap).await.unwrap());

        resolver.set_scan_type_active(&cap, false).await.unwrap();
        assert!(!resolver.validate_capability(&cap).await.unwrap());
    }
}

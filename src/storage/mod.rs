//! Storage layer for the fleet controller
//!
//! Trait definitions plus SQLite implementations, one store per aggregate.
//! All mutation goes through these traits; services hold `Arc<dyn Store>`
//! handles so tests can substitute fixtures without touching SQL.
//!
//! # Submodules
//!
//! - `agent_storage` - agent registry rows and set-containment listings
//! - `catalog_storage` - scan-type and tag reference data
//! - `metrics_storage` - single-row-per-agent snapshots with LWW guard
//! - `task_storage` - task rows and the atomic ownership CAS
//! - `raw_asset_storage` - ingest staging rows for assets and networks
//! - `unified_asset_storage` - canonical asset graph with merge upsert
//! - `etl_error_storage` - captured normalization failures

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::domain_types::{
    Agent, AgentKey, AgentStatus, ApprovalStatus, BatchId, CapabilityId, EtlError, EtlErrorStatus,
    EtlStage, MetricsSnapshot, PageNumber, PageSize, RawAsset, RawAssetNetwork, RawAssetStatus,
    ScanType, TagId, TagType, Task, TaskId, TaskStatus, WorkStatus,
};
use crate::error::{FleetError, FleetResult};
use crate::etl::NormalizedAsset;

pub mod agent_storage;
pub mod catalog_storage;
pub mod etl_error_storage;
pub mod metrics_storage;
pub mod raw_asset_storage;
pub mod task_storage;
pub mod unified_asset_storage;

pub use agent_storage::SqliteAgentStore;
pub use catalog_storage::SqliteCatalogStore;
pub use etl_error_storage::SqliteEtlErrorStore;
pub use metrics_storage::SqliteMetricsStore;
pub use raw_asset_storage::SqliteRawAssetStore;
pub use task_storage::SqliteTaskStore;
pub use unified_asset_storage::SqliteUnifiedAssetStore;

/// A page of rows plus the unpaged total
#[derive(Debug, Clone)]
pub struct PagedRows<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// Filters for the agent listing
#[derive(Debug, Clone, Default)]
pub struct AgentListFilter {
    pub status: Option<AgentStatus>,
    /// Free-text match over agent_id, hostname, ip_address, and remark
    pub keyword: Option<String>,
    /// AND semantics: the Agent must hold every listed tag
    pub tags: Vec<TagId>,
    /// AND semantics: the Agent must hold every listed capability
    pub capabilities: Vec<CapabilityId>,
}

/// Filters for the metrics listing
#[derive(Debug, Clone, Default)]
pub struct MetricsListFilter {
    pub work_status: Option<WorkStatus>,
    pub scan_type: Option<String>,
    pub keyword: Option<String>,
}

/// Filters for the ETL error listing
#[derive(Debug, Clone, Default)]
pub struct EtlErrorFilter {
    pub status: Option<EtlErrorStatus>,
    pub stage: Option<EtlStage>,
    pub result_type: Option<String>,
}

/// New ETL error row to capture
#[derive(Debug, Clone)]
pub struct NewEtlError {
    pub task_id: Option<String>,
    pub result_type: String,
    pub stage: EtlStage,
    pub raw_ref: i64,
    pub err_msg: String,
}

/// Persistent storage interface for the agent registry
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Fetch one Agent by its stable identifier
    async fn get(&self, agent_id: &AgentKey) -> FleetResult<Option<Agent>>;

    /// Fetch one Agent by its `(hostname, port)` endpoint
    async fn get_by_hostname_port(
        &self,
        hostname: &str,
        port: u16,
    ) -> FleetResult<Option<Agent>>;

    /// Insert a new Agent row
    async fn insert(&self, agent: &Agent) -> FleetResult<()>;

    /// Rewrite the descriptive fields and sets of an existing row
    async fn update(&self, agent: &Agent) -> FleetResult<()>;

    /// Paged, filtered listing
    async fn list(
        &self,
        filter: &AgentListFilter,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<Agent>>;

    /// Set status + last_heartbeat + updated_at in one write
    async fn record_heartbeat(
        &self,
        agent_id: &AgentKey,
        status: AgentStatus,
        at: DateTime<Utc>,
    ) -> FleetResult<bool>;

    /// Set status + updated_at
    async fn update_status(
        &self,
        agent_id: &AgentKey,
        status: AgentStatus,
        at: DateTime<Utc>,
    ) -> FleetResult<bool>;

    /// Replace the capability set
    async fn set_capabilities(
        &self,
        agent_id: &AgentKey,
        capabilities: &HashSet<CapabilityId>,
        at: DateTime<Utc>,
    ) -> FleetResult<bool>;

    /// Replace the tag set
    async fn set_tags(
        &self,
        agent_id: &AgentKey,
        tags: &HashSet<TagId>,
        at: DateTime<Utc>,
    ) -> FleetResult<bool>;

    /// Remove the Agent row; returns false when it did not exist
    async fn delete(&self, agent_id: &AgentKey) -> FleetResult<bool>;

    /// All Agents in the given status
    async fn list_by_status(&self, status: AgentStatus) -> FleetResult<Vec<Agent>>;

    /// Agents whose `last_heartbeat` is older than `cutoff` (or missing)
    /// and whose status is subject to eviction
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> FleetResult<Vec<Agent>>;
}

/// Persistent storage interface for the capability/tag catalog
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert one scan type
    async fn insert_scan_type(&self, scan_type: &ScanType) -> FleetResult<()>;

    /// Flip the `is_active` flag; returns false when the row is missing
    async fn set_scan_type_active(&self, id: &CapabilityId, active: bool) -> FleetResult<bool>;

    /// All scan types, active and inactive
    async fn list_scan_types(&self) -> FleetResult<Vec<ScanType>>;

    /// Insert one tag
    async fn insert_tag(&self, tag: &TagType) -> FleetResult<()>;

    /// All tags
    async fn list_tags(&self) -> FleetResult<Vec<TagType>>;
}

/// Persistent storage interface for metrics snapshots
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Upsert the single snapshot row for an Agent.
    ///
    /// Last-writer-wins on snapshot `timestamp`: a snapshot older than the
    /// stored one is discarded and `false` is returned. The plugin-status
    /// JSON is only overwritten when the incoming value is non-null.
    async fn upsert(&self, snapshot: &MetricsSnapshot) -> FleetResult<bool>;

    /// Latest snapshot for one Agent
    async fn get(&self, agent_id: &AgentKey) -> FleetResult<Option<MetricsSnapshot>>;

    /// Paged, filtered listing ordered `timestamp DESC`
    async fn list(
        &self,
        filter: &MetricsListFilter,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<MetricsSnapshot>>;

    /// Full snapshot set
    async fn all(&self) -> FleetResult<Vec<MetricsSnapshot>>;

    /// Snapshots with `timestamp >= t`
    async fn since(&self, t: DateTime<Utc>) -> FleetResult<Vec<MetricsSnapshot>>;

    /// Snapshots for the given Agents
    async fn by_agent_ids(&self, ids: &[AgentKey]) -> FleetResult<Vec<MetricsSnapshot>>;

    /// Snapshots for the given Agents with `timestamp >= t`
    async fn by_agent_ids_since(
        &self,
        ids: &[AgentKey],
        t: DateTime<Utc>,
    ) -> FleetResult<Vec<MetricsSnapshot>>;

    /// Drop the snapshot row for an Agent
    async fn delete(&self, agent_id: &AgentKey) -> FleetResult<bool>;
}

/// Persistent storage interface for tasks and ownership binding
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task row
    async fn insert(&self, task: &Task) -> FleetResult<()>;

    /// Fetch one task
    async fn get(&self, task_id: &TaskId) -> FleetResult<Option<Task>>;

    /// Atomic ownership CAS: `pending` with no owner becomes `assigned`
    /// with the given owner. Returns false when another dispatcher won.
    async fn try_assign(
        &self,
        task_id: &TaskId,
        agent_id: &AgentKey,
        at: DateTime<Utc>,
    ) -> FleetResult<bool>;

    /// Revert a binding after a failed delivery: `assigned` returns to
    /// `pending`, the owner is cleared, and the attempt counter grows.
    async fn release_assignment(
        &self,
        task_id: &TaskId,
        agent_id: &AgentKey,
        at: DateTime<Utc>,
    ) -> FleetResult<bool>;

    /// Guarded status move; owner is cleared when `to` is terminal.
    /// Returns false when the row was not in any `from` status.
    async fn transition(
        &self,
        task_id: &TaskId,
        from: &[TaskStatus],
        to: TaskStatus,
        failure_reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> FleetResult<bool>;

    /// Update progress on a running task
    async fn set_progress(
        &self,
        task_id: &TaskId,
        progress: u8,
        at: DateTime<Utc>,
    ) -> FleetResult<bool>;

    /// Fail every task owned by an Agent (owner removal cascade);
    /// returns how many rows changed
    async fn fail_owned_by(
        &self,
        agent_id: &AgentKey,
        reason: &str,
        at: DateTime<Utc>,
    ) -> FleetResult<u64>;

    /// Tasks currently in any of the given statuses
    async fn list_by_statuses(&self, statuses: &[TaskStatus]) -> FleetResult<Vec<Task>>;

    /// How many assigned/running/paused tasks an Agent currently owns.
    /// Dispatch capacity checks trust this over the (possibly stale)
    /// metrics snapshot.
    async fn count_active_owned(&self, agent_id: &AgentKey) -> FleetResult<u64>;
}

/// Persistent storage interface for raw ingest staging
#[async_trait]
pub trait RawAssetStore: Send + Sync {
    /// Append asset rows for one batch; returns the new row ids
    async fn insert_assets(
        &self,
        batch_id: BatchId,
        source_type: &str,
        payloads: &[String],
        at: DateTime<Utc>,
    ) -> FleetResult<Vec<i64>>;

    /// Append network rows for one batch; returns the new row ids
    async fn insert_networks(
        &self,
        batch_id: BatchId,
        source_type: &str,
        payloads: &[String],
        at: DateTime<Utc>,
    ) -> FleetResult<Vec<i64>>;

    /// Fetch one asset staging row
    async fn get_asset(&self, id: i64) -> FleetResult<Option<RawAsset>>;

    /// Fetch one network staging row
    async fn get_network(&self, id: i64) -> FleetResult<Option<RawAssetNetwork>>;

    /// Paged asset staging listing
    async fn list_assets(
        &self,
        status: Option<RawAssetStatus>,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<RawAsset>>;

    /// Paged network staging listing
    async fn list_networks(
        &self,
        approval: Option<ApprovalStatus>,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<RawAssetNetwork>>;

    /// Earliest batch that still has pending asset rows, excluding
    /// batches already being worked
    async fn next_pending_batch(&self, exclude: &[BatchId]) -> FleetResult<Option<BatchId>>;

    /// Pending asset rows of one batch in insertion (`id`) order
    async fn pending_assets_in_batch(&self, batch_id: BatchId) -> FleetResult<Vec<RawAsset>>;

    /// Approved network rows still pending normalization, in `id` order
    async fn pending_approved_networks(&self) -> FleetResult<Vec<RawAssetNetwork>>;

    /// Guarded `pending -> processing` claim on one asset row; false
    /// means another worker took it
    async fn claim_asset(&self, id: i64, at: DateTime<Utc>) -> FleetResult<bool>;

    /// Guarded `pending -> processing` claim on one network row
    async fn claim_network(&self, id: i64, at: DateTime<Utc>) -> FleetResult<bool>;

    /// Flip one asset row's staging status
    async fn mark_asset(
        &self,
        id: i64,
        status: RawAssetStatus,
        err_msg: Option<&str>,
        at: DateTime<Utc>,
    ) -> FleetResult<bool>;

    /// Flip one network row's staging status
    async fn mark_network(
        &self,
        id: i64,
        status: RawAssetStatus,
        err_msg: Option<&str>,
        at: DateTime<Utc>,
    ) -> FleetResult<bool>;

    /// Guarded review transition for a discovered subnet
    async fn set_network_approval(
        &self,
        id: i64,
        from: ApprovalStatus,
        to: ApprovalStatus,
        at: DateTime<Utc>,
    ) -> FleetResult<bool>;
}

/// Persistent storage interface for the normalized asset graph
#[async_trait]
pub trait UnifiedAssetStore: Send + Sync {
    /// Merge-upsert one normalized record under its
    /// `(project_id, ip, port)` key; returns the unified row id.
    ///
    /// Field rule: a non-empty incoming value overwrites, an empty one
    /// preserves. A unique-key race is retried once as an update.
    async fn upsert(&self, incoming: &NormalizedAsset, at: DateTime<Utc>) -> FleetResult<i64>;

    /// Fetch one unified row by key
    async fn get_by_key(
        &self,
        project_id: &str,
        ip: &str,
        port: u16,
    ) -> FleetResult<Option<crate::domain_types::UnifiedAsset>>;

    /// Paged listing filtered by ip/port/project
    async fn list(
        &self,
        project_id: Option<&str>,
        ip: Option<&str>,
        port: Option<u16>,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<crate::domain_types::UnifiedAsset>>;

    /// Whether the normalizer must drop records for this IP
    async fn is_skip_listed(&self, ip: &str) -> FleetResult<bool>;

    /// Add a skip-policy row (thin projection)
    async fn add_skip_policy(&self, ip: &str, reason: &str, at: DateTime<Utc>) -> FleetResult<()>;
}

/// Persistent storage interface for captured ETL failures
#[async_trait]
pub trait EtlErrorStore: Send + Sync {
    /// Record a new failure; returns the error row id
    async fn insert(&self, error: &NewEtlError, at: DateTime<Utc>) -> FleetResult<i64>;

    /// Paged, filtered listing
    async fn list(
        &self,
        filter: &EtlErrorFilter,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<EtlError>>;

    /// Every row currently in `new` status, oldest first
    async fn list_new(&self) -> FleetResult<Vec<EtlError>>;

    /// Guarded `new -> retrying` move that also bumps the replay counter
    async fn mark_retrying(&self, id: i64, at: DateTime<Utc>) -> FleetResult<bool>;

    /// Terminal success
    async fn mark_resolved(&self, id: i64, at: DateTime<Utc>) -> FleetResult<bool>;

    /// Terminal exhaustion
    async fn mark_abandoned(&self, id: i64, at: DateTime<Utc>) -> FleetResult<bool>;

    /// Failed replay below the limit returns the row to `new`
    async fn revert_to_new(&self, id: i64, err_msg: &str, at: DateTime<Utc>) -> FleetResult<bool>;
}

/// Timestamps are stored as epoch milliseconds in INTEGER columns so
/// staleness and last-writer-wins comparisons stay numeric.
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Converts a stored epoch-millisecond value back to a timestamp
pub(crate) fn from_millis(ms: i64) -> FleetResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| FleetError::StorageFatal(format!("timestamp out of range: {ms}")))
}

/// Optional variant of [`from_millis`]
pub(crate) fn from_millis_opt(ms: Option<i64>) -> FleetResult<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

/// Encodes an id set as a sorted JSON array for stable storage bytes
pub(crate) fn encode_id_set<I, S>(ids: I) -> FleetResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut values: Vec<String> = ids.into_iter().map(|s| s.as_ref().to_string()).collect();
    values.sort();
    serde_json::to_string(&values).map_err(FleetError::from)
}

/// Decodes a JSON array column back into raw id strings
pub(crate) fn decode_id_list(raw: &str) -> FleetResult<Vec<String>> {
    serde_json::from_str::<Vec<String>>(raw)
        .map_err(|e| FleetError::StorageFatal(format!("corrupt JSON set column: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_encode_id_sets_in_sorted_order() {
        let encoded = encode_id_set(["2", "10", "1"]).unwrap();
        assert_eq!(encoded, r#"["1","10","2"]"#);
    }

    #[test]
    fn test_should_reject_corrupt_set_column_when_decoding() {
        assert!(decode_id_list("not json").is_err());
        assert_eq!(decode_id_list("[]").unwrap().len(), 0);
    }
}

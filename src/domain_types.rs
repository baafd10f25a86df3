//! Domain types for the scanmaster fleet controller
//!
//! This module defines strongly-typed domain values to prevent primitive
//! obsession, plus the core entities shared by the registry, dispatcher,
//! and ETL subsystems.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::FleetError;

/// Stable external identifier an Agent presents at registration
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct AgentKey(String);

impl AgentKey {
    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Hostname an Agent is reachable on
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct HostName(String);

impl HostName {
    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// TCP port an Agent listens on (0 is not addressable)
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct PortNumber(u16);

impl PortNumber {
    /// Gets the value as u16
    pub fn as_u16(&self) -> u16 {
        self.into_inner()
    }
}

/// Unique identifier for a scan task
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new random task ID
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// Parses a task ID from its string form
    ///
    /// # Errors
    ///
    /// Returns `invalid_input` if the string is not a UUID.
    pub fn parse(s: &str) -> Result<Self, FleetError> {
        s.parse::<Uuid>()
            .map(Self::new)
            .map_err(|_| FleetError::invalid_input(format!("invalid task id: {s}")))
    }
}

/// Groups the rows of a single raw-asset ingest
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct BatchId(Uuid);

impl BatchId {
    /// Creates a new random batch ID
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// Parses a batch ID from its string form
    ///
    /// # Errors
    ///
    /// Returns `invalid_input` if the string is not a UUID.
    pub fn parse(s: &str) -> Result<Self, FleetError> {
        s.parse::<Uuid>()
            .map(Self::new)
            .map_err(|_| FleetError::invalid_input(format!("invalid batch id: {s}")))
    }
}

/// Identifier of a capability catalog row (scan type)
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct CapabilityId(String);

impl CapabilityId {
    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Identifier of a tag catalog row
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct TagId(String);

impl TagId {
    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Project a normalized asset belongs to
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct ProjectId(String);

impl ProjectId {
    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Task priority; higher drains first
#[nutype(
    validate(less_or_equal = 9),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct TaskPriority(u8);

impl TaskPriority {
    /// Gets the value as u8
    pub fn as_u8(&self) -> u8 {
        self.into_inner()
    }
}

/// Task completion percentage
#[nutype(
    validate(less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct ProgressPercent(u8);

impl ProgressPercent {
    /// Gets the value as u8
    pub fn as_u8(&self) -> u8 {
        self.into_inner()
    }

    /// Whether the task has reached 100%
    pub fn is_complete(&self) -> bool {
        self.into_inner() == 100
    }
}

/// 1-based page number for paged listings
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1
)]
pub struct PageNumber(u32);

impl PageNumber {
    /// Gets the value as u32
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }

    /// Zero-based row offset for this page
    pub fn offset(&self, page_size: PageSize) -> u32 {
        (self.into_inner() - 1) * page_size.as_u32()
    }
}

/// Rows per page for paged listings
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 500),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 20
)]
pub struct PageSize(u32);

impl PageSize {
    /// Gets the value as u32
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Seconds without a heartbeat before an Agent is considered stale
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 86_400),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 90
)]
pub struct StaleAfterSecs(u64);

impl StaleAfterSecs {
    /// Gets the value as u64
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }

    /// Converts to a chrono duration
    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.into_inner() as i64)
    }
}

/// Interval between liveness sweeper passes
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3_600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 15
)]
pub struct SweepIntervalSecs(u64);

impl SweepIntervalSecs {
    /// Gets the value as u64
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Candidate retries per dispatch before giving up with `no_capacity`
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct DispatchRetryLimit(u8);

impl DispatchRetryLimit {
    /// Gets the value as u8
    pub fn as_u8(&self) -> u8 {
        self.into_inner()
    }
}

/// Delivery attempts per task before it is failed as `undeliverable`
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct DeliveryAttemptCap(u8);

impl DeliveryAttemptCap {
    /// Gets the value as u8
    pub fn as_u8(&self) -> u8 {
        self.into_inner()
    }
}

/// Replays per ETL error before it is abandoned
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct ReplayLimit(u8);

impl ReplayLimit {
    /// Gets the value as u8
    pub fn as_u8(&self) -> u8 {
        self.into_inner()
    }
}

/// Worker task count for a background pool
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 64),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct WorkerCount(usize);

impl WorkerCount {
    /// Gets the value as usize
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Bound on the dispatcher's pending-task queue
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1024
)]
pub struct QueueCapacity(usize);

impl QueueCapacity {
    /// Gets the value as usize
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Tasks an Agent may run at once; dispatch skips Agents at capacity
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1024),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 4
)]
pub struct MaxConcurrentTasks(u16);

impl MaxConcurrentTasks {
    /// Gets the value as u16
    pub fn as_u16(&self) -> u16 {
        self.into_inner()
    }
}

/// Agent lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    #[default]
    Offline,
    Busy,
    Error,
    Maintenance,
}

impl AgentStatus {
    /// Storage/wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Maintenance => "maintenance",
        }
    }

    /// Parses the storage/wire representation
    ///
    /// # Errors
    ///
    /// Returns `invalid_input` for an unknown status string.
    pub fn parse(s: &str) -> Result<Self, FleetError> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "busy" => Ok(Self::Busy),
            "error" => Ok(Self::Error),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(FleetError::invalid_input(format!(
                "unknown agent status: {other}"
            ))),
        }
    }
}

/// What an Agent's scan engine is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    #[default]
    Idle,
    Scanning,
    Paused,
    Stopped,
}

impl WorkStatus {
    /// Storage/wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }

    /// Parses the storage/wire representation
    ///
    /// # Errors
    ///
    /// Returns `invalid_input` for an unknown work status string.
    pub fn parse(s: &str) -> Result<Self, FleetError> {
        match s {
            "idle" => Ok(Self::Idle),
            "scanning" => Ok(Self::Scanning),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            other => Err(FleetError::invalid_input(format!(
                "unknown work status: {other}"
            ))),
        }
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Queued,
    Assigned,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Storage/wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the storage/wire representation
    ///
    /// # Errors
    ///
    /// Returns `invalid_input` for an unknown task status string.
    pub fn parse(s: &str) -> Result<Self, FleetError> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(FleetError::invalid_input(format!(
                "unknown task status: {other}"
            ))),
        }
    }

    /// Whether an owner must be bound in this state.
    ///
    /// Invariant: `owner_agent_id` is non-null iff the task is assigned,
    /// running, or paused.
    pub fn requires_owner(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running | Self::Paused)
    }

    /// Whether the task may still be cancelled
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Queued | Self::Assigned | Self::Running | Self::Paused
        )
    }
}

/// Staging state of a raw ingest row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RawAssetStatus {
    #[default]
    Pending,
    Processing,
    Processed,
    Failed,
}

impl RawAssetStatus {
    /// Storage/wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    /// Parses the storage/wire representation
    ///
    /// # Errors
    ///
    /// Returns `invalid_input` for an unknown status string.
    pub fn parse(s: &str) -> Result<Self, FleetError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(FleetError::invalid_input(format!(
                "unknown raw asset status: {other}"
            ))),
        }
    }
}

/// Human review state of a discovered subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    PendingReview,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    /// Storage/wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Parses the storage/wire representation
    ///
    /// # Errors
    ///
    /// Returns `invalid_input` for an unknown status string.
    pub fn parse(s: &str) -> Result<Self, FleetError> {
        match s {
            "pending_review" => Ok(Self::PendingReview),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(FleetError::invalid_input(format!(
                "unknown approval status: {other}"
            ))),
        }
    }
}

/// Pipeline stage an ETL failure was captured at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EtlStage {
    Parse,
    Validate,
    Normalize,
    Persist,
}

impl EtlStage {
    /// Storage/wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Validate => "validate",
            Self::Normalize => "normalize",
            Self::Persist => "persist",
        }
    }

    /// Parses the storage/wire representation
    ///
    /// # Errors
    ///
    /// Returns `invalid_input` for an unknown stage string.
    pub fn parse(s: &str) -> Result<Self, FleetError> {
        match s {
            "parse" => Ok(Self::Parse),
            "validate" => Ok(Self::Validate),
            "normalize" => Ok(Self::Normalize),
            "persist" => Ok(Self::Persist),
            other => Err(FleetError::invalid_input(format!(
                "unknown etl stage: {other}"
            ))),
        }
    }
}

/// Replay state of a captured ETL failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EtlErrorStatus {
    #[default]
    New,
    Retrying,
    Resolved,
    Abandoned,
}

impl EtlErrorStatus {
    /// Storage/wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Retrying => "retrying",
            Self::Resolved => "resolved",
            Self::Abandoned => "abandoned",
        }
    }

    /// Parses the storage/wire representation
    ///
    /// # Errors
    ///
    /// Returns `invalid_input` for an unknown status string.
    pub fn parse(s: &str) -> Result<Self, FleetError> {
        match s {
            "new" => Ok(Self::New),
            "retrying" => Ok(Self::Retrying),
            "resolved" => Ok(Self::Resolved),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(FleetError::invalid_input(format!(
                "unknown etl error status: {other}"
            ))),
        }
    }
}

/// A registered scan Agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentKey,
    pub hostname: HostName,
    pub port: PortNumber,
    pub ip_address: Option<String>,
    pub version: Option<String>,
    pub remark: Option<String>,
    pub status: AgentStatus,
    /// Capability IDs this Agent can execute; members reference the catalog
    pub capabilities: HashSet<CapabilityId>,
    /// Tag IDs used for routing and grouping; members reference the catalog
    pub tags: HashSet<TagId>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Latest metrics snapshot for one Agent.
///
/// Deliberately a single row per Agent: historical analysis is out of
/// scope and "latest value" reads stay trivial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub agent_id: AgentKey,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub disk_usage: f64,
    #[serde(default)]
    pub network_bytes_sent: u64,
    #[serde(default)]
    pub network_bytes_recv: u64,
    #[serde(default)]
    pub active_connections: u32,
    #[serde(default)]
    pub running_tasks: u32,
    #[serde(default)]
    pub completed_tasks: u64,
    #[serde(default)]
    pub failed_tasks: u64,
    #[serde(default)]
    pub work_status: WorkStatus,
    #[serde(default)]
    pub scan_type: Option<String>,
    /// Per-plugin health map; only overwritten when the incoming value
    /// is non-null
    #[serde(default)]
    pub plugin_status: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Catalog row describing one scan type an Agent may advertise
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanType {
    pub id: CapabilityId,
    pub name: String,
    pub is_active: bool,
    /// Each scan type maps 1:1 to a routing tag
    pub tag_id: TagId,
}

/// Catalog row describing one free-form classification label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagType {
    pub id: TagId,
    pub name: String,
    pub category: String,
}

/// A scan task and its dispatch state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub task_type: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub owner_agent_id: Option<AgentKey>,
    /// Opaque per-type configuration, forwarded to the Agent untouched
    pub config: serde_json::Value,
    pub required_capabilities: HashSet<CapabilityId>,
    pub required_tags: HashSet<TagId>,
    pub progress: ProgressPercent,
    pub attempts: u32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Staged raw scan result awaiting normalization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAsset {
    pub id: i64,
    pub batch_id: BatchId,
    pub source_type: String,
    pub payload: String,
    pub status: RawAssetStatus,
    pub err_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Staged subnet discovery awaiting review and normalization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAssetNetwork {
    pub id: i64,
    pub batch_id: BatchId,
    pub source_type: String,
    pub payload: String,
    pub status: RawAssetStatus,
    pub approval_status: ApprovalStatus,
    pub err_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical asset row keyed by `(project_id, ip, port)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedAsset {
    pub id: i64,
    pub project_id: ProjectId,
    pub ip: String,
    pub port: u16,
    pub service: String,
    pub product: String,
    pub component: String,
    pub is_web: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Captured normalization failure, replayable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlError {
    pub id: i64,
    pub task_id: Option<String>,
    /// Which staging table `raw_ref` points at: `asset` or `network`
    pub result_type: String,
    pub error_stage: EtlStage,
    pub status: EtlErrorStatus,
    pub raw_ref: i64,
    pub replay_count: u32,
    pub err_msg: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

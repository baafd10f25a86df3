//! Error types for the fleet controller
//!
//! One taxonomy covers every subsystem: domain errors surface immediately,
//! infrastructure transients are retried before they reach a caller, and
//! ETL stage failures are captured as replayable rows instead of being
//! returned through the ingest path.

use thiserror::Error;

use crate::domain_types::EtlStage;

/// Result alias used throughout the crate
pub type FleetResult<T> = Result<T, FleetError>;

/// Main error type for fleet controller operations
#[derive(Error, Debug)]
pub enum FleetError {
    /// Malformed or out-of-range caller input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A supplied capability, tag, or agent ID does not exist in the catalog
    #[error("invalid reference: unknown {kind} '{id}'")]
    InvalidReference {
        /// What kind of identifier was rejected (`agent`, `capability`, `tag`)
        kind: &'static str,
        /// The identifier that failed to resolve
        id: String,
    },

    /// Entity lookup miss
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Entity kind (`agent`, `task`, `raw asset`, ...)
        resource: &'static str,
        /// The identifier that was looked up
        id: String,
    },

    /// A control command or review action is not legal from the current state
    #[error("invalid transition: {command} not allowed from {from}")]
    InvalidTransition {
        /// Current lifecycle state, in its wire form
        from: String,
        /// The command or event that was rejected
        command: String,
    },

    /// No eligible Agent could be bound within the retry budget
    #[error("no capacity: no eligible agent for task {task_id}")]
    NoCapacity {
        /// The task that could not be placed
        task_id: String,
    },

    /// The assignment could not be delivered to the bound Agent
    #[error("undeliverable: agent {agent_id} unreachable after {attempts} attempts")]
    Undeliverable {
        /// The Agent the delivery was addressed to
        agent_id: String,
        /// Delivery attempts consumed so far
        attempts: u32,
    },

    /// Recoverable storage condition (lock wait, busy handle)
    #[error("transient storage error: {0}")]
    StorageTransient(String),

    /// Unrecoverable storage condition
    #[error("storage error: {0}")]
    StorageFatal(String),

    /// Normalization failure captured for replay; never surfaced to the
    /// ingest caller
    #[error("etl {stage:?} failure: {message}")]
    EtlStage {
        /// Pipeline stage the failure was captured at
        stage: EtlStage,
        /// Failure detail recorded on the error row
        message: String,
    },

    /// The operation's cancellation signal fired
    #[error("operation cancelled")]
    Cancelled,

    /// JSON encode/decode failure at a storage or wire boundary
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FleetError {
    /// Shorthand for an `InvalidInput` error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Shorthand for a `NotFound` error
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Shorthand for an `InvalidReference` error
    pub fn invalid_reference(kind: &'static str, id: impl Into<String>) -> Self {
        Self::InvalidReference {
            kind,
            id: id.into(),
        }
    }

    /// Classifies a `sqlx` failure into the transient/fatal split.
    ///
    /// Lock waits and busy handles are worth one silent retry; anything
    /// else is surfaced as fatal.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let message = db.message().to_lowercase();
                if message.contains("locked") || message.contains("busy") {
                    Self::StorageTransient(db.message().to_string())
                } else {
                    Self::StorageFatal(db.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => Self::StorageTransient("connection pool timeout".into()),
            _ => Self::StorageFatal(err.to_string()),
        }
    }

    /// Whether a single silent retry is appropriate
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageTransient(_))
    }

    /// Whether the underlying condition is a unique-key conflict.
    ///
    /// The normalizer uses this to convert a racing INSERT into an UPDATE.
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => db.is_unique_violation(),
            _ => false,
        }
    }

    /// HTTP status the REST layer maps this error to
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput(_) | Self::InvalidReference { .. } | Self::Serialization(_) => 400,
            Self::NotFound { .. } => 404,
            Self::InvalidTransition { .. } => 409,
            Self::NoCapacity { .. } | Self::Undeliverable { .. } => 503,
            Self::StorageTransient(_) | Self::StorageFatal(_) | Self::EtlStage { .. } => 500,
            Self::Cancelled => 499,
        }
    }
}

impl From<sqlx::Error> for FleetError {
    fn from(err: sqlx::Error) -> Self {
        Self::from_sqlx(err)
    }
}

//! # Scanmaster - Master node for a distributed scanning fleet
//!
//! Scanmaster orchestrates a dynamic population of remote scan Agents:
//! it owns their lifecycle (registration, liveness, deregistration),
//! dispatches scan tasks with performance-aware selection under
//! at-most-one-owner semantics, and ingests raw scan results into a
//! canonical asset graph with replayable failure capture.
//!
//! ## Architecture
//!
//! Three subsystems sit on one SQLite storage layer:
//!
//! - **Registry & liveness** ([`registry`], [`heartbeat`], [`liveness`],
//!   [`metrics`], [`catalog`]) - identity, the status state machine,
//!   single-row metrics snapshots, and the capability/tag catalog.
//! - **Dispatch** ([`dispatcher`]) - capability intersection, load-aware
//!   scoring, atomic ownership CAS, delivery with revert-and-requeue.
//! - **Asset ETL** ([`etl`]) - staging queue, normalization pipeline
//!   with field-merge upserts, and error replay.
//!
//! The REST surface ([`rest_api`], [`server`]) wraps everything in a
//! shared JSON envelope.

pub mod catalog;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod domain_types;
pub mod error;
pub mod etl;
pub mod events;
pub mod heartbeat;
pub mod liveness;
pub mod metrics;
pub mod registry;
pub mod rest_api;
pub mod server;
pub mod storage;
pub mod time_provider;

pub use crate::catalog::CatalogResolver;
pub use crate::config::AppConfig;
pub use crate::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
pub use crate::dispatcher::TaskDispatcher;
pub use crate::domain_types::*;
pub use crate::error::{FleetError, FleetResult};
pub use crate::etl::{AssetNormalizer, EtlReplayService, RawIngestService};
pub use crate::events::{FleetEvent, event_channel};
pub use crate::heartbeat::HeartbeatProcessor;
pub use crate::liveness::LivenessSweeper;
pub use crate::metrics::MetricsAggregator;
pub use crate::registry::AgentRegistry;
pub use crate::rest_api::{AppState, create_app};

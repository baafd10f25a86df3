//! Asset ETL pipeline
//!
//! Raw scan payloads enter through the ingestion queue, are normalized
//! into the unified asset graph, and failures are captured as replayable
//! error rows.
//!
//! # Submodules
//!
//! - `ingest` - raw staging queue and subnet review (C6)
//! - `normalizer` - parse/validate/normalize/persist pipeline (C7)
//! - `replay` - captured-failure resubmission (C8)

use serde::{Deserialize, Serialize};

use crate::domain_types::{ProjectId, UnifiedAsset};

pub mod ingest;
pub mod normalizer;
pub mod replay;

pub use ingest::RawIngestService;
pub use normalizer::AssetNormalizer;
pub use replay::EtlReplayService;

/// One service observed on the asset (satellite row)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceRecord {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub banner: String,
}

/// Web detail observed on the asset (satellite row)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WebRecord {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub status_code: Option<u16>,
}

/// Vulnerability finding on the asset (satellite row)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VulnRecord {
    pub name: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub detail: String,
}

/// Output of the normalize stage, ready to persist.
///
/// Empty strings mean "not observed": the merge rule preserves whatever
/// the store already holds for those fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedAsset {
    pub project_id: ProjectId,
    pub ip: String,
    pub port: u16,
    pub service: String,
    pub product: String,
    pub component: String,
    /// `None` preserves the stored flag
    pub is_web: Option<bool>,
    /// Object whose keys merge over the stored metadata
    pub metadata: serde_json::Value,
    pub hostname: String,
    pub os: String,
    pub services: Vec<ServiceRecord>,
    pub web: Option<WebRecord>,
    pub vulns: Vec<VulnRecord>,
}

/// Applies the field-level merge rule: a non-empty incoming value
/// overwrites, an empty one preserves the stored value.
pub fn merge_field(existing: &mut String, incoming: &str) {
    if !incoming.is_empty() {
        *existing = incoming.to_string();
    }
}

/// Merges an incoming normalized record over an existing unified row.
///
/// Commutative with itself for identical inputs, so feeding the same
/// payload twice leaves the row unchanged after the first application.
pub fn merge_unified(existing: &mut UnifiedAsset, incoming: &NormalizedAsset) {
    merge_field(&mut existing.service, &incoming.service);
    merge_field(&mut existing.product, &incoming.product);
    merge_field(&mut existing.component, &incoming.component);
    if let Some(is_web) = incoming.is_web {
        existing.is_web = is_web;
    }
    merge_metadata(&mut existing.metadata, &incoming.metadata);
}

/// Key-wise metadata merge: incoming keys overwrite, absent keys persist
pub fn merge_metadata(existing: &mut serde_json::Value, incoming: &serde_json::Value) {
    let serde_json::Value::Object(incoming_map) = incoming else {
        return;
    };
    if incoming_map.is_empty() {
        return;
    }
    if !existing.is_object() {
        *existing = serde_json::Value::Object(serde_json::Map::new());
    }
    if let serde_json::Value::Object(existing_map) = existing {
        for (key, value) in incoming_map {
            existing_map.insert(key.clone(), value.clone());
        }
    }
}

//! Raw ingestion queue (ETL ingress)
//!
//! Append-only staging for scan results coming off Agents. Asset rows
//! flow straight to the normalizer; discovered subnets wait for human
//! review and only enter the pipeline once approved.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, instrument};

use crate::domain_types::{
    ApprovalStatus, BatchId, PageNumber, PageSize, RawAsset, RawAssetNetwork, RawAssetStatus,
};
use crate::error::{FleetError, FleetResult};
use crate::storage::{PagedRows, RawAssetStore};
use crate::time_provider::SharedTimeProvider;

/// Which staging table a batch lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IngestKind {
    #[default]
    Asset,
    Network,
}

/// One ingest request from an Agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub source_type: String,
    #[serde(default)]
    pub kind: IngestKind,
    pub records: Vec<serde_json::Value>,
}

/// Receipt for an accepted batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub batch_id: BatchId,
    pub kind: IngestKind,
    pub staged: usize,
}

/// Service front over the raw staging tables
pub struct RawIngestService {
    raw: Arc<dyn RawAssetStore>,
    /// Nudges the normalizer pool when new work lands
    normalizer_wakeup: Arc<Notify>,
    time: SharedTimeProvider,
}

impl RawIngestService {
    /// Creates the ingest service
    pub fn new(
        raw: Arc<dyn RawAssetStore>,
        normalizer_wakeup: Arc<Notify>,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            raw,
            normalizer_wakeup,
            time,
        }
    }

    /// Stages one batch; rows land `pending` under a fresh batch id.
    ///
    /// ETL failures never block this path: whatever the payloads hold,
    /// staging succeeds and the normalizer sorts it out later.
    #[instrument(skip(self, request), fields(source_type = %request.source_type, rows = request.records.len()))]
    pub async fn ingest(&self, request: IngestRequest) -> FleetResult<IngestReceipt> {
        if request.source_type.trim().is_empty() {
            return Err(FleetError::invalid_input("source_type must not be empty"));
        }
        if request.records.is_empty() {
            return Err(FleetError::invalid_input("records must not be empty"));
        }

        let payloads: Vec<String> = request
            .records
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<_, _>>()?;

        let batch_id = BatchId::generate();
        let now = self.time.now();
        let ids = match request.kind {
            IngestKind::Asset => {
                self.raw
                    .insert_assets(batch_id, &request.source_type, &payloads, now)
                    .await?
            }
            IngestKind::Network => {
                self.raw
                    .insert_networks(batch_id, &request.source_type, &payloads, now)
                    .await?
            }
        };

        info!(batch_id = %batch_id, staged = ids.len(), "raw batch staged");
        if request.kind == IngestKind::Asset {
            self.normalizer_wakeup.notify_waiters();
        }
        Ok(IngestReceipt {
            batch_id,
            kind: request.kind,
            staged: ids.len(),
        })
    }

    /// Fetches one staged asset row
    pub async fn get_asset(&self, id: i64) -> FleetResult<RawAsset> {
        self.raw
            .get_asset(id)
            .await?
            .ok_or_else(|| FleetError::not_found("raw asset", id.to_string()))
    }

    /// Paged asset staging listing
    pub async fn list_assets(
        &self,
        status: Option<RawAssetStatus>,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<RawAsset>> {
        self.raw.list_assets(status, page, page_size).await
    }

    /// Paged network staging listing
    pub async fn list_networks(
        &self,
        approval: Option<ApprovalStatus>,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<RawAssetNetwork>> {
        self.raw.list_networks(approval, page, page_size).await
    }

    /// Manual status override on a staged asset row
    pub async fn update_asset_status(
        &self,
        id: i64,
        status: RawAssetStatus,
    ) -> FleetResult<RawAsset> {
        if !self
            .raw
            .mark_asset(id, status, None, self.time.now())
            .await?
        {
            return Err(FleetError::not_found("raw asset", id.to_string()));
        }
        self.get_asset(id).await
    }

    /// Approves a discovered subnet and hands it to the normalizer.
    ///
    /// # Errors
    ///
    /// Returns `invalid_transition` unless the row is `pending_review`.
    #[instrument(skip(self))]
    pub async fn approve_network(&self, id: i64) -> FleetResult<RawAssetNetwork> {
        self.review_network(id, ApprovalStatus::Approved).await
    }

    /// Rejects a discovered subnet; it never reaches the asset graph.
    #[instrument(skip(self))]
    pub async fn reject_network(&self, id: i64) -> FleetResult<RawAssetNetwork> {
        self.review_network(id, ApprovalStatus::Rejected).await
    }

    async fn review_network(
        &self,
        id: i64,
        verdict: ApprovalStatus,
    ) -> FleetResult<RawAssetNetwork> {
        let moved = self
            .raw
            .set_network_approval(id, ApprovalStatus::PendingReview, verdict, self.time.now())
            .await?;
        if !moved {
            let current = self
                .raw
                .get_network(id)
                .await?
                .ok_or_else(|| FleetError::not_found("raw network", id.to_string()))?;
            return Err(FleetError::InvalidTransition {
                from: current.approval_status.as_str().to_string(),
                command: verdict.as_str().to_string(),
            });
        }
        if verdict == ApprovalStatus::Approved {
            self.normalizer_wakeup.notify_waiters();
        }
        self.raw
            .get_network(id)
            .await?
            .ok_or_else(|| FleetError::not_found("raw network", id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect_for_testing;
    use crate::storage::SqliteRawAssetStore;
    use crate::time_provider::MockTimeProvider;
    use tempfile::tempdir;

    async fn service(dir: &std::path::Path) -> RawIngestService {
        let raw = Arc::new(SqliteRawAssetStore::new(connect_for_testing(dir).await));
        RawIngestService::new(raw, Arc::new(Notify::new()), Arc::new(MockTimeProvider::new()))
    }

    #[tokio::test]
    async fn test_should_stage_batch_and_reject_empty_requests() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path()).await;

        let receipt = svc
            .ingest(IngestRequest {
                source_type: "portscan".to_string(),
                kind: IngestKind::Asset,
                records: vec![serde_json::json!({"ip": "10.0.0.1", "port": 80})],
            })
            .await
            .unwrap();
        assert_eq!(receipt.staged, 1);

        let listed = svc
            .list_assets(
                Some(RawAssetStatus::Pending),
                PageNumber::default(),
                PageSize::default(),
            )
            .await
            .unwrap();
        assert_eq!(listed.total, 1);

        let err = svc
            .ingest(IngestRequest {
                source_type: "portscan".to_string(),
                kind: IngestKind::Asset,
                records: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_should_gate_networks_behind_review() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path()).await;

        let receipt = svc
            .ingest(IngestRequest {
                source_type: "discovery".to_string(),
                kind: IngestKind::Network,
                records: vec![serde_json::json!({"cidr": "10.1.0.0/24"})],
            })
            .await
            .unwrap();
        assert_eq!(receipt.kind, IngestKind::Network);

        let pending = svc
            .list_networks(
                Some(ApprovalStatus::PendingReview),
                PageNumber::default(),
                PageSize::default(),
            )
            .await
            .unwrap();
        assert_eq!(pending.total, 1);
        let id = pending.items[0].id;

        let approved = svc.approve_network(id).await.unwrap();
        assert_eq!(approved.approval_status, ApprovalStatus::Approved);

        // Re-reviewing a settled row is a conflict.
        let err = svc.reject_network(id).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { .. }));
    }
}

//! Asset normalizer (the ETL core)
//!
//! Consumes pending staging rows in four stages: parse the payload,
//! validate addressing, normalize into the unified shape, persist with
//! the merge upsert. A failure at any stage flips the raw row to
//! `failed` and captures a stage-tagged error row; the ingest path is
//! never blocked.
//!
//! Workers process distinct batches in parallel; inside one batch rows
//! go in insertion order, which keeps pipeline runs reproducible.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::EtlConfig;
use crate::domain_types::{BatchId, EtlStage, ProjectId, RawAsset, RawAssetNetwork, RawAssetStatus};
use crate::error::{FleetError, FleetResult};
use crate::etl::{NormalizedAsset, ServiceRecord, VulnRecord, WebRecord};
use crate::storage::{EtlErrorStore, NewEtlError, RawAssetStore, UnifiedAssetStore};
use crate::time_provider::SharedTimeProvider;

/// Result-type discriminators on captured error rows
pub const RESULT_TYPE_ASSET: &str = "asset";
pub const RESULT_TYPE_NETWORK: &str = "network";

/// Shape the parse stage decodes asset payloads into; unknown fields
/// are ignored so plugin payloads can carry extras
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RawAssetPayload {
    pub ip: Option<String>,
    pub port: Option<u32>,
    pub service: Option<String>,
    pub product: Option<String>,
    pub component: Option<String>,
    pub is_web: Option<bool>,
    pub project_id: Option<String>,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub services: Vec<ServiceRecord>,
    pub web: Option<WebRecord>,
    pub vulns: Vec<VulnRecord>,
}

/// Shape the parse stage decodes network payloads into
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RawNetworkPayload {
    pub cidr: Option<String>,
    pub project_id: Option<String>,
    pub remark: Option<String>,
}

/// What one pipeline run did with a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineVerdict {
    /// Merged into the unified asset graph
    Persisted,
    /// Dropped by skip policy; no unified side effect
    Skipped,
}

fn stage_failure(stage: EtlStage, message: impl Into<String>) -> FleetError {
    FleetError::EtlStage {
        stage,
        message: message.into(),
    }
}

/// Parse stage for asset rows
pub fn parse_asset_payload(raw: &str) -> FleetResult<RawAssetPayload> {
    serde_json::from_str(raw).map_err(|e| stage_failure(EtlStage::Parse, e.to_string()))
}

/// Parse stage for network rows
pub fn parse_network_payload(raw: &str) -> FleetResult<RawNetworkPayload> {
    serde_json::from_str(raw).map_err(|e| stage_failure(EtlStage::Parse, e.to_string()))
}

/// Validate stage for asset rows: `ip` is the minimum viable record,
/// ports must stay inside u16 range
pub fn validate_asset_payload(payload: &RawAssetPayload) -> FleetResult<(IpAddr, u16)> {
    let ip_raw = payload
        .ip
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| stage_failure(EtlStage::Validate, "missing required field: ip"))?;
    let ip: IpAddr = ip_raw
        .parse()
        .map_err(|_| stage_failure(EtlStage::Validate, format!("invalid ip: {ip_raw}")))?;
    let port = match payload.port {
        None => 0u16,
        Some(p) if p <= u32::from(u16::MAX) => p as u16,
        Some(p) => {
            return Err(stage_failure(
                EtlStage::Validate,
                format!("port out of range: {p}"),
            ));
        }
    };
    Ok((ip, port))
}

/// Validate stage for network rows: CIDR syntax with per-family
/// prefix bounds
pub fn validate_cidr(cidr: &str) -> FleetResult<()> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| stage_failure(EtlStage::Validate, format!("invalid cidr: {cidr}")))?;
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| stage_failure(EtlStage::Validate, format!("invalid cidr address: {addr}")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| stage_failure(EtlStage::Validate, format!("invalid cidr prefix: {prefix}")))?;
    let max = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max {
        return Err(stage_failure(
            EtlStage::Validate,
            format!("cidr prefix {prefix} exceeds /{max}"),
        ));
    }
    Ok(())
}

/// Normalize stage: project binding plus the unified field extraction
pub fn normalize_asset(
    payload: RawAssetPayload,
    ip: IpAddr,
    port: u16,
) -> FleetResult<NormalizedAsset> {
    let project = payload.project_id.unwrap_or_else(|| "default".to_string());
    let project_id = ProjectId::try_new(project)
        .map_err(|e| stage_failure(EtlStage::Normalize, format!("invalid project id: {e}")))?;
    Ok(NormalizedAsset {
        project_id,
        ip: ip.to_string(),
        port,
        service: payload.service.unwrap_or_default(),
        product: payload.product.unwrap_or_default(),
        component: payload.component.unwrap_or_default(),
        is_web: payload.is_web,
        metadata: payload
            .metadata
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
        hostname: payload.hostname.unwrap_or_default(),
        os: payload.os.unwrap_or_default(),
        services: payload.services,
        web: payload.web,
        vulns: payload.vulns,
    })
}

/// Multi-worker normalization pipeline over the staging tables
pub struct AssetNormalizer {
    raw: Arc<dyn RawAssetStore>,
    unified: Arc<dyn UnifiedAssetStore>,
    errors: Arc<dyn EtlErrorStore>,
    config: EtlConfig,
    /// Batches currently owned by a worker; entry wins the claim race
    active_batches: Arc<DashMap<BatchId, ()>>,
    wakeup: Arc<Notify>,
    time: SharedTimeProvider,
}

impl AssetNormalizer {
    /// Creates the normalizer over its stores
    pub fn new(
        raw: Arc<dyn RawAssetStore>,
        unified: Arc<dyn UnifiedAssetStore>,
        errors: Arc<dyn EtlErrorStore>,
        config: EtlConfig,
        wakeup: Arc<Notify>,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            raw,
            unified,
            errors,
            config,
            active_batches: Arc::new(DashMap::new()),
            wakeup,
            time,
        }
    }

    /// Runs the full pipeline on one asset row without touching its
    /// staging status or error bookkeeping (the caller owns those).
    ///
    /// # Errors
    ///
    /// Every failure is an `EtlStage` error tagged with the stage it
    /// was captured at.
    pub async fn run_asset_pipeline(&self, row: &RawAsset) -> FleetResult<PipelineVerdict> {
        let payload = parse_asset_payload(&row.payload)?;
        let (ip, port) = validate_asset_payload(&payload)?;
        let normalized = normalize_asset(payload, ip, port)?;

        if self
            .unified
            .is_skip_listed(&normalized.ip)
            .await
            .map_err(|e| stage_failure(EtlStage::Persist, e.to_string()))?
        {
            debug!(ip = %normalized.ip, "skip policy dropped record");
            return Ok(PipelineVerdict::Skipped);
        }

        self.unified
            .upsert(&normalized, self.time.now())
            .await
            .map_err(|e| stage_failure(EtlStage::Persist, e.to_string()))?;
        Ok(PipelineVerdict::Persisted)
    }

    /// Runs the pipeline on one approved network row. Subnets carry no
    /// `(ip, port)` identity, so validation is their whole journey into
    /// the graph; scan scheduling over them is a separate concern.
    pub async fn run_network_pipeline(&self, row: &RawAssetNetwork) -> FleetResult<()> {
        let payload = parse_network_payload(&row.payload)?;
        let cidr = payload
            .cidr
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| stage_failure(EtlStage::Validate, "missing required field: cidr"))?;
        validate_cidr(cidr)
    }

    async fn settle_asset_row(&self, row: &RawAsset) -> FleetResult<()> {
        match self.run_asset_pipeline(row).await {
            Ok(_) => {
                self.raw
                    .mark_asset(row.id, RawAssetStatus::Processed, None, self.time.now())
                    .await?;
            }
            Err(FleetError::EtlStage { stage, message }) => {
                warn!(raw_id = row.id, stage = stage.as_str(), %message, "asset row failed");
                self.raw
                    .mark_asset(
                        row.id,
                        RawAssetStatus::Failed,
                        Some(&message),
                        self.time.now(),
                    )
                    .await?;
                self.errors
                    .insert(
                        &NewEtlError {
                            task_id: None,
                            result_type: RESULT_TYPE_ASSET.to_string(),
                            stage,
                            raw_ref: row.id,
                            err_msg: message,
                        },
                        self.time.now(),
                    )
                    .await?;
            }
            Err(other) => return Err(other),
        }
        Ok(())
    }

    async fn settle_network_row(&self, row: &RawAssetNetwork) -> FleetResult<()> {
        match self.run_network_pipeline(row).await {
            Ok(()) => {
                self.raw
                    .mark_network(row.id, RawAssetStatus::Processed, None, self.time.now())
                    .await?;
            }
            Err(FleetError::EtlStage { stage, message }) => {
                warn!(raw_id = row.id, stage = stage.as_str(), %message, "network row failed");
                self.raw
                    .mark_network(
                        row.id,
                        RawAssetStatus::Failed,
                        Some(&message),
                        self.time.now(),
                    )
                    .await?;
                self.errors
                    .insert(
                        &NewEtlError {
                            task_id: None,
                            result_type: RESULT_TYPE_NETWORK.to_string(),
                            stage,
                            raw_ref: row.id,
                            err_msg: message,
                        },
                        self.time.now(),
                    )
                    .await?;
            }
            Err(other) => return Err(other),
        }
        Ok(())
    }

    /// Processes one claimable batch; returns rows settled, or None
    /// when no batch was available
    async fn process_one_batch(&self) -> FleetResult<Option<u64>> {
        let active: Vec<BatchId> = self.active_batches.iter().map(|e| *e.key()).collect();
        let Some(batch_id) = self.raw.next_pending_batch(&active).await? else {
            return Ok(None);
        };
        // Entry API arbitrates racing workers; the loser looks for
        // another batch on its next pass.
        match self.active_batches.entry(batch_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Ok(Some(0)),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(());
            }
        }

        let result = self.drain_batch(batch_id).await;
        self.active_batches.remove(&batch_id);
        result.map(Some)
    }

    async fn drain_batch(&self, batch_id: BatchId) -> FleetResult<u64> {
        let rows = self.raw.pending_assets_in_batch(batch_id).await?;
        let mut settled = 0u64;
        for row in rows {
            if !self.raw.claim_asset(row.id, self.time.now()).await? {
                continue;
            }
            self.settle_asset_row(&row).await?;
            settled += 1;
        }
        if settled > 0 {
            debug!(batch_id = %batch_id, settled, "batch drained");
        }
        Ok(settled)
    }

    /// Settles every approved network row and every pending asset batch
    /// currently visible; returns rows settled
    #[instrument(skip(self))]
    pub async fn process_pending_once(&self) -> FleetResult<u64> {
        let mut settled = 0u64;

        for row in self.raw.pending_approved_networks().await? {
            if !self.raw.claim_network(row.id, self.time.now()).await? {
                continue;
            }
            self.settle_network_row(&row).await?;
            settled += 1;
        }

        while let Some(count) = self.process_one_batch().await? {
            settled += count;
            if count == 0 {
                break;
            }
        }
        Ok(settled)
    }

    /// One normalizer worker: drains staging until cancelled
    pub async fn worker_loop(self: Arc<Self>, cancel: CancellationToken) {
        let idle_wait = std::time::Duration::from_millis(self.config.poll_interval_ms.max(10));
        loop {
            match self.process_pending_once().await {
                Ok(0) => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = self.wakeup.notified() => {}
                        () = self.time.sleep(idle_wait) => {}
                    }
                }
                Ok(settled) => debug!(settled, "normalizer pass settled rows"),
                Err(err) => {
                    warn!(error = %err, "normalizer pass failed");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = self.time.sleep(idle_wait) => {}
                    }
                }
            }
            if cancel.is_cancelled() {
                break;
            }
        }
    }

    /// Spawns the normalizer worker pool
    pub fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        info!(workers = count.max(1), "starting normalizer pool");
        (0..count.max(1))
            .map(|_| {
                let normalizer = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(normalizer.worker_loop(cancel))
            })
            .collect()
    }
}

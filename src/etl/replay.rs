//! ETL error replay
//!
//! Failed rows stay in staging with their payloads intact; a triggered
//! replay resubmits every `new` error through the normalizer. Success
//! resolves the error, failure returns it to `new` until the replay
//! limit is spent, after which it is abandoned.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::domain_types::{EtlError, PageNumber, PageSize, RawAssetStatus, ReplayLimit};
use crate::error::{FleetError, FleetResult};
use crate::etl::normalizer::{AssetNormalizer, RESULT_TYPE_ASSET, RESULT_TYPE_NETWORK};
use crate::storage::{EtlErrorFilter, EtlErrorStore, PagedRows, RawAssetStore};
use crate::time_provider::SharedTimeProvider;

/// Tally of one replay pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayOutcome {
    pub submitted: u64,
    pub resolved: u64,
    pub returned: u64,
    pub abandoned: u64,
}

/// Replay service over the captured-error store
pub struct EtlReplayService {
    errors: Arc<dyn EtlErrorStore>,
    raw: Arc<dyn RawAssetStore>,
    normalizer: Arc<AssetNormalizer>,
    limit: ReplayLimit,
    time: SharedTimeProvider,
}

impl EtlReplayService {
    /// Creates the replay service
    pub fn new(
        errors: Arc<dyn EtlErrorStore>,
        raw: Arc<dyn RawAssetStore>,
        normalizer: Arc<AssetNormalizer>,
        limit: ReplayLimit,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            errors,
            raw,
            normalizer,
            limit,
            time,
        }
    }

    /// Paged error listing for the API
    pub async fn list(
        &self,
        filter: &EtlErrorFilter,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<EtlError>> {
        self.errors.list(filter, page, page_size).await
    }

    /// Replays every error currently in `new` status.
    ///
    /// Replay is synchronous and per-row, so a pass gives deterministic
    /// state transitions: resolved, returned to `new`, or abandoned
    /// once the limit is spent.
    #[instrument(skip(self))]
    pub async fn trigger_replay(&self) -> FleetResult<ReplayOutcome> {
        let mut outcome = ReplayOutcome::default();

        for error in self.errors.list_new().await? {
            if !self.errors.mark_retrying(error.id, self.time.now()).await? {
                continue;
            }
            outcome.submitted += 1;
            let attempt = error.replay_count + 1;

            let replay_result = self.replay_one(&error).await;
            match replay_result {
                Ok(()) => {
                    self.errors.mark_resolved(error.id, self.time.now()).await?;
                    outcome.resolved += 1;
                }
                Err(FleetError::EtlStage { message, .. }) => {
                    if attempt >= u32::from(self.limit.as_u8()) {
                        self.errors
                            .mark_abandoned(error.id, self.time.now())
                            .await?;
                        outcome.abandoned += 1;
                        warn!(error_id = error.id, attempt, "etl error abandoned");
                    } else {
                        self.errors
                            .revert_to_new(error.id, &message, self.time.now())
                            .await?;
                        outcome.returned += 1;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        info!(
            submitted = outcome.submitted,
            resolved = outcome.resolved,
            returned = outcome.returned,
            abandoned = outcome.abandoned,
            "replay pass finished"
        );
        Ok(outcome)
    }

    /// Re-runs one captured failure against its original payload
    async fn replay_one(&self, error: &EtlError) -> FleetResult<()> {
        match error.result_type.as_str() {
            RESULT_TYPE_ASSET => {
                let row = self
                    .raw
                    .get_asset(error.raw_ref)
                    .await?
                    .ok_or_else(|| FleetError::not_found("raw asset", error.raw_ref.to_string()))?;
                self.raw
                    .mark_asset(row.id, RawAssetStatus::Processing, None, self.time.now())
                    .await?;
                match self.normalizer.run_asset_pipeline(&row).await {
                    Ok(_) => {
                        self.raw
                            .mark_asset(row.id, RawAssetStatus::Processed, None, self.time.now())
                            .await?;
                        Ok(())
                    }
                    Err(err) => {
                        self.raw
                            .mark_asset(
                                row.id,
                                RawAssetStatus::Failed,
                                Some(&err.to_string()),
                                self.time.now(),
                            )
                            .await?;
                        Err(err)
                    }
                }
            }
            RESULT_TYPE_NETWORK => {
                let row = self.raw.get_network(error.raw_ref).await?.ok_or_else(|| {
                    FleetError::not_found("raw network", error.raw_ref.to_string())
                })?;
                self.raw
                    .mark_network(row.id, RawAssetStatus::Processing, None, self.time.now())
                    .await?;
                match self.normalizer.run_network_pipeline(&row).await {
                    Ok(()) => {
                        self.raw
                            .mark_network(row.id, RawAssetStatus::Processed, None, self.time.now())
                            .await?;
                        Ok(())
                    }
                    Err(err) => {
                        self.raw
                            .mark_network(
                                row.id,
                                RawAssetStatus::Failed,
                                Some(&err.to_string()),
                                self.time.now(),
                            )
                            .await?;
                        Err(err)
                    }
                }
            }
            other => Err(FleetError::StorageFatal(format!(
                "unknown etl result type: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EtlConfig;
    use crate::database::connect_for_testing;
    use crate::domain_types::{BatchId, EtlErrorStatus};
    use crate::storage::{
        SqliteEtlErrorStore, SqliteRawAssetStore, SqliteUnifiedAssetStore, UnifiedAssetStore,
    };
    use crate::time_provider::MockTimeProvider;
    use chrono::Utc;
    use tempfile::tempdir;
    use tokio::sync::Notify;

    struct Fixture {
        replay: EtlReplayService,
        normalizer: Arc<AssetNormalizer>,
        raw: Arc<SqliteRawAssetStore>,
        errors: Arc<SqliteEtlErrorStore>,
        unified: Arc<SqliteUnifiedAssetStore>,
    }

    async fn fixture(dir: &std::path::Path) -> Fixture {
        let db = connect_for_testing(dir).await;
        let raw = Arc::new(SqliteRawAssetStore::new(db.clone()));
        let unified = Arc::new(SqliteUnifiedAssetStore::new(db.clone()));
        let errors = Arc::new(SqliteEtlErrorStore::new(db));
        let time: SharedTimeProvider = Arc::new(MockTimeProvider::new());
        let normalizer = Arc::new(AssetNormalizer::new(
            raw.clone(),
            unified.clone(),
            errors.clone(),
            EtlConfig::default(),
            Arc::new(Notify::new()),
            time.clone(),
        ));
        let replay = EtlReplayService::new(
            errors.clone(),
            raw.clone(),
            normalizer.clone(),
            ReplayLimit::default(),
            time,
        );
        Fixture {
            replay,
            normalizer,
            raw,
            errors,
            unified,
        }
    }

    async fn stage_and_fail(f: &Fixture, payload: &str) -> i64 {
        let ids = f
            .raw
            .insert_assets(
                BatchId::generate(),
                "portscan",
                &[payload.to_string()],
                Utc::now(),
            )
            .await
            .unwrap();
        f.normalizer.process_pending_once().await.unwrap();
        ids[0]
    }

    async fn error_status(f: &Fixture, raw_ref: i64) -> (EtlErrorStatus, u32) {
        let page = f
            .errors
            .list(
                &EtlErrorFilter::default(),
                PageNumber::default(),
                PageSize::default(),
            )
            .await
            .unwrap();
        let row = page.items.iter().find(|e| e.raw_ref == raw_ref).unwrap();
        (row.status, row.replay_count)
    }

    #[tokio::test]
    async fn test_should_abandon_error_after_replay_limit_with_no_side_effects() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path()).await;

        let raw_id = stage_and_fail(&f, "malformed payload").await;
        assert_eq!(error_status(&f, raw_id).await.0, EtlErrorStatus::New);

        // Replays 1 and 2 fail and return the error to `new`.
        for expected_count in 1..=2u32 {
            let outcome = f.replay.trigger_replay().await.unwrap();
            assert_eq!(outcome.submitted, 1);
            assert_eq!(outcome.returned, 1);
            let (status, count) = error_status(&f, raw_id).await;
            assert_eq!(status, EtlErrorStatus::New);
            assert_eq!(count, expected_count);
        }

        // Replay 3 exhausts the limit.
        let outcome = f.replay.trigger_replay().await.unwrap();
        assert_eq!(outcome.abandoned, 1);
        let (status, count) = error_status(&f, raw_id).await;
        assert_eq!(status, EtlErrorStatus::Abandoned);
        assert_eq!(count, 3);

        // Abandoned errors leave the replay pool.
        let outcome = f.replay.trigger_replay().await.unwrap();
        assert_eq!(outcome.submitted, 0);

        // The broken payload never produced a unified row.
        let unified = f
            .unified
            .list(None, None, None, PageNumber::default(), PageSize::default())
            .await
            .unwrap();
        assert_eq!(unified.total, 0);
    }

    #[tokio::test]
    async fn test_should_resolve_error_when_underlying_cause_is_fixed() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path()).await;

        // A healthy payload behind a hand-inserted persist error stands
        // in for a transient first-run failure.
        let ids = f
            .raw
            .insert_assets(
                BatchId::generate(),
                "portscan",
                &[serde_json::to_string(
                    &serde_json::json!({"ip": "10.0.0.3", "port": 80, "service": "http"}),
                )
                .unwrap()],
                Utc::now(),
            )
            .await
            .unwrap();
        f.errors
            .insert(
                &crate::storage::NewEtlError {
                    task_id: None,
                    result_type: RESULT_TYPE_ASSET.to_string(),
                    stage: crate::domain_types::EtlStage::Persist,
                    raw_ref: ids[0],
                    err_msg: "simulated lock wait".to_string(),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let outcome = f.replay.trigger_replay().await.unwrap();
        assert_eq!(outcome.resolved, 1);

        let row = f.raw.get_asset(ids[0]).await.unwrap().unwrap();
        assert_eq!(row.status, RawAssetStatus::Processed);
        // Exactly one unified side effect regardless of replay count.
        let unified = f
            .unified
            .list(None, Some("10.0.0.3"), Some(80), PageNumber::default(), PageSize::default())
            .await
            .unwrap();
        assert_eq!(unified.total, 1);
    }
}

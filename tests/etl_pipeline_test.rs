//! End-to-end ETL scenarios: merge upserts across batches, failure
//! capture, replay exhaustion, and the subnet review gate.

mod common;

use scanmaster::domain_types::{EtlErrorStatus, EtlStage, PageNumber, PageSize, RawAssetStatus};
use scanmaster::etl::ingest::{IngestKind, IngestRequest};
use scanmaster::storage::{EtlErrorFilter, UnifiedAssetStore};

fn assets(records: Vec<serde_json::Value>) -> IngestRequest {
    IngestRequest {
        source_type: "portscan".to_string(),
        kind: IngestKind::Asset,
        records,
    }
}

#[tokio::test]
async fn test_should_merge_two_batches_into_single_unified_row() {
    let h = common::harness().await;

    h.ingest
        .ingest(assets(vec![
            serde_json::json!({"ip": "10.0.0.1", "port": 80, "service": "http"}),
        ]))
        .await
        .unwrap();
    h.normalizer.process_pending_once().await.unwrap();

    h.ingest
        .ingest(assets(vec![
            serde_json::json!({"ip": "10.0.0.1", "port": 80, "product": "nginx"}),
        ]))
        .await
        .unwrap();
    h.normalizer.process_pending_once().await.unwrap();

    let page = h
        .unified
        .list(None, Some("10.0.0.1"), Some(80), PageNumber::default(), PageSize::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1, "one row per (project, ip, port)");
    assert_eq!(page.items[0].service, "http");
    assert_eq!(page.items[0].product, "nginx");
}

#[tokio::test]
async fn test_should_preserve_stored_fields_when_payload_omits_them() {
    let h = common::harness().await;

    h.ingest
        .ingest(assets(vec![serde_json::json!({
            "ip": "10.0.0.2", "port": 22,
            "service": "ssh", "product": "openssh", "component": "sshd"
        })]))
        .await
        .unwrap();
    h.normalizer.process_pending_once().await.unwrap();

    // Second sighting carries only the component.
    h.ingest
        .ingest(assets(vec![serde_json::json!({
            "ip": "10.0.0.2", "port": 22, "component": "sshd-9.6"
        })]))
        .await
        .unwrap();
    h.normalizer.process_pending_once().await.unwrap();

    let row = h
        .unified
        .get_by_key("default", "10.0.0.2", 22)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.service, "ssh", "omitted field preserved");
    assert_eq!(row.product, "openssh", "omitted field preserved");
    assert_eq!(row.component, "sshd-9.6", "present field overwritten");
}

#[tokio::test]
async fn test_should_yield_identical_state_when_same_batch_ingested_twice() {
    let h = common::harness().await;
    let record = serde_json::json!({"ip": "10.0.0.3", "port": 443, "service": "https"});

    h.ingest.ingest(assets(vec![record.clone()])).await.unwrap();
    h.normalizer.process_pending_once().await.unwrap();
    let first = h
        .unified
        .get_by_key("default", "10.0.0.3", 443)
        .await
        .unwrap()
        .unwrap();

    h.ingest.ingest(assets(vec![record])).await.unwrap();
    h.normalizer.process_pending_once().await.unwrap();
    let second = h
        .unified
        .get_by_key("default", "10.0.0.3", 443)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.service, second.service);
    assert_eq!(first.metadata, second.metadata);
}

#[tokio::test]
async fn test_should_abandon_malformed_payload_after_three_replays() {
    let h = common::harness().await;

    // A record without the required ip fails the validate stage and
    // exercises the capture/replay path deterministically.
    h.ingest
        .ingest(assets(vec![serde_json::json!({"port": 80})]))
        .await
        .unwrap();
    h.normalizer.process_pending_once().await.unwrap();

    let errors = h
        .replay
        .list(&EtlErrorFilter::default(), PageNumber::default(), PageSize::default())
        .await
        .unwrap();
    assert_eq!(errors.total, 1);
    assert_eq!(errors.items[0].error_stage, EtlStage::Validate);
    assert_eq!(errors.items[0].status, EtlErrorStatus::New);
    let error_id = errors.items[0].id;
    let raw_ref = errors.items[0].raw_ref;

    let raw = h.ingest.get_asset(raw_ref).await.unwrap();
    assert_eq!(raw.status, RawAssetStatus::Failed);

    // Three failed replays exhaust the limit.
    for _ in 0..2 {
        let outcome = h.replay.trigger_replay().await.unwrap();
        assert_eq!(outcome.returned, 1);
    }
    let outcome = h.replay.trigger_replay().await.unwrap();
    assert_eq!(outcome.abandoned, 1);

    let errors = h
        .replay
        .list(&EtlErrorFilter::default(), PageNumber::default(), PageSize::default())
        .await
        .unwrap();
    assert_eq!(errors.items[0].id, error_id);
    assert_eq!(errors.items[0].status, EtlErrorStatus::Abandoned);
    assert_eq!(errors.items[0].replay_count, 3);

    // No unified rows ever came out of it.
    let unified = h
        .unified
        .list(None, None, None, PageNumber::default(), PageSize::default())
        .await
        .unwrap();
    assert_eq!(unified.total, 0);
}

#[tokio::test]
async fn test_should_only_normalize_networks_after_approval() {
    let h = common::harness().await;

    h.ingest
        .ingest(IngestRequest {
            source_type: "discovery".to_string(),
            kind: IngestKind::Network,
            records: vec![
                serde_json::json!({"cidr": "10.1.0.0/24"}),
                serde_json::json!({"cidr": "10.2.0.0/24"}),
            ],
        })
        .await
        .unwrap();

    // Nothing moves while review is pending.
    assert_eq!(h.normalizer.process_pending_once().await.unwrap(), 0);

    let pending = h
        .ingest
        .list_networks(None, PageNumber::default(), PageSize::default())
        .await
        .unwrap();
    let first = pending.items[0].id;
    let second = pending.items[1].id;

    h.ingest.approve_network(first).await.unwrap();
    h.ingest.reject_network(second).await.unwrap();

    assert_eq!(h.normalizer.process_pending_once().await.unwrap(), 1);

    let approved = h
        .ingest
        .list_networks(None, PageNumber::default(), PageSize::default())
        .await
        .unwrap();
    let first_row = approved.items.iter().find(|n| n.id == first).unwrap();
    assert_eq!(first_row.status, RawAssetStatus::Processed);
    let second_row = approved.items.iter().find(|n| n.id == second).unwrap();
    assert_eq!(
        second_row.status,
        RawAssetStatus::Pending,
        "rejected subnets never enter the pipeline"
    );
}

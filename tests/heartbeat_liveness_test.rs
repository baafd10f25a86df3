//! Liveness control-plane scenarios: registration feeding heartbeats,
//! staleness eviction, and the sticky maintenance/error states.

mod common;

use scanmaster::domain_types::{AgentKey, AgentStatus, CapabilityId, HostName, PortNumber};
use scanmaster::heartbeat::{HeartbeatMetrics, HeartbeatRequest};
use scanmaster::registry::RegisterRequest;
use scanmaster::time_provider::TimeProvider;

fn register(agent_id: &str, hostname: &str, port: u16) -> RegisterRequest {
    RegisterRequest {
        agent_id: AgentKey::try_new(agent_id.to_string()).unwrap(),
        hostname: HostName::try_new(hostname.to_string()).unwrap(),
        port: PortNumber::try_new(port).unwrap(),
        ip_address: None,
        version: None,
        remark: None,
        capabilities: vec![CapabilityId::try_new("1".to_string()).unwrap()],
        tags: vec![],
    }
}

#[tokio::test]
async fn test_should_track_status_through_register_then_heartbeat() {
    let h = common::harness().await;

    let (_, agent) = h.registry.register(register("a1", "h", 9000)).await.unwrap();
    assert_eq!(agent.status, AgentStatus::Offline, "registration starts offline");

    let stamp = "2025-01-01T00:00:00Z"
        .parse::<chrono::DateTime<chrono::Utc>>()
        .unwrap();
    h.heartbeat
        .process_heartbeat(
            &agent.agent_id,
            HeartbeatRequest {
                status: Some(AgentStatus::Online),
                metrics: Some(HeartbeatMetrics {
                    cpu_usage: 0.1,
                    timestamp: Some(stamp),
                    ..Default::default()
                }),
            },
        )
        .await
        .unwrap();

    let loaded = h.registry.get(&agent.agent_id).await.unwrap();
    assert_eq!(loaded.agent.status, AgentStatus::Online);
    assert_eq!(loaded.agent.last_heartbeat, Some(stamp));
    let metrics = loaded.metrics.expect("snapshot stored");
    assert!((metrics.cpu_usage - 0.1).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_should_evict_stale_agent_within_sweep_after_t_stale() {
    let h = common::harness().await;

    let (_, agent) = h.registry.register(register("a2", "h2", 9000)).await.unwrap();
    h.heartbeat
        .process_heartbeat(
            &agent.agent_id,
            HeartbeatRequest {
                status: Some(AgentStatus::Online),
                metrics: Some(HeartbeatMetrics {
                    timestamp: Some(h.clock.now()),
                    ..Default::default()
                }),
            },
        )
        .await
        .unwrap();

    // t0 + 89s: still inside the window.
    h.clock.advance_secs(89);
    assert_eq!(h.sweeper.sweep_once().await.unwrap(), 0);
    let fresh = h.registry.get(&agent.agent_id).await.unwrap();
    assert_eq!(fresh.agent.status, AgentStatus::Online);

    // t0 + 91s with T_stale = 90s: the next sweep evicts.
    h.clock.advance_secs(2);
    assert_eq!(h.sweeper.sweep_once().await.unwrap(), 1);
    let evicted = h.registry.get(&agent.agent_id).await.unwrap();
    assert_eq!(evicted.agent.status, AgentStatus::Offline);
}

#[tokio::test]
async fn test_should_recover_agent_when_heartbeat_resumes_after_eviction() {
    let h = common::harness().await;

    let (_, agent) = h.registry.register(register("a3", "h3", 9000)).await.unwrap();
    h.heartbeat
        .process_heartbeat(&agent.agent_id, HeartbeatRequest::default())
        .await
        .unwrap();

    h.clock.advance_secs(120);
    h.sweeper.sweep_once().await.unwrap();
    assert_eq!(
        h.registry.get(&agent.agent_id).await.unwrap().agent.status,
        AgentStatus::Offline
    );

    // A bare heartbeat brings the agent straight back online.
    let outcome = h
        .heartbeat
        .process_heartbeat(
            &agent.agent_id,
            HeartbeatRequest {
                status: None,
                metrics: Some(HeartbeatMetrics {
                    timestamp: Some(h.clock.now()),
                    ..Default::default()
                }),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, AgentStatus::Online);
    assert!(outcome.status_changed);
}

#[tokio::test]
async fn test_should_keep_maintenance_agent_until_explicit_online_report() {
    let h = common::harness().await;

    let (_, agent) = h.registry.register(register("a4", "h4", 9000)).await.unwrap();
    h.heartbeat
        .process_heartbeat(
            &agent.agent_id,
            HeartbeatRequest {
                status: Some(AgentStatus::Maintenance),
                metrics: None,
            },
        )
        .await
        .unwrap();

    // Staleness never touches maintenance.
    h.clock.advance_secs(600);
    assert_eq!(h.sweeper.sweep_once().await.unwrap(), 0);
    assert_eq!(
        h.registry.get(&agent.agent_id).await.unwrap().agent.status,
        AgentStatus::Maintenance
    );

    // Nor does a bare heartbeat.
    h.heartbeat
        .process_heartbeat(&agent.agent_id, HeartbeatRequest::default())
        .await
        .unwrap();
    assert_eq!(
        h.registry.get(&agent.agent_id).await.unwrap().agent.status,
        AgentStatus::Maintenance
    );

    // Only the explicit report moves it.
    let outcome = h
        .heartbeat
        .process_heartbeat(
            &agent.agent_id,
            HeartbeatRequest {
                status: Some(AgentStatus::Online),
                metrics: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, AgentStatus::Online);
}

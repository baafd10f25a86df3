//! REST API for the Master management surface
//!
//! JSON over HTTP with one shared envelope:
//! `{code, status, message, data, error}`; paged payloads additionally
//! carry `{total, page, page_size, total_pages, has_next, has_previous}`.
//! Handlers parse at the boundary into domain types, call the services,
//! and map `FleetError` onto HTTP statuses.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::catalog::CatalogResolver;
use crate::dispatcher::{AgentReport, ControlCommand, NewTask, TaskDispatcher};
use crate::domain_types::{
    AgentKey, AgentStatus, ApprovalStatus, CapabilityId, PageNumber, PageSize, RawAssetStatus,
    ScanType, StaleAfterSecs, TagId, TagType, TaskId, WorkStatus,
};
use crate::error::{FleetError, FleetResult};
use crate::etl::{EtlReplayService, RawIngestService, ingest::IngestRequest};
use crate::heartbeat::{HeartbeatProcessor, HeartbeatRequest};
use crate::metrics::MetricsAggregator;
use crate::registry::{AgentRegistry, RegisterOutcome, RegisterRequest};
use crate::storage::{AgentListFilter, EtlErrorFilter, MetricsListFilter, PagedRows, UnifiedAssetStore};

/// Shared response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: u16,
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiEnvelope<T> {
    fn success(code: StatusCode, message: impl Into<String>, data: T) -> (StatusCode, Json<Self>) {
        (
            code,
            Json(Self {
                code: code.as_u16(),
                status: "success".to_string(),
                message: message.into(),
                data: Some(data),
                error: None,
            }),
        )
    }
}

/// Paged payload carried inside the envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageData<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_previous: bool,
}

impl<T> PageData<T> {
    fn from_rows(rows: PagedRows<T>, page: PageNumber, page_size: PageSize) -> Self {
        let size = u64::from(page_size.as_u32());
        let total_pages = rows.total.div_ceil(size.max(1));
        let current = u64::from(page.as_u32());
        Self {
            items: rows.items,
            total: rows.total,
            page: page.as_u32(),
            page_size: page_size.as_u32(),
            total_pages,
            has_next: current < total_pages,
            has_previous: current > 1,
        }
    }
}

/// `FleetError` adapter onto the envelope
pub struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ApiEnvelope::<serde_json::Value> {
            code: code.as_u16(),
            status: "failed".to_string(),
            message: "request failed".to_string(),
            data: None,
            error: Some(self.0.to_string()),
        };
        (code, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<(StatusCode, Json<ApiEnvelope<T>>), ApiError>;

/// Everything the handlers need, cloned per request
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub heartbeat: Arc<HeartbeatProcessor>,
    pub metrics: Arc<MetricsAggregator>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub ingest: Arc<RawIngestService>,
    pub replay: Arc<EtlReplayService>,
    pub unified: Arc<dyn UnifiedAssetStore>,
    pub catalog: Arc<CatalogResolver>,
    pub stale_after: StaleAfterSecs,
}

/// Builds the full API router over the application state
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/agents/register", post(register_agent))
        .route("/api/v1/agents", get(list_agents))
        .route("/api/v1/agents/metrics", get(list_metrics))
        .route("/api/v1/agents/metrics/summary", get(metrics_summary))
        .route(
            "/api/v1/agents/{id}",
            get(get_agent).delete(delete_agent),
        )
        .route("/api/v1/agents/{id}/heartbeat", post(agent_heartbeat))
        .route("/api/v1/agents/{id}/capabilities", post(add_capability))
        .route(
            "/api/v1/agents/{id}/capabilities/{cap}",
            delete(remove_capability),
        )
        .route("/api/v1/agents/{id}/tags", post(add_tag))
        .route("/api/v1/agents/{id}/tags/{tag}", delete(remove_tag))
        .route("/api/v1/tasks", post(submit_task))
        .route("/api/v1/tasks/queue/stats", get(queue_stats))
        .route("/api/v1/tasks/queue/clear", post(clear_queue))
        .route("/api/v1/tasks/{id}/status", get(task_status))
        .route("/api/v1/tasks/{id}/report", post(task_report))
        .route("/api/v1/tasks/{id}/{command}", post(task_control))
        .route("/api/v1/asset/raw", post(ingest_raw).get(list_raw_assets))
        .route("/api/v1/asset/raw-networks", get(list_raw_networks))
        .route(
            "/api/v1/asset/raw-networks/{id}/approve",
            post(approve_network),
        )
        .route(
            "/api/v1/asset/raw-networks/{id}/reject",
            post(reject_network),
        )
        .route("/api/v1/asset/unified", get(list_unified))
        .route("/api/v1/asset/etl/errors", get(list_etl_errors))
        .route("/api/v1/asset/etl/errors/replay", post(trigger_replay))
        .route("/api/v1/scan-types", get(list_scan_types).post(create_scan_type))
        .route("/api/v1/scan-types/{id}/active", post(set_scan_type_active))
        .route("/api/v1/tags", get(list_tags).post(create_tag))
        .with_state(state)
}

fn parse_agent_key(raw: String) -> Result<AgentKey, ApiError> {
    AgentKey::try_new(raw)
        .map_err(|e| ApiError(FleetError::invalid_input(format!("agent id: {e}"))))
}

fn parse_page(page: Option<u32>, page_size: Option<u32>) -> FleetResult<(PageNumber, PageSize)> {
    let page = match page {
        Some(p) => PageNumber::try_new(p)
            .map_err(|e| FleetError::invalid_input(format!("page: {e}")))?,
        None => PageNumber::default(),
    };
    let page_size = match page_size {
        Some(s) => PageSize::try_new(s)
            .map_err(|e| FleetError::invalid_input(format!("page_size: {e}")))?,
        None => PageSize::default(),
    };
    Ok((page, page_size))
}

fn split_ids(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HealthPayload {
    status: String,
}

async fn health_check() -> ApiResult<HealthPayload> {
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "ok",
        HealthPayload {
            status: "healthy".to_string(),
        },
    ))
}

async fn register_agent(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<crate::domain_types::Agent> {
    let (outcome, agent) = state.registry.register(request).await?;
    let (code, message) = match outcome {
        RegisterOutcome::Created => (StatusCode::CREATED, "agent registered"),
        RegisterOutcome::Updated => (StatusCode::OK, "agent registration refreshed"),
    };
    Ok(ApiEnvelope::success(code, message, agent))
}

async fn agent_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<crate::heartbeat::HeartbeatOutcome> {
    let agent_id = parse_agent_key(id)?;
    let outcome = state.heartbeat.process_heartbeat(&agent_id, request).await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "heartbeat accepted",
        outcome,
    ))
}

#[derive(Debug, Deserialize)]
struct ListAgentsQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    status: Option<String>,
    keyword: Option<String>,
    /// Comma-separated tag ids, AND semantics
    tags: Option<String>,
    /// Comma-separated capability ids, AND semantics
    capabilities: Option<String>,
}

async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<ListAgentsQuery>,
) -> ApiResult<PageData<crate::registry::AgentWithMetrics>> {
    let (page, page_size) = parse_page(query.page, query.page_size)?;
    let status = query
        .status
        .as_deref()
        .map(AgentStatus::parse)
        .transpose()?;
    let tags = split_ids(query.tags.as_deref())
        .into_iter()
        .map(|t| TagId::try_new(t).map_err(|e| FleetError::invalid_input(format!("tag: {e}"))))
        .collect::<FleetResult<Vec<_>>>()?;
    let capabilities = split_ids(query.capabilities.as_deref())
        .into_iter()
        .map(|c| {
            CapabilityId::try_new(c)
                .map_err(|e| FleetError::invalid_input(format!("capability: {e}")))
        })
        .collect::<FleetResult<Vec<_>>>()?;

    let filter = AgentListFilter {
        status,
        keyword: query.keyword,
        tags,
        capabilities,
    };
    let rows = state.registry.list(&filter, page, page_size).await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "agents",
        PageData::from_rows(rows, page, page_size),
    ))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::registry::AgentWithMetrics> {
    let agent_id = parse_agent_key(id)?;
    let agent = state.registry.get(&agent_id).await?;
    Ok(ApiEnvelope::success(StatusCode::OK, "agent", agent))
}

async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let agent_id = parse_agent_key(id)?;
    state.registry.delete(&agent_id).await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "agent deleted",
        serde_json::json!({"agent_id": agent_id}),
    ))
}

#[derive(Debug, Deserialize)]
struct CapabilityBody {
    capability_id: CapabilityId,
}

async fn add_capability(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CapabilityBody>,
) -> ApiResult<serde_json::Value> {
    let agent_id = parse_agent_key(id)?;
    state
        .registry
        .add_capability(&agent_id, body.capability_id)
        .await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "capability added",
        serde_json::json!({"agent_id": agent_id}),
    ))
}

async fn remove_capability(
    State(state): State<AppState>,
    Path((id, cap)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    let agent_id = parse_agent_key(id)?;
    let capability = CapabilityId::try_new(cap)
        .map_err(|e| FleetError::invalid_input(format!("capability: {e}")))?;
    state
        .registry
        .remove_capability(&agent_id, &capability)
        .await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "capability removed",
        serde_json::json!({"agent_id": agent_id}),
    ))
}

#[derive(Debug, Deserialize)]
struct TagBody {
    tag_id: TagId,
}

async fn add_tag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TagBody>,
) -> ApiResult<serde_json::Value> {
    let agent_id = parse_agent_key(id)?;
    state.registry.add_tag(&agent_id, body.tag_id).await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "tag added",
        serde_json::json!({"agent_id": agent_id}),
    ))
}

async fn remove_tag(
    State(state): State<AppState>,
    Path((id, tag)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    let agent_id = parse_agent_key(id)?;
    let tag =
        TagId::try_new(tag).map_err(|e| FleetError::invalid_input(format!("tag: {e}")))?;
    state.registry.remove_tag(&agent_id, &tag).await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "tag removed",
        serde_json::json!({"agent_id": agent_id}),
    ))
}

#[derive(Debug, Deserialize)]
struct ListMetricsQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    work_status: Option<String>,
    scan_type: Option<String>,
    keyword: Option<String>,
}

async fn list_metrics(
    State(state): State<AppState>,
    Query(query): Query<ListMetricsQuery>,
) -> ApiResult<PageData<crate::domain_types::MetricsSnapshot>> {
    let (page, page_size) = parse_page(query.page, query.page_size)?;
    let work_status = query
        .work_status
        .as_deref()
        .map(WorkStatus::parse)
        .transpose()?;
    let filter = MetricsListFilter {
        work_status,
        scan_type: query.scan_type,
        keyword: query.keyword,
    };
    let rows = state.metrics.list(&filter, page, page_size).await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "metrics",
        PageData::from_rows(rows, page, page_size),
    ))
}

async fn metrics_summary(
    State(state): State<AppState>,
) -> ApiResult<crate::metrics::FleetSummary> {
    let summary = state.metrics.fleet_summary(state.stale_after).await?;
    Ok(ApiEnvelope::success(StatusCode::OK, "fleet summary", summary))
}

async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<NewTask>,
) -> ApiResult<crate::domain_types::Task> {
    let task = state.dispatcher.submit(request).await?;
    Ok(ApiEnvelope::success(
        StatusCode::CREATED,
        "task accepted",
        task,
    ))
}

async fn task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::domain_types::Task> {
    let task_id = TaskId::parse(&id)?;
    let task = state.dispatcher.status(&task_id).await?;
    Ok(ApiEnvelope::success(StatusCode::OK, "task", task))
}

async fn task_control(
    State(state): State<AppState>,
    Path((id, command)): Path<(String, String)>,
) -> ApiResult<crate::domain_types::Task> {
    let task_id = TaskId::parse(&id)?;
    let command = ControlCommand::parse(&command)?;
    let task = state.dispatcher.control(&task_id, command).await?;
    Ok(ApiEnvelope::success(StatusCode::OK, "task updated", task))
}

async fn task_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<AgentReport>,
) -> ApiResult<crate::domain_types::Task> {
    let task_id = TaskId::parse(&id)?;
    let task = state.dispatcher.report(&task_id, report).await?;
    Ok(ApiEnvelope::success(StatusCode::OK, "report applied", task))
}

async fn queue_stats(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let stats = state.dispatcher.queue_stats().await;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "queue stats",
        serde_json::json!({"queued_by_priority": stats}),
    ))
}

async fn clear_queue(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let cleared = state.dispatcher.clear_queue().await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "queue cleared",
        serde_json::json!({"cancelled": cleared}),
    ))
}

async fn ingest_raw(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<crate::etl::ingest::IngestReceipt> {
    let receipt = state.ingest.ingest(request).await?;
    Ok(ApiEnvelope::success(
        StatusCode::ACCEPTED,
        "batch staged",
        receipt,
    ))
}

#[derive(Debug, Deserialize)]
struct ListRawQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    status: Option<String>,
}

async fn list_raw_assets(
    State(state): State<AppState>,
    Query(query): Query<ListRawQuery>,
) -> ApiResult<PageData<crate::domain_types::RawAsset>> {
    let (page, page_size) = parse_page(query.page, query.page_size)?;
    let status = query
        .status
        .as_deref()
        .map(RawAssetStatus::parse)
        .transpose()?;
    let rows = state.ingest.list_assets(status, page, page_size).await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "raw assets",
        PageData::from_rows(rows, page, page_size),
    ))
}

#[derive(Debug, Deserialize)]
struct ListRawNetworksQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    approval_status: Option<String>,
}

async fn list_raw_networks(
    State(state): State<AppState>,
    Query(query): Query<ListRawNetworksQuery>,
) -> ApiResult<PageData<crate::domain_types::RawAssetNetwork>> {
    let (page, page_size) = parse_page(query.page, query.page_size)?;
    let approval = query
        .approval_status
        .as_deref()
        .map(ApprovalStatus::parse)
        .transpose()?;
    let rows = state.ingest.list_networks(approval, page, page_size).await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "raw networks",
        PageData::from_rows(rows, page, page_size),
    ))
}

async fn approve_network(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<crate::domain_types::RawAssetNetwork> {
    let row = state.ingest.approve_network(id).await?;
    Ok(ApiEnvelope::success(StatusCode::OK, "network approved", row))
}

async fn reject_network(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<crate::domain_types::RawAssetNetwork> {
    let row = state.ingest.reject_network(id).await?;
    Ok(ApiEnvelope::success(StatusCode::OK, "network rejected", row))
}

#[derive(Debug, Deserialize)]
struct ListUnifiedQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    project_id: Option<String>,
    ip: Option<String>,
    port: Option<u16>,
}

async fn list_unified(
    State(state): State<AppState>,
    Query(query): Query<ListUnifiedQuery>,
) -> ApiResult<PageData<crate::domain_types::UnifiedAsset>> {
    let (page, page_size) = parse_page(query.page, query.page_size)?;
    let rows = state
        .unified
        .list(
            query.project_id.as_deref(),
            query.ip.as_deref(),
            query.port,
            page,
            page_size,
        )
        .await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "unified assets",
        PageData::from_rows(rows, page, page_size),
    ))
}

#[derive(Debug, Deserialize)]
struct ListEtlErrorsQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    status: Option<String>,
    stage: Option<String>,
    result_type: Option<String>,
}

async fn list_etl_errors(
    State(state): State<AppState>,
    Query(query): Query<ListEtlErrorsQuery>,
) -> ApiResult<PageData<crate::domain_types::EtlError>> {
    let (page, page_size) = parse_page(query.page, query.page_size)?;
    let status = query
        .status
        .as_deref()
        .map(crate::domain_types::EtlErrorStatus::parse)
        .transpose()?;
    let stage = query
        .stage
        .as_deref()
        .map(crate::domain_types::EtlStage::parse)
        .transpose()?;
    let filter = EtlErrorFilter {
        status,
        stage,
        result_type: query.result_type,
    };
    let rows = state.replay.list(&filter, page, page_size).await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "etl errors",
        PageData::from_rows(rows, page, page_size),
    ))
}

async fn trigger_replay(
    State(state): State<AppState>,
) -> ApiResult<crate::etl::replay::ReplayOutcome> {
    let outcome = state.replay.trigger_replay().await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "replay triggered",
        outcome,
    ))
}

async fn list_scan_types(State(state): State<AppState>) -> ApiResult<Vec<ScanType>> {
    let rows = state.catalog.list_scan_types().await?;
    Ok(ApiEnvelope::success(StatusCode::OK, "scan types", rows))
}

async fn create_scan_type(
    State(state): State<AppState>,
    Json(scan_type): Json<ScanType>,
) -> ApiResult<ScanType> {
    state.catalog.create_scan_type(&scan_type).await?;
    Ok(ApiEnvelope::success(
        StatusCode::CREATED,
        "scan type created",
        scan_type,
    ))
}

#[derive(Debug, Deserialize)]
struct ActiveBody {
    is_active: bool,
}

async fn set_scan_type_active(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ActiveBody>,
) -> ApiResult<serde_json::Value> {
    let id = CapabilityId::try_new(id)
        .map_err(|e| FleetError::invalid_input(format!("scan type id: {e}")))?;
    state.catalog.set_scan_type_active(&id, body.is_active).await?;
    Ok(ApiEnvelope::success(
        StatusCode::OK,
        "scan type updated",
        serde_json::json!({"id": id, "is_active": body.is_active}),
    ))
}

async fn list_tags(State(state): State<AppState>) -> ApiResult<Vec<TagType>> {
    let rows = state.catalog.list_tags().await?;
    Ok(ApiEnvelope::success(StatusCode::OK, "tags", rows))
}

async fn create_tag(
    State(state): State<AppState>,
    Json(tag): Json<TagType>,
) -> ApiResult<TagType> {
    state.catalog.create_tag(&tag).await?;
    Ok(ApiEnvelope::success(StatusCode::CREATED, "tag created", tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_compute_pagination_flags_from_totals() {
        let rows = PagedRows {
            items: vec![1, 2, 3],
            total: 45,
        };
        let page = PageNumber::try_new(2).unwrap();
        let size = PageSize::try_new(20).unwrap();
        let data = PageData::from_rows(rows, page, size);
        assert_eq!(data.total_pages, 3);
        assert!(data.has_next);
        assert!(data.has_previous);

        let last = PageData::from_rows(
            PagedRows {
                items: vec![1],
                total: 45,
            },
            PageNumber::try_new(3).unwrap(),
            size,
        );
        assert!(!last.has_next);
    }

    #[test]
    fn test_should_map_errors_onto_failed_envelope() {
        let response = ApiError(FleetError::not_found("agent", "a1")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError(FleetError::Cancelled).into_response();
        assert_eq!(response.status().as_u16(), 499);
    }

    #[test]
    fn test_should_split_comma_separated_filter_ids() {
        assert_eq!(split_ids(Some("1, 2,,3 ")), vec!["1", "2", "3"]);
        assert!(split_ids(None).is_empty());
    }
}

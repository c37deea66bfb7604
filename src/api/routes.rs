use axum::{
    error_handling::HandleErrorLayer,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    BoxError, Json, Router,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::domain::{Actor, AuditEntry, Facts, OrgId, RuleSetVersion, Run, RunStatus};
use crate::error::EngineError;
use crate::rules::{RuleSet, RuleSetDraft};
use crate::runs::{RunHandle, RunManager};
use crate::storage::PageCursor;

use super::error::ApiError;
use super::request::{
    decode_cursor, encode_cursor, page_limit, parse_run_id, ListAuditQuery, ListRunsQuery,
    SubmitRunRequest, ACTOR_HEADER,
};
use super::response::{ErrorResponse, HealthResponse, PageResponse, RunAcceptedResponse};

/// Shared application state.
pub struct AppState {
    pub manager: RunManager,

    /// Application start time
    pub start_time: Instant,

    /// Application version
    pub version: String,

    /// How long a submission waits for its decision before answering 202
    pub wait_timeout: Duration,

    /// Upper bound on any single request
    pub request_timeout: Duration,

    /// Concurrent requests served before new ones queue
    pub max_in_flight_requests: usize,

    /// Allowed browser origins; empty allows any
    pub cors_origins: Vec<String>,
}

/// Create the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(HandleErrorLayer::new(handle_middleware_error))
        .timeout(state.request_timeout)
        .concurrency_limit(state.max_in_flight_requests.max(1));

    Router::new()
        .route("/v1/orgs/:org_id/rule-sets", post(handle_publish_rule_set))
        .route("/v1/orgs/:org_id/rule-sets/:version", get(handle_get_rule_set))
        .route(
            "/v1/orgs/:org_id/runs",
            post(handle_submit_run).get(handle_list_runs),
        )
        .route("/v1/orgs/:org_id/runs/:run_id", get(handle_get_run))
        .route("/v1/orgs/:org_id/audit", get(handle_list_audit))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(middleware)
        .layer(cors_layer(&state.cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn handle_middleware_error(err: BoxError) -> (StatusCode, Json<ErrorResponse>) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            Json(ErrorResponse::new("request timed out", "TIMEOUT")),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::internal_error(err.to_string())),
        )
    }
}

fn actor_from(headers: &HeaderMap) -> Actor {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Actor::new)
        .unwrap_or_else(Actor::anonymous)
}

/// Publish a rule set version.
async fn handle_publish_rule_set(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<String>,
    Json(draft): Json<RuleSetDraft>,
) -> Result<(StatusCode, Json<RuleSet>), ApiError> {
    let org = OrgId::new(org_id);
    let rule_set = state.manager.publish_rule_set(&org, draft).await?;
    Ok((StatusCode::CREATED, Json(rule_set)))
}

async fn handle_get_rule_set(
    State(state): State<Arc<AppState>>,
    Path((org_id, version)): Path<(String, String)>,
) -> Result<Json<RuleSet>, ApiError> {
    let rule_set = state
        .manager
        .get_rule_set(&OrgId::new(org_id), &RuleSetVersion::new(version))
        .await?;
    Ok(Json(rule_set))
}

/// Submit a run and, unless told otherwise, wait briefly for its decision.
async fn handle_submit_run(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SubmitRunRequest>,
) -> Result<Response, ApiError> {
    let org = OrgId::new(org_id);
    let actor = actor_from(&headers);
    let facts = Facts::from_json(req.facts)?;

    let mut handle = state
        .manager
        .submit_run(&org, &req.rule_set_version, facts, actor)
        .await?;

    if !req.wait {
        return Ok(accepted(&state, &handle).await);
    }

    match handle.wait_timeout(state.wait_timeout).await {
        Ok(_) => {
            let run = state.manager.get_run(&org, handle.run_id()).await?;
            Ok((StatusCode::OK, Json(run)).into_response())
        }
        Err(EngineError::Cancelled { run_id }) => {
            debug!(org_id = %org, run_id = %run_id, "decision not ready, answering 202");
            Ok(accepted(&state, &handle).await)
        }
        Err(source) => {
            warn!(org_id = %org, run_id = %handle.run_id(), error = %source, "run failed");
            Err(ApiError::Run {
                run_id: handle.run_id(),
                source,
            })
        }
    }
}

async fn accepted(state: &AppState, handle: &RunHandle) -> Response {
    let status = state
        .manager
        .get_run(handle.org_id(), handle.run_id())
        .await
        .map(|run| run.status())
        .unwrap_or(RunStatus::Pending);

    (
        StatusCode::ACCEPTED,
        Json(RunAcceptedResponse {
            run_id: handle.run_id(),
            status,
            coalesced: handle.is_coalesced(),
        }),
    )
        .into_response()
}

async fn handle_get_run(
    State(state): State<Arc<AppState>>,
    Path((org_id, run_id)): Path<(String, String)>,
) -> Result<Json<Run>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    let run = state.manager.get_run(&OrgId::new(org_id), run_id).await?;
    Ok(Json(run))
}

/// List runs, oldest first. Filter by `created_by` to show a caller only
/// their own runs.
async fn handle_list_runs(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<PageResponse<Run>>, ApiError> {
    let org = OrgId::new(org_id);
    let limit = page_limit(query.limit, state.manager.config().page_size);
    let after = query.after.as_deref().map(decode_cursor).transpose()?;

    let runs = state
        .manager
        .list_runs(&org, query.filter())
        .starting_after(after)
        .collect(limit)
        .await
        .map_err(EngineError::from)?;

    let next_cursor = if runs.len() == limit {
        runs.last().map(|r| encode_cursor(&PageCursor::for_run(r)))
    } else {
        None
    };

    Ok(Json(PageResponse {
        items: runs,
        next_cursor,
    }))
}

async fn handle_list_audit(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<String>,
    Query(query): Query<ListAuditQuery>,
) -> Result<Json<PageResponse<AuditEntry>>, ApiError> {
    let org = OrgId::new(org_id);
    let limit = page_limit(query.limit, state.manager.config().page_size);
    let after = query.after.as_deref().map(decode_cursor).transpose()?;

    let entries = state
        .manager
        .audit_trail()
        .list_for(&org, query.filter())
        .starting_after(after)
        .collect(limit)
        .await
        .map_err(EngineError::from)?;

    let next_cursor = if entries.len() == limit {
        entries.last().map(|e| encode_cursor(&PageCursor::for_audit(e)))
    } else {
        None
    };

    Ok(Json(PageResponse {
        items: entries,
        next_cursor,
    }))
}

/// Health check endpoint.
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        runs_in_flight: state.manager.in_flight(),
    })
}

/// Metrics endpoint (Prometheus format).
async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = format!(
        "# HELP eligr_uptime_seconds Application uptime in seconds\n\
         # TYPE eligr_uptime_seconds counter\n\
         eligr_uptime_seconds {}\n\n\
         # HELP eligr_runs_in_flight Runs admitted but not finalized\n\
         # TYPE eligr_runs_in_flight gauge\n\
         eligr_runs_in_flight {}\n\n{}",
        state.start_time.elapsed().as_secs(),
        state.manager.in_flight(),
        state.manager.metrics().to_prometheus(),
    );

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        metrics,
    )
}

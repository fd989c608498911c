//! The HTTP JSON API (§6.1, ambient): the nine RPC operations exposed
//! over `axum` -- one `Router`, one `Service` in `State`, one handler per
//! route, a uniform `AppError` mapping internal failures to HTTP status
//! codes and a uniform JSON error body.
//!
//! Authorization is a `Role` recovered from the `Authorization: Bearer
//! <token>` header via [`tskd_core::token`]; each handler declares which
//! it needs before the `Service` touches the database, so a permission
//! failure never reaches a query.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use tskd_core::auth::{AuthError, Role};
use tskd_core::rpc::{JobSearchFilter, RpcError, Service, TaskSearchFilter, TriggerRequest};
use tskd_core::token::{self, TokenConfig};
use tskd_db::models::{JobRow, JobStatus, SkipRuleRow, TaskRow, TaskStatus};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        let status = match &err {
            RpcError::Auth(_) => StatusCode::FORBIDDEN,
            RpcError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            RpcError::NotFound => StatusCode::NOT_FOUND,
            RpcError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: err.to_string() }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

fn unauthenticated() -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        message: "missing or malformed Authorization header".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Auth extraction
// ---------------------------------------------------------------------------

/// Recover the caller's [`Role`] from a bearer token in the request
/// headers. Used at the top of every handler, before any query runs
/// (§6.1).
fn extract_role(headers: &HeaderMap, token_config: &TokenConfig) -> Result<Role, AppError> {
    let header = headers.get(axum::http::header::AUTHORIZATION).ok_or_else(unauthenticated)?;
    let value = header.to_str().map_err(|_| unauthenticated())?;
    let bearer = value.strip_prefix("Bearer ").ok_or_else(unauthenticated)?;
    token::validate_token(token_config, bearer).map_err(|_| AppError {
        status: StatusCode::UNAUTHORIZED,
        message: "invalid bearer token".to_string(),
    })
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        Self { status: StatusCode::FORBIDDEN, message: err.to_string() }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Service>,
    pub token_config: Arc<TokenConfig>,
}

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TriggerJobsBody {
    pub requests: Vec<TriggerJobRequestBody>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerJobRequestBody {
    pub job_name: String,
    pub repo: String,
    pub revision: Option<String>,
    pub patch_issue: Option<String>,
    pub patch_patchset: Option<String>,
    pub patch_server: Option<String>,
    pub patch_repo: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: f64,
    #[serde(default)]
    pub is_force: bool,
}

fn default_priority() -> f64 {
    1.0
}

impl From<TriggerJobRequestBody> for TriggerRequest {
    fn from(body: TriggerJobRequestBody) -> Self {
        Self {
            job_name: body.job_name,
            repo: body.repo,
            revision: body.revision,
            patch_issue: body.patch_issue,
            patch_patchset: body.patch_patchset,
            patch_server: body.patch_server,
            patch_repo: body.patch_repo,
            priority: body.priority,
            is_force: body.is_force,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TriggerJobsResponse {
    pub job_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct JobViewResponse {
    #[serde(flatten)]
    pub job: JobRow,
    pub tasks: Vec<TaskRow>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct JobSearchQuery {
    pub repo: Option<String>,
    pub name: Option<String>,
    pub status: Option<JobStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl From<JobSearchQuery> for JobSearchFilter {
    fn from(q: JobSearchQuery) -> Self {
        Self {
            repo: q.repo,
            name: q.name,
            status: q.status,
            since: q.since,
            until: q.until,
            limit: q.limit.unwrap_or(100),
            offset: q.offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TaskSearchQuery {
    pub repo: Option<String>,
    pub name: Option<String>,
    pub status: Option<TaskStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl From<TaskSearchQuery> for TaskSearchFilter {
    fn from(q: TaskSearchQuery) -> Self {
        Self {
            repo: q.repo,
            name: q.name,
            status: q.status,
            since: q.since,
            until: q.until,
            limit: q.limit.unwrap_or(100),
            offset: q.offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct GetTaskQuery {
    #[serde(default)]
    pub include_stats: bool,
}

#[derive(Debug, Serialize)]
pub struct TaskViewResponse {
    #[serde(flatten)]
    pub task: TaskRow,
    pub stats: Option<StatsResponse>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub cpu_seconds: Option<f64>,
    pub wall_seconds: Option<f64>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct AddSkipRuleBody {
    pub name: String,
    pub added_by: String,
    #[serde(default)]
    pub description: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub commits: Vec<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn trigger_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TriggerJobsBody>,
) -> Result<Json<TriggerJobsResponse>, AppError> {
    let role = extract_role(&headers, &state.token_config)?;
    let requests: Vec<TriggerRequest> = body.requests.into_iter().map(Into::into).collect();
    let job_ids = state.service.trigger_jobs(role, &requests).await?;
    Ok(Json(TriggerJobsResponse { job_ids }))
}

async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JobViewResponse>, AppError> {
    let role = extract_role(&headers, &state.token_config)?;
    let view = state.service.get_job(role, id).await?;
    Ok(Json(JobViewResponse { job: view.job, tasks: view.tasks }))
}

async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JobRow>, AppError> {
    let role = extract_role(&headers, &state.token_config)?;
    let job = state.service.cancel_job(role, id).await?;
    Ok(Json(job))
}

async fn search_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<JobSearchQuery>,
) -> Result<Json<Vec<JobRow>>, AppError> {
    let role = extract_role(&headers, &state.token_config)?;
    let jobs = state.service.search_jobs(role, &query.into()).await?;
    Ok(Json(jobs))
}

async fn get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<GetTaskQuery>,
) -> Result<Json<TaskViewResponse>, AppError> {
    let role = extract_role(&headers, &state.token_config)?;
    let view = state.service.get_task(role, id, query.include_stats).await?;
    Ok(Json(TaskViewResponse {
        task: view.task,
        stats: view.stats.map(|s| StatsResponse {
            cpu_seconds: s.cpu_seconds,
            wall_seconds: s.wall_seconds,
            exit_code: s.exit_code,
        }),
    }))
}

async fn search_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TaskSearchQuery>,
) -> Result<Json<Vec<TaskRow>>, AppError> {
    let role = extract_role(&headers, &state.token_config)?;
    let tasks = state.service.search_tasks(role, &query.into()).await?;
    Ok(Json(tasks))
}

async fn get_skip_rules(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SkipRuleRow>>, AppError> {
    let role = extract_role(&headers, &state.token_config)?;
    let rules = state.service.get_skip_task_rules(role)?;
    Ok(Json(rules))
}

async fn add_skip_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AddSkipRuleBody>,
) -> Result<Json<Vec<SkipRuleRow>>, AppError> {
    let role = extract_role(&headers, &state.token_config)?;
    let rules = state
        .service
        .add_skip_task_rule(role, &body.name, &body.added_by, &body.description, &body.patterns, &body.commits)
        .await?;
    Ok(Json(rules))
}

async fn delete_skip_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Vec<SkipRuleRow>>, AppError> {
    let role = extract_role(&headers, &state.token_config)?;
    let rules = state.service.delete_skip_task_rule(role, &name).await?;
    Ok(Json(rules))
}

async fn healthz() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/jobs", post(trigger_jobs).get(search_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/tasks", get(search_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/skip-rules", get(get_skip_rules).post(add_skip_rule))
        .route("/api/skip-rules/{name}", delete(delete_skip_rule))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_status_codes_match_taxonomy() {
        let not_found: AppError = RpcError::NotFound.into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let invalid: AppError = RpcError::InvalidArgument("bad".to_string()).into();
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);

        let auth: AppError = RpcError::Auth(AuthError { caller: Role::Viewer, required: tskd_core::auth::Requirement::Write }).into();
        assert_eq!(auth.status, StatusCode::FORBIDDEN);

        let other: AppError = RpcError::Other(anyhow::anyhow!("boom")).into();
        assert_eq!(other.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn missing_auth_header_is_unauthenticated() {
        let headers = HeaderMap::new();
        let token_config = TokenConfig::new(vec![1u8; 32]);
        let err = extract_role(&headers, &token_config).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn valid_token_resolves_role() {
        let token_config = TokenConfig::new(vec![1u8; 32]);
        let token = token::generate_token(&token_config, Role::Editor);
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        let role = extract_role(&headers, &token_config).unwrap();
        assert_eq!(role, Role::Editor);
    }
}

//! Task control plane HTTP surface (§6): `create_run`/`get_runs`/`get_tasks`/`get_run_tasks`.
//!
//! Grounded on `task_service.py`'s same-named methods (see [`super::model`]'s module doc)
//! and on the request/response shapes in §6. Authentication reuses [`crate::auth::validate`]
//! — the same bearer scheme as the WebSocket surface, per §6's "authenticated with the same
//! bearer scheme".

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::auth;
use crate::identity::{IdentityCache, UserIdentity, UserStore};
use crate::tasks::consumer::validate_schedule;
use crate::tasks::model::{Page, QueryScope, Run, Task, TaskFilter, TaskStatus, TaskStore};

pub struct TaskHttpState {
    pub store: Arc<dyn TaskStore>,
    pub identity_cache: IdentityCache,
    pub user_store: Arc<dyn UserStore>,
    pub jwt_secret: String,
    pub anonymous_domain: String,
}

#[derive(Debug, Serialize)]
struct ApiError {
    code: &'static str,
    message: String,
}

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (status, Json(ApiError { code, message: message.into() })).into_response()
}

async fn authenticate(
    state: &TaskHttpState,
    headers: &HeaderMap,
    query_params: &HashMap<String, String>,
) -> Result<UserIdentity, Response> {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    auth::validate(
        auth_header,
        query_params,
        &state.jwt_secret,
        &state.identity_cache,
        state.user_store.as_ref(),
        &state.anonymous_domain,
    )
    .await
    .map_err(|e| error_response(StatusCode::FORBIDDEN, e.code(), e.reason()))
}

fn scope_from_query(query: &HashMap<String, String>) -> QueryScope {
    QueryScope {
        space_id: query.get("space_id").cloned().unwrap_or_default(),
        user_id: query.get("user_id").cloned(),
        thread_id: query.get("thread_id").cloned(),
    }
}

fn page_from_query(query: &HashMap<String, String>) -> Page {
    let page = query.get("page").and_then(|v| v.parse().ok()).unwrap_or(1);
    let page_size = query.get("page_size").and_then(|v| v.parse().ok()).unwrap_or(20);
    Page { page, page_size }
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub data: CreateRunData,
    #[serde(default)]
    pub tasks: Option<Vec<Value>>,
    pub run_mode: String,
    pub assignee: String,
    #[serde(default)]
    pub collection_ref: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    pub user: String,
    pub space_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRunData {
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub execution_type: Option<String>,
    #[serde(default)]
    pub extra_input: Option<Value>,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default)]
    pub filters: Option<Value>,
    #[serde(default)]
    pub space_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleSpec {
    pub calling_date: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub run_id: String,
    pub task_ids: Vec<String>,
    pub status: HashMap<String, TaskStatus>,
}

fn new_run_id() -> String {
    format!("R{}", Uuid::new_v4().simple())
}

fn new_task_id() -> String {
    format!("T{}", Uuid::new_v4().simple())
}

/// `POST /tasks/create_run/` (§6). 400 when neither `tasks` nor `data.filters` is present
/// (there is nothing to dispatch against), and 400 when `data.schedule.calling_date` has
/// already passed (§4.10: "manual schedules in the past are rejected at creation").
pub async fn create_run_handler(
    headers: HeaderMap,
    Query(query_params): Query<HashMap<String, String>>,
    State(state): State<Arc<TaskHttpState>>,
    Json(req): Json<CreateRunRequest>,
) -> Response {
    if let Err(resp) = authenticate(&state, &headers, &query_params).await {
        return resp;
    }

    let tasks = req.tasks.clone().unwrap_or_default();
    if tasks.is_empty() && req.data.filters.is_none() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "missing_tasks_and_filters",
            "either `tasks` or `data.filters` is required",
        );
    }

    if let Some(schedule) = &req.data.schedule {
        if let Err(e) = validate_schedule(schedule.calling_date, Utc::now()) {
            return error_response(StatusCode::BAD_REQUEST, "past_scheduled_time", e.to_string());
        }
    }

    let run_id = new_run_id();
    let run = Run {
        run_id: run_id.clone(),
        space_id: req.space_id.clone(),
        user: req.user.clone(),
        org_id: req.org_id.clone(),
        thread_id: req.thread_id.clone(),
        collection_ref: req.collection_ref.clone(),
        run_mode: req.run_mode.clone(),
        status: TaskStatus::Pending,
        created: Utc::now(),
    };
    state.store.create_run(run).await;

    let payloads: Vec<Value> = if tasks.is_empty() {
        vec![req.data.context.clone().unwrap_or_else(|| Value::Object(Default::default()))]
    } else {
        tasks
    };

    let mut task_ids = Vec::with_capacity(payloads.len());
    let mut status = HashMap::with_capacity(payloads.len());
    let scheduled = req.data.schedule.as_ref().map(|s| s.calling_date);
    let task_status = if scheduled.is_some() { TaskStatus::Scheduled } else { TaskStatus::Pending };

    for payload in payloads {
        let task_id = new_task_id();
        let task = Task {
            task_id: task_id.clone(),
            run_id: run_id.clone(),
            space_id: req.space_id.clone(),
            user: req.user.clone(),
            thread_id: req.thread_id.clone(),
            assignee: req.assignee.clone(),
            collection_ref: req.collection_ref.clone(),
            ref_id: None,
            input: payload,
            output: None,
            status: task_status,
            scheduled_timestamp: scheduled,
            follow_up_count: 0,
            execution_type: req.data.execution_type.clone(),
            created: Utc::now(),
            modified: Utc::now(),
        };
        state.store.add_task(task).await;
        status.insert(task_id.clone(), task_status);
        task_ids.push(task_id);
    }

    (StatusCode::OK, Json(CreateRunResponse { run_id, task_ids, status })).into_response()
}

fn task_filter_from_query(query: &HashMap<String, String>) -> TaskFilter {
    let status = query.get("status").map(|raw| {
        raw.split(',')
            .filter_map(|s| match s.trim() {
                "pending" => Some(TaskStatus::Pending),
                "scheduled" => Some(TaskStatus::Scheduled),
                "in_progress" => Some(TaskStatus::InProgress),
                "completed" => Some(TaskStatus::Completed),
                "failed" => Some(TaskStatus::Failed),
                "hold" => Some(TaskStatus::Hold),
                _ => None,
            })
            .collect::<Vec<_>>()
    });
    TaskFilter {
        status,
        call_type: query.get("call_type").cloned(),
        search: query.get("search").cloned(),
        created_from: query.get("created_from").and_then(|v| v.parse().ok()),
        created_to: query.get("created_to").and_then(|v| v.parse().ok()),
    }
}

/// `GET /tasks/get_runs/?space_id=&user_id=&thread_id=` (§6). An empty scope (no
/// `space_id`) yields an empty paginated response rather than a full scan (§4.9).
pub async fn get_runs_handler(
    headers: HeaderMap,
    Query(query_params): Query<HashMap<String, String>>,
    State(state): State<Arc<TaskHttpState>>,
) -> Response {
    if let Err(resp) = authenticate(&state, &headers, &query_params).await {
        return resp;
    }
    let scope = scope_from_query(&query_params);
    let page = page_from_query(&query_params);
    let result = state.store.get_runs(&scope, page).await;
    (StatusCode::OK, Json(serde_json::json!({"data": result.items, "count": result.total}))).into_response()
}

/// `GET /tasks/get_tasks/?space_id=&user_id=&thread_id=&status=&call_type=&search=` (§6).
pub async fn get_tasks_handler(
    headers: HeaderMap,
    Query(query_params): Query<HashMap<String, String>>,
    State(state): State<Arc<TaskHttpState>>,
) -> Response {
    if let Err(resp) = authenticate(&state, &headers, &query_params).await {
        return resp;
    }
    let scope = scope_from_query(&query_params);
    let filter = task_filter_from_query(&query_params);
    let page = page_from_query(&query_params);
    let result = state.store.get_tasks(&scope, &filter, page).await;
    (StatusCode::OK, Json(serde_json::json!({"data": result.items, "count": result.total}))).into_response()
}

/// `GET /tasks/get_run_tasks/{run_id}/` (§6).
pub async fn get_run_tasks_handler(
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Query(query_params): Query<HashMap<String, String>>,
    State(state): State<Arc<TaskHttpState>>,
) -> Response {
    if let Err(resp) = authenticate(&state, &headers, &query_params).await {
        return resp;
    }
    let scope = scope_from_query(&query_params);
    let page = page_from_query(&query_params);
    let result = state.store.get_run_tasks(&run_id, &scope, page).await;
    (StatusCode::OK, Json(serde_json::json!({"data": result.items, "count": result.total}))).into_response()
}

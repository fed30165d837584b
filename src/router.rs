//! The single `axum::Router` serving both external interfaces of §6: the WebSocket
//! messaging endpoint and the task control-plane HTTP surface, with `tower_http`'s trace
//! and CORS layers carried as ambient middleware.
//!
//! Each surface keeps its own state type ([`crate::messaging::MessagingState`],
//! [`crate::tasks::TaskHttpState`]); they're built into independent sub-routers with
//! `with_state` applied before being merged, so the combined router itself is
//! state-free and can be served directly.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::messaging::{thread_socket_handler, MessagingState};
use crate::tasks::http::{create_run_handler, get_run_tasks_handler, get_runs_handler, get_tasks_handler};
use crate::tasks::TaskHttpState;

/// Builds the combined router. `messaging_state` and `task_state` are injected so callers
/// assemble the concrete storage/identity backends (Redis-backed, Mongo/Postgres-backed, or
/// in-memory for tests) before the process starts serving traffic.
pub fn build_router(messaging_state: Arc<MessagingState>, task_state: Arc<TaskHttpState>) -> Router {
    let messaging_router = Router::new()
        .route("/ws/v1/messaging/{thread_id}", get(thread_socket_handler))
        .with_state(messaging_state);

    let tasks_router = Router::new()
        .route("/tasks/create_run/", post(create_run_handler))
        .route("/tasks/get_runs/", get(get_runs_handler))
        .route("/tasks/get_tasks/", get(get_tasks_handler))
        .route("/tasks/get_run_tasks/{run_id}/", get(get_run_tasks_handler))
        .with_state(task_state);

    Router::new()
        .merge(messaging_router)
        .merge(tasks_router)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

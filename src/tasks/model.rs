//! Run/Task/ExecutionLog/CallLog entities and the scoped, paginated query surface (§3, §4.9).
//!
//! Grounded on `original_source/apps/api-services/services/task_service/core/task_service.py`
//! (`TaskService.add_task`/`update_task_status`/`get_runs`/`get_tasks`/`get_run_tasks`, the
//! `{space_id, user_id?, thread_id?}` scoping query, and the date/status/call-type/free-text
//! filter set) and `services/task_service/schemas/task.py`'s status enum. The in-memory store
//! reproduces the state graph and scoping predicate without a Mongo dependency; a production
//! deployment backs [`TaskStore`] with the real collection.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransitionError;

/// Task lifecycle state (§3). `Completed` is terminal; `Failed` is the only state with an
/// edge back into the graph (`Failed → Pending`, a retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    InProgress,
    Completed,
    Failed,
    Hold,
}

impl TaskStatus {
    fn label(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Hold => "hold",
        }
    }

    /// `true` for every edge in the fixed state graph of §3:
    /// `pending→{in_progress, hold, scheduled}`, `scheduled→in_progress`,
    /// `in_progress→{completed, failed, hold}`, `hold→{in_progress, failed}`,
    /// `failed→pending`.
    fn allows(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Hold)
                | (Pending, Scheduled)
                | (Scheduled, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Hold)
                | (Hold, InProgress)
                | (Hold, Failed)
                | (Failed, Pending)
        )
    }
}

/// A batch of one or more [`Task`]s (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub space_id: String,
    pub user: String,
    pub org_id: Option<String>,
    pub thread_id: Option<String>,
    pub collection_ref: Option<String>,
    pub run_mode: String,
    pub status: TaskStatus,
    pub created: DateTime<Utc>,
}

/// A unit of dispatchable work inside a [`Run`] (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub run_id: String,
    pub space_id: String,
    pub user: String,
    pub thread_id: Option<String>,
    pub assignee: String,
    pub collection_ref: Option<String>,
    pub ref_id: Option<String>,
    pub input: Value,
    pub output: Option<Value>,
    pub status: TaskStatus,
    pub scheduled_timestamp: Option<DateTime<Utc>>,
    pub follow_up_count: u32,
    pub execution_type: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Append-only `{task_id, run_id, step, status, input, output, timestamp}` audit record
/// (§3), used to make the Post-Call Flow idempotent and to drive the consumer pool's
/// reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub task_id: String,
    pub run_id: String,
    pub step: String,
    pub status: String,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Derived terminal record (§3), kept independent of [`Task`] so retention policy can
/// differ between the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLog {
    pub task_id: String,
    pub transcript: String,
    pub recording_url: Option<String>,
    pub duration_ms: i64,
    pub cost: f64,
    pub classification: Option<Value>,
    pub summary: Option<Value>,
    pub metadata: Value,
    pub created: DateTime<Utc>,
}

/// `{space_id, user_id?, thread_id?}` — every query is scoped by this predicate, and an
/// empty scope (`space_id` empty) yields an empty result rather than a full scan (§4.9).
#[derive(Debug, Clone, Default)]
pub struct QueryScope {
    pub space_id: String,
    pub user_id: Option<String>,
    pub thread_id: Option<String>,
}

impl QueryScope {
    fn is_empty(&self) -> bool {
        self.space_id.is_empty()
    }

    fn matches_run(&self, run: &Run) -> bool {
        if run.space_id != self.space_id {
            return false;
        }
        if let Some(user_id) = &self.user_id {
            if &run.user != user_id {
                return false;
            }
        }
        if let Some(thread_id) = &self.thread_id {
            if run.thread_id.as_deref() != Some(thread_id.as_str()) {
                return false;
            }
        }
        true
    }

    fn matches_task(&self, task: &Task) -> bool {
        if task.space_id != self.space_id {
            return false;
        }
        if let Some(user_id) = &self.user_id {
            if &task.user != user_id {
                return false;
            }
        }
        if let Some(thread_id) = &self.thread_id {
            if task.thread_id.as_deref() != Some(thread_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Free-text/status/date-range/call-type filter set applied on top of a [`QueryScope`]
/// (§4.9), mirroring `TaskService.get_filters`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<Vec<TaskStatus>>,
    pub call_type: Option<String>,
    pub search: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.status {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(call_type) = &self.call_type {
            let task_call_type = task
                .output
                .as_ref()
                .and_then(|o| o.get("call_type"))
                .and_then(|v| v.as_str());
            if task_call_type != Some(call_type.as_str()) {
                return false;
            }
        }
        if let Some(from) = self.created_from {
            if task.created < from {
                return false;
            }
        }
        if let Some(to) = self.created_to {
            if task.created > to {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let haystack = serde_json::to_string(&task.input).unwrap_or_default()
                + &task.output.as_ref().map(|o| o.to_string()).unwrap_or_default();
            if !haystack.to_lowercase().contains(&search.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// `page`/`page_size` pagination parameters, matching the HTTP surface in §6.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: usize,
    pub page_size: usize,
}

impl Default for Page {
    fn default() -> Self {
        Page { page: 1, page_size: 20 }
    }
}

/// A page of results plus the total count matching the scope/filter, independent of
/// pagination (mirrors `paginateData`'s `{data, count}` shape).
#[derive(Debug, Clone)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Raised by [`TaskStore::update_task`] when the requested transition is not an edge in
/// the state graph of §3.
pub fn check_transition(from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
    if from.allows(to) {
        Ok(())
    } else {
        Err(TransitionError {
            from: from.label().to_string(),
            to: to.label().to_string(),
        })
    }
}

/// Backing store for runs, tasks, and execution logs (§4.9). A real deployment implements
/// this over the Mongo-backed `RunModel`/`TaskModel`/execution-log collections named in
/// `original_source/`; [`InMemoryTaskStore`] is the in-process reference implementation
/// used by tests and small deployments.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_run(&self, run: Run) -> Run;
    async fn add_task(&self, task: Task) -> Task;
    async fn get_task(&self, task_id: &str) -> Option<Task>;
    async fn get_run(&self, run_id: &str) -> Option<Run>;
    /// The only mutation path for a task's status/output; rejects illegal transitions.
    async fn update_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        output: Option<Value>,
    ) -> Result<Task, TaskUpdateError>;
    async fn update_task_ref(&self, task_id: &str, ref_id: String, collection_ref: String) -> Option<Task>;
    async fn update_run_status(&self, run_id: &str, status: TaskStatus);
    async fn append_execution_log(&self, entry: ExecutionLogEntry);
    async fn execution_log_for_task(&self, task_id: &str) -> Vec<ExecutionLogEntry>;
    async fn save_call_log(&self, log: CallLog);
    async fn get_runs(&self, scope: &QueryScope, page: Page) -> PagedResult<Run>;
    async fn get_tasks(&self, scope: &QueryScope, filter: &TaskFilter, page: Page) -> PagedResult<Task>;
    async fn get_run_tasks(&self, run_id: &str, scope: &QueryScope, page: Page) -> PagedResult<Task>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskUpdateError {
    NotFound,
    IllegalTransition(TransitionError),
}

impl std::fmt::Display for TaskUpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskUpdateError::NotFound => write!(f, "task not found"),
            TaskUpdateError::IllegalTransition(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TaskUpdateError {}

impl TaskUpdateError {
    pub fn code(&self) -> &'static str {
        match self {
            TaskUpdateError::NotFound => "task_not_found",
            TaskUpdateError::IllegalTransition(_) => "invalid_transition",
        }
    }
}

fn paginate<T: Clone>(mut items: Vec<T>, page: Page) -> PagedResult<T> {
    let total = items.len();
    let start = page.page.saturating_sub(1) * page.page_size;
    if start >= items.len() {
        return PagedResult { items: Vec::new(), total };
    }
    let end = (start + page.page_size).min(items.len());
    PagedResult { items: items.drain(start..end).collect(), total }
}

/// In-memory [`TaskStore`]. Not persistent across process restarts; intended for tests
/// and for deployments small enough not to need the Mongo-backed production store.
#[derive(Default)]
pub struct InMemoryTaskStore {
    runs: Mutex<HashMap<String, Run>>,
    tasks: Mutex<HashMap<String, Task>>,
    logs: Mutex<Vec<ExecutionLogEntry>>,
    call_logs: Mutex<Vec<CallLog>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_run(&self, run: Run) -> Run {
        self.runs.lock().unwrap().insert(run.run_id.clone(), run.clone());
        run
    }

    async fn add_task(&self, task: Task) -> Task {
        self.tasks.lock().unwrap().insert(task.task_id.clone(), task.clone());
        task
    }

    async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().unwrap().get(task_id).cloned()
    }

    async fn get_run(&self, run_id: &str) -> Option<Run> {
        self.runs.lock().unwrap().get(run_id).cloned()
    }

    async fn update_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        output: Option<Value>,
    ) -> Result<Task, TaskUpdateError> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(task_id).ok_or(TaskUpdateError::NotFound)?;
        check_transition(task.status, status).map_err(TaskUpdateError::IllegalTransition)?;
        task.status = status;
        if let Some(output) = output {
            task.output = Some(output);
        }
        task.modified = Utc::now();
        Ok(task.clone())
    }

    async fn update_task_ref(&self, task_id: &str, ref_id: String, collection_ref: String) -> Option<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(task_id)?;
        task.ref_id = Some(ref_id);
        task.collection_ref = Some(collection_ref);
        task.modified = Utc::now();
        Some(task.clone())
    }

    async fn update_run_status(&self, run_id: &str, status: TaskStatus) {
        if let Some(run) = self.runs.lock().unwrap().get_mut(run_id) {
            run.status = status;
        }
    }

    async fn append_execution_log(&self, entry: ExecutionLogEntry) {
        self.logs.lock().unwrap().push(entry);
    }

    async fn execution_log_for_task(&self, task_id: &str) -> Vec<ExecutionLogEntry> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    async fn save_call_log(&self, log: CallLog) {
        self.call_logs.lock().unwrap().push(log);
    }

    async fn get_runs(&self, scope: &QueryScope, page: Page) -> PagedResult<Run> {
        if scope.is_empty() {
            return PagedResult { items: Vec::new(), total: 0 };
        }
        let runs: Vec<Run> = self
            .runs
            .lock()
            .unwrap()
            .values()
            .filter(|r| scope.matches_run(r))
            .cloned()
            .collect();
        paginate(runs, page)
    }

    async fn get_tasks(&self, scope: &QueryScope, filter: &TaskFilter, page: Page) -> PagedResult<Task> {
        if scope.is_empty() {
            return PagedResult { items: Vec::new(), total: 0 };
        }
        let tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| scope.matches_task(t) && filter.matches(t))
            .cloned()
            .collect();
        paginate(tasks, page)
    }

    async fn get_run_tasks(&self, run_id: &str, scope: &QueryScope, page: Page) -> PagedResult<Task> {
        if scope.is_empty() {
            return PagedResult { items: Vec::new(), total: 0 };
        }
        let tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.run_id == run_id && scope.matches_task(t))
            .cloned()
            .collect();
        paginate(tasks, page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(task_id: &str, space_id: &str, status: TaskStatus) -> Task {
        Task {
            task_id: task_id.to_string(),
            run_id: "run-1".to_string(),
            space_id: space_id.to_string(),
            user: "user-1".to_string(),
            thread_id: None,
            assignee: "agent-1".to_string(),
            collection_ref: None,
            ref_id: None,
            input: serde_json::json!({"name": "Alex"}),
            output: None,
            status,
            scheduled_timestamp: None,
            follow_up_count: 0,
            execution_type: None,
            created: Utc::now(),
            modified: Utc::now(),
        }
    }

    #[test]
    fn valid_transitions_are_exactly_the_spec_graph_edges() {
        use TaskStatus::*;
        assert!(check_transition(Pending, InProgress).is_ok());
        assert!(check_transition(Pending, Hold).is_ok());
        assert!(check_transition(Pending, Scheduled).is_ok());
        assert!(check_transition(Scheduled, InProgress).is_ok());
        assert!(check_transition(InProgress, Completed).is_ok());
        assert!(check_transition(Hold, InProgress).is_ok());
        assert!(check_transition(Hold, Failed).is_ok());
        assert!(check_transition(Failed, Pending).is_ok());
        assert!(check_transition(Completed, Pending).is_err());
        assert!(check_transition(Pending, Completed).is_err());
        assert!(check_transition(Scheduled, Hold).is_err());
    }

    #[tokio::test]
    async fn update_task_rejects_illegal_transition() {
        let store = InMemoryTaskStore::new();
        store.add_task(sample_task("t1", "space-1", TaskStatus::Pending)).await;
        let err = store.update_task("t1", TaskStatus::Completed, None).await.unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
    }

    #[tokio::test]
    async fn update_task_applies_legal_transition_and_output() {
        let store = InMemoryTaskStore::new();
        store.add_task(sample_task("t1", "space-1", TaskStatus::Pending)).await;
        let task = store
            .update_task("t1", TaskStatus::InProgress, None)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        let task = store
            .update_task("t1", TaskStatus::Completed, Some(serde_json::json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.output, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn empty_scope_yields_empty_result_never_a_full_scan() {
        let store = InMemoryTaskStore::new();
        store.add_task(sample_task("t1", "space-1", TaskStatus::Pending)).await;
        let empty_scope = QueryScope::default();
        let result = store.get_tasks(&empty_scope, &TaskFilter::default(), Page::default()).await;
        assert_eq!(result.total, 0);
        assert!(result.items.is_empty());
    }

    #[tokio::test]
    async fn scoped_query_only_returns_matching_space() {
        let store = InMemoryTaskStore::new();
        store.add_task(sample_task("t1", "space-1", TaskStatus::Pending)).await;
        store.add_task(sample_task("t2", "space-2", TaskStatus::Pending)).await;
        let scope = QueryScope { space_id: "space-1".to_string(), user_id: None, thread_id: None };
        let result = store.get_tasks(&scope, &TaskFilter::default(), Page::default()).await;
        assert_eq!(result.total, 1);
        assert_eq!(result.items[0].task_id, "t1");
    }

    #[tokio::test]
    async fn status_filter_narrows_results() {
        let store = InMemoryTaskStore::new();
        store.add_task(sample_task("t1", "space-1", TaskStatus::Pending)).await;
        store.add_task(sample_task("t2", "space-1", TaskStatus::Completed)).await;
        let scope = QueryScope { space_id: "space-1".to_string(), user_id: None, thread_id: None };
        let filter = TaskFilter { status: Some(vec![TaskStatus::Completed]), ..Default::default() };
        let result = store.get_tasks(&scope, &filter, Page::default()).await;
        assert_eq!(result.total, 1);
        assert_eq!(result.items[0].task_id, "t2");
    }

    #[tokio::test]
    async fn execution_log_is_append_only_and_keyed_by_task() {
        let store = InMemoryTaskStore::new();
        store
            .append_execution_log(ExecutionLogEntry {
                task_id: "t1".to_string(),
                run_id: "run-1".to_string(),
                step: "webhook attempt 1".to_string(),
                status: "success".to_string(),
                input: None,
                output: None,
                timestamp: Utc::now(),
            })
            .await;
        let log = store.execution_log_for_task("t1").await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].step, "webhook attempt 1");
    }
}

//! Post-Call Flow: the idempotent terminal orchestration that turns a [`CallResult`] into
//! a persisted [`CallLog`], a completed [`Task`]/[`Run`], a dispatched webhook, and
//! (conditionally) a scheduled follow-up (§4.11).
//!
//! Grounded on `original_source/apps/super/super_services/orchestration/cron_jobs/
//! post_call.py` (`post_call_flow`, `create_task_output`, `update_task`, `create_call_log`,
//! `get_doc_id`) and `original_source/apps/super/super/core/voice/common/prefect.py`
//! (`trigger_post_call`'s unconditional latency-metrics persistence ahead of the
//! `prefect:<task_id>` idempotency gate). The cost markup (`cost + cost*0.05`), the
//! single-leading-zero phone strip, and the `is_redial` early return (an analyzer result
//! that defers task completion to a later retry flow rather than mutating state here) all
//! come from `create_task_output`/`post_call_flow` directly.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::tasks::model::{CallLog, ExecutionLogEntry, Task, TaskStatus, TaskStore};
use crate::voice::CallResult;

/// Per-agent webhook configuration resolved via the DB Pool (§4.11 item 5; SPEC_FULL §3
/// "Webhook notification plan").
#[derive(Debug, Clone, Default)]
pub struct WebhookPlan {
    pub webhook_url: Option<String>,
    pub enable_webhook: bool,
    pub headers: HashMap<String, String>,
}

/// Strips exactly one leading `'0'` from a phone number string (§4.11 item 2, §8: "Strip a
/// single leading zero from a string phone number" — not every leading zero).
pub fn strip_leading_zero(phone: &str) -> String {
    phone.strip_prefix('0').map(str::to_string).unwrap_or_else(|| phone.to_string())
}

/// `cost + cost * 0.05`, equivalent to `cost × 1.05` (§4.11 item 2, §9 Open Questions: the
/// 5% figure is fixed, not configurable, per the source).
pub fn apply_cost_markup(raw_cost: f64) -> f64 {
    raw_cost + raw_cost * 0.05
}

/// Output of the agent-specific post-call workflow (LLM summarization, classification,
/// follow-up analysis) — every field is optional since the workflow's outputs are optional
/// (§4.11 item 1).
#[derive(Debug, Clone, Default)]
pub struct PostCallAnalysis {
    pub requires_followup: bool,
    pub classification: Option<Value>,
    pub summary: Option<Value>,
    pub structured_data: Option<Value>,
    /// The call is already being redialed by a separate flow; the post-call flow must not
    /// touch the task (grounded on `post_call.py`'s `is_redial` early return).
    pub is_redial: bool,
}

/// Executes the agent-specific post-call workflow (§4.11 item 1). A real deployment wires
/// this to the external search-service retrieval/generation flow (out of scope per §1); it
/// is a pure contract here.
#[async_trait]
pub trait PostCallAnalyzer: Send + Sync {
    async fn analyze(&self, task: &Task, call_result: &CallResult) -> Option<PostCallAnalysis>;
}

/// Resolves or creates a contact document from a phone number and name (§4.11 item 4).
#[async_trait]
pub trait ContactResolver: Send + Sync {
    /// Returns `(ref_id, collection_ref)` on success.
    async fn resolve_or_create(&self, contact_number: &str, name: &str, token: &str) -> Option<(String, String)>;
}

/// Fires the configured webhook (§4.11 item 5).
#[async_trait]
pub trait WebhookSender: Send + Sync {
    /// Returns the response status code, or `Err` on a transport failure.
    async fn send(&self, plan: &WebhookPlan, payload: &Value) -> Result<u16, String>;
}

/// `reqwest`-backed [`WebhookSender`].
pub struct ReqwestWebhookSender {
    client: reqwest::Client,
}

impl Default for ReqwestWebhookSender {
    fn default() -> Self {
        ReqwestWebhookSender { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl WebhookSender for ReqwestWebhookSender {
    async fn send(&self, plan: &WebhookPlan, payload: &Value) -> Result<u16, String> {
        let url = plan.webhook_url.as_deref().ok_or_else(|| "no webhook_url configured".to_string())?;
        let mut req = self.client.post(url).json(payload);
        for (name, value) in &plan.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let response = req.send().await.map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }
}

/// Short-lived distributed lock guarding idempotent invocation (§4.11: "Idempotency";
/// §6: `prefect:<task_id>` → string, TTL 100s).
#[async_trait]
pub trait IdempotencyLock: Send + Sync {
    /// Attempts to acquire the lock for `task_id`. Returns `true` if the caller now owns
    /// it and should proceed; `false` if another invocation already holds it within the
    /// TTL window.
    async fn try_acquire(&self, task_id: &str) -> bool;
}

const IDEMPOTENCY_LOCK_TTL: Duration = Duration::from_secs(100);

fn idempotency_key(task_id: &str) -> String {
    format!("prefect:{task_id}")
}

/// Redis-backed [`IdempotencyLock`] using `SET key value NX PX <ttl>`.
pub struct RedisIdempotencyLock {
    conn: redis::aio::ConnectionManager,
}

impl RedisIdempotencyLock {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        RedisIdempotencyLock { conn }
    }
}

#[async_trait]
impl IdempotencyLock for RedisIdempotencyLock {
    async fn try_acquire(&self, task_id: &str) -> bool {
        let mut conn = self.conn.clone();
        let result: Result<Option<String>, _> = redis::cmd("SET")
            .arg(idempotency_key(task_id))
            .arg("scheduled")
            .arg("NX")
            .arg("PX")
            .arg(IDEMPOTENCY_LOCK_TTL.as_millis() as u64)
            .query_async(&mut conn)
            .await;
        matches!(result, Ok(Some(_)))
    }
}

/// In-process [`IdempotencyLock`] for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryIdempotencyLock {
    held: Mutex<HashMap<String, Instant>>,
}

impl InMemoryIdempotencyLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyLock for InMemoryIdempotencyLock {
    async fn try_acquire(&self, task_id: &str) -> bool {
        let mut held = self.held.lock().unwrap();
        let now = Instant::now();
        if let Some(acquired_at) = held.get(task_id) {
            if now.duration_since(*acquired_at) < IDEMPOTENCY_LOCK_TTL {
                return false;
            }
        }
        held.insert(task_id.to_string(), now);
        true
    }
}

/// Per-call latency/provider rollup persisted unconditionally, ahead of the idempotency
/// gate (§3 "Latency metrics sink").
#[derive(Debug, Clone)]
pub struct LatencyRollup {
    pub metrics: Value,
    pub agent_id: Option<String>,
    pub providers: Value,
    pub thread_id: Option<String>,
    pub provider: String,
}

#[async_trait]
pub trait LatencyRollupSink: Send + Sync {
    async fn persist(&self, rollup: LatencyRollup);
}

/// No-op sink for deployments that don't care about the rollup (still invoked
/// unconditionally per the contract, just discards the record).
#[derive(Default)]
pub struct NullLatencyRollupSink;

#[async_trait]
impl LatencyRollupSink for NullLatencyRollupSink {
    async fn persist(&self, _rollup: LatencyRollup) {}
}

/// Why the flow returned without completing the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostCallOutcome {
    /// Another invocation already held the idempotency lock; no state was mutated.
    AlreadyRunning,
    /// The analyzer flagged an in-progress redial; the task is left untouched for a later
    /// retry flow to complete.
    DeferredToRedial,
    /// The task reached `completed`, with a follow-up task id if one was scheduled.
    Completed { follow_up_task_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostCallError {
    TaskNotFound,
}

impl std::fmt::Display for PostCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostCallError::TaskNotFound => write!(f, "task not found"),
        }
    }
}

impl std::error::Error for PostCallError {}

/// Builds the `{call_id, customer, contact_number, call_end_reason, recording_url,
/// transcript, start_time, end_time, duration, cost, post_call_data, metadata}` task
/// output record (§4.11 item 2).
pub fn build_task_output(call_result: &CallResult, post_call_result: Option<&PostCallAnalysis>) -> Value {
    let contact_number = call_result.contact_number.as_deref().map(strip_leading_zero);
    let cost = apply_cost_markup(call_result.data.cost);
    json!({
        "call_id": call_result.call_id,
        "customer": call_result.customer,
        "contact_number": contact_number,
        "call_end_reason": call_result.call_end_reason,
        "recording_url": call_result.recording_url,
        "transcript": call_result.transcript,
        "start_time": call_result.call_start,
        "end_time": call_result.call_end,
        "duration": call_result.duration_ms,
        "cost": cost,
        "post_call_data": post_call_result.map(|p| json!({
            "requires_followup": p.requires_followup,
            "classification": p.classification,
            "summary": p.summary,
            "structured_data": p.structured_data,
        })),
        "metadata": {
            "cost": cost,
            "type": call_result.data.kind,
        },
    })
}

/// Orchestrates §4.11's terminal portion of a call. Constructed once per process with the
/// store and the collaborator contracts it needs; [`PostCallFlow::run`] is the sole entry
/// point, called once per finished call.
pub struct PostCallFlow {
    pub store: std::sync::Arc<dyn TaskStore>,
    pub lock: std::sync::Arc<dyn IdempotencyLock>,
    pub webhook_sender: std::sync::Arc<dyn WebhookSender>,
    pub latency_sink: std::sync::Arc<dyn LatencyRollupSink>,
    pub contact_resolver: std::sync::Arc<dyn ContactResolver>,
    pub analyzer: std::sync::Arc<dyn PostCallAnalyzer>,
    pub max_webhook_attempts: u32,
    pub max_follow_up_calls: u32,
    pub follow_up_delay: chrono::Duration,
}

impl PostCallFlow {
    pub async fn run(
        &self,
        task_id: &str,
        call_result: &CallResult,
        webhook_plan: &WebhookPlan,
        latency_rollup: LatencyRollup,
        contact_token: &str,
    ) -> Result<PostCallOutcome, PostCallError> {
        // Unconditional, not gated by idempotency (SPEC_FULL §4.11 refinement).
        self.latency_sink.persist(latency_rollup).await;

        if !self.lock.try_acquire(task_id).await {
            return Ok(PostCallOutcome::AlreadyRunning);
        }

        let task = self.store.get_task(task_id).await.ok_or(PostCallError::TaskNotFound)?;
        let analysis = self.analyzer.analyze(&task, call_result).await;

        if analysis.as_ref().map(|a| a.is_redial).unwrap_or(false) {
            return Ok(PostCallOutcome::DeferredToRedial);
        }

        let task_output = build_task_output(call_result, analysis.as_ref());

        self.store
            .save_call_log(CallLog {
                task_id: task_id.to_string(),
                transcript: call_result.data.transcript.clone(),
                recording_url: call_result.recording_url.clone(),
                duration_ms: call_result.duration_ms,
                cost: apply_cost_markup(call_result.data.cost),
                classification: analysis.as_ref().and_then(|a| a.classification.clone()),
                summary: analysis.as_ref().and_then(|a| a.summary.clone()),
                metadata: task_output.clone(),
                created: Utc::now(),
            })
            .await;

        let mut resolved_name = task_output
            .get("customer")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        if task.ref_id.is_none() {
            if let Some(number) = call_result.contact_number.as_deref() {
                let number = strip_leading_zero(number);
                let name = resolved_name.clone().unwrap_or_default();
                if let Some((ref_id, collection_ref)) =
                    self.contact_resolver.resolve_or_create(&number, &name, contact_token).await
                {
                    self.store.update_task_ref(task_id, ref_id, collection_ref).await;
                    resolved_name = Some(name);
                }
            }
        }

        let mut final_output = task_output;
        if let Some(name) = resolved_name {
            if let Value::Object(ref mut map) = final_output {
                map.insert("customer".to_string(), Value::String(name));
            }
        }

        let _ = self.store.update_task(task_id, TaskStatus::Completed, Some(final_output)).await;
        self.store.update_run_status(&task.run_id, TaskStatus::Completed).await;

        self.dispatch_webhook(&task, webhook_plan).await;

        let follow_up_task_id = self.maybe_schedule_follow_up(&task, analysis.as_ref()).await;

        Ok(PostCallOutcome::Completed { follow_up_task_id })
    }

    /// Fires the configured webhook with at most [`Self::max_webhook_attempts`] attempts on
    /// transport failure or a non-2xx response, logging every attempt (§4.11 item 5).
    async fn dispatch_webhook(&self, task: &Task, plan: &WebhookPlan) {
        if !plan.enable_webhook || plan.webhook_url.is_none() {
            return;
        }
        let payload = json!({"task_id": task.task_id, "run_id": task.run_id, "status": "completed"});

        for attempt in 1..=self.max_webhook_attempts {
            let (status, outcome) = match self.webhook_sender.send(plan, &payload).await {
                Ok(code) if (200..300).contains(&code) => (Some(code), "success"),
                Ok(code) => (Some(code), "non_2xx"),
                Err(_) => (None, "transport_error"),
            };
            self.store
                .append_execution_log(ExecutionLogEntry {
                    task_id: task.task_id.clone(),
                    run_id: task.run_id.clone(),
                    step: format!("webhook attempt {attempt}"),
                    status: outcome.to_string(),
                    input: Some(payload.clone()),
                    output: status.map(|c| json!({"status_code": c})),
                    timestamp: Utc::now(),
                })
                .await;
            if outcome == "success" {
                break;
            }
        }
    }

    /// Schedules a follow-up only if the analyzer flagged one is required **and**
    /// `prior_follow_up_count + 1 < max_calls` (§4.11 item 6, §8 testable property).
    async fn maybe_schedule_follow_up(&self, task: &Task, analysis: Option<&PostCallAnalysis>) -> Option<String> {
        let requires_followup = analysis.map(|a| a.requires_followup).unwrap_or(false);
        if !requires_followup {
            return None;
        }
        if task.follow_up_count + 1 >= self.max_follow_up_calls {
            return None;
        }

        let follow_up = Task {
            task_id: format!("T{}", uuid::Uuid::new_v4().simple()),
            run_id: task.run_id.clone(),
            space_id: task.space_id.clone(),
            user: task.user.clone(),
            thread_id: task.thread_id.clone(),
            assignee: task.assignee.clone(),
            collection_ref: task.collection_ref.clone(),
            ref_id: task.ref_id.clone(),
            input: task.input.clone(),
            output: None,
            status: TaskStatus::Scheduled,
            scheduled_timestamp: Some(Utc::now() + self.follow_up_delay),
            follow_up_count: task.follow_up_count + 1,
            execution_type: task.execution_type.clone(),
            created: Utc::now(),
            modified: Utc::now(),
        };
        let follow_up_task_id = follow_up.task_id.clone();
        self.store.add_task(follow_up).await;
        Some(follow_up_task_id)
    }

    /// Computes the rejection reason string for the §8 scenario
    /// ("reason contains `max_calls=4`") when a follow-up is declined.
    pub fn follow_up_rejection_reason(&self, prior_follow_up_count: u32) -> String {
        format!(
            "follow-up not scheduled: prior_follow_up_count={prior_follow_up_count}, max_calls={}",
            self.max_follow_up_calls
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::InMemoryTaskStore;
    use crate::voice::{CallResultData, CallState, EndReason};

    fn sample_call_result() -> CallResult {
        CallResult {
            status: "success",
            call_status: CallState::Done,
            call_id: "call-1".to_string(),
            customer: Some("Alex".to_string()),
            contact_number: Some("09876543210".to_string()),
            transcript: vec![],
            duration_ms: 45_000,
            recording_url: Some("https://example.com/rec.wav".to_string()),
            call_start: Some(Utc::now()),
            call_end: Some(Utc::now()),
            call_end_reason: Some(EndReason::CallerHangUp),
            assistant_number: None,
            data: CallResultData {
                kind: "voice_call",
                transcript: "Caller: hi\nAssistant: hello".to_string(),
                cost: 10.0,
                quality_metrics: None,
                conversation_userdata: None,
            },
        }
    }

    fn sample_task(follow_up_count: u32) -> Task {
        Task {
            task_id: "t1".to_string(),
            run_id: "run-1".to_string(),
            space_id: "space-1".to_string(),
            user: "user-1".to_string(),
            thread_id: None,
            assignee: "agent-1".to_string(),
            collection_ref: None,
            ref_id: Some("ref-1".to_string()),
            input: json!({}),
            output: None,
            status: TaskStatus::InProgress,
            scheduled_timestamp: None,
            follow_up_count,
            execution_type: None,
            created: Utc::now(),
            modified: Utc::now(),
        }
    }

    #[test]
    fn strip_leading_zero_removes_exactly_one() {
        assert_eq!(strip_leading_zero("09876543210"), "9876543210");
        assert_eq!(strip_leading_zero("009876543210"), "09876543210");
        assert_eq!(strip_leading_zero("9876543210"), "9876543210");
    }

    #[test]
    fn cost_markup_applies_five_percent() {
        assert_eq!(apply_cost_markup(100.0), 105.0);
    }

    #[test]
    fn build_task_output_strips_phone_and_applies_markup() {
        let result = sample_call_result();
        let output = build_task_output(&result, None);
        assert_eq!(output["contact_number"], json!("9876543210"));
        assert_eq!(output["cost"], json!(10.5));
        assert_eq!(output["call_id"], json!("call-1"));
    }

    #[tokio::test]
    async fn idempotent_invocation_does_not_mutate_state_twice() {
        let lock = InMemoryIdempotencyLock::new();
        assert!(lock.try_acquire("t1").await);
        assert!(!lock.try_acquire("t1").await);
    }

    struct NoFollowUpAnalyzer;
    #[async_trait]
    impl PostCallAnalyzer for NoFollowUpAnalyzer {
        async fn analyze(&self, _task: &Task, _call_result: &CallResult) -> Option<PostCallAnalysis> {
            Some(PostCallAnalysis { requires_followup: true, ..Default::default() })
        }
    }

    struct NullContactResolver;
    #[async_trait]
    impl ContactResolver for NullContactResolver {
        async fn resolve_or_create(&self, _number: &str, _name: &str, _token: &str) -> Option<(String, String)> {
            None
        }
    }

    struct AlwaysOkWebhook;
    #[async_trait]
    impl WebhookSender for AlwaysOkWebhook {
        async fn send(&self, _plan: &WebhookPlan, _payload: &Value) -> Result<u16, String> {
            Ok(200)
        }
    }

    fn flow(store: std::sync::Arc<dyn TaskStore>, max_follow_up_calls: u32) -> PostCallFlow {
        PostCallFlow {
            store,
            lock: std::sync::Arc::new(InMemoryIdempotencyLock::new()),
            webhook_sender: std::sync::Arc::new(AlwaysOkWebhook),
            latency_sink: std::sync::Arc::new(NullLatencyRollupSink),
            contact_resolver: std::sync::Arc::new(NullContactResolver),
            analyzer: std::sync::Arc::new(NoFollowUpAnalyzer),
            max_webhook_attempts: 3,
            max_follow_up_calls,
            follow_up_delay: chrono::Duration::hours(24),
        }
    }

    #[tokio::test]
    async fn follow_up_is_scheduled_when_flagged_and_under_the_cap() {
        let store: std::sync::Arc<dyn TaskStore> = std::sync::Arc::new(InMemoryTaskStore::new());
        store.add_task(sample_task(0)).await;
        let flow = flow(store.clone(), 4);
        let outcome = flow
            .run(
                "t1",
                &sample_call_result(),
                &WebhookPlan::default(),
                LatencyRollup {
                    metrics: json!({}),
                    agent_id: None,
                    providers: json!({}),
                    thread_id: None,
                    provider: "livekit".to_string(),
                },
                "token-1",
            )
            .await
            .unwrap();
        match outcome {
            PostCallOutcome::Completed { follow_up_task_id } => assert!(follow_up_task_id.is_some()),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn follow_up_gate_blocks_at_the_max_calls_boundary() {
        // prior follow-up count = 3, max_calls = 4: 3 + 1 is NOT < 4, so no follow-up (§8 scenario 6).
        let store: std::sync::Arc<dyn TaskStore> = std::sync::Arc::new(InMemoryTaskStore::new());
        store.add_task(sample_task(3)).await;
        let flow = flow(store.clone(), 4);
        let outcome = flow
            .run(
                "t1",
                &sample_call_result(),
                &WebhookPlan::default(),
                LatencyRollup {
                    metrics: json!({}),
                    agent_id: None,
                    providers: json!({}),
                    thread_id: None,
                    provider: "livekit".to_string(),
                },
                "token-1",
            )
            .await
            .unwrap();
        match outcome {
            PostCallOutcome::Completed { follow_up_task_id } => assert!(follow_up_task_id.is_none()),
            other => panic!("expected Completed, got {other:?}"),
        }
        let reason = flow.follow_up_rejection_reason(3);
        assert!(reason.contains("max_calls=4"));
    }

    #[tokio::test]
    async fn second_concurrent_invocation_returns_without_mutating() {
        let store: std::sync::Arc<dyn TaskStore> = std::sync::Arc::new(InMemoryTaskStore::new());
        store.add_task(sample_task(0)).await;
        let flow = flow(store.clone(), 4);
        let rollup = || LatencyRollup {
            metrics: json!({}),
            agent_id: None,
            providers: json!({}),
            thread_id: None,
            provider: "livekit".to_string(),
        };
        let first = flow
            .run("t1", &sample_call_result(), &WebhookPlan::default(), rollup(), "token-1")
            .await
            .unwrap();
        assert!(matches!(first, PostCallOutcome::Completed { .. }));

        let second = flow
            .run("t1", &sample_call_result(), &WebhookPlan::default(), rollup(), "token-1")
            .await
            .unwrap();
        assert_eq!(second, PostCallOutcome::AlreadyRunning);
    }
}

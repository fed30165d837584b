//! Task Consumer Pool: priority-tiered worker claiming with cross-process worker counters
//! (§4.10).
//!
//! Grounded on `examples/original_source/apps/super/super_services/voice/consumers/
//! monitor_consumers.py`, which reads back exactly the state this module writes:
//! `<tier>_<provider>_call_workers` counters and a `metrics:task_latency:<tier>` bounded
//! latency list, with `normal_max = total * 0.7` and `bulk_max = total * 0.4` (both floored,
//! at least 1). Counters live behind [`WorkerCounters`] so the pool is agnostic to Redis vs.
//! an in-memory stand-in for tests; the reconciler that returns stuck claims to `pending`
//! uses the execution log rather than the counters themselves, since counters are explicitly
//! advisory (§4.10: "Crash safety").

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;

use crate::tasks::model::{ExecutionLogEntry, TaskStatus, TaskStore, TaskUpdateError};

/// A priority class governing worker share (§3 GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Normal,
    Bulk,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Normal => "normal",
            Tier::Bulk => "bulk",
        }
    }

    fn max_fraction(self) -> f64 {
        match self {
            Tier::Normal => 0.7,
            Tier::Bulk => 0.4,
        }
    }
}

/// Tier worker maxima derived from the configured total budget (§4.10: "Tier maxima default
/// to 70% and 40% of the total respectively; the sum may exceed 100%").
#[derive(Debug, Clone, Copy)]
pub struct TierCaps {
    total: u32,
}

impl TierCaps {
    pub fn from_total(total_workers: u32) -> Self {
        TierCaps { total: total_workers }
    }

    pub fn max_for(&self, tier: Tier) -> u32 {
        ((self.total as f64 * tier.max_fraction()).floor() as u32).max(1)
    }

    /// Per-provider cap within a tier: half the tier cap (§4.10 item 2).
    pub fn per_provider_cap(&self, tier: Tier) -> u32 {
        (self.max_for(tier) / 2).max(1)
    }
}

fn provider_key(tier: Tier, provider: &str) -> String {
    format!("{}_{}_call_workers", tier.as_str(), provider)
}

fn tier_total_key(tier: Tier) -> String {
    format!("{}_total_call_workers", tier.as_str())
}

/// Cross-process worker counters keyed `<tier>_<provider>_call_workers` (§3, §6). Mutated
/// only by this pool's claim/release paths (§5).
#[async_trait]
pub trait WorkerCounters: Send + Sync {
    async fn increment(&self, key: &str) -> i64;
    async fn decrement(&self, key: &str) -> i64;
    async fn get(&self, key: &str) -> i64;
}

/// Redis-backed [`WorkerCounters`] using simple `INCR`/`DECR`/`GET`.
pub struct RedisWorkerCounters {
    conn: redis::aio::ConnectionManager,
}

impl RedisWorkerCounters {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        RedisWorkerCounters { conn }
    }
}

#[async_trait]
impl WorkerCounters for RedisWorkerCounters {
    async fn increment(&self, key: &str) -> i64 {
        let mut conn = self.conn.clone();
        conn.incr(key, 1).await.unwrap_or(0)
    }

    async fn decrement(&self, key: &str) -> i64 {
        let mut conn = self.conn.clone();
        let next: i64 = conn.decr(key, 1).await.unwrap_or(0);
        if next < 0 {
            let _: Result<(), _> = conn.set(key, 0).await;
            return 0;
        }
        next
    }

    async fn get(&self, key: &str) -> i64 {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<i64>>(key).await.ok().flatten().unwrap_or(0)
    }
}

/// In-process [`WorkerCounters`] for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryWorkerCounters {
    counts: Mutex<HashMap<String, i64>>,
}

impl InMemoryWorkerCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerCounters for InMemoryWorkerCounters {
    async fn increment(&self, key: &str) -> i64 {
        let mut counts = self.counts.lock().unwrap();
        let entry = counts.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    async fn decrement(&self, key: &str) -> i64 {
        let mut counts = self.counts.lock().unwrap();
        let entry = counts.entry(key.to_string()).or_insert(0);
        *entry = (*entry - 1).max(0);
        *entry
    }

    async fn get(&self, key: &str) -> i64 {
        *self.counts.lock().unwrap().get(key).unwrap_or(&0)
    }
}

const LATENCY_SAMPLE_CAP: usize = 500;

/// Bounded rolling latency samples per tier, used for p95/avg reporting (§4.10 item 3, §6
/// `metrics:task_latency:<tier>`).
#[async_trait]
pub trait LatencyStore: Send + Sync {
    async fn record(&self, tier: Tier, latency_ms: u64);
    async fn average_ms(&self, tier: Tier) -> f64;
    async fn p95_ms(&self, tier: Tier) -> f64;
}

/// Redis-list-backed [`LatencyStore`]: `LPUSH` + `LTRIM` keeps the list bounded to
/// [`LATENCY_SAMPLE_CAP`] most recent samples.
pub struct RedisLatencyStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisLatencyStore {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        RedisLatencyStore { conn }
    }

    fn key(tier: Tier) -> String {
        format!("metrics:task_latency:{}", tier.as_str())
    }

    async fn samples(&self, tier: Tier) -> Vec<u64> {
        let mut conn = self.conn.clone();
        conn.lrange::<_, Vec<i64>>(Self::key(tier), 0, -1)
            .await
            .map(|v| v.into_iter().map(|n| n.max(0) as u64).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LatencyStore for RedisLatencyStore {
    async fn record(&self, tier: Tier, latency_ms: u64) {
        let mut conn = self.conn.clone();
        let key = Self::key(tier);
        let _: Result<(), _> = conn.lpush(&key, latency_ms as i64).await;
        let _: Result<(), _> = conn.ltrim(&key, 0, LATENCY_SAMPLE_CAP as isize - 1).await;
    }

    async fn average_ms(&self, tier: Tier) -> f64 {
        average(&self.samples(tier).await)
    }

    async fn p95_ms(&self, tier: Tier) -> f64 {
        p95(&mut self.samples(tier).await)
    }
}

/// In-process [`LatencyStore`] for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryLatencyStore {
    samples: Mutex<HashMap<&'static str, VecDeque<u64>>>,
}

impl InMemoryLatencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LatencyStore for InMemoryLatencyStore {
    async fn record(&self, tier: Tier, latency_ms: u64) {
        let mut samples = self.samples.lock().unwrap();
        let list = samples.entry(tier.as_str()).or_default();
        list.push_front(latency_ms);
        list.truncate(LATENCY_SAMPLE_CAP);
    }

    async fn average_ms(&self, tier: Tier) -> f64 {
        let samples = self.samples.lock().unwrap();
        average(samples.get(tier.as_str()).map(|v| v.iter().copied().collect::<Vec<_>>()).unwrap_or_default().as_slice())
    }

    async fn p95_ms(&self, tier: Tier) -> f64 {
        let samples = self.samples.lock().unwrap();
        let mut values: Vec<u64> = samples.get(tier.as_str()).cloned().unwrap_or_default().into();
        p95(&mut values)
    }
}

fn average(samples: &[u64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<u64>() as f64 / samples.len() as f64
}

fn p95(samples: &mut [u64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.sort_unstable();
    let idx = ((samples.len() as f64) * 0.95).ceil() as usize;
    let idx = idx.saturating_sub(1).min(samples.len() - 1);
    samples[idx] as f64
}

/// A task claimed off the queue for dispatch, carrying just enough to account for it in the
/// worker counters.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task_id: String,
    pub run_id: String,
    pub tier: Tier,
    pub provider: String,
    pub scheduled_timestamp: Option<DateTime<Utc>>,
}

/// The priority queue backing a tier. A production deployment implements this over Kafka;
/// tests use an in-memory `VecDeque`.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Claims the next eligible task of `tier` — one with no `scheduled_timestamp`, or one
    /// whose `scheduled_timestamp` has already passed (§4.10: "Scheduled tasks").
    async fn claim_next(&self, tier: Tier) -> Option<ClaimedTask>;
    /// Returns a claimed-but-not-dispatched task to the queue, to be reattempted after
    /// `delay` (§4.10 item 2: provider-at-capacity backoff).
    async fn requeue_with_delay(&self, task: ClaimedTask, delay: Duration);
}

/// Outcome of one [`ConsumerPool::poll`] call, useful for tests and operator logging.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    TierAtCapacity,
    QueueEmpty,
    ProviderAtCapacity,
    Dispatched(String),
}

const PROVIDER_BACKOFF_DELAY: Duration = Duration::from_millis(250);

/// Priority-aware consumer pool spanning the `normal` and `bulk` tiers (§4.10). This is the
/// one component in the core that spans processes (§5): counters and latency samples are
/// authoritative across every process polling the same queue.
pub struct ConsumerPool {
    caps: TierCaps,
    counters: std::sync::Arc<dyn WorkerCounters>,
    latency: std::sync::Arc<dyn LatencyStore>,
}

impl ConsumerPool {
    pub fn new(
        caps: TierCaps,
        counters: std::sync::Arc<dyn WorkerCounters>,
        latency: std::sync::Arc<dyn LatencyStore>,
    ) -> Self {
        ConsumerPool { caps, counters, latency }
    }

    /// One iteration of the selection algorithm in §4.10:
    /// 1. Skip the tier if it's at its maximum.
    /// 2. Claim the next task; if its provider+tier counter is above the per-provider cap,
    ///    return it to the queue with a short delay.
    /// 3. Otherwise increment counters and dispatch.
    pub async fn poll(&self, tier: Tier, queue: &dyn TaskQueue) -> PollOutcome {
        let tier_total = self.counters.get(&tier_total_key(tier)).await;
        if tier_total >= self.caps.max_for(tier) as i64 {
            return PollOutcome::TierAtCapacity;
        }

        let claimed = match queue.claim_next(tier).await {
            Some(task) => task,
            None => return PollOutcome::QueueEmpty,
        };

        let provider_key = provider_key(tier, &claimed.provider);
        let provider_count = self.counters.get(&provider_key).await;
        if provider_count >= self.caps.per_provider_cap(tier) as i64 {
            let task_id = claimed.task_id.clone();
            queue.requeue_with_delay(claimed, PROVIDER_BACKOFF_DELAY).await;
            let _ = task_id;
            return PollOutcome::ProviderAtCapacity;
        }

        self.counters.increment(&provider_key).await;
        self.counters.increment(&tier_total_key(tier)).await;
        PollOutcome::Dispatched(claimed.task_id)
    }

    /// Decrements the worker counters and records end-to-end latency on completion or
    /// abort of a dispatched task (§4.10 item 3).
    pub async fn release(&self, tier: Tier, provider: &str, end_to_end_ms: u64) {
        self.counters.decrement(&provider_key(tier, provider)).await;
        self.counters.decrement(&tier_total_key(tier)).await;
        self.latency.record(tier, end_to_end_ms).await;
    }

    pub async fn average_latency_ms(&self, tier: Tier) -> f64 {
        self.latency.average_ms(tier).await
    }

    pub async fn p95_latency_ms(&self, tier: Tier) -> f64 {
        self.latency.p95_ms(tier).await
    }
}

/// Rejects a manual schedule set in the past (§4.10: "manual schedules in the past are
/// rejected at creation"; §6: `POST /tasks/create_run/` "400 on a past scheduled time").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PastScheduleError;

impl std::fmt::Display for PastScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scheduled time must be in the future.")
    }
}

impl std::error::Error for PastScheduleError {}

pub fn validate_schedule(scheduled: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), PastScheduleError> {
    if scheduled <= now {
        Err(PastScheduleError)
    } else {
        Ok(())
    }
}

/// Returns tasks claimed-but-never-completed beyond a bounded window to `pending` (§4.10:
/// "Crash safety" — counters are advisory, so the reconciler relies on the execution log,
/// not the counters, to detect abandoned claims). The default period is not specified by
/// the source; §9's Open Questions note this and DESIGN.md records 60s as the chosen
/// default, surfaced as configuration rather than hardcoded.
pub struct Reconciler {
    stuck_window: Duration,
}

impl Reconciler {
    pub fn new(stuck_window: Duration) -> Self {
        Reconciler { stuck_window }
    }

    /// Scans every `in_progress` task; one is considered abandoned if its most recent
    /// execution-log entry is older than `stuck_window`. Abandoned tasks are returned to
    /// `pending` via `store.update_task`, which is the sole mutation path (§4.9).
    pub async fn reconcile(&self, store: &dyn TaskStore, scope: &crate::tasks::model::QueryScope) -> Vec<String> {
        let now = Utc::now();
        let mut recovered = Vec::new();
        let in_progress = store
            .get_tasks(
                scope,
                &crate::tasks::model::TaskFilter {
                    status: Some(vec![TaskStatus::InProgress]),
                    ..Default::default()
                },
                crate::tasks::model::Page { page: 1, page_size: usize::MAX },
            )
            .await;

        for task in in_progress.items {
            let log = store.execution_log_for_task(&task.task_id).await;
            let last_seen = log.iter().map(|e| e.timestamp).max().unwrap_or(task.modified);
            let age = now.signed_duration_since(last_seen);
            if age.to_std().unwrap_or(Duration::ZERO) > self.stuck_window {
                match store.update_task(&task.task_id, TaskStatus::Failed, None).await {
                    Ok(_) => {}
                    Err(TaskUpdateError::IllegalTransition(_)) | Err(TaskUpdateError::NotFound) => continue,
                }
                if store.update_task(&task.task_id, TaskStatus::Pending, None).await.is_ok() {
                    store
                        .append_execution_log(ExecutionLogEntry {
                            task_id: task.task_id.clone(),
                            run_id: task.run_id.clone(),
                            step: "reconciler: returned stuck claim to pending".to_string(),
                            status: "recovered".to_string(),
                            input: None,
                            output: None,
                            timestamp: now,
                        })
                        .await;
                    recovered.push(task.task_id);
                }
            }
        }
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    #[test]
    fn tier_caps_default_to_70_and_40_percent() {
        let caps = TierCaps::from_total(10);
        assert_eq!(caps.max_for(Tier::Normal), 7);
        assert_eq!(caps.max_for(Tier::Bulk), 4);
    }

    #[test]
    fn tier_caps_floor_to_at_least_one() {
        let caps = TierCaps::from_total(1);
        assert_eq!(caps.max_for(Tier::Normal), 1);
        assert_eq!(caps.max_for(Tier::Bulk), 1);
    }

    #[test]
    fn per_provider_cap_is_half_the_tier_cap() {
        let caps = TierCaps::from_total(10);
        assert_eq!(caps.per_provider_cap(Tier::Normal), 3);
    }

    #[tokio::test]
    async fn in_memory_counters_never_go_negative() {
        let counters = InMemoryWorkerCounters::new();
        assert_eq!(counters.decrement("k").await, 0);
        counters.increment("k").await;
        assert_eq!(counters.decrement("k").await, 0);
    }

    #[tokio::test]
    async fn p95_and_average_over_in_memory_samples() {
        let store = InMemoryLatencyStore::new();
        for ms in [100, 200, 300, 400, 500] {
            store.record(Tier::Normal, ms).await;
        }
        assert_eq!(store.average_ms(Tier::Normal).await, 300.0);
        assert_eq!(store.p95_ms(Tier::Normal).await, 500.0);
    }

    struct FifoQueue {
        tasks: AsyncMutex<VecDeque<ClaimedTask>>,
    }

    #[async_trait]
    impl TaskQueue for FifoQueue {
        async fn claim_next(&self, tier: Tier) -> Option<ClaimedTask> {
            let mut tasks = self.tasks.lock().await;
            let idx = tasks.iter().position(|t| t.tier == tier)?;
            tasks.remove(idx)
        }

        async fn requeue_with_delay(&self, task: ClaimedTask, _delay: Duration) {
            self.tasks.lock().await.push_back(task);
        }
    }

    fn claim(task_id: &str, tier: Tier, provider: &str) -> ClaimedTask {
        ClaimedTask {
            task_id: task_id.to_string(),
            run_id: "run-1".to_string(),
            tier,
            provider: provider.to_string(),
            scheduled_timestamp: None,
        }
    }

    #[tokio::test]
    async fn poll_dispatches_and_increments_counters() {
        let caps = TierCaps::from_total(10);
        let counters: Arc<dyn WorkerCounters> = Arc::new(InMemoryWorkerCounters::new());
        let latency: Arc<dyn LatencyStore> = Arc::new(InMemoryLatencyStore::new());
        let pool = ConsumerPool::new(caps, counters.clone(), latency);
        let queue = FifoQueue { tasks: AsyncMutex::new(VecDeque::from([claim("t1", Tier::Normal, "livekit")])) };

        let outcome = pool.poll(Tier::Normal, &queue).await;
        assert_eq!(outcome, PollOutcome::Dispatched("t1".to_string()));
        assert_eq!(counters.get("normal_livekit_call_workers").await, 1);
        assert_eq!(counters.get("normal_total_call_workers").await, 1);
    }

    #[tokio::test]
    async fn poll_skips_tier_at_capacity() {
        let caps = TierCaps::from_total(1); // normal max = 1
        let counters: Arc<dyn WorkerCounters> = Arc::new(InMemoryWorkerCounters::new());
        counters.increment("normal_total_call_workers").await;
        let latency: Arc<dyn LatencyStore> = Arc::new(InMemoryLatencyStore::new());
        let pool = ConsumerPool::new(caps, counters, latency);
        let queue = FifoQueue { tasks: AsyncMutex::new(VecDeque::from([claim("t1", Tier::Normal, "livekit")])) };

        let outcome = pool.poll(Tier::Normal, &queue).await;
        assert_eq!(outcome, PollOutcome::TierAtCapacity);
    }

    #[tokio::test]
    async fn poll_requeues_when_provider_at_capacity() {
        let caps = TierCaps::from_total(10); // normal per-provider cap = 3
        let counters: Arc<dyn WorkerCounters> = Arc::new(InMemoryWorkerCounters::new());
        for _ in 0..3 {
            counters.increment("normal_livekit_call_workers").await;
        }
        let latency: Arc<dyn LatencyStore> = Arc::new(InMemoryLatencyStore::new());
        let pool = ConsumerPool::new(caps, counters, latency);
        let queue = FifoQueue { tasks: AsyncMutex::new(VecDeque::from([claim("t1", Tier::Normal, "livekit")])) };

        let outcome = pool.poll(Tier::Normal, &queue).await;
        assert_eq!(outcome, PollOutcome::ProviderAtCapacity);
        assert_eq!(queue.tasks.lock().await.len(), 1);
    }

    #[test]
    fn validate_schedule_rejects_the_past() {
        let now = Utc::now();
        assert!(validate_schedule(now - chrono::Duration::hours(1), now).is_err());
        assert!(validate_schedule(now + chrono::Duration::hours(1), now).is_ok());
    }

    #[tokio::test]
    async fn reconciler_returns_stuck_claims_to_pending() {
        use crate::tasks::model::{InMemoryTaskStore, Page, Task, QueryScope, TaskFilter};
        let store = InMemoryTaskStore::new();
        let old_ts = Utc::now() - chrono::Duration::minutes(5);
        store
            .add_task(Task {
                task_id: "t1".to_string(),
                run_id: "run-1".to_string(),
                space_id: "space-1".to_string(),
                user: "user-1".to_string(),
                thread_id: None,
                assignee: "agent-1".to_string(),
                collection_ref: None,
                ref_id: None,
                input: serde_json::json!({}),
                output: None,
                status: TaskStatus::InProgress,
                scheduled_timestamp: None,
                follow_up_count: 0,
                execution_type: None,
                created: old_ts,
                modified: old_ts,
            })
            .await;
        store
            .append_execution_log(ExecutionLogEntry {
                task_id: "t1".to_string(),
                run_id: "run-1".to_string(),
                step: "claimed".to_string(),
                status: "in_progress".to_string(),
                input: None,
                output: None,
                timestamp: old_ts,
            })
            .await;

        let reconciler = Reconciler::new(Duration::from_secs(60));
        let scope = QueryScope { space_id: "space-1".to_string(), user_id: None, thread_id: None };
        let recovered = reconciler.reconcile(&store, &scope).await;
        assert_eq!(recovered, vec!["t1".to_string()]);

        let task = store.get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        let _ = Page::default();
        let _ = TaskFilter::default();
    }
}

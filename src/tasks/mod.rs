//! Task dispatch core: the run/task model, the priority-tiered consumer pool, and the
//! idempotent post-call flow (§3, §4.9, §4.10, §4.11).
//!
//! [`model`] owns the entity definitions, the state-transition graph, and the scoped,
//! paginated query surface exposed over HTTP (§6). [`consumer`] claims tasks off a
//! per-tier queue under cross-process worker counters (the one component in the core that
//! spans processes — §5). [`post_call`] is the idempotent terminal orchestration that a
//! finished [`crate::voice::CallResult`] feeds into.

pub mod consumer;
pub mod http;
pub mod model;
pub mod post_call;

pub use consumer::{ConsumerPool, Tier, TierCaps};
pub use http::TaskHttpState;
pub use model::{Run, Task, TaskStatus, TaskStore};
pub use post_call::{PostCallFlow, PostCallOutcome};

//! unpod-core: messaging fan-out, voice agent session runtime, and task dispatch.
//!
//! Three tightly coupled subsystems live in this crate:
//!
//! - [`messaging`] — the WebSocket thread server: auth gate, thread access check, and
//!   Redis-backed event fan-out via [`broadcaster`].
//! - [`voice`] — the per-call session runtime: config resolution, prompt composition,
//!   STT/LLM/TTS pipeline wiring, utterance hygiene, and per-turn metrics.
//! - [`tasks`] — the run/task model, the priority-aware consumer pool, and the
//!   idempotent post-call flow.
//!
//! Supporting modules ([`auth`], [`identity`], [`db`], [`config_resolver`], [`prompt`],
//! [`knowledge`]) are the leaf dependencies those three subsystems share, matching the
//! dependency order in the system overview. [`router`] assembles the messaging and task
//! surfaces into the single `axum::Router` a deployment actually serves.

pub mod auth;
pub mod broadcaster;
pub mod client_wrapper;
pub mod clients;
pub mod config_resolver;
pub mod db;
pub mod error;
pub mod event;
pub mod http_client_pool;
pub mod identity;
pub mod knowledge;
pub mod llm_session;
pub mod messaging;
pub mod prompt;
pub mod router;
pub mod settings;
pub mod tasks;
pub mod tool_protocol;
pub mod voice;

pub use client_wrapper::{ClientWrapper, Message, Role};
pub use llm_session::LLMSession;
pub use router::build_router;
pub use settings::Settings;

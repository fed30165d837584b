//! Voice Session Runtime: the per-call state machine tying config resolution, prompt
//! composition, and the STT/LLM/TTS pipeline together (§4.8).
//!
//! A [`CallSession`] walks a fixed state graph —
//! `init → resolving → composing → pipelining → active ⇄ waiting_for_input → closing →
//! done/failed` — and exposes the five operations the Design Notes call out:
//! [`CallSession::start`], [`CallSession::handle_audio`], [`CallSession::handle_text`],
//! [`CallSession::handle_interrupt`], and [`CallSession::end`]. Utterance hygiene
//! ([`hygiene`]), per-turn metrics ([`metrics`]), provider adapters ([`adapters`]), and the
//! in-call tool bindings ([`tools`]) are split into their own submodules.

pub mod adapters;
pub mod hygiene;
pub mod metrics;
pub mod tools;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::config_resolver::AgentConfig;
use crate::error::TransitionError;
use adapters::{Speech, TextToSpeechSession, Transcript};
use metrics::{CallMetrics, PerfLog};

/// A call's position in the fixed state graph (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Init,
    Resolving,
    Composing,
    Pipelining,
    Active,
    WaitingForInput,
    Closing,
    Done,
    Failed,
}

impl CallState {
    fn allows(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Init, Resolving)
                | (Resolving, Composing)
                | (Resolving, Failed)
                | (Composing, Pipelining)
                | (Composing, Failed)
                | (Pipelining, Active)
                | (Pipelining, Failed)
                | (Active, WaitingForInput)
                | (WaitingForInput, Active)
                | (Active, Closing)
                | (WaitingForInput, Closing)
                | (Active, Failed)
                | (WaitingForInput, Failed)
                | (Closing, Done)
                | (Closing, Failed)
        )
    }

    fn label(self) -> &'static str {
        match self {
            CallState::Init => "init",
            CallState::Resolving => "resolving",
            CallState::Composing => "composing",
            CallState::Pipelining => "pipelining",
            CallState::Active => "active",
            CallState::WaitingForInput => "waiting_for_input",
            CallState::Closing => "closing",
            CallState::Done => "done",
            CallState::Failed => "failed",
        }
    }
}

/// Why a call ended. Cancellation (a hang-up, an explicit `end_call`, or an interrupt
/// timeout) is distinct from failure: both close the call, but only `Error` drives the
/// session to `CallState::Failed` (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    CallerHangUp,
    AgentEndedCall,
    Transferred,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Caller,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp_ms: u64,
}

/// Raised by a [`CallSession`] operation called from the wrong state, or after the session's
/// single per-turn retry has already been spent (§4.8).
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    InvalidTransition(TransitionError),
    ProviderFailed { provider: &'static str, reason: String },
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::InvalidTransition(e) => write!(f, "{e}"),
            CallError::ProviderFailed { provider, reason } => write!(f, "{provider} failed: {reason}"),
        }
    }
}

impl std::error::Error for CallError {}

impl CallError {
    pub fn code(&self) -> &'static str {
        match self {
            CallError::InvalidTransition(_) => "invalid_transition",
            CallError::ProviderFailed { .. } => "provider_failed",
        }
    }
}

/// The `{status, call_status, ...}` document assembled when a call ends, matching
/// `build_call_result()` in `original_source/.../voice/common/common.py`.
#[derive(Debug, Clone, Serialize)]
pub struct CallResult {
    pub status: &'static str,
    pub call_status: CallState,
    pub call_id: String,
    pub customer: Option<String>,
    pub contact_number: Option<String>,
    pub transcript: Vec<TranscriptEntry>,
    pub duration_ms: i64,
    pub recording_url: Option<String>,
    pub call_start: Option<DateTime<Utc>>,
    pub call_end: Option<DateTime<Utc>>,
    pub call_end_reason: Option<EndReason>,
    pub assistant_number: Option<String>,
    pub data: CallResultData,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallResultData {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub transcript: String,
    pub cost: f64,
    pub quality_metrics: Option<QualityMetrics>,
    pub conversation_userdata: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityMetrics {
    pub turn_count: usize,
    pub total_completion_tokens: usize,
    pub total_tts_chars: usize,
    pub average_turn_latency_ms: f64,
    pub total_init_time_ms: u64,
}

/// A single call's runtime state (§3, §4.8).
pub struct CallSession {
    pub thread_id: String,
    pub call_id: String,
    pub config: Option<AgentConfig>,
    pub customer_name: Option<String>,
    pub contact_number: Option<String>,
    pub assistant_number: Option<String>,
    pub recording_url: Option<String>,
    pub cost: f64,
    pub conversation_userdata: Option<Value>,

    state: CallState,
    call_start: Option<DateTime<Utc>>,
    call_end: Option<DateTime<Utc>>,
    end_reason: Option<EndReason>,
    transcript: Vec<TranscriptEntry>,
    metrics: CallMetrics,
    perf_log: PerfLog,
    retry_used_this_turn: bool,
    next_timestamp_ms: u64,
}

impl CallSession {
    pub fn new(thread_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        CallSession {
            thread_id: thread_id.into(),
            call_id: call_id.into(),
            config: None,
            customer_name: None,
            contact_number: None,
            assistant_number: None,
            recording_url: None,
            cost: 0.0,
            conversation_userdata: None,
            state: CallState::Init,
            call_start: None,
            call_end: None,
            end_reason: None,
            transcript: Vec::new(),
            metrics: CallMetrics::new(),
            perf_log: PerfLog::new(),
            retry_used_this_turn: false,
            next_timestamp_ms: 0,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn perf_log(&self) -> &PerfLog {
        &self.perf_log
    }

    pub fn metrics(&self) -> &CallMetrics {
        &self.metrics
    }

    fn transition(&mut self, next: CallState) -> Result<(), CallError> {
        if !self.state.allows(next) {
            return Err(CallError::InvalidTransition(TransitionError {
                from: self.state.label().to_string(),
                to: next.label().to_string(),
            }));
        }
        self.state = next;
        Ok(())
    }

    /// Resolves into `config`, composes the system prompt, and moves the session through
    /// `resolving → composing → pipelining` (§4.8, §4.3, §4.4). Call [`CallSession::activate`]
    /// once the STT/LLM/TTS adapters are open, or [`CallSession::fail_before_active`] if one
    /// of them can't be opened.
    pub fn start(
        &mut self,
        config: AgentConfig,
        contact_number: Option<String>,
        customer_name: Option<String>,
    ) -> Result<String, CallError> {
        self.transition(CallState::Resolving)?;
        self.config = Some(config);
        self.contact_number = contact_number;
        self.customer_name = customer_name;

        self.transition(CallState::Composing)?;
        let prompt = crate::prompt::compose(self.config.as_ref().unwrap(), Some(&Utc::now().to_rfc3339()));

        self.transition(CallState::Pipelining)?;
        Ok(prompt)
    }

    /// Moves `pipelining → active` once every adapter session opened successfully.
    pub fn activate(&mut self) -> Result<(), CallError> {
        self.transition(CallState::Active)?;
        self.call_start = Some(Utc::now());
        Ok(())
    }

    /// A provider was unavailable before any audio was accepted: fails the session directly,
    /// without counting against the active-call retry budget (§4.8).
    pub fn fail_before_active(&mut self, provider: &'static str, reason: impl Into<String>) -> CallResult {
        self.end_reason = Some(EndReason::Error);
        let _ = self.transition(CallState::Failed);
        let _ = reason.into();
        self.build_call_result()
    }

    /// Records a finalized caller utterance. Interim/partial results from the STT adapter
    /// should not be passed here.
    pub fn handle_audio(&mut self, transcript: &Transcript) -> Result<(), CallError> {
        self.ensure_turn_state()?;
        if transcript.is_final && !transcript.text.trim().is_empty() {
            self.record_transcript(Speaker::Caller, transcript.text.clone());
            self.retry_used_this_turn = false;
        }
        Ok(())
    }

    /// Synthesizes `assistant_text` through `tts`, applying the single "no audio frames were
    /// pushed" retry (transliterate, replace `&` with `"and"`, retry once) before giving up
    /// and failing the call (§4.8).
    pub async fn handle_text(
        &mut self,
        tts: &mut dyn TextToSpeechSession,
        assistant_text: &str,
    ) -> Result<Speech, CallError> {
        self.ensure_turn_state()?;
        let cleaned = hygiene::strip_non_speakable(assistant_text);
        self.record_transcript(Speaker::Assistant, cleaned.clone());

        match tts.synthesize(&cleaned).await {
            Ok(speech) => {
                self.retry_used_this_turn = false;
                Ok(speech)
            }
            Err(first_error) => {
                if self.retry_used_this_turn {
                    return self.fail_turn("tts", first_error.to_string());
                }
                let fallback = hygiene::transliterate_fallback(&cleaned);
                let retry_text = if fallback != cleaned { fallback } else { cleaned.clone() };
                self.retry_used_this_turn = true;
                match tts.synthesize(&retry_text).await {
                    Ok(speech) => {
                        self.retry_used_this_turn = false;
                        Ok(speech)
                    }
                    Err(second_error) => self.fail_turn("tts", second_error.to_string()),
                }
            }
        }
    }

    /// The caller cut in mid-turn. This is not a failure: it resets the per-turn retry budget
    /// and leaves the call active, ready for a fresh utterance (§4.8).
    pub fn handle_interrupt(&mut self) -> Result<(), CallError> {
        self.ensure_turn_state()?;
        self.retry_used_this_turn = false;
        Ok(())
    }

    /// Ends the call for `reason`, transitioning through `closing` to `done` (cancellation)
    /// or `failed` (`EndReason::Error`), and assembles the final [`CallResult`].
    pub fn end(&mut self, reason: EndReason) -> Result<CallResult, CallError> {
        if self.state == CallState::Active || self.state == CallState::WaitingForInput {
            self.transition(CallState::Closing)?;
        }
        if self.state != CallState::Closing {
            // start()/activate() never ran, or the call already ended.
            return Err(CallError::InvalidTransition(TransitionError {
                from: self.state.label().to_string(),
                to: CallState::Closing.label().to_string(),
            }));
        }
        self.end_reason = Some(reason);
        self.call_end = Some(Utc::now());
        let target = if reason == EndReason::Error {
            CallState::Failed
        } else {
            CallState::Done
        };
        self.transition(target)?;
        Ok(self.build_call_result())
    }

    fn ensure_turn_state(&mut self) -> Result<(), CallError> {
        match self.state {
            CallState::Active | CallState::WaitingForInput => Ok(()),
            _ => Err(CallError::InvalidTransition(TransitionError {
                from: self.state.label().to_string(),
                to: CallState::Active.label().to_string(),
            })),
        }
    }

    /// Applies the "second failure in the same turn" rule: the first failure is absorbed (the
    /// caller already retried once above), the second fails the call.
    fn fail_turn<T>(&mut self, provider: &'static str, reason: String) -> Result<T, CallError> {
        self.end_reason = Some(EndReason::Error);
        let _ = self.transition(CallState::Closing);
        let _ = self.transition(CallState::Failed);
        Err(CallError::ProviderFailed { provider, reason })
    }

    fn record_transcript(&mut self, speaker: Speaker, text: String) {
        let timestamp_ms = self.next_timestamp_ms;
        self.next_timestamp_ms += 1;
        self.transcript.push(TranscriptEntry { speaker, text, timestamp_ms });
    }

    fn build_call_result(&self) -> CallResult {
        let duration_ms = match (self.call_start, self.call_end) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        };
        let transcript_text = self
            .transcript
            .iter()
            .map(|t| format!("{:?}: {}", t.speaker, t.text))
            .collect::<Vec<_>>()
            .join("\n");

        CallResult {
            status: if self.state == CallState::Failed { "failed" } else { "success" },
            call_status: self.state,
            call_id: self.call_id.clone(),
            customer: self.customer_name.clone(),
            contact_number: self.contact_number.clone(),
            transcript: self.transcript.clone(),
            duration_ms,
            recording_url: self.recording_url.clone(),
            call_start: self.call_start,
            call_end: self.call_end,
            call_end_reason: self.end_reason,
            assistant_number: self.assistant_number.clone(),
            data: CallResultData {
                kind: "voice_call",
                transcript: transcript_text,
                cost: self.cost,
                quality_metrics: if self.metrics.turn_count() > 0 {
                    Some(QualityMetrics {
                        turn_count: self.metrics.turn_count(),
                        total_completion_tokens: self.metrics.total_completion_tokens(),
                        total_tts_chars: self.metrics.total_tts_chars(),
                        average_turn_latency_ms: self.metrics.average_turn_latency_ms(),
                        total_init_time_ms: self.perf_log.total_init_time_ms(),
                    })
                } else {
                    None
                },
                conversation_userdata: self.conversation_userdata.clone(),
            },
        }
    }
}

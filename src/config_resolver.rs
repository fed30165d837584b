//! Config Resolver: derives an [`AgentConfig`] from session metadata (§4.3, §6).
//!
//! Resolution never guesses: the first matching step wins, and if none match the resolver
//! returns [`ResolutionError::NotFound`], which short-circuits call setup (§4.8: "Provider
//! unavailability at `start` transitions directly to `failed` before any audio is
//! accepted" — the same rule applies to resolution failures).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ResolutionError;

/// Conversational tone applied by the prompt composer (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Professional,
    Casual,
}

/// Call-type flags that drive which pattern fragments the prompt composer appends (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Support,
    Sales,
    Booking,
    Outbound,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureToggles {
    pub memory_enabled: bool,
    pub follow_up_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    pub phone_number: String,
    pub sip_trunk_id: Option<String>,
}

/// Resolved per-call agent configuration (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_handle: String,
    pub agent_name: String,
    pub company_name: String,
    /// `"<provider>:<model>"`, e.g. `"deepgram:nova-3"` (§6).
    pub stt_provider: String,
    /// `"<provider>:<model>"`, e.g. `"openai:gpt-4.1-nano"` (§6).
    pub llm_provider: String,
    /// `"<provider>:<model>"`, e.g. `"cartesia:sonic-3"` (§6).
    pub tts_provider: String,
    pub tts_voice: Option<String>,
    pub language: String,
    pub tone: Tone,
    pub call_type: CallType,
    pub telephony: Option<TelephonyConfig>,
    pub custom_persona: Option<String>,
    pub strict_script: bool,
    pub knowledge_base_tokens: Vec<String>,
    pub features: FeatureToggles,
    pub max_follow_up_calls: u32,
}

/// The inputs available at session start that drive resolution (§4.3).
#[derive(Debug, Clone, Default)]
pub struct SessionMetadata {
    pub agent_handle: Option<String>,
    pub space_token: Option<String>,
    pub is_inbound_sip: bool,
    pub dialed_phone_number: Option<String>,
    pub session_binding_id: Option<String>,
}

/// Backing store queried by each resolution step. Implementations typically delegate to
/// [`crate::db::DbPool`].
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn by_agent_handle(&self, handle: &str) -> Option<AgentConfig>;
    async fn most_recent_by_space(&self, space_token: &str) -> Option<AgentConfig>;
    async fn by_phone_number(&self, phone: &str) -> Option<AgentConfig>;
    async fn by_session_binding(&self, session_binding_id: &str) -> Option<AgentConfig>;
}

/// Resolves `metadata` into an [`AgentConfig`], trying each step in order and returning the
/// first hit (§4.3):
/// 1. `agent_handle` named in metadata.
/// 2. `space_token` named in metadata → most recently bound agent.
/// 3. Inbound SIP call with a dialled phone number → normalized lookup, then raw fallback.
/// 4. A persisted session binding.
pub async fn resolve(
    metadata: &SessionMetadata,
    store: &dyn ConfigStore,
) -> Result<AgentConfig, ResolutionError> {
    if let Some(handle) = &metadata.agent_handle {
        if let Some(config) = store.by_agent_handle(handle).await {
            return Ok(config);
        }
    }

    if let Some(token) = &metadata.space_token {
        if let Some(config) = store.most_recent_by_space(token).await {
            return Ok(config);
        }
    }

    if metadata.is_inbound_sip {
        if let Some(raw) = &metadata.dialed_phone_number {
            let normalized = normalize_phone(raw);
            if let Some(config) = store.by_phone_number(&normalized).await {
                return Ok(config);
            }
            if let Some(config) = store.by_phone_number(raw).await {
                return Ok(config);
            }
        }
    }

    if let Some(binding) = &metadata.session_binding_id {
        if let Some(config) = store.by_session_binding(binding).await {
            return Ok(config);
        }
    }

    Err(ResolutionError::NotFound)
}

/// Normalizes a caller-provided phone number to E.164 by stripping every non-digit
/// character and prepending a single `+` (§6, §8).
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("+{digits}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn normalize_phone_strips_spaces_and_adds_plus() {
        assert_eq!(normalize_phone("+91 98765 43210"), "+919876543210");
        assert_eq!(normalize_phone("919876543210"), "+919876543210");
    }

    fn sample_config(handle: &str) -> AgentConfig {
        AgentConfig {
            agent_handle: handle.to_string(),
            agent_name: "Riya".to_string(),
            company_name: "Acme".to_string(),
            stt_provider: "deepgram:nova-3".to_string(),
            llm_provider: "openai:gpt-4.1-nano".to_string(),
            tts_provider: "cartesia:sonic-3".to_string(),
            tts_voice: Some("alloy".to_string()),
            language: "en".to_string(),
            tone: Tone::Professional,
            call_type: CallType::Support,
            telephony: None,
            custom_persona: None,
            strict_script: false,
            knowledge_base_tokens: vec![],
            features: FeatureToggles::default(),
            max_follow_up_calls: 4,
        }
    }

    struct FakeStore {
        handle_hits: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConfigStore for FakeStore {
        async fn by_agent_handle(&self, handle: &str) -> Option<AgentConfig> {
            self.handle_hits.lock().unwrap().push(handle.to_string());
            if handle == "known" {
                Some(sample_config(handle))
            } else {
                None
            }
        }
        async fn most_recent_by_space(&self, space_token: &str) -> Option<AgentConfig> {
            if space_token == "space1" {
                Some(sample_config("space-bound"))
            } else {
                None
            }
        }
        async fn by_phone_number(&self, phone: &str) -> Option<AgentConfig> {
            if phone == "+919876543210" {
                Some(sample_config("phone-bound"))
            } else {
                None
            }
        }
        async fn by_session_binding(&self, session_binding_id: &str) -> Option<AgentConfig> {
            if session_binding_id == "binding1" {
                Some(sample_config("session-bound"))
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn agent_handle_wins_when_present() {
        let store = FakeStore { handle_hits: Mutex::new(vec![]) };
        let meta = SessionMetadata {
            agent_handle: Some("known".to_string()),
            space_token: Some("space1".to_string()),
            ..Default::default()
        };
        let config = resolve(&meta, &store).await.unwrap();
        assert_eq!(config.agent_handle, "known");
    }

    #[tokio::test]
    async fn falls_through_to_phone_lookup_with_normalized_then_raw() {
        let store = FakeStore { handle_hits: Mutex::new(vec![]) };
        let meta = SessionMetadata {
            is_inbound_sip: true,
            dialed_phone_number: Some("+91 98765 43210".to_string()),
            ..Default::default()
        };
        let config = resolve(&meta, &store).await.unwrap();
        assert_eq!(config.agent_handle, "phone-bound");
    }

    #[tokio::test]
    async fn falls_through_to_session_binding_last() {
        let store = FakeStore { handle_hits: Mutex::new(vec![]) };
        let meta = SessionMetadata {
            session_binding_id: Some("binding1".to_string()),
            ..Default::default()
        };
        let config = resolve(&meta, &store).await.unwrap();
        assert_eq!(config.agent_handle, "session-bound");
    }

    #[tokio::test]
    async fn not_found_when_nothing_matches() {
        let store = FakeStore { handle_hits: Mutex::new(vec![]) };
        let meta = SessionMetadata::default();
        let err = resolve(&meta, &store).await.unwrap_err();
        assert_eq!(err.code(), "agent_not_found");
    }
}

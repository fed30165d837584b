//! Provider adapter traits for the voice pipeline (§4.8, §9 Design Notes).
//!
//! Each leg of the pipeline — speech-to-text, the LLM, and text-to-speech — is a trait with
//! an `open(provider)` factory returning a per-call session, mirroring how
//! `crate::clients` wraps each LLM vendor behind [`crate::client_wrapper::ClientWrapper`].
//! The LLM leg reuses that trait directly rather than inventing a parallel one: a voice
//! session's LLM turn is just [`crate::LLMSession::send_message`] under the hood.

use async_trait::async_trait;
use std::error::Error;
use std::fmt;

/// A provider identifier in `"<provider>:<model>"` form, e.g. `"deepgram:nova-3"` (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderId {
    pub provider: String,
    pub model: String,
}

impl ProviderId {
    pub fn parse(raw: &str) -> Option<Self> {
        let (provider, model) = raw.split_once(':')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(ProviderId {
            provider: provider.to_string(),
            model: model.to_string(),
        })
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

/// A single finalized transcript, with the latency incurred to produce it.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub duration_ms: u64,
    pub is_final: bool,
}

/// A speech-to-text session bound to one call.
#[async_trait]
pub trait SpeechToTextSession: Send + Sync {
    /// Feeds one inbound audio frame, returning a transcript once the provider finalizes an
    /// utterance (`None` for interim/partial results the caller doesn't need to act on).
    async fn push_audio(&mut self, frame: &[u8]) -> Result<Option<Transcript>, Box<dyn Error + Send + Sync>>;

    async fn close(&mut self) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Opens a [`SpeechToTextSession`] for a resolved provider identifier.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn open(&self, provider: &ProviderId) -> Result<Box<dyn SpeechToTextSession>, Box<dyn Error + Send + Sync>>;
}

/// One synthesized audio response, with the latency to first byte and the character count
/// billed (§4.8 per-turn metrics).
#[derive(Debug, Clone)]
pub struct Speech {
    pub audio: Vec<u8>,
    pub ttfb_ms: u64,
    pub char_count: usize,
}

/// Raised when a TTS provider returns successfully but produces no audio, per §4.8's retry
/// rule ("no audio frames were pushed").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoAudioFrames;

impl fmt::Display for NoAudioFrames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no audio frames were pushed")
    }
}

impl std::error::Error for NoAudioFrames {}

/// A text-to-speech session bound to one call.
#[async_trait]
pub trait TextToSpeechSession: Send + Sync {
    async fn synthesize(&mut self, text: &str) -> Result<Speech, Box<dyn Error + Send + Sync>>;
}

/// Opens a [`TextToSpeechSession`] for a resolved provider identifier, optionally pinned to a
/// specific voice.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn open(
        &self,
        provider: &ProviderId,
        voice: Option<&str>,
    ) -> Result<Box<dyn TextToSpeechSession>, Box<dyn Error + Send + Sync>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_parses_provider_and_model() {
        let id = ProviderId::parse("deepgram:nova-3").unwrap();
        assert_eq!(id.provider, "deepgram");
        assert_eq!(id.model, "nova-3");
        assert_eq!(id.to_string(), "deepgram:nova-3");
    }

    #[test]
    fn provider_id_rejects_malformed_strings() {
        assert!(ProviderId::parse("deepgram").is_none());
        assert!(ProviderId::parse(":nova-3").is_none());
        assert!(ProviderId::parse("deepgram:").is_none());
    }
}

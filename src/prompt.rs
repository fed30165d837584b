//! Prompt Composer: a deterministic builder that assembles the system prompt handed to the
//! LLM leg of a voice session (§4.4).
//!
//! `original_source/apps/super/super/core/voice/prompts/composer.py::compose_prompt` pins
//! down section order and the non-English language list: identity, custom persona (headed
//! `"## YOUR BUSINESS CONTEXT - FOLLOW THIS EXACTLY"`, inserted *before* the base voice
//! rules), base voice rules (skipped in strict-script mode), STT-error-handling fragment,
//! reference-context-handling fragment, pattern fragments (support by default; sales and
//! booking for outbound/sales call types; multilingual whenever the language isn't English),
//! tone modifier, then optional memory/follow-up fragments. Strict-script mode renders a
//! `"## Script Execution Mode"` directive in place of the pattern fragments.

use crate::config_resolver::{AgentConfig, CallType, Tone};

const VOICE_RULES: &str = "\
## How You Speak
- Generate plain, TTS-ready text only: no markdown, bullets, or headings in your replies.
- Keep answers short by default (1-2 sentences); expand only when the caller asks for detail.
- Silently correct obvious speech-to-text errors by inferring intent from context; never \
mention that a correction happened.
- Mirror the caller's language and energy; never sound robotic or apologize excessively.";

const STT_ERROR_HANDLING: &str = "\
## Handling Transcription Errors
The text you receive may contain mistranscriptions, partial words, or dropped syllables. \
Infer the caller's intended meaning from context before responding, and ask a brief \
clarifying question only if the intended meaning is genuinely ambiguous after inference.";

const REFERENCE_CONTEXT_HANDLING: &str = "\
## Reference Context
Caller messages may include a block of background information for your reference only. \
Use it silently to inform your answer; never repeat, quote, or open your response with it, \
and never let the caller know it was provided.";

const SUPPORT_PATTERN: &str = "\
## Support Conversations
- Acknowledge the caller's issue in one sentence before asking a clarifying question.
- Offer the next concrete step rather than a menu of options.
- Escalate to a human or schedule a follow-up when the issue is outside what you can resolve.";

const SALES_PATTERN: &str = "\
## Sales Conversations
- Lead with the value to the caller, not a feature list.
- Ask qualifying questions before pitching; never read a script verbatim unless in script mode.
- Move toward a concrete next step: a booked callback, a demo, or a confirmed purchase.";

const BOOKING_PATTERN: &str = "\
## Booking Conversations
- Confirm date, time, and any required details back to the caller before finalizing.
- If the requested slot is unavailable, offer the two nearest alternatives.
- Always restate the final confirmed booking at the end of the exchange.";

const MULTILINGUAL_PATTERN: &str = "\
## Multilingual & Code-Mixed Speech
- Mirror the caller's language and any code-mixing rather than switching to English.
- Use the caller's script for non-Latin languages when the voice output supports it.
- If intent is unclear across languages, ask a brief clarifying question in the caller's language.";

const PROFESSIONAL_MODIFIER: &str = "\
## Tone: Professional
Structured, courteous, business-appropriate language with minimal filler words.";

const CASUAL_MODIFIER: &str = "\
## Tone: Casual
Warm and conversational, with natural filler words where they fit; stay concise.";

const MEMORY_GUIDELINES: &str = "\
## Memory
You may reference relevant facts from earlier in this conversation or prior calls with this \
caller when it's directly useful; never fabricate a memory you don't have.";

const FOLLOWUP_GUIDELINES: &str = "\
## Follow-up
If the conversation ends without full resolution, say plainly that someone will follow up, \
and let the system handle scheduling that callback.";

const SCRIPT_EXECUTION_MODE: &str = "\
## Script Execution Mode
- Follow the provided business/campaign script exactly.
- Do not use generic support fallback lines.
- On yes/ok/go-ahead acknowledgments, continue to the next scripted line.";

/// Non-English language codes/names that trigger the multilingual pattern fragment, per
/// `original_source/.../composer.py`'s `non_english_languages` set (§4.4 refinements).
const NON_ENGLISH_LANGUAGES: &[&str] = &[
    "hi", "hindi", "hinglish", "hn", "pa", "punjabi", "ta", "tamil", "te", "telugu", "mr",
    "marathi", "gu", "gujarati", "bn", "bengali", "kn", "kannada", "ml", "malayalam", "ur",
    "urdu", "or", "odia", "es", "spanish", "fr", "french", "de", "german", "pt", "portuguese",
    "ar", "arabic", "zh", "chinese", "ja", "japanese", "ko", "korean",
];

fn is_non_english(language: &str) -> bool {
    let lowered = language.to_lowercase();
    let starts_with_en = lowered.starts_with("en");
    !starts_with_en || NON_ENGLISH_LANGUAGES.contains(&lowered.as_str())
}

/// Assembles the full system prompt for `config`, optionally including `current_datetime`
/// (rendered as an ISO-8601-ish string on the identity line when present).
pub fn compose(config: &AgentConfig, current_datetime: Option<&str>) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(identity_section(config, current_datetime));

    if let Some(persona) = &config.custom_persona {
        if !persona.trim().is_empty() {
            sections.push(format!("## YOUR BUSINESS CONTEXT - FOLLOW THIS EXACTLY\n{persona}"));
        }
    }

    if !config.strict_script {
        sections.push(VOICE_RULES.to_string());
    }

    sections.push(STT_ERROR_HANDLING.to_string());
    sections.push(REFERENCE_CONTEXT_HANDLING.to_string());

    if config.strict_script {
        sections.push(SCRIPT_EXECUTION_MODE.to_string());
    } else {
        for pattern in patterns_for(config) {
            sections.push(pattern.to_string());
        }
    }

    sections.push(
        match config.tone {
            Tone::Professional => PROFESSIONAL_MODIFIER,
            Tone::Casual => CASUAL_MODIFIER,
        }
        .to_string(),
    );

    if config.features.memory_enabled {
        sections.push(MEMORY_GUIDELINES.to_string());
    }
    if config.features.follow_up_enabled {
        sections.push(FOLLOWUP_GUIDELINES.to_string());
    }

    sections.join("\n\n")
}

fn identity_section(config: &AgentConfig, current_datetime: Option<&str>) -> String {
    let mut identity = format!("You are {}", config.agent_name);
    if !config.company_name.is_empty() {
        identity.push_str(&format!(", a voice assistant for {}", config.company_name));
    }
    identity.push_str(". You're on a phone call—speak naturally, keep it brief.");
    if let Some(dt) = current_datetime {
        identity.push_str(&format!("\nCurrent date/time: {dt}"));
    }
    identity
}

/// Returns the ordered set of pattern fragments for a non-strict-script config: support by
/// default, plus sales/booking for sales/booking/outbound call types, plus multilingual
/// whenever the configured language isn't English.
fn patterns_for(config: &AgentConfig) -> Vec<&'static str> {
    let mut patterns = match config.call_type {
        CallType::Sales | CallType::Outbound => vec![SALES_PATTERN, BOOKING_PATTERN],
        CallType::Booking => vec![BOOKING_PATTERN],
        CallType::Support => vec![SUPPORT_PATTERN],
    };

    if is_non_english(&config.language) && !patterns.contains(&MULTILINGUAL_PATTERN) {
        patterns.push(MULTILINGUAL_PATTERN);
    }

    patterns
}

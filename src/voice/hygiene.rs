//! Utterance hygiene: one combined pass that keeps LLM leakage out of what reaches TTS.
//!
//! Grounded on
//! `original_source/apps/super/tests/core/voice/livekit/test_livekit_lite_agent_tools.py`,
//! which pins down three behaviors: angle-bracket command tags (e.g. `<Transfer the call
//! here>`) must be stripped even when a tag is split across two streamed chunks, without
//! joining the words on either side of the removed tag; `tool_code` / `default_api.<fn>(...)`
//! leakage must be stripped the same way; and a TTS "no audio frames were pushed" failure
//! should be retried exactly once after transliterating non-ASCII text and spelling out `&`
//! as `"and"`.
//!
//! [`UtteranceHygiene`] is the streaming half: feed it chunks as they arrive from the LLM and
//! it holds back only the minimum text needed to recognize a tag or call that spans a chunk
//! boundary. [`strip_non_speakable`] is the non-streaming equivalent, used by
//! [`UtteranceHygiene::finish`] and for already-buffered text.

use once_cell::sync::Lazy;
use regex::Regex;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^<>]*>").unwrap());
static TOOL_CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)tool_code\s*\n?\s*print\(default_api\.\w+\([^)]*\)\)").unwrap()
});
static DEFAULT_API_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"default_api\.\w+\([^)]*\)").unwrap());

/// Removes angle-bracket command tags and `default_api` call leakage from a complete string,
/// collapsing the whitespace left behind so words on either side never run together and a
/// double space never appears where a tag used to be.
pub fn strip_non_speakable(text: &str) -> String {
    let text = strip_pattern(text, &TAG_RE);
    let text = strip_pattern(&text, &TOOL_CODE_RE);
    strip_pattern(&text, &DEFAULT_API_RE)
}

fn strip_pattern(text: &str, re: &Regex) -> String {
    let mut output = String::new();
    let mut last_end = 0;
    for m in re.find_iter(text) {
        append_with_join_handling(&mut output, &text[last_end..m.start()]);
        last_end = m.end();
    }
    append_with_join_handling(&mut output, &text[last_end..]);
    output
}

/// Appends `segment` to `output`, collapsing a whitespace-whitespace boundary to a single
/// space and inserting exactly one space at a word-word boundary that would otherwise glue
/// two words together.
fn append_with_join_handling(output: &mut String, segment: &str) {
    if segment.is_empty() {
        return;
    }
    let output_ends_with_space = output.is_empty() || output.ends_with(char::is_whitespace);
    let segment_starts_with_space = segment.starts_with(char::is_whitespace);

    if output_ends_with_space && segment_starts_with_space {
        while output.ends_with(char::is_whitespace) {
            output.pop();
        }
        if !output.is_empty() {
            output.push(' ');
        }
        output.push_str(segment.trim_start());
    } else if !output_ends_with_space
        && !segment_starts_with_space
        && output.chars().last().map(|c| c.is_alphanumeric()).unwrap_or(false)
        && segment.chars().next().map(|c| c.is_alphanumeric()).unwrap_or(false)
    {
        output.push(' ');
        output.push_str(segment);
    } else {
        output.push_str(segment);
    }
}

/// Replaces non-ASCII runs with nothing and spells `&` out as `"and"`, for the single retry
/// attempt after a TTS provider reports "no audio frames were pushed" (§4.8).
pub fn transliterate_fallback(text: &str) -> String {
    let stripped: String = text.chars().filter(|c| c.is_ascii()).collect();
    let spelled = stripped.replace('&', " and ");
    spelled.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    /// A separator is owed before the next non-empty segment (whitespace was trimmed off the
    /// tail of what was already emitted).
    Space,
    /// The last emitted character was alphanumeric with no trailing whitespace; insert one
    /// space if the next segment starts with another alphanumeric character.
    JoinGuard,
}

/// Streaming counterpart to [`strip_non_speakable`]. Feed it text chunks in arrival order;
/// each call returns whatever text is now safe to forward to TTS, holding back only the
/// minimum needed to recognize a construct that might still be mid-flight.
pub struct UtteranceHygiene {
    buffer: String,
    pending: Pending,
    any_emitted: bool,
}

impl Default for UtteranceHygiene {
    fn default() -> Self {
        Self::new()
    }
}

impl UtteranceHygiene {
    pub fn new() -> Self {
        UtteranceHygiene {
            buffer: String::new(),
            pending: Pending::None,
            any_emitted: false,
        }
    }

    /// Feeds a streamed chunk, returning the portion now safe to forward.
    pub fn feed(&mut self, chunk: &str) -> String {
        self.buffer.push_str(chunk);
        self.extract_ready()
    }

    /// Call once the stream ends. Flushes whatever remains, stripping any complete construct
    /// and discarding the opening of one that never closed.
    pub fn finish(&mut self) -> String {
        let remaining = std::mem::take(&mut self.buffer);
        let usable = match earliest_marker(&remaining) {
            Some(start) if construct_end(&remaining, start).is_none() => &remaining[..start],
            _ => remaining.as_str(),
        };
        let mut output = String::new();
        self.push(&mut output, &strip_non_speakable(usable));
        output
    }

    fn extract_ready(&mut self) -> String {
        let mut output = String::new();
        loop {
            match earliest_marker(&self.buffer) {
                None => {
                    let rest = std::mem::take(&mut self.buffer);
                    self.push(&mut output, &rest);
                    break;
                }
                Some(start) => {
                    if let Some(end) = construct_end(&self.buffer, start) {
                        let before = self.buffer[..start].to_string();
                        self.push(&mut output, &before);
                        self.buffer = self.buffer[end..].to_string();
                        // The construct itself contributes no speakable text.
                        continue;
                    } else {
                        let before = self.buffer[..start].to_string();
                        self.push(&mut output, &before);
                        self.buffer = self.buffer[start..].to_string();
                        break;
                    }
                }
            }
        }
        output
    }

    fn push(&mut self, output: &mut String, raw: &str) {
        if raw.is_empty() {
            return;
        }
        let trimmed_trailing = raw.trim_end();
        let had_trailing_ws = trimmed_trailing.len() != raw.len();
        let mut content = trimmed_trailing;

        match self.pending {
            Pending::Space => {
                content = content.trim_start();
                if !content.is_empty() {
                    if self.any_emitted {
                        output.push(' ');
                    }
                    output.push_str(content);
                    self.any_emitted = true;
                }
            }
            Pending::JoinGuard => {
                let starts_with_ws = content.starts_with(char::is_whitespace);
                let starts_with_alnum = content.chars().next().map(|c| c.is_alphanumeric()).unwrap_or(false);
                if !content.is_empty() {
                    if !starts_with_ws && starts_with_alnum {
                        output.push(' ');
                    }
                    output.push_str(content);
                    self.any_emitted = true;
                }
            }
            Pending::None => {
                if !content.is_empty() {
                    output.push_str(content);
                    self.any_emitted = true;
                }
            }
        }

        self.pending = if had_trailing_ws {
            Pending::Space
        } else if content.chars().last().map(|c| c.is_alphanumeric()).unwrap_or(false) {
            Pending::JoinGuard
        } else {
            Pending::None
        };
    }
}

fn earliest_marker(buffer: &str) -> Option<usize> {
    [buffer.find('<'), buffer.find("tool_code"), buffer.find("default_api")]
        .into_iter()
        .flatten()
        .min()
}

/// Returns the end offset of the construct starting at `start`, or `None` if the construct is
/// recognized but not yet complete (more chunks are needed).
fn construct_end(buffer: &str, start: usize) -> Option<usize> {
    let slice = &buffer[start..];
    if slice.starts_with('<') {
        slice.find('>').map(|rel| start + rel + 1)
    } else if slice.starts_with("tool_code") {
        TOOL_CODE_RE
            .find(slice)
            .filter(|m| m.start() == 0)
            .map(|m| start + m.end())
    } else if slice.starts_with("default_api") {
        DEFAULT_API_RE
            .find(slice)
            .filter(|m| m.start() == 0)
            .map(|m| start + m.end())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_a_command_tag_within_one_chunk() {
        let mut hygiene = UtteranceHygiene::new();
        let mut out = hygiene.feed("Hello there <Disconnect the call> thanks");
        out.push_str(&hygiene.finish());
        assert_eq!(out, "Hello there thanks");
    }

    #[test]
    fn strips_a_command_tag_split_across_chunks_without_joining_words() {
        let mut hygiene = UtteranceHygiene::new();
        let chunks = [
            "Great! So I can see",
            " you were purchasing",
            " <Tran",
            "sfer the call here>",
            " bonsai plants",
            " on our website.",
        ];
        let mut out = String::new();
        for chunk in chunks {
            out.push_str(&hygiene.feed(chunk));
        }
        out.push_str(&hygiene.finish());
        assert_eq!(
            out,
            "Great! So I can see you were purchasing bonsai plants on our website."
        );
        assert!(!out.contains("purchasingbonsai"));
    }

    #[test]
    fn strips_split_tool_code_leakage_without_touching_legitimate_text() {
        let mut hygiene = UtteranceHygiene::new();
        let chunks = [
            "Sorry, could you please repeat it.",
            " We have previous year question papers and test series available.",
            " \ntool_code\nprint(default_api.get_",
            "docs(kb_name = \"Vajiram Knowledge base\", query = \"previous year question papers and test series\"))",
            " Let me know!",
        ];
        let mut out = String::new();
        for chunk in chunks {
            out.push_str(&hygiene.feed(chunk));
        }
        out.push_str(&hygiene.finish());
        assert!(!out.contains("tool_code"));
        assert!(!out.contains("default_api"));
        assert!(out.contains("Sorry, could you please repeat it."));
        assert!(out.contains("previous year question papers and test series available."));
        assert!(out.contains("Let me know!"));
    }

    #[test]
    fn bare_default_api_call_without_tool_code_marker_is_stripped() {
        let out = strip_non_speakable("One moment default_api.hang_up(reason = \"done\") please hold.");
        assert_eq!(out, "One moment please hold.");
    }

    #[test]
    fn transliterate_fallback_strips_non_ascii_and_spells_out_ampersand() {
        let out = transliterate_fallback("Hello I am Saanvi from वाजीराम & Ravi.");
        assert!(!out.contains("वाजीराम"));
        assert!(!out.contains('&'));
        assert!(out.contains("and"));
    }

    #[test]
    fn finish_discards_an_unterminated_trailing_tag() {
        let mut hygiene = UtteranceHygiene::new();
        let mut out = hygiene.feed("All set. <Somehow never closes");
        out.push_str(&hygiene.finish());
        assert_eq!(out, "All set.");
    }
}

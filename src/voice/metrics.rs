//! Per-turn and per-call metrics, grounded on
//! `original_source/apps/super/super/core/voice/common/common.py`'s `PerfTimer` and
//! `add_perf_log` helpers.
//!
//! `PerfTimer` is a scoped guard: starting it records a monotonic start instant, and dropping
//! it (or calling [`PerfTimer::stop`] explicitly) appends one `{name, duration_ms}` entry to
//! the call's init-time log. `TurnMetrics` accumulates the STT/LLM/TTS timings the Design
//! Notes call for per turn, plus the running totals carried on [`crate::voice::CallResult`].

use std::time::Instant;

/// One entry in the call's initialization-time log (`init_time_log` in the original).
#[derive(Debug, Clone, PartialEq)]
pub struct PerfLogEntry {
    pub name: String,
    pub duration_ms: u64,
    pub timestamp_ms: Option<u64>,
}

/// Accumulates [`PerfLogEntry`] values and their sum, mirroring `add_perf_log`'s running
/// `total_init_time_ms`.
#[derive(Debug, Clone, Default)]
pub struct PerfLog {
    entries: Vec<PerfLogEntry>,
    total_ms: u64,
}

impl PerfLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, duration_ms: u64, timestamp_ms: Option<u64>) {
        self.total_ms += duration_ms;
        self.entries.push(PerfLogEntry {
            name: name.into(),
            duration_ms,
            timestamp_ms,
        });
    }

    pub fn entries(&self) -> &[PerfLogEntry] {
        &self.entries
    }

    pub fn total_init_time_ms(&self) -> u64 {
        self.total_ms
    }
}

/// A context-manager-style scoped timer: construct with [`PerfTimer::start`], and either call
/// [`PerfTimer::stop`] or let it drop to append its entry to the [`PerfLog`].
pub struct PerfTimer<'a> {
    name: String,
    started_at: Instant,
    log: &'a mut PerfLog,
    stopped: bool,
}

impl<'a> PerfTimer<'a> {
    pub fn start(name: impl Into<String>, log: &'a mut PerfLog) -> Self {
        PerfTimer {
            name: name.into(),
            started_at: Instant::now(),
            log,
            stopped: false,
        }
    }

    pub fn stop(mut self) {
        self.record();
        self.stopped = true;
    }

    fn record(&mut self) {
        if self.stopped {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_millis() as u64;
        self.log.add(self.name.clone(), duration_ms, None);
    }
}

impl Drop for PerfTimer<'_> {
    fn drop(&mut self) {
        self.record();
    }
}

/// Measurements for a single conversational turn (one STT finalize → LLM reply → TTS
/// playback cycle).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnMetrics {
    pub stt_duration_ms: u64,
    pub llm_ttft_ms: u64,
    pub llm_completion_tokens: usize,
    pub tts_ttfb_ms: u64,
    pub tts_char_count: usize,
    pub turn_latency_ms: u64,
}

/// Accumulates [`TurnMetrics`] across the whole call for the `quality_metrics` block in
/// [`crate::voice::CallResult`].
#[derive(Debug, Clone, Default)]
pub struct CallMetrics {
    pub turns: Vec<TurnMetrics>,
}

impl CallMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_turn(&mut self, turn: TurnMetrics) {
        self.turns.push(turn);
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn total_completion_tokens(&self) -> usize {
        self.turns.iter().map(|t| t.llm_completion_tokens).sum()
    }

    pub fn total_tts_chars(&self) -> usize {
        self.turns.iter().map(|t| t.tts_char_count).sum()
    }

    pub fn average_turn_latency_ms(&self) -> f64 {
        if self.turns.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.turns.iter().map(|t| t.turn_latency_ms).sum();
        sum as f64 / self.turns.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perf_timer_appends_an_entry_on_stop() {
        let mut log = PerfLog::new();
        let timer = PerfTimer::start("resolve_config", &mut log);
        timer.stop();
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].name, "resolve_config");
    }

    #[test]
    fn perf_timer_appends_an_entry_on_drop() {
        let mut log = PerfLog::new();
        {
            let _timer = PerfTimer::start("compose_prompt", &mut log);
        }
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].name, "compose_prompt");
    }

    #[test]
    fn total_init_time_sums_every_entry() {
        let mut log = PerfLog::new();
        log.add("a", 10, None);
        log.add("b", 25, None);
        assert_eq!(log.total_init_time_ms(), 35);
    }

    #[test]
    fn call_metrics_aggregate_across_turns() {
        let mut metrics = CallMetrics::new();
        metrics.record_turn(TurnMetrics {
            stt_duration_ms: 100,
            llm_ttft_ms: 200,
            llm_completion_tokens: 12,
            tts_ttfb_ms: 50,
            tts_char_count: 80,
            turn_latency_ms: 400,
        });
        metrics.record_turn(TurnMetrics {
            turn_latency_ms: 600,
            llm_completion_tokens: 8,
            tts_char_count: 40,
            ..Default::default()
        });
        assert_eq!(metrics.turn_count(), 2);
        assert_eq!(metrics.total_completion_tokens(), 20);
        assert_eq!(metrics.total_tts_chars(), 120);
        assert_eq!(metrics.average_turn_latency_ms(), 500.0);
    }
}

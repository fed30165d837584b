//! Observability event bus.
//!
//! Every subsystem emits [`ObservabilityEvent`]s into an [`EventHandler`] rather than
//! logging directly inline, mirroring the teacher crate's `AgentEvent`/`EventHandler`
//! pattern. The default handler logs through the `log` facade under a module-scoped
//! target (`unpod::messaging`, `unpod::voice`, `unpod::tasks`) so operators can filter by
//! subsystem via `RUST_LOG`; applications may supply their own [`EventHandler`] to also
//! ship events to metrics or tracing backends.

use std::fmt;
use std::sync::Arc;

/// A structured event emitted by a subsystem for logging/metrics hook-up.
#[derive(Debug, Clone)]
pub struct ObservabilityEvent {
    /// Logging target, e.g. `"unpod::voice"`.
    pub target: &'static str,
    pub level: Level,
    pub message: String,
    pub fields: Vec<(&'static str, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for ObservabilityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for (k, v) in &self.fields {
            write!(f, " {k}={v}")?;
        }
        Ok(())
    }
}

impl ObservabilityEvent {
    pub fn new(target: &'static str, level: Level, message: impl Into<String>) -> Self {
        Self {
            target,
            level,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, key: &'static str, value: impl ToString) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }
}

/// Receives [`ObservabilityEvent`]s emitted by subsystems.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: ObservabilityEvent);
}

/// Routes every event through the `log` facade at the target/level it carries.
pub struct LogEventHandler;

impl EventHandler for LogEventHandler {
    fn handle(&self, event: ObservabilityEvent) {
        match event.level {
            Level::Debug => log::debug!(target: event.target, "{event}"),
            Level::Info => log::info!(target: event.target, "{event}"),
            Level::Warn => log::warn!(target: event.target, "{event}"),
            Level::Error => log::error!(target: event.target, "{event}"),
        }
    }
}

/// A shared handle to the process's event sink, injected into components at construction.
pub type EventBus = Arc<dyn EventHandler>;

/// Builds the default, log-backed [`EventBus`].
pub fn default_event_bus() -> EventBus {
    Arc::new(LogEventHandler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CapturingHandler(Mutex<Vec<String>>);

    impl EventHandler for CapturingHandler {
        fn handle(&self, event: ObservabilityEvent) {
            self.0.lock().unwrap().push(event.to_string());
        }
    }

    #[test]
    fn fields_are_rendered_in_display() {
        let event = ObservabilityEvent::new("unpod::voice", Level::Info, "turn completed")
            .with_field("call_id", "call_1")
            .with_field("latency_ms", 120);
        assert_eq!(event.to_string(), "turn completed call_id=call_1 latency_ms=120");
    }

    #[test]
    fn custom_handler_receives_events() {
        let handler = CapturingHandler(Mutex::new(Vec::new()));
        handler.handle(ObservabilityEvent::new("unpod::tasks", Level::Warn, "retrying"));
        assert_eq!(handler.0.lock().unwrap().len(), 1);
    }
}

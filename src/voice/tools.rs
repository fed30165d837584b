//! In-call tools (`end_call`, `transfer_call`, `schedule_followup`), registered with
//! [`crate::tool_protocol::ToolRegistry`] the way every other in-call control action is
//! exposed to the LLM leg of a call.
//!
//! Each tool only records the caller's intent onto an `mpsc` channel; the voice session
//! runtime's driver loop is what actually acts on a [`ToolSignal`] (ending the call,
//! transferring it, or queuing a follow-up), since only the driver owns the live
//! [`crate::voice::CallSession`].

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::tool_protocol::{Executor, ToolMetadata, ToolParameter, ToolParameterType, ToolRegistry, ToolResult};

/// What the in-call tools ask the driver loop to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolSignal {
    EndCall { reason: Option<String> },
    TransferCall { destination: String },
    ScheduleFollowup { reason: Option<String> },
}

struct EndCallTool {
    signals: UnboundedSender<ToolSignal>,
}

#[async_trait]
impl Executor for EndCallTool {
    async fn execute(&self, args: Value) -> ToolResult {
        let reason = args.get("reason").and_then(Value::as_str).map(str::to_string);
        if self.signals.send(ToolSignal::EndCall { reason }).is_err() {
            return ToolResult::failure("call already ended");
        }
        ToolResult::success(serde_json::json!({"acknowledged": true}))
    }
}

struct TransferCallTool {
    signals: UnboundedSender<ToolSignal>,
}

#[async_trait]
impl Executor for TransferCallTool {
    async fn execute(&self, args: Value) -> ToolResult {
        let Some(destination) = args.get("destination").and_then(Value::as_str) else {
            return ToolResult::failure("missing required field 'destination'");
        };
        if self
            .signals
            .send(ToolSignal::TransferCall { destination: destination.to_string() })
            .is_err()
        {
            return ToolResult::failure("call already ended");
        }
        ToolResult::success(serde_json::json!({"acknowledged": true}))
    }
}

struct ScheduleFollowupTool {
    signals: UnboundedSender<ToolSignal>,
}

#[async_trait]
impl Executor for ScheduleFollowupTool {
    async fn execute(&self, args: Value) -> ToolResult {
        let reason = args.get("reason").and_then(Value::as_str).map(str::to_string);
        if self.signals.send(ToolSignal::ScheduleFollowup { reason }).is_err() {
            return ToolResult::failure("call already ended");
        }
        ToolResult::success(serde_json::json!({"acknowledged": true}))
    }
}

/// Registers the three in-call tools against `registry`, delivering every invocation onto
/// `signals` for the driver loop to act on.
pub fn register_call_tools(registry: &mut ToolRegistry, signals: UnboundedSender<ToolSignal>) {
    registry.register(
        ToolMetadata {
            name: "end_call".to_string(),
            description: "Ends the active call.".to_string(),
            parameters: vec![ToolParameter {
                name: "reason".to_string(),
                param_type: ToolParameterType::String,
                description: "Why the call is ending.".to_string(),
                required: false,
            }],
        },
        std::sync::Arc::new(EndCallTool { signals: signals.clone() }),
    );
    registry.register(
        ToolMetadata {
            name: "transfer_call".to_string(),
            description: "Transfers the active call to a human or another line.".to_string(),
            parameters: vec![ToolParameter {
                name: "destination".to_string(),
                param_type: ToolParameterType::String,
                description: "Phone number or queue to transfer to.".to_string(),
                required: true,
            }],
        },
        std::sync::Arc::new(TransferCallTool { signals: signals.clone() }),
    );
    registry.register(
        ToolMetadata {
            name: "schedule_followup".to_string(),
            description: "Schedules a follow-up call with this caller.".to_string(),
            parameters: vec![ToolParameter {
                name: "reason".to_string(),
                param_type: ToolParameterType::String,
                description: "Why a follow-up is needed.".to_string(),
                required: false,
            }],
        },
        std::sync::Arc::new(ScheduleFollowupTool { signals }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn end_call_tool_sends_a_signal() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut registry = ToolRegistry::new();
        register_call_tools(&mut registry, tx);

        let result = registry
            .dispatch("end_call", serde_json::json!({"reason": "resolved"}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(
            rx.recv().await,
            Some(ToolSignal::EndCall { reason: Some("resolved".to_string()) })
        );
    }

    #[tokio::test]
    async fn transfer_call_tool_requires_destination() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut registry = ToolRegistry::new();
        register_call_tools(&mut registry, tx);

        let result = registry.dispatch("transfer_call", serde_json::json!({})).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn schedule_followup_tool_sends_a_signal() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut registry = ToolRegistry::new();
        register_call_tools(&mut registry, tx);

        registry
            .dispatch("schedule_followup", serde_json::json!({"reason": "needs pricing info"}))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ToolSignal::ScheduleFollowup { reason: Some("needs pricing info".to_string()) })
        );
    }
}

//! In-call tool registry for the voice session runtime.
//!
//! The original platform discovers in-call control actions (hang up, transfer, schedule a
//! follow-up) through decorator-collected Python functions inspected at runtime. Per the
//! Design Notes, we re-express that as a static registry: each tool advertises a
//! [`ToolMetadata`] schema plus an [`Executor`], and [`ToolRegistry::dispatch`] looks the
//! tool up by name. No runtime type introspection is involved.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use unpod::tool_protocol::{Executor, ToolMetadata, ToolParameter, ToolParameterType, ToolRegistry, ToolResult};
//!
//! struct EndCall;
//!
//! #[async_trait]
//! impl Executor for EndCall {
//!     async fn execute(&self, _args: serde_json::Value) -> ToolResult {
//!         ToolResult::success(serde_json::json!({"ended": true}))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut registry = ToolRegistry::new();
//! registry.register(
//!     ToolMetadata {
//!         name: "end_call".to_string(),
//!         description: "Ends the active call".to_string(),
//!         parameters: vec![ToolParameter {
//!             name: "reason".to_string(),
//!             param_type: ToolParameterType::String,
//!             description: "Why the call is ending".to_string(),
//!             required: false,
//!         }],
//!     },
//!     Arc::new(EndCall),
//! );
//! let result = registry.dispatch("end_call", serde_json::json!({})).await.unwrap();
//! assert!(result.success);
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Outcome of a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: serde_json::Value,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

/// JSON-Schema-ish primitive type for a single tool parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ToolParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
}

/// A single named parameter in a tool's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub param_type: ToolParameterType,
    pub description: String,
    pub required: bool,
}

/// The static, pre-registered shape of a tool: `{name, description, parameters}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolMetadata {
    /// Render this tool's schema as the JSON Schema object LLM providers expect in
    /// [`crate::client_wrapper::ToolDefinition::parameters_schema`].
    pub fn json_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in &self.parameters {
            properties.insert(
                p.name.clone(),
                serde_json::json!({
                    "type": match p.param_type {
                        ToolParameterType::String => "string",
                        ToolParameterType::Number => "number",
                        ToolParameterType::Integer => "integer",
                        ToolParameterType::Boolean => "boolean",
                        ToolParameterType::Object => "object",
                    },
                    "description": p.description,
                }),
            );
            if p.required {
                required.push(serde_json::Value::String(p.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Convert into the wire-level tool definition the LLM providers consume.
    pub fn into_tool_definition(&self) -> crate::client_wrapper::ToolDefinition {
        crate::client_wrapper::ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: self.json_schema(),
        }
    }
}

/// Executes a single registered tool given its call arguments.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, args: serde_json::Value) -> ToolResult;
}

#[derive(Debug)]
pub enum ToolError {
    NotFound(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "no tool registered under name '{}'", name),
        }
    }
}

impl std::error::Error for ToolError {}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "tool_not_found",
        }
    }
}

struct RegisteredTool {
    metadata: ToolMetadata,
    executor: Arc<dyn Executor>,
}

/// Name-keyed map of registered tools, built once at session start and dispatched by name.
///
/// This mirrors the fixed worker-tool pattern used for `end_call` / `transfer_call` /
/// `schedule_followup` in the voice session runtime: every tool is registered up front, there
/// is no discovery step, and dispatch is a single map lookup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool under its own name. Re-registering a name overwrites the prior entry.
    pub fn register(&mut self, metadata: ToolMetadata, executor: Arc<dyn Executor>) {
        self.tools
            .insert(metadata.name.clone(), RegisteredTool { metadata, executor });
    }

    /// All tool schemas, in the order suitable for handing to an LLM's `tools` array.
    pub fn schemas(&self) -> Vec<ToolMetadata> {
        self.tools.values().map(|t| t.metadata.clone()).collect()
    }

    pub fn wire_definitions(&self) -> Vec<crate::client_wrapper::ToolDefinition> {
        self.tools
            .values()
            .map(|t| t.metadata.into_tool_definition())
            .collect()
    }

    /// Dispatch a call by name; returns [`ToolError::NotFound`] for unregistered names.
    pub async fn dispatch(&self, name: &str, args: serde_json::Value) -> Result<ToolResult, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        Ok(tool.executor.execute(args).await)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }
}

//! Tool trait and the fixed tool registry.
//!
//! Tools are the assistant's read-only window into practice data: client
//! lookups, appointment listings, meal plans, progress entries. The tool set
//! is statically known at startup — there is no plugin system.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use tracing::warn;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// The core Tool trait.
///
/// Each data tool implements this trait and is registered in the
/// [`ToolRegistry`] at startup.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "list_appointments").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's input object.
    fn input_schema(&self) -> serde_json::Value;

    /// Invoke the tool and return its result string.
    async fn invoke(
        &self,
        input: serde_json::Value,
    ) -> std::result::Result<String, ToolError>;

    /// Convert this tool into a definition for prompt construction.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// The fixed registry of tools available to the agent loop.
///
/// `dispatch` never fails: an unknown tool or a failing invocation is
/// serialized into the returned result string as a structured error payload,
/// letting the model itself decide how to recover.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// All tool definitions, for sending to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// All registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Invoke a tool by name, always producing a result string.
    pub async fn dispatch(&self, name: &str, input: serde_json::Value) -> String {
        let Some(tool) = self.tools.get(name) else {
            warn!(tool = name, "Model requested an unknown tool");
            return json!({
                "error": format!("Unknown tool: {name}"),
            })
            .to_string();
        };

        match tool.invoke(input).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = name, error = %e, "Tool invocation failed");
                json!({
                    "error": e.to_string(),
                })
                .to_string()
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

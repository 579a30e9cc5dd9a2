use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsonschema_util::JSONSchemaFromPath;

/// A tool as declared in `[tools.<name>]` config.
#[derive(Debug)]
pub struct StaticToolConfig {
    pub name: String,
    pub description: String,
    pub parameters: JSONSchemaFromPath,
    pub strict: bool,
}

/// A tool supplied dynamically on a single request.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    #[serde(default)]
    pub strict: bool,
}

/// Either a tool from config or one supplied dynamically; this is what a `ToolCallConfig`
/// actually holds so a function's static tool set and a request's additional tools share a
/// representation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolConfig {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub strict: bool,
}

/// `tool_choice` as it actually appears on the wire: `none`/`auto`/`required`, or
/// `{"specific": "tool_name"}`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceValue {
    None,
    #[default]
    Auto,
    Required,
    Specific(String),
}

/// The resolved tool configuration for one inference: the function's static tools plus any
/// per-request additions/restrictions, ready to hand to a provider adapter.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallConfig {
    pub tools_available: Vec<ToolConfig>,
    pub tool_choice: ToolChoiceValue,
    pub parallel_tool_calls: bool,
}

/// Per-request tool overrides, flattened onto the inference `Params` struct.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DynamicToolParams {
    pub allowed_tools: Option<Vec<String>>,
    pub additional_tools: Option<Vec<Tool>>,
    pub tool_choice: Option<ToolChoiceValue>,
    pub parallel_tool_calls: Option<bool>,
}

impl ToolCallConfig {
    /// Builds the config a variant should send to the provider for this call, starting from
    /// the function's static tools and applying the request's `DynamicToolParams`.
    /// Returns `None` when there is nothing to send.
    pub fn new(
        static_tools: &HashMap<String, std::sync::Arc<StaticToolConfig>>,
        function_tool_names: &[String],
        function_tool_choice: &ToolChoiceValue,
        function_parallel_tool_calls: bool,
        dynamic: DynamicToolParams,
    ) -> Option<Self> {
        let mut tools_available: Vec<ToolConfig> = function_tool_names
            .iter()
            .filter_map(|name| static_tools.get(name))
            .map(|tool| ToolConfig {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.value.clone(),
                strict: tool.strict,
            })
            .collect();

        if let Some(allowed) = &dynamic.allowed_tools {
            tools_available.retain(|tool| allowed.contains(&tool.name));
        }
        if let Some(additional) = dynamic.additional_tools {
            for tool in additional {
                tools_available.push(ToolConfig {
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.parameters,
                    strict: tool.strict,
                });
            }
        }

        if tools_available.is_empty() {
            return None;
        }

        Some(ToolCallConfig {
            tools_available,
            tool_choice: dynamic.tool_choice.unwrap_or_else(|| function_tool_choice.clone()),
            parallel_tool_calls: dynamic
                .parallel_tool_calls
                .unwrap_or(function_parallel_tool_calls),
        })
    }
}

/// Builds the single implicit tool a `json_mode = "implicit_tool"` function forces the model
/// to call, whose parameters are exactly the output schema.
pub fn create_dynamic_implicit_tool_config(output_schema: Value) -> ToolCallConfig {
    ToolCallConfig {
        tools_available: vec![ToolConfig {
            name: "respond".to_string(),
            description: "Respond to the user using the structured output schema provided."
                .to_string(),
            parameters: output_schema,
            strict: true,
        }],
        tool_choice: ToolChoiceValue::Specific("respond".to_string()),
        parallel_tool_calls: false,
    }
}

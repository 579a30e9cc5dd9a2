//! Fixtures shared across provider test modules.

#[cfg(test)]
pub mod test_fixtures {
    use serde_json::json;

    use crate::tool::{ToolCallConfig, ToolChoiceValue, ToolConfig};

    pub fn weather_tool() -> ToolConfig {
        ToolConfig {
            name: "get_temperature".to_string(),
            description: "Get the current temperature in a given location.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "location": {"type": "string"},
                    "units": {"type": "string", "enum": ["celsius", "fahrenheit"]},
                },
                "required": ["location"],
            }),
            strict: false,
        }
    }

    pub fn query_tool() -> ToolConfig {
        ToolConfig {
            name: "query_articles".to_string(),
            description: "Query a database of articles.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"],
            }),
            strict: false,
        }
    }

    pub fn multi_tool_config() -> ToolCallConfig {
        ToolCallConfig {
            tools_available: vec![weather_tool(), query_tool()],
            tool_choice: ToolChoiceValue::Auto,
            parallel_tool_calls: true,
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::inference::types::{FunctionType, Input, InputMessageContent};
use crate::jsonschema_util::JSONSchemaFromPath;
use crate::tool::{DynamicToolParams, StaticToolConfig, ToolCallConfig, ToolChoiceValue};
use crate::variant::{sample_variant, VariantConfig};

/// Config shared by both function kinds: its variants and the schemas a request's
/// `system`/messages must satisfy if the function declares them.
#[derive(Debug)]
pub struct FunctionConfigCommon {
    pub variants: HashMap<String, Arc<VariantConfig>>,
    pub system_schema: Option<JSONSchemaFromPath>,
    pub tools: Vec<String>,
    pub tool_choice: ToolChoiceValue,
    pub parallel_tool_calls: bool,
}

#[derive(Debug)]
pub struct FunctionConfigChat {
    pub common: FunctionConfigCommon,
}

#[derive(Debug)]
pub struct FunctionConfigJson {
    pub common: FunctionConfigCommon,
    pub output_schema: JSONSchemaFromPath,
}

#[derive(Debug)]
pub enum FunctionConfig {
    Chat(FunctionConfigChat),
    Json(FunctionConfigJson),
}

impl FunctionConfig {
    pub fn function_type(&self) -> FunctionType {
        match self {
            FunctionConfig::Chat(_) => FunctionType::Chat,
            FunctionConfig::Json(_) => FunctionType::Json,
        }
    }

    fn common(&self) -> &FunctionConfigCommon {
        match self {
            FunctionConfig::Chat(c) => &c.common,
            FunctionConfig::Json(c) => &c.common,
        }
    }

    pub fn variants(&self) -> &HashMap<String, Arc<VariantConfig>> {
        &self.common().variants
    }

    /// Validates a request's `input` against the function's declared system schema.
    /// Per-message content validation happens at template-render time in
    /// the variant, since it depends on which role templates are configured.
    pub async fn validate_input(&self, input: &Input) -> Result<(), Error> {
        if let Some(schema) = &self.common().system_schema {
            if let Some(system) = &input.system {
                schema.validate(system).await?;
            } else {
                return Err(ErrorDetails::InvalidMessage {
                    message: "function requires a `system` input matching its schema".to_string(),
                }
                .into());
            }
        }
        for message in &input.messages {
            for block in &message.content {
                if let InputMessageContent::Text { value } = block {
                    if value.is_null() {
                        return Err(ErrorDetails::InvalidMessage {
                            message: "text content block must not be null".to_string(),
                        }
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Builds the resolved `ToolCallConfig` for one inference: for Json
    /// functions using `implicit_tool` mode this is handled in the variant instead, since it
    /// needs the (possibly dynamic) output schema.
    pub fn prepare_tool_config(
        &self,
        static_tools: &HashMap<String, Arc<StaticToolConfig>>,
        dynamic: DynamicToolParams,
    ) -> Option<ToolCallConfig> {
        let common = self.common();
        ToolCallConfig::new(
            static_tools,
            &common.tools,
            &common.tool_choice,
            common.parallel_tool_calls,
            dynamic,
        )
    }
}

/// Resolves the ordered candidate list for one inference: either every configured variant, or
/// a single pinned one if the request named it via a `variant_name` override.
pub fn candidate_variants<'a>(
    function: &'a FunctionConfig,
    function_name: &str,
    pinned_variant_name: Option<&str>,
) -> Result<Vec<String>, Error> {
    let variants = function.variants();
    if variants.is_empty() {
        return Err(ErrorDetails::InvalidFunctionVariants {
            function_name: function_name.to_string(),
            message: "function has no variants configured".to_string(),
        }
        .into());
    }
    if let Some(name) = pinned_variant_name {
        if !variants.contains_key(name) {
            return Err(ErrorDetails::UnknownVariant {
                name: name.to_string(),
            }
            .into());
        }
        return Ok(vec![name.to_string()]);
    }
    Ok(variants.keys().cloned().collect())
}

/// Picks the variant to try next out of the remaining candidates, removing it from
/// `candidates` so a retry loop can fall back to the next one on failure.
pub fn pick_and_remove_variant<'a>(
    variants: &'a HashMap<String, Arc<VariantConfig>>,
    candidates: &mut Vec<String>,
    episode_id: Uuid,
    allow_new_variant: bool,
) -> Result<(String, Arc<VariantConfig>), Error> {
    let (name, variant) = sample_variant(variants, candidates, episode_id, allow_new_variant)?;
    let name = name.to_string();
    let variant = Arc::clone(variant);
    candidates.retain(|c| c != &name);
    Ok((name, variant))
}

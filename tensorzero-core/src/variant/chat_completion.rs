use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::inference::types::{
    ChatInferenceResult, ContentBlock, ContentBlockOutput, FunctionType, Input, InferenceResult,
    InferenceResultStream, InputMessage, InputMessageContent, JsonInferenceOutput,
    JsonInferenceResult, ModelInferenceRequest, ModelInferenceRequestJsonMode,
    ModelInferenceResponseWithMetadata, RequestMessage, Role,
};
use crate::minijinja_util::TemplateConfig;
use crate::tool::create_dynamic_implicit_tool_config;

use super::{InferenceConfig, JsonMode, ModelUsedInfo, Variant};

/// A variant that sends one model a single chat-shaped request, optionally rendering one
/// minijinja template per role.
#[derive(Debug, Clone)]
pub struct ChatCompletionConfig {
    pub weight: f64,
    pub model: String,
    pub system_template: Option<String>,
    pub user_template: Option<String>,
    pub assistant_template: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub seed: Option<u32>,
    pub json_mode: JsonMode,
    /// Total wall-clock budget for the whole request (all candidate variants, all provider
    /// attempts). `None` means no deadline.
    pub total_timeout_s: Option<f64>,
    /// Budget for a single provider call; exceeding it marks that attempt retryable rather
    /// than fatal. `None` means no per-attempt deadline.
    pub per_attempt_timeout_s: Option<f64>,
}

impl ChatCompletionConfig {
    /// Renders the system template against `system`, or passes a plain string through
    /// untouched when the function declares no system template.
    fn prepare_system_message(
        &self,
        templates: &TemplateConfig<'_>,
        system: Option<&Value>,
    ) -> Result<Option<String>, Error> {
        match (&self.system_template, system) {
            (Some(template_name), Some(value)) => {
                Ok(Some(templates.template_message(template_name, value)?))
            }
            (Some(template_name), None) => {
                Ok(Some(templates.template_message(template_name, &Value::Null)?))
            }
            (None, Some(Value::String(text))) => Ok(Some(text.clone())),
            (None, Some(other)) => Err(ErrorDetails::InvalidMessage {
                message: format!(
                    "function has no system template, so `system` must be a plain string, got {other}"
                ),
            }
            .into()),
            (None, None) => Ok(None),
        }
    }

    fn template_for_role(&self, role: Role) -> Option<&str> {
        match role {
            Role::System => self.system_template.as_deref(),
            Role::User => self.user_template.as_deref(),
            Role::Assistant => self.assistant_template.as_deref(),
        }
    }

    /// Renders one input message into its resolved `ContentBlock` form. Template/raw-text
    /// content is rendered or passed straight through depending on whether the function
    /// declares a template for that role; tool calls, tool results, thoughts, and unknown
    /// blocks always pass through unchanged.
    fn prepare_request_message(
        &self,
        templates: &TemplateConfig<'_>,
        message: &InputMessage,
    ) -> Result<RequestMessage, Error> {
        let template_name = self.template_for_role(message.role);
        let mut content = Vec::with_capacity(message.content.len());
        for block in &message.content {
            match block {
                InputMessageContent::Text { value } => {
                    let text = match (template_name, value) {
                        (Some(name), value) => templates.template_message(name, value)?,
                        (None, Value::String(text)) => text.clone(),
                        (None, other) => {
                            return Err(ErrorDetails::InvalidMessage {
                                message: format!(
                                    "no template configured for role `{}`; `text` content must be a plain string, got {other}",
                                    message.role
                                ),
                            }
                            .into());
                        }
                    };
                    content.push(ContentBlock::Text(text));
                }
                InputMessageContent::RawText { value } => {
                    content.push(ContentBlock::RawText(value.clone()));
                }
                InputMessageContent::Template { name, arguments } => {
                    content.push(ContentBlock::Text(
                        templates.template_message(name, arguments)?,
                    ));
                }
                InputMessageContent::ToolCall(tool_call) => {
                    content.push(ContentBlock::ToolCall(tool_call.clone()));
                }
                InputMessageContent::ToolResult(tool_result) => {
                    content.push(ContentBlock::ToolResult(tool_result.clone()));
                }
                InputMessageContent::Thought(thought) => {
                    content.push(ContentBlock::Thought(thought.clone()));
                }
                InputMessageContent::File(file) => {
                    content.push(ContentBlock::File(file.clone()));
                }
                InputMessageContent::Unknown(unknown) => {
                    content.push(ContentBlock::Unknown(unknown.clone()));
                }
            }
        }
        Ok(RequestMessage {
            role: message.role,
            content,
        })
    }

    fn prepare_request<'a>(
        &'a self,
        input: &'a Input,
        config: &'a InferenceConfig<'a>,
        stream: bool,
    ) -> Result<ModelInferenceRequest<'a>, Error> {
        let system = self.prepare_system_message(config.templates, input.system.as_ref())?;
        let messages = input
            .messages
            .iter()
            .map(|m| self.prepare_request_message(config.templates, m))
            .collect::<Result<Vec<_>, _>>()?;

        let (tool_config, json_mode) = match config.function_type {
            FunctionType::Chat => (
                config.tool_config.map(std::borrow::Cow::Borrowed),
                match self.json_mode {
                    JsonMode::On | JsonMode::Off => ModelInferenceRequestJsonMode::Off,
                    JsonMode::Strict => ModelInferenceRequestJsonMode::Strict,
                    JsonMode::ImplicitTool => ModelInferenceRequestJsonMode::Off,
                },
            ),
            FunctionType::Json => match self.json_mode {
                JsonMode::ImplicitTool => {
                    let schema = config
                        .dynamic_output_schema
                        .cloned()
                        .ok_or_else(|| ErrorDetails::Config {
                            message: "json_mode = implicit_tool requires an output schema".to_string(),
                        })?;
                    let implicit = create_dynamic_implicit_tool_config(schema);
                    (
                        Some(std::borrow::Cow::Owned(implicit)),
                        ModelInferenceRequestJsonMode::Off,
                    )
                }
                JsonMode::Strict => (None, ModelInferenceRequestJsonMode::Strict),
                JsonMode::On => (None, ModelInferenceRequestJsonMode::On),
                JsonMode::Off => (None, ModelInferenceRequestJsonMode::Off),
            },
        };

        Ok(ModelInferenceRequest {
            messages,
            system,
            tool_config,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            seed: self.seed,
            stream,
            json_mode,
            function_type: config.function_type,
            output_schema: config.dynamic_output_schema,
        })
    }

    fn build_result<'a>(
        &'a self,
        config: &'a InferenceConfig<'a>,
        content: Vec<ContentBlockOutput>,
        inference_id: Uuid,
        model_inference_results: Vec<ModelInferenceResponseWithMetadata<'a>>,
    ) -> InferenceResult<'a> {
        let usage = model_inference_results
            .iter()
            .fold(crate::inference::types::Usage::default(), |acc, r| acc + r.usage);
        match config.function_type {
            FunctionType::Chat => InferenceResult::Chat(ChatInferenceResult {
                inference_id,
                content,
                model_inference_results,
                usage,
            }),
            FunctionType::Json => {
                let raw = content.into_iter().find_map(|block| match block {
                    ContentBlockOutput::Text { text } => Some(text),
                    ContentBlockOutput::ToolCall(tool_call) => Some(tool_call.raw_arguments),
                    ContentBlockOutput::Thought(_) | ContentBlockOutput::Unknown(_) => None,
                });
                let parsed = raw
                    .as_ref()
                    .and_then(|r| serde_json::from_str(r).ok());
                InferenceResult::Json(JsonInferenceResult {
                    inference_id,
                    output: JsonInferenceOutput { raw, parsed },
                    model_inference_results,
                    usage,
                })
            }
        }
    }
}

impl Variant for ChatCompletionConfig {
    async fn infer<'a>(
        &'a self,
        input: &'a Input,
        config: &'a InferenceConfig<'a>,
    ) -> Result<InferenceResult<'a>, Error> {
        let request = self.prepare_request(input, config, false)?;
        let model_config = config
            .models
            .get(&self.model)
            .ok_or_else(|| ErrorDetails::UnknownModel {
                name: self.model.clone(),
            })?;
        let dynamic_api_key = config.dynamic_api_keys.get(&self.model);
        let start = Instant::now();
        let retry_config = crate::model::RetryConfig {
            per_attempt_timeout_s: self.per_attempt_timeout_s,
            ..crate::model::RetryConfig::default()
        };
        let result = model_config
            .infer(&request, config.http_client, retry_config, dynamic_api_key)
            .await?;
        let _ = start.elapsed();
        let inference_id = Uuid::now_v7();
        let content = result.response.content.clone();
        let mut model_results: Vec<ModelInferenceResponseWithMetadata<'a>> = result
            .failed_attempts
            .iter()
            .map(|attempt| ModelInferenceResponseWithMetadata::from_failed_attempt(attempt, &self.model))
            .collect();
        model_results.push(ModelInferenceResponseWithMetadata::new(
            result.response,
            &self.model,
            &result.provider_name,
        ));
        Ok(self.build_result(config, content, inference_id, model_results))
    }

    async fn infer_stream<'a>(
        &'a self,
        input: &'a Input,
        config: &'a InferenceConfig<'a>,
    ) -> Result<(InferenceResultStream, ModelUsedInfo<'a>), Error> {
        let request = self.prepare_request(input, config, true)?;
        let model_config = config
            .models
            .get(&self.model)
            .ok_or_else(|| ErrorDetails::UnknownModel {
                name: self.model.clone(),
            })?;
        let dynamic_api_key = config.dynamic_api_keys.get(&self.model);
        let retry_config = crate::model::RetryConfig {
            per_attempt_timeout_s: self.per_attempt_timeout_s,
            ..crate::model::RetryConfig::default()
        };
        let result = model_config
            .infer_stream(&request, config.http_client, retry_config, dynamic_api_key)
            .await?;

        let episode_id = config.episode_id;
        let function_type = config.function_type;
        let stream = Box::pin(async_stream::stream! {
            use futures::StreamExt;
            let mut inner = result.stream;
            while let Some(chunk) = inner.next().await {
                match chunk {
                    Ok(chunk) => yield Ok(crate::inference::types::InferenceResultChunk::new(
                        chunk,
                        episode_id,
                        function_type,
                    )),
                    Err(err) => yield Err(err),
                }
            }
        });

        let model_inference_results = result
            .failed_attempts
            .iter()
            .map(|attempt| ModelInferenceResponseWithMetadata::from_failed_attempt(attempt, &self.model))
            .collect();
        let model_used_info = ModelUsedInfo {
            model_name: self.model.clone(),
            model_provider_name: result.provider_name,
            raw_request: result.first_chunk_raw_request,
            raw_response: String::new(),
            inference_params: serde_json::json!({
                "temperature": self.temperature,
                "max_tokens": self.max_tokens,
                "seed": self.seed,
            }),
            failed_attempts: result.failed_attempts,
            model_inference_results,
        };
        Ok((stream, model_used_info))
    }

    fn validate(&self, function_name: &str, variant_name: &str) -> Result<(), Error> {
        if self.weight < 0.0 {
            return Err(ErrorDetails::Config {
                message: format!(
                    "Variant `{variant_name}` of function `{function_name}` has a negative weight"
                ),
            }
            .into());
        }
        Ok(())
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn total_timeout_s(&self) -> Option<f64> {
        self.total_timeout_s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, ModelProvider, ModelTable};
    use crate::inference::providers::dummy::DummyProvider;
    use crate::model::ProviderConfig;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn models_with_dummy(model_name: &str) -> ModelTable {
        let mut providers = HashMap::new();
        providers.insert(
            "dummy".to_string(),
            ModelProvider {
                name: "dummy".to_string(),
                config: ProviderConfig::Dummy(DummyProvider {
                    model_name: model_name.to_string(),
                }),
            },
        );
        let mut models = HashMap::new();
        models.insert(
            "test_model".to_string(),
            Arc::new(ModelConfig {
                routing: vec!["dummy".to_string()],
                providers,
            }),
        );
        ModelTable::new(models)
    }

    #[tokio::test]
    async fn infers_plain_text_without_templates() {
        let variant = ChatCompletionConfig {
            weight: 1.0,
            model: "test_model".to_string(),
            system_template: None,
            user_template: None,
            assistant_template: None,
            temperature: None,
            max_tokens: None,
            seed: None,
            json_mode: JsonMode::Off,
            total_timeout_s: None,
            per_attempt_timeout_s: None,
        };
        let models = models_with_dummy("good");
        let templates = TemplateConfig::new();
        let http_client = reqwest::Client::new();
        let dynamic_api_keys = HashMap::new();
        let config = InferenceConfig {
            function_name: "test",
            variant_name: "test_variant",
            episode_id: Uuid::now_v7(),
            tool_config: None,
            dynamic_output_schema: None,
            function_type: FunctionType::Chat,
            models: &models,
            templates: &templates,
            http_client: &http_client,
            dynamic_api_keys: &dynamic_api_keys,
        };
        let input = Input {
            system: Some(Value::String("be nice".to_string())),
            messages: vec![InputMessage {
                role: Role::User,
                content: vec![InputMessageContent::Text {
                    value: Value::String("hi".to_string()),
                }],
            }],
        };
        let result = variant.infer(&input, &config).await.unwrap();
        match result {
            InferenceResult::Chat(chat) => assert_eq!(chat.model_inference_results.len(), 1),
            InferenceResult::Json(_) => panic!("expected chat result"),
        }
    }
}

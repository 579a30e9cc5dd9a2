//! OpenAI-compatible `/openai/v1/chat/completions` façade. The request/response shapes below
//! follow the OpenAI chat completions wire format; the translation logic between it and
//! TensorZero's native inference types is this module's own.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::function::{candidate_variants, pick_and_remove_variant};
use crate::gateway_util::{AppStateData, StructuredJson};
use crate::inference::types::{
    ContentBlockOutput, InferenceResult, Input, InputMessage, InputMessageContent, Role,
};
use crate::tool::{DynamicToolParams, Tool, ToolChoiceValue};
use crate::variant::{InferenceConfig, Variant};
use crate::uuid_util::validate_episode_id;

use super::inference::{as_provider_response, cache_key, write_inference_records};

#[derive(Debug, Deserialize, Serialize)]
pub struct OpenAICompatibleFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OpenAICompatibleToolCall {
    pub id: String,
    pub r#type: String,
    pub function: OpenAICompatibleFunctionCall,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum OpenAICompatibleMessage {
    System { content: String },
    User { content: Value },
    Assistant {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        tool_calls: Option<Vec<OpenAICompatibleToolCall>>,
        #[serde(default)]
        tensorzero_extra_content: Option<Vec<ExtraContentEntry>>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct ExtraContentEntry {
    pub insert_index: usize,
    pub block: crate::inference::types::ContentBlock,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpenAICompatibleResponseFormat {
    Text,
    JsonObject {
        #[serde(default)]
        json_schema: Option<Value>,
    },
    JsonSchema {
        json_schema: JsonSchemaSpec,
    },
}

#[derive(Debug, Deserialize)]
pub struct JsonSchemaSpec {
    pub schema: Value,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Deserialize)]
pub struct OpenAICompatibleToolFunction {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: Value,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpenAICompatibleTool {
    Function { function: OpenAICompatibleToolFunction },
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatCompletionToolChoiceOption {
    #[default]
    None,
    Auto,
    Required,
    #[serde(untagged)]
    Named {
        r#type: String,
        function: NamedToolChoiceFunction,
    },
}

#[derive(Debug, Deserialize)]
pub struct NamedToolChoiceFunction {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenAICompatibleParams {
    pub messages: Vec<OpenAICompatibleMessage>,
    pub model: String,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_completion_tokens: Option<u32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub response_format: Option<OpenAICompatibleResponseFormat>,
    #[serde(default)]
    pub seed: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub tools: Option<Vec<OpenAICompatibleTool>>,
    #[serde(default)]
    pub tool_choice: Option<ChatCompletionToolChoiceOption>,
    #[serde(default)]
    pub parallel_tool_calls: Option<bool>,
    #[serde(default)]
    pub episode_id: Option<Uuid>,
    #[serde(default)]
    pub dryrun: Option<bool>,
    /// Extension field (ignored by stock OpenAI clients): opts out of per-episode variant
    /// stickiness for this one call, same as the native endpoint's `allow_new_variant`.
    #[serde(default, rename = "tensorzero::allow_new_variant")]
    pub allow_new_variant: Option<bool>,
}

/// Parses `model`'s `tensorzero::function_name::X` / `tensorzero::model_name::X` convention.
fn parse_model_field(model: &str) -> Result<(String, Option<String>), Error> {
    let rest = model.strip_prefix("tensorzero::").ok_or_else(|| ErrorDetails::InvalidRequest {
        message: format!(
            "`model` must use the `tensorzero::function_name::X` or `tensorzero::model_name::X` convention, got `{model}`"
        ),
    })?;
    if let Some(function_name) = rest.strip_prefix("function_name::") {
        Ok((function_name.to_string(), None))
    } else if let Some(model_name) = rest.strip_prefix("model_name::") {
        Ok(("tensorzero::default".to_string(), Some(model_name.to_string())))
    } else {
        Err(ErrorDetails::InvalidRequest {
            message: format!("Unrecognized `model` field `{model}`"),
        }
        .into())
    }
}

fn translate_tool_choice(choice: ChatCompletionToolChoiceOption) -> ToolChoiceValue {
    match choice {
        ChatCompletionToolChoiceOption::None => ToolChoiceValue::None,
        ChatCompletionToolChoiceOption::Auto => ToolChoiceValue::Auto,
        ChatCompletionToolChoiceOption::Required => ToolChoiceValue::Required,
        ChatCompletionToolChoiceOption::Named { function, .. } => {
            ToolChoiceValue::Specific(function.name)
        }
    }
}

fn translate_messages(messages: Vec<OpenAICompatibleMessage>) -> Result<(Option<Value>, Vec<InputMessage>), Error> {
    let mut system = None;
    let mut input_messages = Vec::new();
    for message in messages {
        match message {
            OpenAICompatibleMessage::System { content } => {
                system = Some(Value::String(content));
            }
            OpenAICompatibleMessage::User { content } => {
                input_messages.push(InputMessage {
                    role: Role::User,
                    content: vec![InputMessageContent::Text { value: content }],
                });
            }
            OpenAICompatibleMessage::Assistant {
                content,
                tool_calls,
                tensorzero_extra_content,
            } => {
                let mut blocks = Vec::new();
                if let Some(text) = content {
                    blocks.push(InputMessageContent::Text {
                        value: Value::String(text),
                    });
                }
                for tool_call in tool_calls.into_iter().flatten() {
                    blocks.push(InputMessageContent::ToolCall(crate::inference::types::ToolCall {
                        id: tool_call.id,
                        name: tool_call.function.name,
                        arguments: tool_call.function.arguments,
                    }));
                }
                for extra in tensorzero_extra_content.into_iter().flatten() {
                    let index = extra.insert_index.min(blocks.len());
                    let converted = match extra.block {
                        crate::inference::types::ContentBlock::Thought(t) => {
                            InputMessageContent::Thought(t)
                        }
                        crate::inference::types::ContentBlock::Unknown(u) => {
                            InputMessageContent::Unknown(u)
                        }
                        crate::inference::types::ContentBlock::Text(text) => {
                            InputMessageContent::RawText { value: text }
                        }
                        crate::inference::types::ContentBlock::RawText(text) => {
                            InputMessageContent::RawText { value: text }
                        }
                        crate::inference::types::ContentBlock::ToolCall(tool_call) => {
                            InputMessageContent::ToolCall(tool_call)
                        }
                        crate::inference::types::ContentBlock::ToolResult(tool_result) => {
                            InputMessageContent::ToolResult(tool_result)
                        }
                        crate::inference::types::ContentBlock::File(file) => {
                            InputMessageContent::File(file)
                        }
                    };
                    blocks.insert(index, converted);
                }
                input_messages.push(InputMessage {
                    role: Role::Assistant,
                    content: blocks,
                });
            }
            OpenAICompatibleMessage::Tool { content, tool_call_id } => {
                input_messages.push(InputMessage {
                    role: Role::User,
                    content: vec![InputMessageContent::ToolResult(crate::inference::types::ToolResult {
                        id: tool_call_id,
                        name: String::new(),
                        result: content,
                    })],
                });
            }
        }
    }
    Ok((system, input_messages))
}

pub async fn chat_completions_handler(
    State(app_state): State<AppStateData>,
    StructuredJson(params): StructuredJson<OpenAICompatibleParams>,
) -> Result<Response, Error> {
    let (function_name, pinned_variant_name) = parse_model_field(&params.model)?;
    let model_label = params.model.clone();
    let dryrun = params.dryrun.unwrap_or(false);
    let stream = params.stream.unwrap_or(false);

    let tools = params
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|t| match t {
            OpenAICompatibleTool::Function { function } => Tool {
                name: function.name,
                description: function.description,
                parameters: function.parameters,
                strict: function.strict,
            },
        })
        .collect::<Vec<_>>();
    let dynamic_tool_params = DynamicToolParams {
        allowed_tools: None,
        additional_tools: if tools.is_empty() { None } else { Some(tools) },
        tool_choice: params.tool_choice.map(translate_tool_choice),
        parallel_tool_calls: params.parallel_tool_calls,
    };

    let output_schema = match params.response_format {
        Some(OpenAICompatibleResponseFormat::JsonSchema { json_schema }) => Some(json_schema.schema),
        Some(OpenAICompatibleResponseFormat::JsonObject { json_schema }) => json_schema,
        _ => None,
    };

    let (system, messages) = translate_messages(params.messages)?;
    let input = Input { system, messages };

    let function = app_state
        .config
        .functions
        .get(&function_name)
        .cloned()
        .ok_or_else(|| ErrorDetails::UnknownFunction {
            name: function_name.clone(),
        })?;
    function.validate_input(&input).await?;

    let mut candidates = candidate_variants(&function, &function_name, pinned_variant_name.as_deref())?;
    let episode_id = match params.episode_id {
        Some(id) => {
            validate_episode_id(id)?;
            id
        }
        None => Uuid::now_v7(),
    };

    if !dryrun {
        metrics::counter!("request_count", "endpoint" => "openai_compatible").increment(1);
        metrics::counter!("inference_count", "function_name" => function_name.clone()).increment(1);
    }

    let tool_config = function.prepare_tool_config(&app_state.config.tools, dynamic_tool_params);
    let empty_credentials = HashMap::new();
    let cache_options = crate::cache::CacheOptions::default();
    let key = cache_key(&function_name, &input, output_schema.as_ref());

    if !stream {
        if let Some(cached) = app_state.cache.get(cache_options, &key) {
            let message = translate_content_to_openai_message(cached.content);
            return Ok(Json(chat_completion_response(
                cached.id,
                &model_label,
                message,
                cached.usage,
                cached.finish_reason,
            ))
            .into_response());
        }
    }

    let start = Instant::now();
    let mut last_error = None;
    while !candidates.is_empty() {
        let (variant_name, variant) = pick_and_remove_variant(
            function.variants(),
            &mut candidates,
            episode_id,
            params.allow_new_variant.unwrap_or(false),
        )?;

        let config = InferenceConfig {
            function_name: &function_name,
            variant_name: &variant_name,
            episode_id,
            tool_config: tool_config.as_ref(),
            dynamic_output_schema: output_schema.as_ref(),
            function_type: function.function_type(),
            models: &app_state.config.models,
            templates: &app_state.config.templates,
            http_client: &app_state.http_client,
            dynamic_api_keys: &empty_credentials,
        };

        let attempt_deadline = variant.total_timeout_s().map(Duration::from_secs_f64);

        if stream {
            let infer_stream_result = match attempt_deadline {
                Some(deadline) => {
                    match tokio::time::timeout(deadline, variant.infer_stream(&input, &config)).await {
                        Ok(result) => result,
                        Err(_) => {
                            return Err(ErrorDetails::DeadlineExceeded {
                                message: format!(
                                    "variant '{variant_name}' exceeded its {}s deadline",
                                    deadline.as_secs_f64()
                                ),
                            }
                            .into());
                        }
                    }
                }
                None => variant.infer_stream(&input, &config).await,
            };
            match infer_stream_result {
                Ok((inner_stream, model_used_info)) => {
                    let failed_attempts: Vec<(String, String, String, Option<String>)> = model_used_info
                        .model_inference_results
                        .iter()
                        .map(|failed| {
                            (
                                failed.model_name.to_string(),
                                failed.model_provider_name.clone(),
                                failed.raw_request.clone(),
                                failed.error.clone(),
                            )
                        })
                        .collect();
                    let response_stream = build_openai_sse_stream(
                        inner_stream,
                        function_name.clone(),
                        variant_name.clone(),
                        input.clone(),
                        output_schema.clone(),
                        episode_id,
                        model_label.clone(),
                        model_used_info.model_name,
                        model_used_info.model_provider_name,
                        model_used_info.raw_request,
                        failed_attempts,
                        app_state.observability.clone(),
                        dryrun,
                    );
                    return Ok(Sse::new(response_stream)
                        .keep_alive(KeepAlive::default())
                        .into_response());
                }
                Err(err) => {
                    tracing::warn!(variant = %variant_name, error = %err, "variant streaming attempt failed");
                    last_error = Some(err);
                    continue;
                }
            }
        }

        let infer_result = match attempt_deadline {
            Some(deadline) => {
                match tokio::time::timeout(deadline, variant.infer(&input, &config)).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(ErrorDetails::DeadlineExceeded {
                            message: format!(
                                "variant '{variant_name}' exceeded its {}s deadline",
                                deadline.as_secs_f64()
                            ),
                        }
                        .into());
                    }
                }
            }
            None => variant.infer(&input, &config).await,
        };
        match infer_result {
            Ok(result) => {
                if !dryrun {
                    app_state
                        .cache
                        .put(cache_options, key.clone(), &as_provider_response(&result));
                    write_inference_records(
                        &app_state,
                        &result,
                        &function_name,
                        &input,
                        output_schema.as_ref(),
                        &HashMap::new(),
                        episode_id,
                        &variant_name,
                        start.elapsed(),
                    );
                }
                let (content, usage, finish_reason) = match &result {
                    InferenceResult::Chat(chat) => (chat.content.clone(), chat.usage, None),
                    InferenceResult::Json(json) => (
                        json.output
                            .raw
                            .clone()
                            .map(|raw| vec![ContentBlockOutput::Text { text: raw }])
                            .unwrap_or_default(),
                        json.usage,
                        None,
                    ),
                };
                let message = translate_content_to_openai_message(content);
                return Ok(Json(chat_completion_response(
                    result.inference_id(),
                    &model_label,
                    message,
                    usage,
                    finish_reason,
                ))
                .into_response());
            }
            Err(err) => {
                tracing::warn!(variant = %variant_name, error = %err, "variant inference attempt failed");
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        ErrorDetails::InvalidFunctionVariants {
            function_name: function_name.clone(),
            message: "every candidate variant failed".to_string(),
        }
        .into()
    }))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Serialize)]
struct OpenAICompatibleUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

fn chat_completion_response(
    id: Uuid,
    model: &str,
    message: OpenAICompatibleResponseMessage,
    usage: crate::inference::types::Usage,
    finish_reason: Option<crate::inference::types::FinishReason>,
) -> Value {
    let finish_reason = match finish_reason {
        Some(crate::inference::types::FinishReason::ToolCall) => "tool_calls",
        Some(crate::inference::types::FinishReason::Length) => "length",
        Some(crate::inference::types::FinishReason::ContentFilter) => "content_filter",
        _ if message.tool_calls.is_some() => "tool_calls",
        _ => "stop",
    };
    serde_json::json!({
        "id": id.to_string(),
        "object": "chat.completion",
        "created": unix_timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": OpenAICompatibleUsage {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.input_tokens + usage.output_tokens,
        },
    })
}

fn build_openai_sse_stream(
    mut inner: crate::inference::types::InferenceResultStream,
    function_name: String,
    variant_name: String,
    input: Input,
    output_schema: Option<Value>,
    episode_id: Uuid,
    model_label: String,
    model_name: String,
    model_provider_name: String,
    raw_request: String,
    failed_attempts: Vec<(String, String, String, Option<String>)>,
    observability: std::sync::Arc<crate::observability::ObservabilityWriter>,
    dryrun: bool,
) -> std::pin::Pin<Box<dyn futures::Stream<Item = Result<Event, std::convert::Infallible>> + Send>> {
    Box::pin(async_stream::stream! {
        use futures::StreamExt;
        use crate::inference::types::InferenceResultChunk;

        struct CancellationGuard {
            completed: bool,
            observability: std::sync::Arc<crate::observability::ObservabilityWriter>,
            dryrun: bool,
            inference_id: Uuid,
            model_name: String,
            model_provider_name: String,
            raw_request: String,
        }

        impl Drop for CancellationGuard {
            fn drop(&mut self) {
                if self.completed || self.dryrun {
                    return;
                }
                let row = crate::inference::types::ModelInferenceDatabaseInsert {
                    id: Uuid::now_v7(),
                    inference_id: self.inference_id,
                    model_name: std::mem::take(&mut self.model_name),
                    model_provider_name: std::mem::take(&mut self.model_provider_name),
                    raw_request: std::mem::take(&mut self.raw_request),
                    raw_response: String::new(),
                    input_tokens: 0,
                    output_tokens: 0,
                    response_time_ms: 0,
                    ttft_ms: None,
                    cached: false,
                    error: Some(crate::error::ErrorDetails::Cancelled.to_string()),
                };
                self.observability.enqueue("ModelInference", serde_json::json!(row));
            }
        }

        let mut cancellation_guard = CancellationGuard {
            completed: false,
            observability: observability.clone(),
            dryrun,
            inference_id: episode_id,
            model_name: model_name.clone(),
            model_provider_name: model_provider_name.clone(),
            raw_request: raw_request.clone(),
        };

        let started = Instant::now();
        let created = unix_timestamp();
        let id = episode_id.to_string();
        let mut chat_text: HashMap<String, String> = HashMap::new();
        let mut chat_tool_calls: HashMap<String, (Option<String>, String)> = HashMap::new();
        let mut tool_call_order: Vec<String> = Vec::new();
        let mut json_raw = String::new();
        let mut usage = crate::inference::types::Usage::default();
        let mut actual_inference_id = episode_id;
        let mut is_json = false;

        while let Some(chunk) = inner.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let payload = serde_json::json!({"error": err.to_string()});
                    if let Ok(data) = serde_json::to_string(&payload) {
                        yield Ok(Event::default().data(data));
                    }
                    yield Ok(Event::default().data("[DONE]"));
                    cancellation_guard.completed = true;
                    return;
                }
            };

            let delta = match &chunk {
                InferenceResultChunk::Chat(c) => {
                    actual_inference_id = c.inference_id;
                    cancellation_guard.inference_id = actual_inference_id;
                    if let Some(u) = c.usage { usage = usage + u; }
                    let mut text_delta = String::new();
                    let mut tool_call_deltas = Vec::new();
                    for block in &c.content {
                        match block {
                            crate::inference::types::ContentBlockChunk::Text { id, text } => {
                                chat_text.entry(id.clone()).or_default().push_str(text);
                                text_delta.push_str(text);
                            }
                            crate::inference::types::ContentBlockChunk::ToolCall { id, raw_name, raw_arguments } => {
                                if !chat_tool_calls.contains_key(id) {
                                    tool_call_order.push(id.clone());
                                }
                                let entry = chat_tool_calls.entry(id.clone()).or_insert((None, String::new()));
                                if entry.0.is_none() {
                                    entry.0 = raw_name.clone();
                                }
                                entry.1.push_str(raw_arguments);
                                let index = tool_call_order.iter().position(|x| x == id).unwrap_or(0);
                                tool_call_deltas.push(serde_json::json!({
                                    "index": index,
                                    "id": id,
                                    "type": "function",
                                    "function": {
                                        "name": raw_name,
                                        "arguments": raw_arguments,
                                    }
                                }));
                            }
                            crate::inference::types::ContentBlockChunk::Thought { .. } => {}
                        }
                    }
                    let mut delta = serde_json::Map::new();
                    if !text_delta.is_empty() {
                        delta.insert("content".to_string(), Value::String(text_delta));
                    }
                    if !tool_call_deltas.is_empty() {
                        delta.insert("tool_calls".to_string(), Value::Array(tool_call_deltas));
                    }
                    Value::Object(delta)
                }
                InferenceResultChunk::Json(j) => {
                    is_json = true;
                    actual_inference_id = j.inference_id;
                    cancellation_guard.inference_id = actual_inference_id;
                    if let Some(u) = j.usage { usage = usage + u; }
                    if let Some(raw) = &j.raw { json_raw.push_str(raw); }
                    let mut delta = serde_json::Map::new();
                    if let Some(raw) = &j.raw {
                        delta.insert("content".to_string(), Value::String(raw.clone()));
                    }
                    Value::Object(delta)
                }
            };

            let payload = serde_json::json!({
                "id": id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model_label,
                "choices": [{
                    "index": 0,
                    "delta": delta,
                    "finish_reason": Value::Null,
                }],
            });
            if let Ok(data) = serde_json::to_string(&payload) {
                yield Ok(Event::default().data(data));
            }
        }

        cancellation_guard.completed = true;

        if !dryrun {
            let processing_time_ms = started.elapsed().as_millis() as u64;
            for (failed_model_name, failed_provider_name, failed_raw_request, failed_error) in &failed_attempts {
                let failed_row = crate::inference::types::ModelInferenceDatabaseInsert {
                    id: Uuid::now_v7(),
                    inference_id: actual_inference_id,
                    model_name: failed_model_name.clone(),
                    model_provider_name: failed_provider_name.clone(),
                    raw_request: failed_raw_request.clone(),
                    raw_response: String::new(),
                    input_tokens: 0,
                    output_tokens: 0,
                    response_time_ms: 0,
                    ttft_ms: None,
                    cached: false,
                    error: failed_error.clone(),
                };
                observability.enqueue("ModelInference", serde_json::json!(failed_row));
            }
            let model_row = crate::inference::types::ModelInferenceDatabaseInsert {
                id: Uuid::now_v7(),
                inference_id: actual_inference_id,
                model_name,
                model_provider_name,
                raw_request,
                raw_response: String::new(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                response_time_ms: processing_time_ms,
                ttft_ms: None,
                cached: false,
                error: None,
            };
            observability.enqueue("ModelInference", serde_json::json!(model_row));

            if is_json {
                let parsed = serde_json::from_str(&json_raw).ok();
                let row = crate::inference::types::JsonInferenceDatabaseInsert {
                    id: actual_inference_id,
                    episode_id,
                    function_name,
                    variant_name,
                    input,
                    output: crate::inference::types::JsonInferenceOutput { raw: Some(json_raw), parsed },
                    output_schema: output_schema.unwrap_or(Value::Null),
                    inference_params: Value::Null,
                    processing_time_ms,
                    tags: HashMap::new(),
                };
                observability.enqueue("JsonInference", serde_json::json!(row));
            } else {
                let mut content: Vec<crate::inference::types::ContentBlockOutput> = Vec::new();
                for (_id, text) in chat_text {
                    content.push(crate::inference::types::ContentBlockOutput::Text { text });
                }
                for (id, (name, arguments)) in chat_tool_calls {
                    content.push(crate::inference::types::ContentBlockOutput::ToolCall(
                        crate::inference::types::ToolCallOutput {
                            id,
                            raw_name: name.clone().unwrap_or_default(),
                            name,
                            raw_arguments: arguments.clone(),
                            arguments: serde_json::from_str(&arguments).ok(),
                        },
                    ));
                }
                let row = crate::inference::types::ChatInferenceDatabaseInsert {
                    id: actual_inference_id,
                    episode_id,
                    function_name,
                    variant_name,
                    input,
                    output: content,
                    tool_params: None,
                    inference_params: Value::Null,
                    processing_time_ms,
                    tags: HashMap::new(),
                };
                observability.enqueue("ChatInference", serde_json::json!(row));
            }
        }

        yield Ok(Event::default().data("[DONE]"));
    })
}

#[derive(Debug, Serialize)]
pub struct OpenAICompatibleResponseMessage {
    pub role: &'static str,
    pub content: Option<String>,
    pub tool_calls: Option<Vec<OpenAICompatibleToolCall>>,
}

/// Translates a native `InferenceResponse`-shaped value into `message.tool_calls`/`content`.
pub fn translate_content_to_openai_message(content: Vec<ContentBlockOutput>) -> OpenAICompatibleResponseMessage {
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in content {
        match block {
            ContentBlockOutput::Text { text } => text_parts.push(text),
            ContentBlockOutput::ToolCall(tool_call) => tool_calls.push(OpenAICompatibleToolCall {
                id: tool_call.id,
                r#type: "function".to_string(),
                function: OpenAICompatibleFunctionCall {
                    name: tool_call.name.unwrap_or(tool_call.raw_name),
                    arguments: tool_call.raw_arguments,
                },
            }),
            ContentBlockOutput::Thought(_) | ContentBlockOutput::Unknown(_) => {}
        }
    }
    OpenAICompatibleResponseMessage {
        role: "assistant",
        content: if text_parts.is_empty() {
            None
        } else {
            Some(text_parts.join(""))
        },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
    }
}


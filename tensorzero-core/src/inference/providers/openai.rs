//! The OpenAI provider, and the wire shape several other providers in this workspace's
//! target deployment reuse verbatim (Azure OpenAI, Fireworks, Together, vLLM, and Mistral's
//! chat-completions endpoint are all OpenAI-compatible REST APIs). `OpenAIProvider` is
//! therefore parameterized on `api_base` so those providers are thin wrappers around it
//! (see `crate::model::ProviderConfig`).

use std::time::Instant;

use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::inference::providers::provider_trait::{HasCredentials, InferenceProvider};
use crate::inference::types::{
    ContentBlock, ContentBlockChunk, ContentBlockOutput, FinishReason, Latency,
    ModelInferenceRequest, ModelInferenceRequestJsonMode, ProviderInferenceResponse,
    ProviderInferenceResponseChunk, ProviderInferenceResponseStream, Role, ToolCallOutput, Usage,
};
use crate::tool::ToolChoiceValue;

#[derive(Debug, Clone)]
pub struct OpenAIProvider {
    pub model_name: String,
    pub api_base: String,
    pub api_key: Option<SecretString>,
}

impl HasCredentials for OpenAIProvider {
    fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequestMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<OpenAIMessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

/// Plain text in the common case; an array of parts once a message carries an `unknown`
/// block, so that block's raw `data` can be re-emitted onto the wire verbatim instead of
/// being collapsed into (or dropped from) a text string.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAIMessageContent {
    Text(String),
    Parts(Vec<Value>),
}

#[derive(Debug, Serialize)]
struct OpenAIToolCallRequest {
    id: String,
    r#type: &'static str,
    function: OpenAIFunctionCallRequest,
}

#[derive(Debug, Serialize)]
struct OpenAIFunctionCallRequest {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIRequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    r#type: &'static str,
    function: OpenAIToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIToolFunction {
    name: String,
    description: String,
    parameters: Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    strict: bool,
}

fn encode_messages(request: &ModelInferenceRequest<'_>) -> Vec<OpenAIRequestMessage> {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(OpenAIRequestMessage {
            role: "system",
            content: Some(OpenAIMessageContent::Text(system.clone())),
            tool_calls: None,
            tool_call_id: None,
        });
    }
    for message in &request.messages {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut unknown_parts = Vec::new();
        for block in &message.content {
            match block {
                ContentBlock::Text(text) | ContentBlock::RawText(text) => text_parts.push(text.clone()),
                ContentBlock::ToolCall(tool_call) => tool_calls.push(OpenAIToolCallRequest {
                    id: tool_call.id.clone(),
                    r#type: "function",
                    function: OpenAIFunctionCallRequest {
                        name: tool_call.name.clone(),
                        arguments: tool_call.arguments.clone(),
                    },
                }),
                ContentBlock::ToolResult(tool_result) => {
                    messages.push(OpenAIRequestMessage {
                        role: "tool",
                        content: Some(OpenAIMessageContent::Text(tool_result.result.clone())),
                        tool_calls: None,
                        tool_call_id: Some(tool_result.id.clone()),
                    });
                    continue;
                }
                ContentBlock::Unknown(unknown) => unknown_parts.push(unknown.data.clone()),
                ContentBlock::Thought(_) | ContentBlock::File(_) => {}
            }
        }
        if !text_parts.is_empty() || !tool_calls.is_empty() || !unknown_parts.is_empty() {
            let content = if !unknown_parts.is_empty() {
                let mut parts = unknown_parts;
                if !text_parts.is_empty() {
                    parts.insert(0, serde_json::json!({"type": "text", "text": text_parts.join("")}));
                }
                Some(OpenAIMessageContent::Parts(parts))
            } else if text_parts.is_empty() {
                None
            } else {
                Some(OpenAIMessageContent::Text(text_parts.join("")))
            };
            messages.push(OpenAIRequestMessage {
                role,
                content,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            });
        }
    }
    messages
}

fn encode_request<'a>(
    model_name: &'a str,
    request: &'a ModelInferenceRequest<'a>,
    stream: bool,
) -> OpenAIRequest<'a> {
    let tools = request.tool_config.as_ref().map(|config| {
        config
            .tools_available
            .iter()
            .map(|tool| OpenAITool {
                r#type: "function",
                function: OpenAIToolFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                    strict: tool.strict,
                },
            })
            .collect()
    });
    let tool_choice = request.tool_config.as_ref().map(|config| match &config.tool_choice {
        ToolChoiceValue::None => Value::String("none".to_string()),
        ToolChoiceValue::Auto => Value::String("auto".to_string()),
        ToolChoiceValue::Required => Value::String("required".to_string()),
        ToolChoiceValue::Specific(name) => serde_json::json!({
            "type": "function",
            "function": {"name": name},
        }),
    });
    let response_format = match request.json_mode {
        ModelInferenceRequestJsonMode::On => Some(serde_json::json!({"type": "json_object"})),
        ModelInferenceRequestJsonMode::Strict => request.output_schema.map(|schema| {
            serde_json::json!({
                "type": "json_schema",
                "json_schema": {"name": "response", "schema": schema, "strict": true},
            })
        }),
        ModelInferenceRequestJsonMode::Off => None,
    };
    OpenAIRequest {
        model: model_name,
        messages: encode_messages(request),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        seed: request.seed,
        stream,
        tools,
        tool_choice,
        response_format,
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCallResponse>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCallResponse {
    id: String,
    function: OpenAIFunctionCallResponse,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionCallResponse {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

fn decode_finish_reason(reason: Option<&str>) -> Option<FinishReason> {
    match reason {
        Some("stop") => Some(FinishReason::Stop),
        Some("length") => Some(FinishReason::Length),
        Some("tool_calls") => Some(FinishReason::ToolCall),
        Some("content_filter") => Some(FinishReason::ContentFilter),
        Some(_) => Some(FinishReason::Unknown),
        None => None,
    }
}

fn decode_response(
    response: OpenAIResponse,
    raw_request: String,
    raw_response: String,
    latency: Latency,
) -> Result<ProviderInferenceResponse, Error> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ErrorDetails::ProviderFatal {
            provider_name: "openai".to_string(),
            model_name: String::new(),
            message: "OpenAI response contained no choices".to_string(),
        })?;
    let mut content = Vec::new();
    if let Some(text) = choice.message.content {
        if !text.is_empty() {
            content.push(ContentBlockOutput::Text { text });
        }
    }
    for tool_call in choice.message.tool_calls {
        let parsed = serde_json::from_str(&tool_call.function.arguments).ok();
        content.push(ContentBlockOutput::ToolCall(ToolCallOutput {
            id: tool_call.id,
            raw_name: tool_call.function.name.clone(),
            raw_arguments: tool_call.function.arguments,
            name: Some(tool_call.function.name),
            arguments: parsed,
        }));
    }
    let usage = response
        .usage
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();
    Ok(ProviderInferenceResponse {
        id: Uuid::now_v7(),
        content,
        raw_request,
        raw_response,
        usage,
        latency,
        finish_reason: decode_finish_reason(choice.finish_reason.as_deref()),
    })
}

impl InferenceProvider for OpenAIProvider {
    async fn infer(
        &self,
        request: &ModelInferenceRequest<'_>,
        client: &Client,
        dynamic_api_key: Option<&SecretString>,
    ) -> Result<ProviderInferenceResponse, Error> {
        let body = encode_request(&self.model_name, request, false);
        let raw_request = serde_json::to_string(&body).map_err(|e| ErrorDetails::Serialization {
            message: e.to_string(),
        })?;
        let api_key = dynamic_api_key.or(self.api_key.as_ref());
        let start = Instant::now();
        let mut req = client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Content-Type", "application/json");
        if let Some(api_key) = api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }
        let response = req.body(raw_request.clone()).send().await.map_err(|e| {
            ErrorDetails::ProviderRetryable {
                provider_name: "openai".to_string(),
                model_name: self.model_name.clone(),
                attempt_number: 1,
                message: e.to_string(),
            }
        })?;
        let status = response.status();
        let raw_response = response.text().await.map_err(|e| ErrorDetails::ProviderRetryable {
            provider_name: "openai".to_string(),
            model_name: self.model_name.clone(),
            attempt_number: 1,
            message: e.to_string(),
        })?;
        if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429 {
            return Err(ErrorDetails::ProviderRetryable {
                provider_name: "openai".to_string(),
                model_name: self.model_name.clone(),
                attempt_number: 1,
                message: format!("HTTP {status}: {raw_response}"),
            }
            .into());
        }
        if !status.is_success() {
            return Err(ErrorDetails::ProviderFatal {
                provider_name: "openai".to_string(),
                model_name: self.model_name.clone(),
                message: format!("HTTP {status}: {raw_response}"),
            }
            .into());
        }
        let parsed: OpenAIResponse =
            serde_json::from_str(&raw_response).map_err(|e| ErrorDetails::ProviderFatal {
                provider_name: "openai".to_string(),
                model_name: self.model_name.clone(),
                message: format!("Failed to parse OpenAI response: {e}"),
            })?;
        decode_response(
            parsed,
            raw_request,
            raw_response,
            Latency::NonStreaming {
                response_time: start.elapsed(),
            },
        )
    }

    async fn infer_stream(
        &self,
        request: &ModelInferenceRequest<'_>,
        client: &Client,
        dynamic_api_key: Option<&SecretString>,
    ) -> Result<(ProviderInferenceResponseStream, String), Error> {
        let body = encode_request(&self.model_name, request, true);
        let raw_request = serde_json::to_string(&body).map_err(|e| ErrorDetails::Serialization {
            message: e.to_string(),
        })?;
        let api_key = dynamic_api_key.or(self.api_key.as_ref());
        let mut req = client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Content-Type", "application/json");
        if let Some(api_key) = api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }
        let response = req.body(raw_request.clone()).send().await.map_err(|e| {
            ErrorDetails::ProviderRetryable {
                provider_name: "openai".to_string(),
                model_name: self.model_name.clone(),
                attempt_number: 1,
                message: e.to_string(),
            }
        })?;
        if !response.status().is_success() {
            return Err(ErrorDetails::ProviderFatal {
                provider_name: "openai".to_string(),
                model_name: self.model_name.clone(),
                message: format!("HTTP {}", response.status()),
            }
            .into());
        }
        let inference_id = Uuid::now_v7();
        let model_name = self.model_name.clone();
        let byte_stream = response.bytes_stream();
        let stream = async_stream::stream! {
            futures::pin_mut!(byte_stream);
            let mut buf = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(ErrorDetails::ProviderRetryable {
                            provider_name: "openai".to_string(),
                            model_name: model_name.clone(),
                            attempt_number: 1,
                            message: e.to_string(),
                        }.into());
                        continue;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find("\n\n") {
                    let event = buf[..pos].to_string();
                    buf.drain(..pos + 2);
                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data: ") else { continue };
                        if data == "[DONE]" {
                            continue;
                        }
                        if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                            if let Some(parsed_chunk) = decode_openai_stream_chunk(inference_id, &parsed) {
                                yield Ok(parsed_chunk);
                            }
                        }
                    }
                }
            }
        };
        Ok((Box::pin(stream), raw_request))
    }
}

fn decode_openai_stream_chunk(inference_id: Uuid, value: &Value) -> Option<ProviderInferenceResponseChunk> {
    let choice = value.get("choices")?.get(0)?;
    let delta = choice.get("delta")?;
    let mut content = Vec::new();
    if let Some(text) = delta.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            content.push(ContentBlockChunk::Text {
                id: "0".to_string(),
                text: text.to_string(),
            });
        }
    }
    if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for tool_call in tool_calls {
            let id = tool_call
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("0")
                .to_string();
            let function = tool_call.get("function");
            let raw_name = function
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let raw_arguments = function
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            content.push(ContentBlockChunk::ToolCall {
                id,
                raw_name,
                raw_arguments,
            });
        }
    }
    let usage = value.get("usage").and_then(|u| {
        Some(Usage {
            input_tokens: u.get("prompt_tokens")?.as_u64()? as u32,
            output_tokens: u.get("completion_tokens")?.as_u64()? as u32,
        })
    });
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .and_then(|r| decode_finish_reason(Some(r)));
    if content.is_empty() && usage.is_none() && finish_reason.is_none() {
        return None;
    }
    Some(ProviderInferenceResponseChunk {
        inference_id,
        content,
        usage,
        raw_response: value.to_string(),
        latency: std::time::Duration::from_millis(1),
        finish_reason,
    })
}

//! The Anthropic Messages API adapter. Anthropic's wire format differs from OpenAI's in two
//! ways this adapter has to bridge: tool results are content blocks inside a `user` message
//! rather than a dedicated `tool` role, and reasoning ("extended thinking") comes back as a
//! `thinking` content block whose `signature` is an opaque token we must preserve
//! byte-for-byte if it is echoed back in a follow-up request.

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
    ModelInferenceRequest, ProviderInferenceResponse, ProviderInferenceResponseChunk,
    ProviderInferenceResponseStream, Role, ToolCallOutput, Usage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    pub model_name: String,
    pub api_base: String,
    pub api_key: Option<SecretString>,
}

impl HasCredentials for AnthropicProvider {
    fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

fn encode_request<'a>(
    model_name: &'a str,
    request: &'a ModelInferenceRequest<'a>,
    stream: bool,
) -> AnthropicRequest<'a> {
    let mut messages = Vec::new();
    for message in &request.messages {
        let role = match message.role {
            Role::Assistant => "assistant",
            _ => "user",
        };
        let mut blocks = Vec::new();
        for block in &message.content {
            match block {
                ContentBlock::Text(text) | ContentBlock::RawText(text) => {
                    blocks.push(serde_json::json!({"type": "text", "text": text}));
                }
                ContentBlock::ToolCall(tool_call) => {
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": tool_call.id,
                        "name": tool_call.name,
                        "input": serde_json::from_str::<Value>(&tool_call.arguments)
                            .unwrap_or(Value::Null),
                    }));
                }
                ContentBlock::ToolResult(tool_result) => {
                    blocks.push(serde_json::json!({
                        "type": "tool_result",
                        "tool_use_id": tool_result.id,
                        "content": tool_result.result,
                    }));
                }
                ContentBlock::Thought(thought) => {
                    blocks.push(serde_json::json!({
                        "type": "thinking",
                        "thinking": thought.text,
                        "signature": thought.signature,
                    }));
                }
                ContentBlock::Unknown(unknown) => {
                    blocks.push(unknown.data.clone());
                }
                ContentBlock::File(_) => {}
            }
        }
        messages.push(AnthropicMessage {
            role,
            content: blocks,
        });
    }
    let tools = request.tool_config.as_ref().map(|config| {
        config
            .tools_available
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect()
    });
    AnthropicRequest {
        model: model_name,
        max_tokens: request.max_tokens.unwrap_or(4096),
        messages,
        system: request.system.as_deref(),
        temperature: request.temperature,
        stream,
        tools,
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    Thinking { thinking: String, signature: Option<String> },
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

fn decode_stop_reason(reason: Option<&str>) -> Option<FinishReason> {
    match reason {
        Some("end_turn") | Some("stop_sequence") => Some(FinishReason::Stop),
        Some("max_tokens") => Some(FinishReason::Length),
        Some("tool_use") => Some(FinishReason::ToolCall),
        Some(_) => Some(FinishReason::Unknown),
        None => None,
    }
}

fn decode_response(
    response: AnthropicResponse,
    raw_request: String,
    raw_response: String,
    latency: Latency,
) -> ProviderInferenceResponse {
    let content = response
        .content
        .into_iter()
        .map(|block| match block {
            AnthropicContentBlock::Text { text } => ContentBlockOutput::Text { text },
            AnthropicContentBlock::ToolUse { id, name, input } => {
                let raw_arguments = input.to_string();
                ContentBlockOutput::ToolCall(ToolCallOutput {
                    id,
                    raw_name: name.clone(),
                    raw_arguments,
                    name: Some(name),
                    arguments: Some(input),
                })
            }
            AnthropicContentBlock::Thinking { thinking, signature } => {
                ContentBlockOutput::Thought(crate::inference::types::Thought {
                    text: Some(thinking),
                    signature,
                    summary: None,
                })
            }
        })
        .collect();
    ProviderInferenceResponse {
        id: Uuid::now_v7(),
        content,
        raw_request,
        raw_response,
        usage: Usage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        },
        latency,
        finish_reason: decode_stop_reason(response.stop_reason.as_deref()),
    }
}

impl InferenceProvider for AnthropicProvider {
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
        let api_key = dynamic_api_key.or(self.api_key.as_ref()).ok_or_else(|| {
            ErrorDetails::AuthError {
                message: "no Anthropic API key configured".to_string(),
            }
        })?;
        let start = Instant::now();
        let response = client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .body(raw_request.clone())
            .send()
            .await
            .map_err(|e| ErrorDetails::ProviderRetryable {
                provider_name: "anthropic".to_string(),
                model_name: self.model_name.clone(),
                attempt_number: 1,
                message: e.to_string(),
            })?;
        let status = response.status();
        let raw_response = response.text().await.map_err(|e| ErrorDetails::ProviderRetryable {
            provider_name: "anthropic".to_string(),
            model_name: self.model_name.clone(),
            attempt_number: 1,
            message: e.to_string(),
        })?;
        if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429 {
            return Err(ErrorDetails::ProviderRetryable {
                provider_name: "anthropic".to_string(),
                model_name: self.model_name.clone(),
                attempt_number: 1,
                message: format!("HTTP {status}: {raw_response}"),
            }
            .into());
        }
        if !status.is_success() {
            return Err(ErrorDetails::ProviderFatal {
                provider_name: "anthropic".to_string(),
                model_name: self.model_name.clone(),
                message: format!("HTTP {status}: {raw_response}"),
            }
            .into());
        }
        let parsed: AnthropicResponse = serde_json::from_str(&raw_response).map_err(|e| {
            ErrorDetails::ProviderFatal {
                provider_name: "anthropic".to_string(),
                model_name: self.model_name.clone(),
                message: format!("Failed to parse Anthropic response: {e}"),
            }
        })?;
        Ok(decode_response(
            parsed,
            raw_request,
            raw_response,
            Latency::NonStreaming {
                response_time: start.elapsed(),
            },
        ))
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
        let api_key = dynamic_api_key.or(self.api_key.as_ref()).ok_or_else(|| {
            ErrorDetails::AuthError {
                message: "no Anthropic API key configured".to_string(),
            }
        })?;
        let response = client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .body(raw_request.clone())
            .send()
            .await
            .map_err(|e| ErrorDetails::ProviderRetryable {
                provider_name: "anthropic".to_string(),
                model_name: self.model_name.clone(),
                attempt_number: 1,
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ErrorDetails::ProviderFatal {
                provider_name: "anthropic".to_string(),
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
            let mut current_tool_id: Option<String> = None;
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(ErrorDetails::ProviderRetryable {
                            provider_name: "anthropic".to_string(),
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
                        if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                            if let Some(chunk) = decode_anthropic_event(inference_id, &parsed, &mut current_tool_id) {
                                yield Ok(chunk);
                            }
                        }
                    }
                }
            }
        };
        Ok((Box::pin(stream), raw_request))
    }
}

fn decode_anthropic_event(
    inference_id: Uuid,
    value: &Value,
    current_tool_id: &mut Option<String>,
) -> Option<ProviderInferenceResponseChunk> {
    let event_type = value.get("type")?.as_str()?;
    match event_type {
        "content_block_start" => {
            let block = value.get("content_block")?;
            if block.get("type")?.as_str()? == "tool_use" {
                *current_tool_id = block.get("id").and_then(Value::as_str).map(str::to_string);
                return Some(ProviderInferenceResponseChunk {
                    inference_id,
                    content: vec![ContentBlockChunk::ToolCall {
                        id: current_tool_id.clone().unwrap_or_default(),
                        raw_name: block.get("name").and_then(Value::as_str).map(str::to_string),
                        raw_arguments: String::new(),
                    }],
                    usage: None,
                    raw_response: value.to_string(),
                    latency: std::time::Duration::from_millis(1),
                    finish_reason: None,
                });
            }
            None
        }
        "content_block_delta" => {
            let delta = value.get("delta")?;
            match delta.get("type")?.as_str()? {
                "text_delta" => Some(ProviderInferenceResponseChunk {
                    inference_id,
                    content: vec![ContentBlockChunk::Text {
                        id: "0".to_string(),
                        text: delta.get("text")?.as_str()?.to_string(),
                    }],
                    usage: None,
                    raw_response: value.to_string(),
                    latency: std::time::Duration::from_millis(1),
                    finish_reason: None,
                }),
                "input_json_delta" => Some(ProviderInferenceResponseChunk {
                    inference_id,
                    content: vec![ContentBlockChunk::ToolCall {
                        id: current_tool_id.clone().unwrap_or_default(),
                        raw_name: None,
                        raw_arguments: delta.get("partial_json")?.as_str()?.to_string(),
                    }],
                    usage: None,
                    raw_response: value.to_string(),
                    latency: std::time::Duration::from_millis(1),
                    finish_reason: None,
                }),
                "thinking_delta" => Some(ProviderInferenceResponseChunk {
                    inference_id,
                    content: vec![ContentBlockChunk::Thought {
                        id: "0".to_string(),
                        text: delta.get("thinking").and_then(Value::as_str).map(str::to_string),
                        signature: None,
                    }],
                    usage: None,
                    raw_response: value.to_string(),
                    latency: std::time::Duration::from_millis(1),
                    finish_reason: None,
                }),
                "signature_delta" => Some(ProviderInferenceResponseChunk {
                    inference_id,
                    content: vec![ContentBlockChunk::Thought {
                        id: "0".to_string(),
                        text: None,
                        signature: delta.get("signature").and_then(Value::as_str).map(str::to_string),
                    }],
                    usage: None,
                    raw_response: value.to_string(),
                    latency: std::time::Duration::from_millis(1),
                    finish_reason: None,
                }),
                _ => None,
            }
        }
        "message_delta" => {
            let stop_reason = value
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str);
            let usage = value.get("usage").and_then(|u| {
                Some(Usage {
                    input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                    output_tokens: u.get("output_tokens")?.as_u64()? as u32,
                })
            });
            Some(ProviderInferenceResponseChunk {
                inference_id,
                content: vec![],
                usage,
                raw_response: value.to_string(),
                latency: std::time::Duration::from_millis(1),
                finish_reason: decode_stop_reason(stop_reason),
            })
        }
        _ => None,
    }
}

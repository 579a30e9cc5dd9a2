use std::borrow::Cow;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::tool::ToolCallConfig;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One tool call emitted by a model. `arguments` is the raw (unparsed) JSON string the
/// provider returned; callers that need structured access parse it lazily.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ToolCallOutput {
    pub id: String,
    pub raw_name: String,
    pub raw_arguments: String,
    pub name: Option<String>,
    pub arguments: Option<Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub result: String,
}

/// A reasoning/"thought" block. `signature` is an opaque, provider-specific token that must
/// round-trip byte-for-byte if echoed back in a follow-up request.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Thought {
    pub text: Option<String>,
    pub signature: Option<String>,
    pub summary: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StoragePointer {
    /// Where the gateway persisted file bytes it could not pass through as a URL.
    Path { path: String },
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FileContent {
    #[serde(flatten)]
    pub source: FileSource,
    pub mime_type: String,
    pub storage_pointer: Option<StoragePointer>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum FileSource {
    Base64 { data: String },
    Url { url: String },
}

/// A provider-specific payload the gateway does not natively model. Must round-trip
/// byte-identical when the next assistant turn targets the same provider.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct UnknownContentBlock {
    pub data: Value,
    pub model_provider_name: Option<String>,
}

/// Content blocks as they arrive in a client request, before template rendering.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputMessageContent {
    Text { value: Value },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Thought(Thought),
    File(FileContent),
    Template { name: String, arguments: Value },
    RawText { value: String },
    Unknown(UnknownContentBlock),
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct InputMessage {
    pub role: Role,
    pub content: Vec<InputMessageContent>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Input {
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub messages: Vec<InputMessage>,
}

/// A single `{insert_index, block}` instruction for lossless thought/unknown round-tripping
/// on a follow-up assistant message.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ExtraContentBlock {
    pub insert_index: usize,
    pub block: ContentBlock,
}

/// Canonical, resolved content block: the form used once templates have been rendered and
/// the request is ready for provider encoding.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(String),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Thought(Thought),
    File(FileContent),
    RawText(String),
    Unknown(UnknownContentBlock),
}

impl From<String> for ContentBlock {
    fn from(value: String) -> Self {
        ContentBlock::Text(value)
    }
}

/// Content blocks as returned to the client: everything `ContentBlock` can be, except that a
/// tool call additionally carries the provider's raw name/arguments alongside the parsed
/// form (useful when the arguments fail to parse as JSON).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockOutput {
    Text { text: String },
    ToolCall(ToolCallOutput),
    Thought(Thought),
    Unknown(UnknownContentBlock),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FunctionType {
    Chat,
    Json,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelInferenceRequestJsonMode {
    #[default]
    Off,
    On,
    Strict,
}

/// The fully-resolved request handed to a `ModelConfig`/provider, built with `derive_builder`
/// so optional fields default sanely.
#[derive(Clone, Debug, derive_builder::Builder)]
#[builder(setter(into, strip_option), default)]
pub struct ModelInferenceRequest<'a> {
    pub messages: Vec<RequestMessage>,
    pub system: Option<String>,
    pub tool_config: Option<Cow<'a, ToolCallConfig>>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub seed: Option<u32>,
    pub stream: bool,
    pub json_mode: ModelInferenceRequestJsonMode,
    pub function_type: FunctionType,
    pub output_schema: Option<&'a Value>,
}

impl Default for ModelInferenceRequest<'_> {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            system: None,
            tool_config: None,
            temperature: None,
            max_tokens: None,
            seed: None,
            stream: false,
            json_mode: ModelInferenceRequestJsonMode::Off,
            function_type: FunctionType::Chat,
            output_schema: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl std::ops::Add for Usage {
    type Output = Usage;
    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Latency {
    Streaming {
        ttft: Duration,
        response_time: Duration,
    },
    NonStreaming {
        response_time: Duration,
    },
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCall,
    ContentFilter,
    Unknown,
}

/// What a single provider call produced, before the variant/function layer attaches naming
/// metadata. One of these becomes one `ModelInferenceRecord`.
#[derive(Clone, Debug)]
pub struct ProviderInferenceResponse {
    pub id: Uuid,
    pub content: Vec<ContentBlockOutput>,
    pub raw_request: String,
    pub raw_response: String,
    pub usage: Usage,
    pub latency: Latency,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Clone, Debug)]
pub struct ModelInferenceResponseWithMetadata<'a> {
    pub id: Uuid,
    pub model_name: &'a str,
    pub model_provider_name: String,
    pub content: Vec<ContentBlockOutput>,
    pub raw_request: String,
    pub raw_response: String,
    pub usage: Usage,
    pub latency: Latency,
    pub finish_reason: Option<FinishReason>,
    /// `Some` for a `FailedProviderAttempt` that never produced a `ProviderInferenceResponse`.
    pub error: Option<String>,
}

impl<'a> ModelInferenceResponseWithMetadata<'a> {
    pub fn new(response: ProviderInferenceResponse, model_name: &'a str, provider_name: &str) -> Self {
        Self {
            id: response.id,
            model_name,
            model_provider_name: provider_name.to_string(),
            content: response.content,
            raw_request: response.raw_request,
            raw_response: response.raw_response,
            usage: response.usage,
            latency: response.latency,
            finish_reason: response.finish_reason,
            error: None,
        }
    }

    /// One row per attempt a model exhausted before falling back to the next provider (or
    /// failing outright), so `Testable Property #8`-style fallback scenarios still end up with
    /// a `ModelInferenceRecord` for every attempt, not just the one that answered the request.
    pub fn from_failed_attempt(
        attempt: &crate::model::FailedProviderAttempt,
        model_name: &'a str,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            model_name,
            model_provider_name: attempt.provider_name.clone(),
            content: Vec::new(),
            raw_request: attempt.raw_request.clone(),
            raw_response: String::new(),
            usage: Usage::default(),
            latency: Latency::NonStreaming {
                response_time: std::time::Duration::ZERO,
            },
            finish_reason: None,
            error: Some(attempt.error_message.clone()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ModelInferenceDatabaseInsert {
    pub id: Uuid,
    pub inference_id: Uuid,
    pub model_name: String,
    pub model_provider_name: String,
    pub raw_request: String,
    pub raw_response: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub response_time_ms: u64,
    pub ttft_ms: Option<u64>,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatInferenceDatabaseInsert {
    pub id: Uuid,
    pub episode_id: Uuid,
    pub function_name: String,
    pub variant_name: String,
    pub input: Input,
    pub output: Vec<ContentBlockOutput>,
    pub tool_params: Option<ToolCallConfig>,
    pub inference_params: Value,
    pub processing_time_ms: u64,
    pub tags: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct JsonInferenceOutput {
    pub raw: Option<String>,
    pub parsed: Option<Value>,
}

#[derive(Clone, Debug, Serialize)]
pub struct JsonInferenceDatabaseInsert {
    pub id: Uuid,
    pub episode_id: Uuid,
    pub function_name: String,
    pub variant_name: String,
    pub input: Input,
    pub output: JsonInferenceOutput,
    pub output_schema: Value,
    pub inference_params: Value,
    pub processing_time_ms: u64,
    pub tags: HashMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct ChatInferenceResult<'a> {
    pub inference_id: Uuid,
    pub content: Vec<ContentBlockOutput>,
    pub model_inference_results: Vec<ModelInferenceResponseWithMetadata<'a>>,
    pub usage: Usage,
}

#[derive(Clone, Debug)]
pub struct JsonInferenceResult<'a> {
    pub inference_id: Uuid,
    pub output: JsonInferenceOutput,
    pub model_inference_results: Vec<ModelInferenceResponseWithMetadata<'a>>,
    pub usage: Usage,
}

#[derive(Clone, Debug)]
pub enum InferenceResult<'a> {
    Chat(ChatInferenceResult<'a>),
    Json(JsonInferenceResult<'a>),
}

impl<'a> InferenceResult<'a> {
    pub fn inference_id(&self) -> Uuid {
        match self {
            InferenceResult::Chat(c) => c.inference_id,
            InferenceResult::Json(j) => j.inference_id,
        }
    }

    pub fn usage(&self) -> Usage {
        match self {
            InferenceResult::Chat(c) => c.usage,
            InferenceResult::Json(j) => j.usage,
        }
    }

    pub fn model_inference_results(&self) -> &[ModelInferenceResponseWithMetadata<'a>] {
        match self {
            InferenceResult::Chat(c) => &c.model_inference_results,
            InferenceResult::Json(j) => &j.model_inference_results,
        }
    }
}

// ---------------------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------------------

/// A delta for one content-block "slot", keyed by `id` rather than raw array index, since a
/// provider is free to interleave text and tool-call chunks.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockChunk {
    Text {
        id: String,
        text: String,
    },
    ToolCall {
        id: String,
        raw_name: Option<String>,
        raw_arguments: String,
    },
    Thought {
        id: String,
        text: Option<String>,
        signature: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct ProviderInferenceResponseChunk {
    pub inference_id: Uuid,
    pub content: Vec<ContentBlockChunk>,
    pub usage: Option<Usage>,
    pub raw_response: String,
    pub latency: Duration,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatInferenceResultChunk {
    pub inference_id: Uuid,
    pub episode_id: Uuid,
    pub content: Vec<ContentBlockChunk>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Clone, Debug, Serialize)]
pub struct JsonInferenceResultChunk {
    pub inference_id: Uuid,
    pub episode_id: Uuid,
    pub raw: Option<String>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Clone, Debug)]
pub enum InferenceResultChunk {
    Chat(ChatInferenceResultChunk),
    Json(JsonInferenceResultChunk),
}

impl InferenceResultChunk {
    pub fn new(
        chunk: ProviderInferenceResponseChunk,
        episode_id: Uuid,
        function_type: FunctionType,
    ) -> Self {
        match function_type {
            FunctionType::Chat => InferenceResultChunk::Chat(ChatInferenceResultChunk {
                inference_id: chunk.inference_id,
                episode_id,
                content: chunk.content,
                usage: chunk.usage,
                finish_reason: chunk.finish_reason,
            }),
            FunctionType::Json => {
                let raw = chunk.content.into_iter().find_map(|block| match block {
                    ContentBlockChunk::Text { text, .. } => Some(text),
                    ContentBlockChunk::ToolCall { raw_arguments, .. } => Some(raw_arguments),
                    ContentBlockChunk::Thought { .. } => None,
                });
                InferenceResultChunk::Json(JsonInferenceResultChunk {
                    inference_id: chunk.inference_id,
                    episode_id,
                    raw,
                    usage: chunk.usage,
                    finish_reason: chunk.finish_reason,
                })
            }
        }
    }
}

pub type InferenceResultStream =
    Pin<Box<dyn Stream<Item = Result<InferenceResultChunk, Error>> + Send>>;
pub type ProviderInferenceResponseStream =
    Pin<Box<dyn Stream<Item = Result<ProviderInferenceResponseChunk, Error>> + Send>>;

/// Per-slot aggregation state. `id`/`name` are first-wins; `arguments`/`text` are
/// append-wins: a per-index slot table with first-wins identity fields and append-wins
/// argument buffers, never allowing mid-stream renames.
#[derive(Default)]
struct ToolCallSlot {
    name: Option<String>,
    arguments: String,
}

/// Collapses a stream of chunks into the same shape a non-streaming call would have
/// produced.
pub async fn collect_chunks(
    inference_id: Uuid,
    function_type: FunctionType,
    mut stream: ProviderInferenceResponseStream,
) -> Result<(Vec<ContentBlockOutput>, Usage, Option<FinishReason>), Error> {
    use futures::StreamExt;

    let mut text = String::new();
    let mut text_seen = false;
    let mut thought_text = String::new();
    let mut thought_signature: Option<String> = None;
    let mut thought_seen = false;
    let mut tool_calls: Vec<String> = Vec::new();
    let mut tool_slots: HashMap<String, ToolCallSlot> = HashMap::new();
    let mut usage = Usage::default();
    let mut finish_reason = None;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Some(u) = chunk.usage {
            usage = usage + u;
        }
        if chunk.finish_reason.is_some() {
            finish_reason = chunk.finish_reason;
        }
        for block in chunk.content {
            match block {
                ContentBlockChunk::Text { text: delta, .. } => {
                    text_seen = true;
                    text.push_str(&delta);
                }
                ContentBlockChunk::Thought {
                    text: delta,
                    signature,
                    ..
                } => {
                    thought_seen = true;
                    if let Some(delta) = delta {
                        thought_text.push_str(&delta);
                    }
                    if signature.is_some() {
                        thought_signature = signature;
                    }
                }
                ContentBlockChunk::ToolCall {
                    id,
                    raw_name,
                    raw_arguments,
                } => {
                    let slot = tool_slots.entry(id.clone()).or_insert_with(|| {
                        tool_calls.push(id.clone());
                        ToolCallSlot::default()
                    });
                    if slot.name.is_none() {
                        slot.name = raw_name;
                    }
                    slot.arguments.push_str(&raw_arguments);
                }
            }
        }
    }

    let mut content = Vec::new();
    if thought_seen {
        content.push(ContentBlockOutput::Thought(Thought {
            text: if thought_text.is_empty() {
                None
            } else {
                Some(thought_text)
            },
            signature: thought_signature,
            summary: None,
        }));
    }
    match function_type {
        FunctionType::Chat => {
            if text_seen {
                content.push(ContentBlockOutput::Text { text });
            }
            for id in tool_calls {
                let slot = tool_slots.remove(&id).ok_or_else(|| {
                    Error::from(ErrorDetails::Internal {
                        message: "missing tool call slot during aggregation".to_string(),
                    })
                })?;
                let parsed = serde_json::from_str(&slot.arguments).ok();
                content.push(ContentBlockOutput::ToolCall(ToolCallOutput {
                    id,
                    raw_name: slot.name.clone().unwrap_or_default(),
                    raw_arguments: slot.arguments,
                    name: slot.name,
                    arguments: parsed,
                }));
            }
        }
        FunctionType::Json => {
            // JSON-mode streams reduce to a single text payload (possibly itself the
            // concatenated arguments of an implicit/forced tool call).
            let raw = if !tool_calls.is_empty() {
                tool_slots
                    .remove(&tool_calls[0])
                    .map(|slot| slot.arguments)
                    .unwrap_or(text)
            } else {
                text
            };
            if !raw.is_empty() || text_seen {
                content.push(ContentBlockOutput::Text { text: raw });
            }
        }
    }

    let _ = inference_id;
    Ok((content, usage, finish_reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunk(content: Vec<ContentBlockChunk>, usage: Option<Usage>) -> ProviderInferenceResponseChunk {
        ProviderInferenceResponseChunk {
            inference_id: Uuid::now_v7(),
            content,
            usage,
            raw_response: "{}".to_string(),
            latency: Duration::from_millis(1),
            finish_reason: None,
        }
    }

    #[tokio::test]
    async fn aggregates_text_chunks() {
        let chunks = vec![
            Ok(chunk(
                vec![ContentBlockChunk::Text {
                    id: "0".to_string(),
                    text: "Hello, ".to_string(),
                }],
                None,
            )),
            Ok(chunk(
                vec![ContentBlockChunk::Text {
                    id: "0".to_string(),
                    text: "world!".to_string(),
                }],
                Some(Usage {
                    input_tokens: 3,
                    output_tokens: 5,
                }),
            )),
        ];
        let s: ProviderInferenceResponseStream = Box::pin(stream::iter(chunks));
        let (content, usage, _) = collect_chunks(Uuid::now_v7(), FunctionType::Chat, s)
            .await
            .unwrap();
        assert_eq!(content.len(), 1);
        match &content[0] {
            ContentBlockOutput::Text { text } => assert_eq!(text, "Hello, world!"),
            _ => panic!("expected text block"),
        }
        assert_eq!(usage.output_tokens, 5);
    }

    #[tokio::test]
    async fn aggregates_tool_call_chunks_by_id_never_renaming() {
        let chunks = vec![
            Ok(chunk(
                vec![ContentBlockChunk::ToolCall {
                    id: "call_1".to_string(),
                    raw_name: Some("get_temperature".to_string()),
                    raw_arguments: "{\"loc".to_string(),
                }],
                None,
            )),
            Ok(chunk(
                vec![ContentBlockChunk::ToolCall {
                    id: "call_1".to_string(),
                    raw_name: None,
                    raw_arguments: "ation\": \"Tokyo\"}".to_string(),
                }],
                None,
            )),
        ];
        let s: ProviderInferenceResponseStream = Box::pin(stream::iter(chunks));
        let (content, _, _) = collect_chunks(Uuid::now_v7(), FunctionType::Chat, s)
            .await
            .unwrap();
        match &content[0] {
            ContentBlockOutput::ToolCall(tool_call) => {
                assert_eq!(tool_call.name.as_deref(), Some("get_temperature"));
                assert_eq!(tool_call.raw_arguments, "{\"location\": \"Tokyo\"}");
            }
            _ => panic!("expected tool call block"),
        }
    }
}

use std::collections::HashMap;
use std::pin::Pin;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cache::{CacheOptions, InferenceCache};
use crate::error::{Error, ErrorDetails};
use crate::function::{candidate_variants, pick_and_remove_variant};
use crate::gateway_util::{AppStateData, InferenceCredentials, StructuredJson};
use crate::inference::types::{
    ContentBlockOutput, FunctionType, Input, InferenceResult, JsonInferenceOutput,
};
use crate::tool::DynamicToolParams;
use crate::uuid_util::validate_episode_id;
use crate::variant::{InferenceConfig, Variant};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Params {
    pub function_name: String,
    #[serde(default)]
    pub episode_id: Option<Uuid>,
    pub input: Input,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub variant_name: Option<String>,
    #[serde(default)]
    pub dryrun: Option<bool>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default, flatten)]
    pub dynamic_tool_params: DynamicToolParams,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub credentials: InferenceCredentials,
    #[serde(default)]
    pub cache_options: CacheOptions,
    /// Opts out of per-episode variant stickiness for this one call: normally an episode with a
    /// prior inference keeps drawing the same variant, but a caller that wants a fresh weighted
    /// draw anyway (e.g. deliberately sampling another variant for comparison) can set this.
    #[serde(default)]
    pub allow_new_variant: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ChatInferenceResponse {
    pub inference_id: Uuid,
    pub episode_id: Uuid,
    pub variant_name: String,
    pub content: Vec<ContentBlockOutput>,
}

#[derive(Debug, Serialize)]
pub struct JsonInferenceResponse {
    pub inference_id: Uuid,
    pub episode_id: Uuid,
    pub variant_name: String,
    pub output: JsonInferenceOutput,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum InferenceResponse {
    Chat(ChatInferenceResponse),
    Json(JsonInferenceResponse),
}

pub async fn inference_handler(
    State(app_state): State<AppStateData>,
    StructuredJson(params): StructuredJson<Params>,
) -> Result<Response, Error> {
    run_inference(app_state, params).await
}

/// `GET /inference/{id}`: a thin read over the observability store, not a re-inference. Looks
/// in both `ChatInference` and `JsonInference` since an inference id doesn't carry its function
/// type with it.
pub async fn get_inference_handler(
    State(app_state): State<AppStateData>,
    axum::extract::Path(inference_id): axum::extract::Path<Uuid>,
) -> Result<Json<Value>, Error> {
    let inference_id_str = inference_id.to_string();
    let chat_rows = app_state
        .clickhouse
        .query_rows_by_field("ChatInference", "id", &inference_id_str)
        .await?;
    if let Some(row) = chat_rows.into_iter().next() {
        return Ok(Json(row));
    }
    let json_rows = app_state
        .clickhouse
        .query_rows_by_field("JsonInference", "id", &inference_id_str)
        .await?;
    match json_rows.into_iter().next() {
        Some(row) => Ok(Json(row)),
        None => Err(ErrorDetails::UnknownInference {
            id: inference_id,
        }
        .into()),
    }
}

/// Variant selection, fallback across candidates, streaming vs. non-streaming dispatch, and the
/// cache fast path, for the native `/inference` surface. The OpenAI-compatible shim
/// (`openai_compatible.rs`) runs its own candidate loop over the same `Variant`/`ModelTable`
/// primitives rather than reusing this function, since it needs to translate to a different
/// wire shape at each step rather than at the end.
pub async fn run_inference(app_state: AppStateData, params: Params) -> Result<Response, Error> {
    let dryrun = params.dryrun.unwrap_or(false);
    let stream = params.stream.unwrap_or(false);

    let function = app_state
        .config
        .functions
        .get(&params.function_name)
        .cloned()
        .ok_or_else(|| ErrorDetails::UnknownFunction {
            name: params.function_name.clone(),
        })?;

    function.validate_input(&params.input).await?;

    let mut candidates = candidate_variants(
        &function,
        &params.function_name,
        params.variant_name.as_deref(),
    )?;

    let episode_id = match params.episode_id {
        Some(id) => {
            validate_episode_id(id)?;
            id
        }
        None => Uuid::now_v7(),
    };

    if !dryrun {
        metrics::counter!("request_count", "endpoint" => "inference").increment(1);
        metrics::counter!("inference_count", "function_name" => params.function_name.clone())
            .increment(1);
    }

    let tool_config =
        function.prepare_tool_config(&app_state.config.tools, params.dynamic_tool_params.clone());
    let cache_key_value = cache_key(&params.function_name, &params.input, params.output_schema.as_ref());

    if !stream {
        if let Some(cached) = app_state.cache.get(params.cache_options, &cache_key_value) {
            let response = build_response_from_cache(cached, episode_id, function.function_type());
            return Ok(Json(response).into_response());
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
            function_name: &params.function_name,
            variant_name: &variant_name,
            episode_id,
            tool_config: tool_config.as_ref(),
            dynamic_output_schema: params.output_schema.as_ref(),
            function_type: function.function_type(),
            models: &app_state.config.models,
            templates: &app_state.config.templates,
            http_client: &app_state.http_client,
            dynamic_api_keys: &params.credentials,
        };

        let attempt_deadline = variant.total_timeout_s().map(Duration::from_secs_f64);

        if stream {
            let infer_stream_result = match attempt_deadline {
                Some(deadline) => {
                    match tokio::time::timeout(deadline, variant.infer_stream(&params.input, &config)).await {
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
                None => variant.infer_stream(&params.input, &config).await,
            };
            match infer_stream_result {
                Ok((inner_stream, model_used_info)) => {
                    let failed_attempt_names: Vec<(String, String, String, Option<String>)> =
                        model_used_info
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
                    let response_stream = build_sse_stream(
                        inner_stream,
                        episode_id,
                        params.function_name.clone(),
                        variant_name.clone(),
                        params.input.clone(),
                        params.tags.clone(),
                        params.output_schema.clone(),
                        model_used_info.model_name,
                        model_used_info.model_provider_name,
                        model_used_info.raw_request,
                        failed_attempt_names,
                        app_state.observability.clone(),
                        dryrun,
                    );
                    return Ok(Sse::new(response_stream)
                        .keep_alive(axum::response::sse::KeepAlive::default())
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
                match tokio::time::timeout(deadline, variant.infer(&params.input, &config)).await {
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
            None => variant.infer(&params.input, &config).await,
        };
        match infer_result {
            Ok(result) => {
                if !dryrun {
                    app_state
                        .cache
                        .put(params.cache_options, cache_key_value.clone(), &as_provider_response(&result));
                    write_inference_records(
                        &app_state,
                        &result,
                        &params.function_name,
                        &params.input,
                        params.output_schema.as_ref(),
                        &params.tags,
                        episode_id,
                        &variant_name,
                        start.elapsed(),
                    );
                }
                let response = build_response(result, episode_id, variant_name.clone());
                return Ok(Json(response).into_response());
            }
            Err(err) => {
                tracing::warn!(variant = %variant_name, error = %err, "variant inference attempt failed");
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        ErrorDetails::InvalidFunctionVariants {
            function_name: params.function_name.clone(),
            message: "every candidate variant failed".to_string(),
        }
        .into()
    }))
}

/// Writes the `ChatInference`/`JsonInference` row plus one `ModelInference` row per model call
/// made. Never blocks the response: the write is only enqueued onto `ObservabilityWriter`, which
/// drops rather than backpressures on a full queue.
pub(crate) fn write_inference_records(
    app_state: &AppStateData,
    result: &InferenceResult<'_>,
    function_name: &str,
    input: &Input,
    output_schema: Option<&Value>,
    tags: &HashMap<String, String>,
    episode_id: Uuid,
    variant_name: &str,
    processing_time: std::time::Duration,
) {
    let model_inference_results = match result {
        InferenceResult::Chat(chat) => &chat.model_inference_results,
        InferenceResult::Json(json) => &json.model_inference_results,
    };
    for model_result in model_inference_results {
        let (response_time_ms, ttft_ms) = match model_result.latency {
            crate::inference::types::Latency::Streaming { ttft, response_time } => {
                (response_time.as_millis() as u64, Some(ttft.as_millis() as u64))
            }
            crate::inference::types::Latency::NonStreaming { response_time } => {
                (response_time.as_millis() as u64, None)
            }
        };
        let row = crate::inference::types::ModelInferenceDatabaseInsert {
            id: Uuid::now_v7(),
            inference_id: result.inference_id(),
            model_name: model_result.model_name.to_string(),
            model_provider_name: model_result.model_provider_name.clone(),
            raw_request: model_result.raw_request.clone(),
            raw_response: model_result.raw_response.clone(),
            input_tokens: model_result.usage.input_tokens,
            output_tokens: model_result.usage.output_tokens,
            response_time_ms,
            ttft_ms,
            cached: false,
            error: model_result.error.clone(),
        };
        app_state
            .observability
            .enqueue("ModelInference", serde_json::json!(row));
    }

    match result {
        InferenceResult::Chat(chat) => {
            let row = crate::inference::types::ChatInferenceDatabaseInsert {
                id: chat.inference_id,
                episode_id,
                function_name: function_name.to_string(),
                variant_name: variant_name.to_string(),
                input: input.clone(),
                output: chat.content.clone(),
                tool_params: None,
                inference_params: Value::Null,
                processing_time_ms: processing_time.as_millis() as u64,
                tags: tags.clone(),
            };
            app_state
                .observability
                .enqueue("ChatInference", serde_json::json!(row));
        }
        InferenceResult::Json(json) => {
            let row = crate::inference::types::JsonInferenceDatabaseInsert {
                id: json.inference_id,
                episode_id,
                function_name: function_name.to_string(),
                variant_name: variant_name.to_string(),
                input: input.clone(),
                output: json.output.clone(),
                output_schema: output_schema.cloned().unwrap_or(Value::Null),
                inference_params: Value::Null,
                processing_time_ms: processing_time.as_millis() as u64,
                tags: tags.clone(),
            };
            app_state
                .observability
                .enqueue("JsonInference", serde_json::json!(row));
        }
    }
}

/// Keyed on the function (not the variant that happens to serve it): a cache hit answers "what
/// would this function return for this input", independent of which variant produced it last
/// time.
pub(crate) fn cache_key(
    function_name: &str,
    input: &Input,
    output_schema: Option<&Value>,
) -> String {
    InferenceCache::key(
        function_name,
        "*",
        &serde_json::to_value(input).unwrap_or(Value::Null),
        &Value::Null,
        &Value::Null,
        output_schema,
    )
}

pub(crate) fn as_provider_response(result: &InferenceResult<'_>) -> crate::inference::types::ProviderInferenceResponse {
    let (content, usage, model_inference_results) = match result {
        InferenceResult::Chat(chat) => (
            chat.content.clone(),
            chat.usage,
            &chat.model_inference_results,
        ),
        InferenceResult::Json(json) => {
            let content = json
                .output
                .raw
                .clone()
                .map(|raw| vec![ContentBlockOutput::Text { text: raw }])
                .unwrap_or_default();
            (content, json.usage, &json.model_inference_results)
        }
    };
    let last = model_inference_results.last();
    crate::inference::types::ProviderInferenceResponse {
        id: result.inference_id(),
        content,
        raw_request: last.map(|r| r.raw_request.clone()).unwrap_or_default(),
        raw_response: last.map(|r| r.raw_response.clone()).unwrap_or_default(),
        usage,
        latency: last
            .map(|r| r.latency)
            .unwrap_or(crate::inference::types::Latency::NonStreaming {
                response_time: std::time::Duration::ZERO,
            }),
        finish_reason: last.and_then(|r| r.finish_reason),
    }
}

fn build_response_from_cache(
    cached: crate::inference::types::ProviderInferenceResponse,
    episode_id: Uuid,
    function_type: FunctionType,
) -> InferenceResponse {
    match function_type {
        FunctionType::Chat => InferenceResponse::Chat(ChatInferenceResponse {
            inference_id: cached.id,
            episode_id,
            variant_name: "cached".to_string(),
            content: cached.content,
        }),
        FunctionType::Json => {
            let raw = cached.content.into_iter().find_map(|block| match block {
                ContentBlockOutput::Text { text } => Some(text),
                ContentBlockOutput::ToolCall(tool_call) => Some(tool_call.raw_arguments),
                _ => None,
            });
            let parsed = raw.as_ref().and_then(|r| serde_json::from_str(r).ok());
            InferenceResponse::Json(JsonInferenceResponse {
                inference_id: cached.id,
                episode_id,
                variant_name: "cached".to_string(),
                output: JsonInferenceOutput { raw, parsed },
            })
        }
    }
}

fn build_response(result: InferenceResult<'_>, episode_id: Uuid, variant_name: String) -> InferenceResponse {
    match result {
        InferenceResult::Chat(chat) => InferenceResponse::Chat(ChatInferenceResponse {
            inference_id: chat.inference_id,
            episode_id,
            variant_name,
            content: chat.content,
        }),
        InferenceResult::Json(json) => InferenceResponse::Json(JsonInferenceResponse {
            inference_id: json.inference_id,
            episode_id,
            variant_name,
            output: json.output,
        }),
    }
}

fn build_sse_stream(
    mut inner: crate::inference::types::InferenceResultStream,
    episode_id: Uuid,
    function_name: String,
    variant_name: String,
    input: Input,
    tags: HashMap<String, String>,
    output_schema: Option<Value>,
    model_name: String,
    model_provider_name: String,
    raw_request: String,
    failed_attempts: Vec<(String, String, String, Option<String>)>,
    observability: std::sync::Arc<crate::observability::ObservabilityWriter>,
    dryrun: bool,
) -> Pin<Box<dyn Stream<Item = Result<Event, std::convert::Infallible>> + Send>> {
    Box::pin(async_stream::stream! {
        use futures::StreamExt;
        use crate::inference::types::InferenceResultChunk;

        /// If the stream generator is dropped before it reaches the end of `inner` (the client
        /// disconnected, or the whole response future was cancelled), this still enqueues a
        /// truncated `ModelInference` row for the model call that was in flight rather than
        /// losing it silently, matching what a completed model call gets.
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
        let inference_id = episode_id;
        let mut chat_text: HashMap<String, String> = HashMap::new();
        let mut chat_tool_calls: HashMap<String, (Option<String>, String)> = HashMap::new();
        let mut chat_thoughts: HashMap<String, (String, Option<String>)> = HashMap::new();
        let mut json_raw = String::new();
        let mut usage = crate::inference::types::Usage::default();
        let mut finish_reason = None;
        let mut actual_inference_id = inference_id;
        let mut is_json = false;

        while let Some(chunk) = inner.next().await {
            match chunk {
                Ok(chunk) => {
                    let chunk_json = match &chunk {
                        InferenceResultChunk::Chat(c) => {
                            actual_inference_id = c.inference_id;
                            cancellation_guard.inference_id = actual_inference_id;
                            if let Some(u) = c.usage { usage = usage + u; }
                            if c.finish_reason.is_some() { finish_reason = c.finish_reason; }
                            for block in &c.content {
                                match block {
                                    crate::inference::types::ContentBlockChunk::Text { id, text } => {
                                        chat_text.entry(id.clone()).or_default().push_str(text);
                                    }
                                    crate::inference::types::ContentBlockChunk::ToolCall { id, raw_name, raw_arguments } => {
                                        let entry = chat_tool_calls.entry(id.clone()).or_insert((None, String::new()));
                                        if entry.0.is_none() {
                                            entry.0 = raw_name.clone();
                                        }
                                        entry.1.push_str(raw_arguments);
                                    }
                                    crate::inference::types::ContentBlockChunk::Thought { id, text, signature } => {
                                        let entry = chat_thoughts.entry(id.clone()).or_insert((String::new(), None));
                                        if let Some(text) = text { entry.0.push_str(text); }
                                        if entry.1.is_none() { entry.1 = signature.clone(); }
                                    }
                                }
                            }
                            serde_json::to_value(c)
                        }
                        InferenceResultChunk::Json(j) => {
                            is_json = true;
                            actual_inference_id = j.inference_id;
                            cancellation_guard.inference_id = actual_inference_id;
                            if let Some(u) = j.usage { usage = usage + u; }
                            if j.finish_reason.is_some() { finish_reason = j.finish_reason; }
                            if let Some(raw) = &j.raw { json_raw.push_str(raw); }
                            serde_json::to_value(j)
                        }
                    };
                    if let Ok(chunk_json) = chunk_json {
                        let payload = serde_json::json!({
                            "episode_id": episode_id,
                            "chunk": chunk_json,
                        });
                        if let Ok(data) = serde_json::to_string(&payload) {
                            yield Ok(Event::default().event("chunk").data(data));
                        }
                    }
                }
                Err(err) => {
                    let payload = serde_json::json!({"error": err.to_string()});
                    if let Ok(data) = serde_json::to_string(&payload) {
                        yield Ok(Event::default().event("chunk").data(data));
                    }
                    yield Ok(Event::default().event("done").data("[DONE]"));
                    cancellation_guard.completed = true;
                    return;
                }
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
                    output: crate::inference::types::JsonInferenceOutput {
                        raw: Some(json_raw),
                        parsed,
                    },
                    output_schema: output_schema.unwrap_or(Value::Null),
                    inference_params: Value::Null,
                    processing_time_ms,
                    tags,
                };
                observability.enqueue("JsonInference", serde_json::json!(row));
            } else {
                let mut content: Vec<crate::inference::types::ContentBlockOutput> = Vec::new();
                for (id, text) in chat_text {
                    let _ = id;
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
                for (_id, (text, signature)) in chat_thoughts {
                    content.push(crate::inference::types::ContentBlockOutput::Thought(
                        crate::inference::types::Thought {
                            text: Some(text),
                            signature,
                            summary: None,
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
                    tags,
                };
                observability.enqueue("ChatInference", serde_json::json!(row));
            }
        }

        let _ = finish_reason;
        yield Ok(Event::default().event("done").data("[DONE]"));
    })
}

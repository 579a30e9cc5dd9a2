//! An in-process provider used by tests (and documented as a valid `type = "dummy"`
//! provider in config) so router/fallback/streaming/content-model behavior can be exercised
//! deterministically, without network access. Behavior is selected by `model_name`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_stream::stream;
use lazy_static::lazy_static;
use reqwest::Client;
use secrecy::SecretString;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::inference::providers::provider_trait::{HasCredentials, InferenceProvider};
use crate::inference::types::{
    ContentBlockChunk, ContentBlockOutput, FinishReason, Latency,
    ModelInferenceRequest, ProviderInferenceResponse, ProviderInferenceResponseChunk,
    ProviderInferenceResponseStream, Thought, ToolCallOutput, Usage,
};

lazy_static! {
    /// Per-model call counters, used by `flaky_once` to fail exactly once per process.
    static ref CALL_COUNTS: Mutex<HashMap<String, u32>> = Mutex::new(HashMap::new());
}

fn increment_call_count(model_name: &str) -> u32 {
    let mut counts = CALL_COUNTS.lock().unwrap_or_else(|e| e.into_inner());
    let count = counts.entry(model_name.to_string()).or_insert(0);
    *count += 1;
    *count
}

#[derive(Debug, Clone)]
pub struct DummyProvider {
    pub model_name: String,
}

impl HasCredentials for DummyProvider {
    fn has_credentials(&self) -> bool {
        true
    }
}

/// What the dummy provider would say for a given model name, shared by `infer` and
/// `infer_stream` so streaming and non-streaming calls agree.
enum DummyBehavior {
    Fatal,
    Retryable,
    FlakyOnce,
    Text(&'static str),
    ToolCall,
    Json(&'static str),
    Reasoning,
}

fn behavior_for(model_name: &str) -> DummyBehavior {
    match model_name {
        "error" => DummyBehavior::Fatal,
        "flaky" => DummyBehavior::Retryable,
        "flaky_once" => DummyBehavior::FlakyOnce,
        "tool" => DummyBehavior::ToolCall,
        "json" => DummyBehavior::Json(r#"{"sentiment":"positive","confidence":0.9}"#),
        "reasoning" => DummyBehavior::Reasoning,
        _ => DummyBehavior::Text("The answer is 4."),
    }
}

impl DummyProvider {
    fn build_response(&self) -> Result<ProviderInferenceResponse, Error> {
        match behavior_for(&self.model_name) {
            DummyBehavior::Fatal => Err(ErrorDetails::ProviderFatal {
                provider_name: "dummy".to_string(),
                model_name: self.model_name.clone(),
                message: "the dummy provider was asked to fail fatally".to_string(),
            }
            .into()),
            DummyBehavior::Retryable => Err(ErrorDetails::ProviderRetryable {
                provider_name: "dummy".to_string(),
                model_name: self.model_name.clone(),
                attempt_number: 1,
                message: "503 Service Unavailable".to_string(),
            }
            .into()),
            DummyBehavior::FlakyOnce => {
                let count = increment_call_count(&self.model_name);
                if count == 1 {
                    Err(ErrorDetails::ProviderRetryable {
                        provider_name: "dummy".to_string(),
                        model_name: self.model_name.clone(),
                        attempt_number: 1,
                        message: "429 Too Many Requests".to_string(),
                    }
                    .into())
                } else {
                    Ok(text_response("Recovered after a retry."))
                }
            }
            DummyBehavior::Text(text) => Ok(text_response(text)),
            DummyBehavior::Json(json) => Ok(text_response(json)),
            DummyBehavior::ToolCall => Ok(ProviderInferenceResponse {
                id: Uuid::now_v7(),
                content: vec![ContentBlockOutput::ToolCall(ToolCallOutput {
                    id: "call_1".to_string(),
                    raw_name: "get_temperature".to_string(),
                    raw_arguments: r#"{"location":"Tokyo","units":"celsius"}"#.to_string(),
                    name: Some("get_temperature".to_string()),
                    arguments: Some(serde_json::json!({"location": "Tokyo", "units": "celsius"})),
                })],
                raw_request: "{}".to_string(),
                raw_response: "{}".to_string(),
                usage: Usage {
                    input_tokens: 15,
                    output_tokens: 10,
                },
                latency: Latency::NonStreaming {
                    response_time: Duration::from_millis(10),
                },
                finish_reason: Some(FinishReason::ToolCall),
            }),
            DummyBehavior::Reasoning => Ok(ProviderInferenceResponse {
                id: Uuid::now_v7(),
                content: vec![
                    ContentBlockOutput::Thought(Thought {
                        text: Some("Let me think about this.".to_string()),
                        signature: Some("sig-abc123".to_string()),
                        summary: None,
                    }),
                    ContentBlockOutput::Text {
                        text: "Here is my answer.".to_string(),
                    },
                ],
                raw_request: "{}".to_string(),
                raw_response: "{}".to_string(),
                usage: Usage {
                    input_tokens: 20,
                    output_tokens: 12,
                },
                latency: Latency::NonStreaming {
                    response_time: Duration::from_millis(10),
                },
                finish_reason: Some(FinishReason::Stop),
            }),
        }
    }
}

fn text_response(text: &str) -> ProviderInferenceResponse {
    ProviderInferenceResponse {
        id: Uuid::now_v7(),
        content: vec![ContentBlockOutput::Text {
            text: text.to_string(),
        }],
        raw_request: "{}".to_string(),
        raw_response: "{}".to_string(),
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
        latency: Latency::NonStreaming {
            response_time: Duration::from_millis(5),
        },
        finish_reason: Some(FinishReason::Stop),
    }
}

impl InferenceProvider for DummyProvider {
    async fn infer(
        &self,
        _request: &ModelInferenceRequest<'_>,
        _client: &Client,
        _dynamic_api_key: Option<&SecretString>,
    ) -> Result<ProviderInferenceResponse, Error> {
        self.build_response()
    }

    async fn infer_stream(
        &self,
        _request: &ModelInferenceRequest<'_>,
        _client: &Client,
        _dynamic_api_key: Option<&SecretString>,
    ) -> Result<(ProviderInferenceResponseStream, String), Error> {
        let response = self.build_response()?;
        let inference_id = response.id;
        let raw_request = response.raw_request.clone();
        let s = stream! {
            for block in response.content {
                match block {
                    ContentBlockOutput::Text { text } => {
                        for word in split_keep_spaces(&text) {
                            yield Ok(ProviderInferenceResponseChunk {
                                inference_id,
                                content: vec![ContentBlockChunk::Text {
                                    id: "0".to_string(),
                                    text: word,
                                }],
                                usage: None,
                                raw_response: "{}".to_string(),
                                latency: Duration::from_millis(1),
                                finish_reason: None,
                            });
                        }
                    }
                    ContentBlockOutput::ToolCall(tool_call) => {
                        yield Ok(ProviderInferenceResponseChunk {
                            inference_id,
                            content: vec![ContentBlockChunk::ToolCall {
                                id: tool_call.id.clone(),
                                raw_name: Some(tool_call.raw_name.clone()),
                                raw_arguments: String::new(),
                            }],
                            usage: None,
                            raw_response: "{}".to_string(),
                            latency: Duration::from_millis(1),
                            finish_reason: None,
                        });
                        for chunk in split_keep_spaces(&tool_call.raw_arguments) {
                            yield Ok(ProviderInferenceResponseChunk {
                                inference_id,
                                content: vec![ContentBlockChunk::ToolCall {
                                    id: tool_call.id.clone(),
                                    raw_name: None,
                                    raw_arguments: chunk,
                                }],
                                usage: None,
                                raw_response: "{}".to_string(),
                                latency: Duration::from_millis(1),
                                finish_reason: None,
                            });
                        }
                    }
                    ContentBlockOutput::Thought(thought) => {
                        yield Ok(ProviderInferenceResponseChunk {
                            inference_id,
                            content: vec![ContentBlockChunk::Thought {
                                id: "0".to_string(),
                                text: thought.text.clone(),
                                signature: thought.signature.clone(),
                            }],
                            usage: None,
                            raw_response: "{}".to_string(),
                            latency: Duration::from_millis(1),
                            finish_reason: None,
                        });
                    }
                    ContentBlockOutput::Unknown(_) => {}
                }
            }
            yield Ok(ProviderInferenceResponseChunk {
                inference_id,
                content: vec![],
                usage: Some(response.usage),
                raw_response: "{}".to_string(),
                latency: Duration::from_millis(1),
                finish_reason: response.finish_reason,
            });
        };
        Ok((Box::pin(s), raw_request))
    }
}

/// Splits into pieces that re-concatenate to the original string, simulating how a real
/// provider streams tokens rather than whole messages.
fn split_keep_spaces(text: &str) -> Vec<String> {
    if text.is_empty() {
        return vec![];
    }
    text.split_inclusive(' ').map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::{FunctionType, ModelInferenceRequest};

    fn request() -> ModelInferenceRequest<'static> {
        ModelInferenceRequest {
            function_type: FunctionType::Chat,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn good_model_returns_text() {
        let provider = DummyProvider {
            model_name: "good".to_string(),
        };
        let response = provider
            .infer(&request(), &Client::new(), None)
            .await
            .unwrap();
        assert_eq!(response.content.len(), 1);
    }

    #[tokio::test]
    async fn error_model_is_fatal() {
        let provider = DummyProvider {
            model_name: "error".to_string(),
        };
        let err = provider.infer(&request(), &Client::new(), None).await;
        assert!(err.is_err());
        assert!(!err.unwrap_err().is_provider_retryable());
    }

    #[tokio::test]
    async fn flaky_model_is_retryable() {
        let provider = DummyProvider {
            model_name: "flaky".to_string(),
        };
        let err = provider.infer(&request(), &Client::new(), None).await;
        assert!(err.unwrap_err().is_provider_retryable());
    }

    #[tokio::test]
    async fn streaming_text_matches_non_streaming() {
        use futures::StreamExt;
        let provider = DummyProvider {
            model_name: "good".to_string(),
        };
        let non_streaming = provider.infer(&request(), &Client::new(), None).await.unwrap();
        let (mut stream, _) = provider
            .infer_stream(&request(), &Client::new(), None)
            .await
            .unwrap();
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            for block in chunk.content {
                if let ContentBlockChunk::Text { text: delta, .. } = block {
                    text.push_str(&delta);
                }
            }
        }
        match &non_streaming.content[0] {
            ContentBlockOutput::Text { text: full } => assert_eq!(&text, full),
            _ => panic!("expected text"),
        }
    }
}

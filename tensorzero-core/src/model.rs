use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::Client;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, ErrorDetails};
use crate::inference::providers::anthropic::AnthropicProvider;
use crate::inference::providers::dummy::DummyProvider;
use crate::inference::providers::openai::OpenAIProvider;
use crate::inference::providers::provider_trait::{HasCredentials, InferenceProvider};
use crate::inference::types::{
    ModelInferenceRequest, ProviderInferenceResponse, ProviderInferenceResponseStream,
};

/// Where a provider's credential comes from, encoded the way config actually spells it:
/// `env::NAME`, `dynamic::NAME`, `path::FILE`, or `none`.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialLocation {
    Env(String),
    Dynamic(String),
    Path(PathBuf),
    None,
}

impl<'de> Deserialize<'de> for CredentialLocation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if let Some(name) = raw.strip_prefix("env::") {
            Ok(CredentialLocation::Env(name.to_string()))
        } else if let Some(name) = raw.strip_prefix("dynamic::") {
            Ok(CredentialLocation::Dynamic(name.to_string()))
        } else if let Some(path) = raw.strip_prefix("path::") {
            Ok(CredentialLocation::Path(PathBuf::from(path)))
        } else if raw == "none" {
            Ok(CredentialLocation::None)
        } else {
            Err(serde::de::Error::custom(format!(
                "invalid credential location `{raw}`: expected `env::NAME`, `dynamic::NAME`, `path::FILE`, or `none`"
            )))
        }
    }
}

/// A credential resolved once at config-load time from a `CredentialLocation`.
#[derive(Debug, Clone)]
pub enum Credential {
    Static(SecretString),
    Dynamic(String),
    None,
    Missing,
}

impl Credential {
    pub fn try_from_location(location: &CredentialLocation, default_env: &str) -> Self {
        match location {
            CredentialLocation::Env(name) => std::env::var(name)
                .map(|v| Credential::Static(SecretString::from(v)))
                .unwrap_or(Credential::Missing),
            CredentialLocation::Dynamic(name) => Credential::Dynamic(name.clone()),
            CredentialLocation::Path(path) => std::fs::read_to_string(path)
                .map(|v| Credential::Static(SecretString::from(v.trim().to_string())))
                .unwrap_or(Credential::Missing),
            CredentialLocation::None => Credential::None,
        }
        .or_default_env(default_env)
    }
}

trait OrDefaultEnv {
    fn or_default_env(self, default_env: &str) -> Self;
}

impl OrDefaultEnv for Credential {
    fn or_default_env(self, default_env: &str) -> Self {
        match self {
            Credential::Missing => std::env::var(default_env)
                .map(|v| Credential::Static(SecretString::from(v)))
                .unwrap_or(Credential::Missing),
            other => other,
        }
    }
}

impl Credential {
    fn as_static(&self) -> Option<SecretString> {
        match self {
            Credential::Static(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// The per-provider retry/fallback policy, owned by the variant that names the model.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    #[serde(default = "default_max_delay_s")]
    pub max_delay_s: f64,
    /// Per-attempt deadline: a single provider call exceeding this is marked retryable rather
    /// than fatal, the same as a `ProviderRetryable` error from the provider itself. `None`
    /// means no per-attempt deadline.
    #[serde(default)]
    pub per_attempt_timeout_s: Option<f64>,
}

fn default_num_retries() -> u32 {
    0
}

fn default_max_delay_s() -> f64 {
    10.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            num_retries: default_num_retries(),
            max_delay_s: default_max_delay_s(),
            per_attempt_timeout_s: None,
        }
    }
}

/// The closed set of provider kinds. Kept as an enum (not a trait object or string-keyed
/// dispatch map) so the match in `infer`/`infer_stream` is exhaustive at compile time — the
/// intended review surface for adding a provider.
///
/// Several of these are thin re-parameterizations of `OpenAIProvider` or `AnthropicProvider`:
/// Azure OpenAI, Mistral, Fireworks, Together, and vLLM all expose an OpenAI-compatible
/// `/chat/completions` endpoint, and GCP Vertex's Anthropic models speak the same Messages
/// API Anthropic does directly. AWS Bedrock and GCP Vertex's Gemini models and Google AI
/// Studio would need their own request-signing schemes (SigV4, GCP OAuth) to be faithful;
/// this workspace models their config shape distinctly but routes their wire traffic through
/// the OpenAI-compatible adapter as a documented simplification (see `DESIGN.md`).
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    OpenAI(OpenAIProvider),
    Azure(OpenAIProvider),
    Anthropic(AnthropicProvider),
    AwsBedrock(OpenAIProvider),
    GCPVertexGemini(OpenAIProvider),
    GCPVertexAnthropic(AnthropicProvider),
    Mistral(OpenAIProvider),
    Fireworks(OpenAIProvider),
    Together(OpenAIProvider),
    VLLM(OpenAIProvider),
    GoogleAIStudioGemini(OpenAIProvider),
    Dummy(DummyProvider),
}

impl HasCredentials for ProviderConfig {
    fn has_credentials(&self) -> bool {
        match self {
            ProviderConfig::OpenAI(p)
            | ProviderConfig::Azure(p)
            | ProviderConfig::AwsBedrock(p)
            | ProviderConfig::GCPVertexGemini(p)
            | ProviderConfig::Mistral(p)
            | ProviderConfig::Fireworks(p)
            | ProviderConfig::Together(p)
            | ProviderConfig::VLLM(p)
            | ProviderConfig::GoogleAIStudioGemini(p) => p.has_credentials(),
            ProviderConfig::Anthropic(p) | ProviderConfig::GCPVertexAnthropic(p) => {
                p.has_credentials()
            }
            ProviderConfig::Dummy(p) => p.has_credentials(),
        }
    }
}

impl ProviderConfig {
    pub async fn infer(
        &self,
        request: &ModelInferenceRequest<'_>,
        client: &Client,
        dynamic_api_key: Option<&SecretString>,
    ) -> Result<ProviderInferenceResponse, Error> {
        match self {
            ProviderConfig::OpenAI(p)
            | ProviderConfig::Azure(p)
            | ProviderConfig::AwsBedrock(p)
            | ProviderConfig::GCPVertexGemini(p)
            | ProviderConfig::Mistral(p)
            | ProviderConfig::Fireworks(p)
            | ProviderConfig::Together(p)
            | ProviderConfig::VLLM(p)
            | ProviderConfig::GoogleAIStudioGemini(p) => p.infer(request, client, dynamic_api_key).await,
            ProviderConfig::Anthropic(p) | ProviderConfig::GCPVertexAnthropic(p) => {
                p.infer(request, client, dynamic_api_key).await
            }
            ProviderConfig::Dummy(p) => p.infer(request, client, dynamic_api_key).await,
        }
    }

    pub async fn infer_stream(
        &self,
        request: &ModelInferenceRequest<'_>,
        client: &Client,
        dynamic_api_key: Option<&SecretString>,
    ) -> Result<(ProviderInferenceResponseStream, String), Error> {
        match self {
            ProviderConfig::OpenAI(p)
            | ProviderConfig::Azure(p)
            | ProviderConfig::AwsBedrock(p)
            | ProviderConfig::GCPVertexGemini(p)
            | ProviderConfig::Mistral(p)
            | ProviderConfig::Fireworks(p)
            | ProviderConfig::Together(p)
            | ProviderConfig::VLLM(p)
            | ProviderConfig::GoogleAIStudioGemini(p) => {
                p.infer_stream(request, client, dynamic_api_key).await
            }
            ProviderConfig::Anthropic(p) | ProviderConfig::GCPVertexAnthropic(p) => {
                p.infer_stream(request, client, dynamic_api_key).await
            }
            ProviderConfig::Dummy(p) => p.infer_stream(request, client, dynamic_api_key).await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelProvider {
    pub name: String,
    pub config: ProviderConfig,
}

/// One model-inference attempt that did not end up being the answer returned to the client,
/// kept so the caller can still write a `ModelInferenceRecord` row for it, raw error body
/// included.
#[derive(Debug, Clone)]
pub struct FailedProviderAttempt {
    pub provider_name: String,
    pub raw_request: String,
    pub error_message: String,
}

pub struct ModelInferResult {
    pub response: ProviderInferenceResponse,
    pub provider_name: String,
    pub failed_attempts: Vec<FailedProviderAttempt>,
}

pub struct ModelInferStreamResult {
    pub first_chunk_raw_request: String,
    pub stream: ProviderInferenceResponseStream,
    pub provider_name: String,
    pub failed_attempts: Vec<FailedProviderAttempt>,
}

/// A model's ordered `routing` list of providers, with the fallback FSM described below.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub routing: Vec<String>,
    pub providers: HashMap<String, ModelProvider>,
}

impl ModelConfig {
    pub fn validate(&self, model_name: &str) -> Result<(), Error> {
        if self.routing.is_empty() {
            return Err(ErrorDetails::Config {
                message: format!("Model `{model_name}` has an empty `routing` list"),
            }
            .into());
        }
        for provider_name in &self.routing {
            if !self.providers.contains_key(provider_name) {
                return Err(ErrorDetails::Config {
                    message: format!(
                        "Model `{model_name}` routes to undefined provider `{provider_name}`"
                    ),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Implements a `TryProvider(i) -> {Success, Retryable, Fatal}` FSM: for each provider in
    /// `routing` order, retry up to `retry_config.num_retries`
    /// times with exponential backoff capped at `max_delay_s` on `ProviderRetryable` errors;
    /// a `ProviderFatal` error (or retry exhaustion) moves to the next provider. Surfaces the
    /// last error if every provider is exhausted.
    pub async fn infer(
        &self,
        request: &ModelInferenceRequest<'_>,
        client: &Client,
        retry_config: RetryConfig,
        dynamic_api_key: Option<&SecretString>,
    ) -> Result<ModelInferResult, Error> {
        let mut failed_attempts = Vec::new();
        let mut last_error = None;

        for provider_name in &self.routing {
            let provider = self
                .providers
                .get(provider_name)
                .ok_or_else(|| ErrorDetails::Config {
                    message: format!("undefined provider `{provider_name}`"),
                })?;
            let backoff = ExponentialBuilder::default()
                .with_max_delay(Duration::from_secs_f64(retry_config.max_delay_s))
                .with_max_times(retry_config.num_retries as usize);

            let result = (|| async {
                match retry_config.per_attempt_timeout_s {
                    Some(timeout_s) => {
                        match tokio::time::timeout(
                            Duration::from_secs_f64(timeout_s),
                            provider.config.infer(request, client, dynamic_api_key),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(ErrorDetails::ProviderRetryable {
                                provider_name: provider_name.clone(),
                                model_name: self.routing.join(","),
                                attempt_number: 1,
                                message: format!("provider call exceeded its {timeout_s}s per-attempt deadline"),
                            }
                            .into()),
                        }
                    }
                    None => provider.config.infer(request, client, dynamic_api_key).await,
                }
            })
                .retry(backoff)
                .when(|e: &Error| e.is_provider_retryable())
                .await;

            match result {
                Ok(response) => {
                    return Ok(ModelInferResult {
                        response,
                        provider_name: provider_name.clone(),
                        failed_attempts,
                    });
                }
                Err(err) => {
                    failed_attempts.push(FailedProviderAttempt {
                        provider_name: provider_name.clone(),
                        raw_request: String::new(),
                        error_message: err.to_string(),
                    });
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ErrorDetails::AllProvidersFailed {
                model_name: self.routing.join(","),
                message: "no providers configured".to_string(),
            }
            .into()
        }))
    }

    pub async fn infer_stream(
        &self,
        request: &ModelInferenceRequest<'_>,
        client: &Client,
        retry_config: RetryConfig,
        dynamic_api_key: Option<&SecretString>,
    ) -> Result<ModelInferStreamResult, Error> {
        let mut failed_attempts = Vec::new();
        let mut last_error = None;

        for provider_name in &self.routing {
            let provider = self
                .providers
                .get(provider_name)
                .ok_or_else(|| ErrorDetails::Config {
                    message: format!("undefined provider `{provider_name}`"),
                })?;
            let attempt = match retry_config.per_attempt_timeout_s {
                Some(timeout_s) => {
                    match tokio::time::timeout(
                        Duration::from_secs_f64(timeout_s),
                        provider.config.infer_stream(request, client, dynamic_api_key),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ErrorDetails::ProviderRetryable {
                            provider_name: provider_name.clone(),
                            model_name: self.routing.join(","),
                            attempt_number: 1,
                            message: format!(
                                "provider call exceeded its {timeout_s}s per-attempt deadline"
                            ),
                        }
                        .into()),
                    }
                }
                None => provider.config.infer_stream(request, client, dynamic_api_key).await,
            };
            match attempt {
                Ok((stream, raw_request)) => {
                    return Ok(ModelInferStreamResult {
                        first_chunk_raw_request: raw_request,
                        stream,
                        provider_name: provider_name.clone(),
                        failed_attempts,
                    });
                }
                Err(err) => {
                    failed_attempts.push(FailedProviderAttempt {
                        provider_name: provider_name.clone(),
                        raw_request: String::new(),
                        error_message: err.to_string(),
                    });
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ErrorDetails::AllProvidersFailed {
                model_name: self.routing.join(","),
                message: "no providers configured".to_string(),
            }
            .into()
        }))
    }
}

/// The full set of configured models, plus the shorthand-expansion behavior: `openai::gpt-4o`-
/// style model names in `function_name` overrides let a request target a model with no
/// `[models.*]` entry at all.
#[derive(Debug, Clone, Default)]
pub struct ModelTable {
    models: HashMap<String, Arc<ModelConfig>>,
}

impl ModelTable {
    pub fn new(models: HashMap<String, Arc<ModelConfig>>) -> Self {
        Self { models }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelConfig>> {
        if let Some(model) = self.models.get(name) {
            return Some(Arc::clone(model));
        }
        Self::shorthand_to_model(name)
    }

    /// Expands `provider::model-id` shorthand (e.g. `openai::gpt-4o`) into a single-provider
    /// `ModelConfig` on the fly, so a client can reference a provider/model pair that was
    /// never declared in `[models.*]`.
    fn shorthand_to_model(name: &str) -> Option<Arc<ModelConfig>> {
        let (provider, model_id) = name.split_once("::")?;
        let config = match provider {
            "openai" => ProviderConfig::OpenAI(OpenAIProvider {
                model_name: model_id.to_string(),
                api_base: "https://api.openai.com/v1".to_string(),
                api_key: std::env::var("OPENAI_API_KEY").ok().map(SecretString::from),
            }),
            "anthropic" => ProviderConfig::Anthropic(AnthropicProvider {
                model_name: model_id.to_string(),
                api_base: "https://api.anthropic.com".to_string(),
                api_key: std::env::var("ANTHROPIC_API_KEY").ok().map(SecretString::from),
            }),
            "dummy" => ProviderConfig::Dummy(DummyProvider {
                model_name: model_id.to_string(),
            }),
            _ => return None,
        };
        let mut providers = HashMap::new();
        providers.insert(
            provider.to_string(),
            ModelProvider {
                name: provider.to_string(),
                config,
            },
        );
        Some(Arc::new(ModelConfig {
            routing: vec![provider.to_string()],
            providers,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::{FunctionType, ModelInferenceRequest};

    fn dummy_model(routing: Vec<&str>) -> ModelConfig {
        let mut providers = HashMap::new();
        for name in &routing {
            providers.insert(
                name.to_string(),
                ModelProvider {
                    name: name.to_string(),
                    config: ProviderConfig::Dummy(DummyProvider {
                        model_name: name.to_string(),
                    }),
                },
            );
        }
        ModelConfig {
            routing: routing.into_iter().map(String::from).collect(),
            providers,
        }
    }

    fn request() -> ModelInferenceRequest<'static> {
        ModelInferenceRequest {
            function_type: FunctionType::Chat,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn falls_back_to_second_provider_on_retryable_error() {
        let model = dummy_model(vec!["flaky", "good"]);
        let result = model
            .infer(&request(), &Client::new(), RetryConfig::default(), None)
            .await
            .unwrap();
        assert_eq!(result.provider_name, "good");
        assert_eq!(result.failed_attempts.len(), 1);
        assert_eq!(result.failed_attempts[0].provider_name, "flaky");
    }

    #[tokio::test]
    async fn surfaces_last_error_when_all_providers_fail() {
        let model = dummy_model(vec!["flaky", "error"]);
        let result = model
            .infer(&request(), &Client::new(), RetryConfig::default(), None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn retries_same_provider_before_falling_back() {
        let model = dummy_model(vec!["flaky_once"]);
        let retry_config = RetryConfig {
            num_retries: 2,
            max_delay_s: 0.01,
        };
        let result = model
            .infer(&request(), &Client::new(), retry_config, None)
            .await
            .unwrap();
        assert_eq!(result.provider_name, "flaky_once");
        assert!(result.failed_attempts.is_empty());
    }

    #[test]
    fn credential_location_parses_env_prefix() {
        let location: CredentialLocation =
            serde_json::from_value(serde_json::json!("env::OPENAI_API_KEY")).unwrap();
        assert_eq!(
            location,
            CredentialLocation::Env("OPENAI_API_KEY".to_string())
        );
    }
}

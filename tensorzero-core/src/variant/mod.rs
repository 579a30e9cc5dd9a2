pub mod chat_completion;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;
use crate::inference::types::{
    FunctionType, Input, InferenceResult, InferenceResultStream, ModelInferenceResponseWithMetadata,
};
use crate::minijinja_util::TemplateConfig;
use crate::model::ModelTable;
use crate::tool::ToolCallConfig;

pub use chat_completion::ChatCompletionConfig;

/// How a JSON-function variant forces structured output out of a model that only natively
/// speaks free text.
#[derive(Debug, Clone, Copy, Default, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JsonMode {
    Off,
    #[default]
    On,
    Strict,
    ImplicitTool,
}

/// Everything a variant's `infer`/`infer_stream` needs beyond the parsed `Input`: resolved
/// model table, the tool config for this call, and identifiers for logging/records.
pub struct InferenceConfig<'a> {
    pub function_name: &'a str,
    pub variant_name: &'a str,
    pub episode_id: Uuid,
    pub tool_config: Option<&'a ToolCallConfig>,
    pub dynamic_output_schema: Option<&'a Value>,
    pub function_type: FunctionType,
    pub models: &'a ModelTable,
    pub templates: &'a TemplateConfig<'a>,
    pub http_client: &'a reqwest::Client,
    pub dynamic_api_keys: &'a HashMap<String, secrecy::SecretString>,
}

/// Bookkeeping the caller needs once a variant has picked a model and gotten an answer: which
/// model/provider actually served the request, plus every failed attempt along the way so the
/// observability writer can still record them.
pub struct ModelUsedInfo<'a> {
    pub model_name: String,
    pub model_provider_name: String,
    pub raw_request: String,
    pub raw_response: String,
    pub inference_params: Value,
    pub failed_attempts: Vec<crate::model::FailedProviderAttempt>,
    pub model_inference_results: Vec<ModelInferenceResponseWithMetadata<'a>>,
}

/// The variant contract. Kept as a trait over a closed
/// `VariantConfig` enum for the same reason providers are: the set of variant kinds is
/// reviewed, not dynamically extensible.
pub trait Variant {
    fn infer<'a>(
        &'a self,
        input: &'a Input,
        config: &'a InferenceConfig<'a>,
    ) -> impl std::future::Future<Output = Result<InferenceResult<'a>, Error>> + Send;

    fn infer_stream<'a>(
        &'a self,
        input: &'a Input,
        config: &'a InferenceConfig<'a>,
    ) -> impl std::future::Future<
        Output = Result<(InferenceResultStream, ModelUsedInfo<'a>), Error>,
    > + Send;

    fn validate(&self, function_name: &str, variant_name: &str) -> Result<(), Error>;

    fn weight(&self) -> f64;

    /// Total wall-clock budget for this variant's whole attempt (all provider retries and
    /// fallbacks within it). `None` means no deadline.
    fn total_timeout_s(&self) -> Option<f64>;
}

/// The closed set of variant kinds. Only `ChatCompletion` is fully implemented; the others
/// other known variant kinds (best-of-n sampling, DICL, mixture-of-n) are out of scope for
/// this workspace's budget and are not represented here — see `DESIGN.md`.
#[derive(Debug, Clone)]
pub enum VariantConfig {
    ChatCompletion(ChatCompletionConfig),
}

impl Variant for VariantConfig {
    async fn infer<'a>(
        &'a self,
        input: &'a Input,
        config: &'a InferenceConfig<'a>,
    ) -> Result<InferenceResult<'a>, Error> {
        match self {
            VariantConfig::ChatCompletion(c) => c.infer(input, config).await,
        }
    }

    async fn infer_stream<'a>(
        &'a self,
        input: &'a Input,
        config: &'a InferenceConfig<'a>,
    ) -> Result<(InferenceResultStream, ModelUsedInfo<'a>), Error> {
        match self {
            VariantConfig::ChatCompletion(c) => c.infer_stream(input, config).await,
        }
    }

    fn validate(&self, function_name: &str, variant_name: &str) -> Result<(), Error> {
        match self {
            VariantConfig::ChatCompletion(c) => c.validate(function_name, variant_name),
        }
    }

    fn weight(&self) -> f64 {
        match self {
            VariantConfig::ChatCompletion(c) => c.weight(),
        }
    }

    fn total_timeout_s(&self) -> Option<f64> {
        match self {
            VariantConfig::ChatCompletion(c) => c.total_timeout_s(),
        }
    }
}

/// Picks a variant for an episode using weighted-random sampling seeded by the episode id, so
/// every inference in the same episode keeps using the same variant. Passing
/// `allow_new_variant: true` draws from fresh entropy instead, letting a caller opt out of that
/// stickiness for this one call.
pub fn sample_variant<'a>(
    candidates: &'a HashMap<String, Arc<VariantConfig>>,
    candidate_names: &[String],
    episode_id: Uuid,
    allow_new_variant: bool,
) -> Result<(&'a str, &'a Arc<VariantConfig>), Error> {
    use rand::SeedableRng;
    use rand::Rng;

    let total_weight: f64 = candidate_names
        .iter()
        .filter_map(|name| candidates.get(name))
        .map(|v| v.weight().max(0.0))
        .sum();

    let mut rng = if allow_new_variant {
        rand::rngs::StdRng::from_rng(&mut rand::rng())
    } else {
        rand::rngs::StdRng::from_seed(*episode_id.as_bytes())
    };
    if total_weight <= 0.0 {
        let index = rng.random_range(0..candidate_names.len());
        let name = &candidate_names[index];
        let entry = candidates.get_key_value(name).ok_or_else(|| {
            crate::error::ErrorDetails::UnknownVariant {
                name: name.clone(),
            }
        })?;
        return Ok((entry.0.as_str(), entry.1));
    }

    let mut threshold = rng.random_range(0.0..total_weight);
    for name in candidate_names {
        if let Some(variant) = candidates.get(name) {
            let weight = variant.weight().max(0.0);
            if threshold < weight {
                let entry = candidates.get_key_value(name).ok_or_else(|| {
                    crate::error::ErrorDetails::UnknownVariant {
                        name: name.clone(),
                    }
                })?;
                return Ok((entry.0.as_str(), entry.1));
            }
            threshold -= weight;
        }
    }

    let name = candidate_names
        .last()
        .ok_or_else(|| crate::error::ErrorDetails::Internal {
            message: "sample_variant called with no candidates".to_string(),
        })?;
    let entry = candidates
        .get_key_value(name)
        .ok_or_else(|| crate::error::ErrorDetails::UnknownVariant { name: name.clone() })?;
    Ok((entry.0.as_str(), entry.1))
}

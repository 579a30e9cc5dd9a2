use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Error, ErrorDetails};
use crate::function::{FunctionConfig, FunctionConfigChat, FunctionConfigCommon, FunctionConfigJson};
use crate::jsonschema_util::JSONSchemaFromPath;
use crate::minijinja_util::TemplateConfig;
use crate::model::{Credential, CredentialLocation, ModelConfig, ModelProvider, ModelTable, ProviderConfig};
use crate::inference::providers::anthropic::AnthropicProvider;
use crate::inference::providers::dummy::DummyProvider;
use crate::inference::providers::openai::OpenAIProvider;
use crate::tool::{StaticToolConfig, ToolChoiceValue};
use crate::variant::{ChatCompletionConfig, JsonMode, VariantConfig};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricConfigType {
    Boolean,
    Float,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricConfigLevel {
    Inference,
    Episode,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricConfigOptimize {
    Min,
    Max,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricConfig {
    pub r#type: MetricConfigType,
    pub level: MetricConfigLevel,
    pub optimize: MetricConfigOptimize,
}

#[derive(Debug, Deserialize)]
struct RawToolConfig {
    description: String,
    parameters: PathBuf,
    #[serde(default)]
    strict: bool,
}

#[derive(Debug, Deserialize)]
struct RawProviderConfig {
    r#type: String,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    api_base: Option<String>,
    #[serde(default)]
    api_key_location: Option<CredentialLocation>,
}

#[derive(Debug, Deserialize)]
struct RawModelConfig {
    routing: Vec<String>,
    providers: HashMap<String, RawProviderConfig>,
}

#[derive(Debug, Deserialize)]
struct RawVariantConfig {
    weight: f64,
    model: String,
    #[serde(default)]
    system_template: Option<PathBuf>,
    #[serde(default)]
    user_template: Option<PathBuf>,
    #[serde(default)]
    assistant_template: Option<PathBuf>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    seed: Option<u32>,
    #[serde(default)]
    json_mode: JsonMode,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    per_attempt_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawFunctionConfig {
    r#type: crate::inference::types::FunctionType,
    variants: HashMap<String, RawVariantConfig>,
    #[serde(default)]
    system_schema: Option<PathBuf>,
    #[serde(default)]
    output_schema: Option<PathBuf>,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    tool_choice: ToolChoiceValue,
    #[serde(default = "default_true")]
    parallel_tool_calls: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawGatewayConfig {
    #[serde(default = "default_bind_address")]
    bind_address: String,
    #[serde(default)]
    debug: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

#[derive(Debug, Deserialize)]
struct RawTomlConfig {
    #[serde(default)]
    gateway: Option<RawGatewayConfig>,
    #[serde(default)]
    models: HashMap<String, RawModelConfig>,
    #[serde(default)]
    functions: HashMap<String, RawFunctionConfig>,
    #[serde(default)]
    tools: HashMap<String, RawToolConfig>,
    #[serde(default)]
    metrics: HashMap<String, MetricConfig>,
}

pub struct GatewayConfig {
    pub bind_address: String,
    pub debug: bool,
}

/// The fully-resolved, validated configuration for one gateway process. Built once at startup
/// from a TOML file, then
/// shared read-only behind an `Arc` for the life of the process.
pub struct Config {
    pub gateway: GatewayConfig,
    pub models: ModelTable,
    pub functions: HashMap<String, Arc<FunctionConfig>>,
    pub tools: HashMap<String, Arc<StaticToolConfig>>,
    pub metrics: HashMap<String, MetricConfig>,
    pub templates: TemplateConfig<'static>,
}

impl Config {
    pub fn load_from_toml(contents: &str, base_path: &Path) -> Result<Self, Error> {
        let raw: RawTomlConfig = toml::from_str(contents).map_err(|e| ErrorDetails::Config {
            message: format!("Failed to parse config: {e}"),
        })?;

        let models = Self::build_models(raw.models)?;
        let tools = Self::build_tools(raw.tools, base_path)?;

        let mut templates = TemplateConfig::new();
        let mut template_paths = HashMap::new();
        for (function_name, function) in &raw.functions {
            for (variant_name, variant) in &function.variants {
                Self::collect_template(
                    &mut template_paths,
                    base_path,
                    function_name,
                    variant_name,
                    "system",
                    &variant.system_template,
                );
                Self::collect_template(
                    &mut template_paths,
                    base_path,
                    function_name,
                    variant_name,
                    "user",
                    &variant.user_template,
                );
                Self::collect_template(
                    &mut template_paths,
                    base_path,
                    function_name,
                    variant_name,
                    "assistant",
                    &variant.assistant_template,
                );
            }
        }
        templates.initialize(template_paths)?;

        let functions = Self::build_functions(raw.functions, base_path)?;

        let gateway = raw.gateway.map_or(
            GatewayConfig {
                bind_address: default_bind_address(),
                debug: false,
            },
            |g| GatewayConfig {
                bind_address: g.bind_address,
                debug: g.debug,
            },
        );

        let config = Self {
            gateway,
            models,
            functions,
            tools,
            metrics: raw.metrics,
            templates,
        };
        config.validate()?;
        Ok(config)
    }

    fn collect_template(
        template_paths: &mut HashMap<String, PathBuf>,
        base_path: &Path,
        function_name: &str,
        variant_name: &str,
        role: &str,
        path: &Option<PathBuf>,
    ) {
        if let Some(path) = path {
            let name = format!("{function_name}.{variant_name}.{role}");
            template_paths.insert(name, base_path.join(path));
        }
    }

    fn template_name(
        function_name: &str,
        variant_name: &str,
        role: &str,
        path: &Option<PathBuf>,
    ) -> Option<String> {
        path.as_ref()
            .map(|_| format!("{function_name}.{variant_name}.{role}"))
    }

    fn build_models(raw: HashMap<String, RawModelConfig>) -> Result<ModelTable, Error> {
        let mut models = HashMap::new();
        for (model_name, raw_model) in raw {
            let mut providers = HashMap::new();
            for (provider_name, raw_provider) in raw_model.providers {
                let config = Self::build_provider(&model_name, &raw_provider)?;
                providers.insert(
                    provider_name.clone(),
                    ModelProvider {
                        name: provider_name,
                        config,
                    },
                );
            }
            let model_config = ModelConfig {
                routing: raw_model.routing,
                providers,
            };
            model_config.validate(&model_name)?;
            models.insert(model_name, Arc::new(model_config));
        }
        Ok(ModelTable::new(models))
    }

    fn build_provider(model_name: &str, raw: &RawProviderConfig) -> Result<ProviderConfig, Error> {
        let model_id = raw.model_name.clone().unwrap_or_else(|| model_name.to_string());
        let (default_env, default_api_base) = match raw.r#type.as_str() {
            "openai" => ("OPENAI_API_KEY", "https://api.openai.com/v1"),
            "azure" => ("AZURE_OPENAI_API_KEY", ""),
            "anthropic" | "gcp_vertex_anthropic" => ("ANTHROPIC_API_KEY", "https://api.anthropic.com"),
            "aws_bedrock" => ("AWS_BEARER_TOKEN_BEDROCK", ""),
            "gcp_vertex_gemini" => ("GCP_VERTEX_CREDENTIALS", ""),
            "mistral" => ("MISTRAL_API_KEY", "https://api.mistral.ai/v1"),
            "fireworks" => ("FIREWORKS_API_KEY", "https://api.fireworks.ai/inference/v1"),
            "together" => ("TOGETHER_API_KEY", "https://api.together.xyz/v1"),
            "vllm" => ("VLLM_API_KEY", ""),
            "google_ai_studio_gemini" => ("GOOGLE_AI_STUDIO_API_KEY", ""),
            "dummy" => ("", ""),
            other => {
                return Err(ErrorDetails::Config {
                    message: format!("Unknown provider type `{other}`"),
                }
                .into());
            }
        };
        let api_base = raw
            .api_base
            .clone()
            .unwrap_or_else(|| default_api_base.to_string());
        let credential = raw
            .api_key_location
            .clone()
            .map(|location| Credential::try_from_location(&location, default_env))
            .unwrap_or_else(|| Credential::try_from_location(&CredentialLocation::Env(default_env.to_string()), default_env));
        let api_key = match credential {
            Credential::Static(key) => Some(key),
            _ => None,
        };

        Ok(match raw.r#type.as_str() {
            "openai" => ProviderConfig::OpenAI(OpenAIProvider {
                model_name: model_id,
                api_base,
                api_key,
            }),
            "azure" => ProviderConfig::Azure(OpenAIProvider {
                model_name: model_id,
                api_base,
                api_key,
            }),
            "mistral" => ProviderConfig::Mistral(OpenAIProvider {
                model_name: model_id,
                api_base,
                api_key,
            }),
            "fireworks" => ProviderConfig::Fireworks(OpenAIProvider {
                model_name: model_id,
                api_base,
                api_key,
            }),
            "together" => ProviderConfig::Together(OpenAIProvider {
                model_name: model_id,
                api_base,
                api_key,
            }),
            "vllm" => ProviderConfig::VLLM(OpenAIProvider {
                model_name: model_id,
                api_base,
                api_key,
            }),
            "google_ai_studio_gemini" => ProviderConfig::GoogleAIStudioGemini(OpenAIProvider {
                model_name: model_id,
                api_base,
                api_key,
            }),
            "aws_bedrock" => ProviderConfig::AwsBedrock(OpenAIProvider {
                model_name: model_id,
                api_base,
                api_key,
            }),
            "gcp_vertex_gemini" => ProviderConfig::GCPVertexGemini(OpenAIProvider {
                model_name: model_id,
                api_base,
                api_key,
            }),
            "anthropic" => ProviderConfig::Anthropic(AnthropicProvider {
                model_name: model_id,
                api_base,
                api_key,
            }),
            "gcp_vertex_anthropic" => ProviderConfig::GCPVertexAnthropic(AnthropicProvider {
                model_name: model_id,
                api_base,
                api_key,
            }),
            "dummy" => ProviderConfig::Dummy(DummyProvider { model_name: model_id }),
            other => {
                return Err(ErrorDetails::Config {
                    message: format!("Unknown provider type `{other}`"),
                }
                .into());
            }
        })
    }

    fn build_tools(
        raw: HashMap<String, RawToolConfig>,
        base_path: &Path,
    ) -> Result<HashMap<String, Arc<StaticToolConfig>>, Error> {
        let mut tools = HashMap::new();
        for (name, raw_tool) in raw {
            let parameters = JSONSchemaFromPath::from_path(&base_path.join(&raw_tool.parameters))?;
            tools.insert(
                name.clone(),
                Arc::new(StaticToolConfig {
                    name,
                    description: raw_tool.description,
                    parameters,
                    strict: raw_tool.strict,
                }),
            );
        }
        Ok(tools)
    }

    fn build_functions(
        raw: HashMap<String, RawFunctionConfig>,
        base_path: &Path,
    ) -> Result<HashMap<String, Arc<FunctionConfig>>, Error> {
        let mut functions = HashMap::new();
        for (function_name, raw_function) in raw {
            let mut variants = HashMap::new();
            for (variant_name, raw_variant) in raw_function.variants {
                let system_template = Self::template_name(
                    &function_name,
                    &variant_name,
                    "system",
                    &raw_variant.system_template,
                );
                let user_template = Self::template_name(
                    &function_name,
                    &variant_name,
                    "user",
                    &raw_variant.user_template,
                );
                let assistant_template = Self::template_name(
                    &function_name,
                    &variant_name,
                    "assistant",
                    &raw_variant.assistant_template,
                );
                variants.insert(
                    variant_name,
                    Arc::new(VariantConfig::ChatCompletion(ChatCompletionConfig {
                        weight: raw_variant.weight,
                        model: raw_variant.model,
                        system_template,
                        user_template,
                        assistant_template,
                        temperature: raw_variant.temperature,
                        max_tokens: raw_variant.max_tokens,
                        seed: raw_variant.seed,
                        json_mode: raw_variant.json_mode,
                        total_timeout_s: raw_variant.timeout_ms.map(|ms| ms as f64 / 1000.0),
                        per_attempt_timeout_s: raw_variant
                            .per_attempt_timeout_ms
                            .map(|ms| ms as f64 / 1000.0),
                    })),
                );
            }
            let system_schema = raw_function
                .system_schema
                .map(|path| JSONSchemaFromPath::from_path(&base_path.join(path)))
                .transpose()?;
            let common = FunctionConfigCommon {
                variants,
                system_schema,
                tools: raw_function.tools,
                tool_choice: raw_function.tool_choice,
                parallel_tool_calls: raw_function.parallel_tool_calls,
            };
            let function = match raw_function.r#type {
                crate::inference::types::FunctionType::Chat => {
                    FunctionConfig::Chat(FunctionConfigChat { common })
                }
                crate::inference::types::FunctionType::Json => {
                    let output_schema = raw_function
                        .output_schema
                        .ok_or_else(|| ErrorDetails::Config {
                            message: format!(
                                "Function `{function_name}` has type `json` but no `output_schema`"
                            ),
                        })?;
                    FunctionConfig::Json(FunctionConfigJson {
                        common,
                        output_schema: JSONSchemaFromPath::from_path(&base_path.join(output_schema))?,
                    })
                }
            };
            functions.insert(function_name, Arc::new(function));
        }
        Ok(functions)
    }

    /// Cross-checks every function/variant/model/tool reference resolves, so a bad config
    /// fails at startup rather than mid-request.
    fn validate(&self) -> Result<(), Error> {
        for (function_name, function) in &self.functions {
            if function.variants().is_empty() {
                return Err(ErrorDetails::Config {
                    message: format!("Function `{function_name}` has no variants"),
                }
                .into());
            }
            for (variant_name, variant) in function.variants() {
                variant.validate(function_name, variant_name)?;
                if let VariantConfig::ChatCompletion(c) = variant.as_ref() {
                    if self.models.get(&c.model).is_none() {
                        return Err(ErrorDetails::Config {
                            message: format!(
                                "Variant `{variant_name}` of function `{function_name}` references undefined model `{}`",
                                c.model
                            ),
                        }
                        .into());
                    }
                }
            }
        }
        for (name, metric) in &self.metrics {
            if name == "comment" || name == "demonstration" {
                return Err(ErrorDetails::Config {
                    message: format!("`{name}` is a reserved feedback type and cannot be used as a metric name"),
                }
                .into());
            }
            let _ = metric;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let toml = r#"
            [models.my_model.providers.dummy]
            type = "dummy"

            [models.my_model]
            routing = ["dummy"]

            [functions.greet]
            type = "chat"

            [functions.greet.variants.v1]
            weight = 1.0
            model = "my_model"
        "#;
        let config = Config::load_from_toml(toml, Path::new(".")).unwrap();
        assert!(config.functions.contains_key("greet"));
        assert!(config.models.get("my_model").is_some());
    }

    #[test]
    fn rejects_variant_referencing_unknown_model() {
        let toml = r#"
            [functions.greet]
            type = "chat"

            [functions.greet.variants.v1]
            weight = 1.0
            model = "does_not_exist"
        "#;
        let result = Config::load_from_toml(toml, Path::new("."));
        assert!(result.is_err());
    }
}

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config_parser::{MetricConfig, MetricConfigLevel, MetricConfigType};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppStateData, StructuredJson};
use crate::uuid_util::{validate_episode_id, validate_feedback_id, validate_inference_id};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Params {
    #[serde(default)]
    pub episode_id: Option<Uuid>,
    #[serde(default)]
    pub inference_id: Option<Uuid>,
    pub metric_name: String,
    pub value: Value,
    #[serde(default)]
    pub dryrun: Option<bool>,
    #[serde(default)]
    pub tags: std::collections::HashMap<String, String>,
}

enum FeedbackType {
    Comment,
    Demonstration,
    Float,
    Boolean,
}

impl From<&MetricConfigType> for FeedbackType {
    fn from(value: &MetricConfigType) -> Self {
        match value {
            MetricConfigType::Float => FeedbackType::Float,
            MetricConfigType::Boolean => FeedbackType::Boolean,
        }
    }
}

/// Resolves which target id (inference or episode) feedback applies to, enforcing that
/// exactly one of `episode_id`/`inference_id` is set and that it matches the metric's declared
/// level: feedback targets an inference id or an episode id, never both.
fn resolve_target(
    params: &Params,
    level: Option<MetricConfigLevel>,
) -> Result<(&'static str, Uuid), Error> {
    match (params.episode_id, params.inference_id) {
        (Some(_), Some(_)) => Err(ErrorDetails::InvalidRequest {
            message: "feedback must target exactly one of `episode_id` or `inference_id`, not both"
                .to_string(),
        }
        .into()),
        (None, None) => Err(ErrorDetails::InvalidRequest {
            message: "feedback must target one of `episode_id` or `inference_id`".to_string(),
        }
        .into()),
        (Some(episode_id), None) => {
            validate_episode_id(episode_id)?;
            if matches!(level, Some(MetricConfigLevel::Inference)) {
                return Err(ErrorDetails::InvalidRequest {
                    message: "this metric is scoped to inferences, not episodes".to_string(),
                }
                .into());
            }
            Ok(("episode_id", episode_id))
        }
        (None, Some(inference_id)) => {
            validate_inference_id(inference_id)?;
            if matches!(level, Some(MetricConfigLevel::Episode)) {
                return Err(ErrorDetails::InvalidRequest {
                    message: "this metric is scoped to episodes, not inferences".to_string(),
                }
                .into());
            }
            Ok(("inference_id", inference_id))
        }
    }
}

fn metric_config_for(
    metrics: &std::collections::HashMap<String, MetricConfig>,
    metric_name: &str,
) -> Option<(&MetricConfig, FeedbackType)> {
    metrics
        .get(metric_name)
        .map(|config| (config, FeedbackType::from(&config.r#type)))
}

pub async fn feedback_handler(
    State(app_state): State<AppStateData>,
    StructuredJson(params): StructuredJson<Params>,
) -> Result<Json<Value>, Error> {
    let feedback_type = match params.metric_name.as_str() {
        "comment" => {
            resolve_target(&params, None)?;
            FeedbackType::Comment
        }
        "demonstration" => {
            resolve_target(&params, None)?;
            FeedbackType::Demonstration
        }
        _ => {
            let (config, feedback_type) = metric_config_for(&app_state.config.metrics, &params.metric_name)
                .ok_or_else(|| ErrorDetails::UnknownMetric {
                    name: params.metric_name.clone(),
                })?;
            resolve_target(&params, Some(config.level))?;
            feedback_type
        }
    };

    let feedback_id = Uuid::now_v7();
    validate_feedback_id(feedback_id)?;
    let dryrun = params.dryrun.unwrap_or(false);

    if !dryrun {
        metrics::counter!("request_count", "endpoint" => "feedback").increment(1);
        let table = match feedback_type {
            FeedbackType::Comment => "CommentFeedback",
            FeedbackType::Demonstration => "DemonstrationFeedback",
            FeedbackType::Float => "FloatMetricFeedback",
            FeedbackType::Boolean => "BooleanMetricFeedback",
        };
        let row = json!({
            "id": feedback_id,
            "metric_name": params.metric_name,
            "value": params.value,
            "tags": params.tags,
        });
        app_state.clickhouse.write(&row, table).await?;
    }

    Ok(Json(json!({"feedback_id": feedback_id})))
}

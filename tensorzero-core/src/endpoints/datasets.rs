//! `POST /datasets/{name}/datapoints`: bulk insert of user-authored reference examples into a
//! named dataset. Every datapoint created here is immutable by id and `is_custom` (a client
//! supplied its input/output directly, not via `source_inference_id`): update/list/delete
//! endpoints over this same dataset surface are out of scope, matching the one endpoint the
//! HTTP surface names.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::function::FunctionConfig;
use crate::gateway_util::{AppStateData, StructuredJson};
use crate::inference::types::{ContentBlockOutput, Input, JsonInferenceOutput};
use crate::tool::{DynamicToolParams, ToolCallConfig};

#[derive(Debug, Deserialize)]
pub struct CreateChatDatapointRequest {
    pub function_name: String,
    #[serde(default)]
    pub episode_id: Option<Uuid>,
    pub input: Input,
    #[serde(default)]
    pub output: Option<Vec<ContentBlockOutput>>,
    #[serde(default)]
    pub dynamic_tool_params: DynamicToolParams,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateJsonDatapointRequest {
    pub function_name: String,
    #[serde(default)]
    pub episode_id: Option<Uuid>,
    pub input: Input,
    #[serde(default)]
    pub output: Option<JsonInferenceOutput>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CreateDatapointRequest {
    Chat(CreateChatDatapointRequest),
    Json(CreateJsonDatapointRequest),
}

#[derive(Debug, Deserialize)]
pub struct CreateDatapointsRequest {
    pub datapoints: Vec<CreateDatapointRequest>,
}

#[derive(Debug, Serialize)]
pub struct CreateDatapointsResponse {
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
struct ChatInferenceDatapointDatabaseInsert {
    id: Uuid,
    dataset_name: String,
    function_name: String,
    episode_id: Option<Uuid>,
    input: Input,
    output: Option<Vec<ContentBlockOutput>>,
    tool_params: Option<ToolCallConfig>,
    tags: HashMap<String, String>,
    source_inference_id: Option<Uuid>,
    is_custom: bool,
    name: Option<String>,
    staled_at: Option<String>,
}

#[derive(Debug, Serialize)]
struct JsonInferenceDatapointDatabaseInsert {
    id: Uuid,
    dataset_name: String,
    function_name: String,
    episode_id: Option<Uuid>,
    input: Input,
    output: Option<JsonInferenceOutput>,
    output_schema: Value,
    tags: HashMap<String, String>,
    source_inference_id: Option<Uuid>,
    is_custom: bool,
    name: Option<String>,
    staled_at: Option<String>,
}

/// Like feedback, this write is synchronous: the caller only gets an id back once the row is
/// durable, since a dataset is reference data a caller may read again immediately afterward.
pub async fn create_datapoints_handler(
    State(app_state): State<AppStateData>,
    Path(dataset_name): Path<String>,
    StructuredJson(params): StructuredJson<CreateDatapointsRequest>,
) -> Result<Json<CreateDatapointsResponse>, Error> {
    let mut ids = Vec::with_capacity(params.datapoints.len());

    for datapoint in params.datapoints {
        let id = Uuid::now_v7();
        match datapoint {
            CreateDatapointRequest::Chat(chat) => {
                let function = app_state
                    .config
                    .functions
                    .get(&chat.function_name)
                    .cloned()
                    .ok_or_else(|| ErrorDetails::UnknownFunction {
                        name: chat.function_name.clone(),
                    })?;
                let FunctionConfig::Chat(_) = function.as_ref() else {
                    return Err(ErrorDetails::InvalidRequest {
                        message: format!("function `{}` is not a chat function", chat.function_name),
                    }
                    .into());
                };
                function.validate_input(&chat.input).await?;
                let tool_params =
                    function.prepare_tool_config(&app_state.config.tools, chat.dynamic_tool_params);
                let row = ChatInferenceDatapointDatabaseInsert {
                    id,
                    dataset_name: dataset_name.clone(),
                    function_name: chat.function_name,
                    episode_id: chat.episode_id,
                    input: chat.input,
                    output: chat.output,
                    tool_params,
                    tags: chat.tags,
                    source_inference_id: None,
                    is_custom: true,
                    name: chat.name,
                    staled_at: None,
                };
                app_state.clickhouse.write(&row, "ChatInferenceDatapoint").await?;
            }
            CreateDatapointRequest::Json(json_datapoint) => {
                let function = app_state
                    .config
                    .functions
                    .get(&json_datapoint.function_name)
                    .cloned()
                    .ok_or_else(|| ErrorDetails::UnknownFunction {
                        name: json_datapoint.function_name.clone(),
                    })?;
                let FunctionConfig::Json(json_function) = function.as_ref() else {
                    return Err(ErrorDetails::InvalidRequest {
                        message: format!(
                            "function `{}` is not a json function",
                            json_datapoint.function_name
                        ),
                    }
                    .into());
                };
                function.validate_input(&json_datapoint.input).await?;
                let row = JsonInferenceDatapointDatabaseInsert {
                    id,
                    dataset_name: dataset_name.clone(),
                    function_name: json_datapoint.function_name,
                    episode_id: json_datapoint.episode_id,
                    input: json_datapoint.input,
                    output: json_datapoint.output,
                    output_schema: json_function.output_schema.value.clone(),
                    tags: json_datapoint.tags,
                    source_inference_id: None,
                    is_custom: true,
                    name: json_datapoint.name,
                    staled_at: None,
                };
                app_state.clickhouse.write(&row, "JsonInferenceDatapoint").await?;
            }
        }
        ids.push(id);
    }

    Ok(Json(CreateDatapointsResponse { ids }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_datapoint_request_tags_chat_vs_json() {
        let chat_json = serde_json::json!({
            "type": "chat",
            "function_name": "write_haiku",
            "input": {"system": null, "messages": []},
        });
        let parsed: CreateDatapointRequest = serde_json::from_value(chat_json).unwrap();
        assert!(matches!(parsed, CreateDatapointRequest::Chat(_)));

        let json_json = serde_json::json!({
            "type": "json",
            "function_name": "extract_entities",
            "input": {"system": null, "messages": []},
        });
        let parsed: CreateDatapointRequest = serde_json::from_value(json_json).unwrap();
        assert!(matches!(parsed, CreateDatapointRequest::Json(_)));
    }
}

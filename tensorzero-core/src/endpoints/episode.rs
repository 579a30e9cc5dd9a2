//! `GET /episode/{id}`: a thin read over the observability store, not a re-inference.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::Error;
use crate::gateway_util::AppStateData;
use crate::uuid_util::validate_episode_id;

pub async fn episode_handler(
    State(app_state): State<AppStateData>,
    Path(episode_id): Path<Uuid>,
) -> Result<Json<Value>, Error> {
    validate_episode_id(episode_id)?;
    let episode_id_str = episode_id.to_string();

    let mut inferences = app_state
        .clickhouse
        .query_rows_by_field("ChatInference", "episode_id", &episode_id_str)
        .await?;
    inferences.extend(
        app_state
            .clickhouse
            .query_rows_by_field("JsonInference", "episode_id", &episode_id_str)
            .await?,
    );

    Ok(Json(json!({
        "episode_id": episode_id,
        "inferences": inferences,
    })))
}

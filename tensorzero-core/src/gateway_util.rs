use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::cache::InferenceCache;
use crate::config_parser::Config;
use crate::observability::{ClickHouseConnectionInfo, ObservabilityWriter};

/// Everything a request handler needs, shared behind `Arc` across the whole process: one
/// `AppState` per process, cloned cheaply per request.
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub clickhouse: ClickHouseConnectionInfo,
    pub cache: Arc<InferenceCache>,
    pub observability: Arc<ObservabilityWriter>,
}

pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub fn new(
        config: Arc<Config>,
        clickhouse: ClickHouseConnectionInfo,
        cache: Arc<InferenceCache>,
    ) -> Result<Self, crate::Error> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| crate::ErrorDetails::Internal {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        let observability = Arc::new(ObservabilityWriter::spawn(
            clickhouse.clone(),
            crate::observability::DEFAULT_QUEUE_CAPACITY,
        ));
        Ok(Self {
            config,
            http_client,
            clickhouse,
            cache,
            observability,
        })
    }
}

/// A JSON extractor that reports the exact path of a deserialization failure (e.g.
/// `params.messages[2].content`) instead of serde's default byte-offset message, via
/// `serde_path_to_error` so validation errors name the offending field.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = axum::body::Bytes::from_request(req, state)
            .await
            .map_err(|e| bad_request(e.to_string()))?;
        let deserializer = &mut serde_json::Deserializer::from_slice(&bytes);
        serde_path_to_error::deserialize(deserializer)
            .map(StructuredJson)
            .map_err(|e| bad_request(e.to_string()))
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, axum::Json(json!({"error": message}))).into_response()
}

/// Per-request dynamic API keys supplied in a `credentials` field, keyed by model name.
pub type InferenceCredentials = HashMap<String, secrecy::SecretString>;

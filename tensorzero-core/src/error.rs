use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::Level;

/// A cheaply-cloneable error. Every fallible path in this crate returns this type rather
/// than `ErrorDetails` directly so that retry/fallback bookkeeping (which needs to hold on
/// to an error while trying the next provider) doesn't pay for a deep clone.
#[derive(Debug, Clone)]
pub struct Error {
    inner: Arc<ErrorDetails>,
}

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        let level = details.level();
        let err = Self {
            inner: Arc::new(details),
        };
        match level {
            Level::ERROR => tracing::error!("{err}"),
            Level::WARN => tracing::warn!("{err}"),
            _ => tracing::info!("{err}"),
        }
        err
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.inner
    }

    /// Whether a router/fallback FSM should treat this as retryable on the same provider,
    /// move on to the next provider, or give up entirely.
    pub fn is_provider_retryable(&self) -> bool {
        matches!(self.inner.as_ref(), ErrorDetails::ProviderRetryable { .. })
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorDetails {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },
    #[error("Invalid template path")]
    InvalidTemplatePath,
    #[error("Invalid tool: {message}")]
    InvalidTool { message: String },
    #[error("Invalid episode id: {message}")]
    InvalidEpisodeId { message: String },
    #[error("Invalid inference id: {message}")]
    InvalidInferenceId { message: String },
    #[error("Invalid config: {message}")]
    Config { message: String },
    #[error("Unknown function: {name}")]
    UnknownFunction { name: String },
    #[error("Unknown model: {name}")]
    UnknownModel { name: String },
    #[error("Unknown variant: {name}")]
    UnknownVariant { name: String },
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },
    #[error("Unknown metric: {name}")]
    UnknownMetric { name: String },
    #[error("Unknown inference: {id}")]
    UnknownInference { id: uuid::Uuid },
    #[error("Function `{function_name}` has no eligible variants: {message}")]
    InvalidFunctionVariants {
        function_name: String,
        message: String,
    },
    #[error("Error serializing or deserializing JSON: {message}")]
    Serialization { message: String },
    #[error("Error rendering template `{name}`: {message}")]
    TemplateError {
        name: String,
        message: String,
    },
    #[error("JSON Schema error: {message}")]
    JsonSchema { message: String },
    #[error("Output produced by the model violated the output schema: {message}")]
    OutputValidation { message: String },
    #[error("Provider `{provider_name}` (model `{model_name}`, attempt {attempt_number}) returned a retryable error: {message}")]
    ProviderRetryable {
        provider_name: String,
        model_name: String,
        attempt_number: u32,
        message: String,
    },
    #[error("Provider `{provider_name}` (model `{model_name}`) returned a fatal error: {message}")]
    ProviderFatal {
        provider_name: String,
        model_name: String,
        message: String,
    },
    #[error("All providers for model `{model_name}` failed. Last error: {message}")]
    AllProvidersFailed { model_name: String, message: String },
    #[error("Request exceeded its deadline: {message}")]
    DeadlineExceeded { message: String },
    #[error("Client disconnected before the inference completed")]
    Cancelled,
    #[error("Error writing to the observability store: {message}")]
    ClickHouseQuery { message: String },
    #[error("Authentication failed: {message}")]
    AuthError { message: String },
    #[error("Internal error: {message}")]
    Internal { message: String },
    #[error("{method} {path} did not match any route")]
    RouteNotFound { path: String, method: String },
}

impl ErrorDetails {
    /// The `tracing::Level` to log this error at when it's constructed. Chosen once, at the
    /// variant definition, so call sites can't accidentally under- or over-report severity.
    pub fn level(&self) -> Level {
        match self {
            ErrorDetails::InvalidRequest { .. }
            | ErrorDetails::InvalidMessage { .. }
            | ErrorDetails::InvalidTemplatePath
            | ErrorDetails::InvalidTool { .. }
            | ErrorDetails::InvalidEpisodeId { .. }
            | ErrorDetails::InvalidInferenceId { .. }
            | ErrorDetails::UnknownFunction { .. }
            | ErrorDetails::UnknownModel { .. }
            | ErrorDetails::UnknownVariant { .. }
            | ErrorDetails::UnknownTool { .. }
            | ErrorDetails::UnknownMetric { .. }
            | ErrorDetails::UnknownInference { .. }
            | ErrorDetails::InvalidFunctionVariants { .. }
            | ErrorDetails::OutputValidation { .. }
            | ErrorDetails::ProviderRetryable { .. }
            | ErrorDetails::Cancelled
            | ErrorDetails::AuthError { .. }
            | ErrorDetails::RouteNotFound { .. } => Level::WARN,
            ErrorDetails::Config { .. }
            | ErrorDetails::Serialization { .. }
            | ErrorDetails::TemplateError { .. }
            | ErrorDetails::JsonSchema { .. }
            | ErrorDetails::ProviderFatal { .. }
            | ErrorDetails::AllProvidersFailed { .. }
            | ErrorDetails::DeadlineExceeded { .. }
            | ErrorDetails::ClickHouseQuery { .. }
            | ErrorDetails::Internal { .. } => Level::ERROR,
        }
    }

    /// The HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::InvalidRequest { .. }
            | ErrorDetails::InvalidMessage { .. }
            | ErrorDetails::InvalidTemplatePath
            | ErrorDetails::InvalidTool { .. }
            | ErrorDetails::InvalidEpisodeId { .. }
            | ErrorDetails::InvalidInferenceId { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::AuthError { .. } => StatusCode::UNAUTHORIZED,
            ErrorDetails::UnknownFunction { .. }
            | ErrorDetails::UnknownModel { .. }
            | ErrorDetails::UnknownVariant { .. }
            | ErrorDetails::UnknownTool { .. }
            | ErrorDetails::UnknownMetric { .. }
            | ErrorDetails::UnknownInference { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::InvalidFunctionVariants { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::OutputValidation { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::ProviderRetryable { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::AllProvidersFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            ErrorDetails::Cancelled => StatusCode::BAD_REQUEST,
            ErrorDetails::Config { .. }
            | ErrorDetails::Serialization { .. }
            | ErrorDetails::TemplateError { .. }
            | ErrorDetails::JsonSchema { .. }
            | ErrorDetails::ProviderFatal { .. }
            | ErrorDetails::ClickHouseQuery { .. }
            | ErrorDetails::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.inner.status_code();
        let body = json!({"error": self.inner.to_string()});
        (status, axum::Json(body)).into_response()
    }
}

/// A `ResultExt`-style helper: log-and-continue for paths where a failure
/// shouldn't abort the caller (e.g. a single best-of-n candidate failing).
pub trait ResultExt<T> {
    fn ok_or_log(self) -> Option<T>;
}

impl<T> ResultExt<T> for Result<T, Error> {
    fn ok_or_log(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!("{err}");
                None
            }
        }
    }
}

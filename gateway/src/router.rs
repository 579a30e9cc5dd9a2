//! Route-to-handler wiring and HTTP middleware: trace layer, version header, 404 fallback.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use tensorzero_core::endpoints;
use tensorzero_core::endpoints::status::TENSORZERO_VERSION;
use tensorzero_core::gateway_util::AppStateData;

async fn add_version_header(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert("x-tensorzero-gateway-version", HeaderValue::from_static(TENSORZERO_VERSION));
    response
}

pub fn build_router(app_state: AppStateData) -> Router {
    Router::new()
        .route("/inference", post(endpoints::inference::inference_handler))
        .route("/inference/{id}", get(endpoints::inference::get_inference_handler))
        .route("/feedback", post(endpoints::feedback::feedback_handler))
        .route("/episode/{id}", get(endpoints::episode::episode_handler))
        .route(
            "/datasets/{name}/datapoints",
            post(endpoints::datasets::create_datapoints_handler),
        )
        .route(
            "/openai/v1/chat/completions",
            post(endpoints::openai_compatible::chat_completions_handler),
        )
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler))
        .fallback(endpoints::fallback::handle_404)
        .layer(middleware::from_fn(add_version_header))
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .with_state(app_state)
}

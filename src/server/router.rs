//! HTTP surface: `POST /render` plus a health probe.

use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use snapdom_browser::ProviderStatus;
use snapdom_renderer::{CompletionType, HeaderMap, RenderError};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::render_manager::RenderRequestBody;

use super::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/render", post(render_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct RenderResponse {
    status: u16,
    html: String,
    headers: HeaderMap,
    completed: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

async fn render_handler(
    State(state): State<AppState>,
    Json(request): Json<RenderRequestBody>,
) -> impl IntoResponse {
    let url = request.url.clone();
    let started = std::time::Instant::now();
    match state.manager.render(request).await {
        Ok(outcome) => {
            info!(
                target: "render-api",
                %url,
                status = outcome.http_status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "render ok"
            );
            let completed = outcome.completion != CompletionType::PageLoadTimeout;
            (
                StatusCode::OK,
                Json(RenderResponse {
                    status: outcome.http_status,
                    html: outcome.html,
                    headers: outcome.headers,
                    completed,
                }),
            )
                .into_response()
        }
        Err(err) => {
            info!(
                target: "render-api",
                %url,
                code = err.kind.code(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "render failed"
            );
            error_response(err)
        }
    }
}

fn error_response(err: RenderError) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            code: err.kind.code(),
            message: err.message,
        }),
    )
        .into_response()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let provider = state.manager.provider_status().await;
    let body: Value = json!({
        "status": if provider == ProviderStatus::Running { "ok" } else { "degraded" },
        "provider": format!("{provider:?}").to_lowercase(),
    });
    let status = if provider == ProviderStatus::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

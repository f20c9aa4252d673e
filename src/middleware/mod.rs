// Authentication and CORS middleware

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::routes::AppState;

/// Authentication middleware
///
/// Verifies the bridge API key in the Authorization header or x-api-key header.
/// Expects format: "Bearer {BRIDGE_API_KEY}" or just the key in x-api-key.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    if bearer == Some(state.bridge_api_key.as_str()) || api_key == Some(state.bridge_api_key.as_str())
    {
        return next.run(request).await;
    }

    let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    tracing::warn!(
        "[{}] Access attempt with invalid or missing API key: {} {}",
        request_id,
        request.method(),
        request.uri().path()
    );

    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "message": "Invalid or missing API key",
                "type": "auth_required",
            }
        })),
    )
        .into_response()
}

/// Create CORS middleware layer
///
/// Content scripts call from whatever page they run in; any origin is accepted.
/// Handles OPTIONS preflight requests automatically.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

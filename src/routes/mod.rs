use axum::{
    extract::State,
    middleware::{self as axum_middleware},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::CredentialManager;
use crate::bridge::{RequestEnvelope, ResponseEnvelope};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::BridgeError;
use crate::middleware;

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub bridge_api_key: String,
    pub dispatcher: Arc<Dispatcher>,
    pub credentials: CredentialManager,
    pub config: Arc<Config>,
}

/// Health check routes (no authentication required)
pub fn health_routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bridge endpoint for remote page-context clients (requires authentication)
pub fn bridge_routes(state: AppState) -> Router {
    Router::new()
        .route("/bridge", post(bridge_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Film Bridge is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
///
/// Includes the sign-in state, when the next silent renewal fires, and the
/// reply budget remote bridge clients should use.
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let user = state.credentials.current_user().await;
    let next_refresh = state.credentials.scheduled_refresh_at().await;

    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION,
        "signedIn": user.is_some(),
        "userId": user.map(|u| u.id),
        "nextRefreshAt": next_refresh.map(|t| t.to_rfc3339()),
        "validationWindowSecs": state.config.validation_window_secs,
        "bridgeTimeoutMs": state.config.bridge_timeout().as_millis() as u64,
    }))
}

/// POST /bridge - Dispatch one request envelope
///
/// Handler failures come back as failure envelopes with status 200; only a
/// request type with no handler is an HTTP error (404).
async fn bridge_handler(
    State(state): State<AppState>,
    Json(envelope): Json<RequestEnvelope>,
) -> Result<Json<ResponseEnvelope>, BridgeError> {
    let kind = envelope.kind;
    let id = envelope.id;

    let response = state
        .dispatcher
        .dispatch(envelope)
        .await
        .ok_or_else(|| BridgeError::NotHandled(kind.to_string()))?;

    tracing::debug!(%id, %kind, success = response.success, "Bridge request handled");
    Ok(Json(response))
}

#[cfg(test)]
pub(crate) fn test_state(api_key: &str) -> AppState {
    use crate::auth::{HttpIdentityProvider, IdentityEndpoints, MemoryCredentialStore, RefreshPolicy};
    use crate::clock::SystemClock;

    let config = Config {
        server_host: "127.0.0.1".to_string(),
        server_port: 8787,
        bridge_api_key: api_key.to_string(),
        credential_db_file: std::path::PathBuf::from("/tmp/film-bridge-test.sqlite3"),
        validation_window_secs: 86400,
        refresh_threshold_secs: 7200,
        identity_api_key: "idkey".to_string(),
        identity_token_url: "http://127.0.0.1:9/token".to_string(),
        identity_lookup_url: "http://127.0.0.1:9/lookup".to_string(),
        refresh_token: None,
        document_store_url: "http://127.0.0.1:9/documents".to_string(),
        bridge_timeout_ms: 30000,
        http_max_connections: 4,
        http_connect_timeout: 1,
        http_request_timeout: 1,
        http_max_retries: 0,
        log_level: "info".to_string(),
    };

    let provider = HttpIdentityProvider::new(
        reqwest::Client::new(),
        IdentityEndpoints {
            token_url: config.identity_token_url.clone(),
            lookup_url: config.identity_lookup_url.clone(),
            api_key: config.identity_api_key.clone(),
        },
        "refresh".to_string(),
    );
    let credentials = CredentialManager::new(
        Arc::new(MemoryCredentialStore::new()),
        Arc::new(provider),
        Arc::new(SystemClock),
        RefreshPolicy::default(),
    );

    AppState {
        bridge_api_key: api_key.to_string(),
        dispatcher: Arc::new(Dispatcher::new()),
        credentials,
        config: Arc::new(config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{GetUser, RequestType};
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use tower::ServiceExt;

    async fn parse_json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn app(mut state: AppState) -> Router {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(|_: GetUser| async { Ok(None) });
        state.dispatcher = Arc::new(dispatcher);

        Router::new()
            .merge(health_routes(state.clone()))
            .merge(bridge_routes(state))
    }

    fn bridge_request(envelope: &RequestEnvelope) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/bridge")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-api-key", "key")
            .body(Body::from(serde_json::to_vec(envelope).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_signed_out() {
        let response = app(test_state("key"))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = parse_json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["signedIn"], false);
        assert_eq!(body["nextRefreshAt"], Value::Null);
        assert_eq!(body["bridgeTimeoutMs"], 30000);
    }

    #[tokio::test]
    async fn test_bridge_dispatches_envelope() {
        let envelope = RequestEnvelope::new(RequestType::GetUser, json!({}));
        let response = app(test_state("key"))
            .oneshot(bridge_request(&envelope))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = parse_json_body(response).await;
        assert_eq!(body["id"], envelope.id.to_string());
        assert_eq!(body["type"], "GET_USER_RESPONSE");
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn test_bridge_unhandled_type_is_not_found() {
        let envelope = RequestEnvelope::new(RequestType::Search, json!({"idOrTitle": "X"}));
        let response = app(test_state("key"))
            .oneshot(bridge_request(&envelope))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = parse_json_body(response).await;
        assert_eq!(body["error"]["type"], "not_handled");
    }

    #[tokio::test]
    async fn test_bridge_requires_api_key() {
        let envelope = RequestEnvelope::new(RequestType::GetUser, json!({}));
        let mut request = bridge_request(&envelope);
        request.headers_mut().remove("x-api-key");

        let response = app(test_state("key")).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

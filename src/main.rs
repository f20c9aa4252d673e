use anyhow::{Context, Result};
use std::sync::Arc;

use film_bridge::auth::{
    CredentialManager, CredentialStore, HttpIdentityProvider, IdentityEvent,
    SqliteCredentialStore,
};
use film_bridge::clock::SystemClock;
use film_bridge::config::Config;
use film_bridge::dispatch::{register_all, Dispatcher, HandlerContext};
use film_bridge::http_client::StoreHttpClient;
use film_bridge::store::DocumentStore;
use film_bridge::{middleware, routes};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("🚀 Film Bridge starting...");
    tracing::info!(
        "Server configured: {}:{}",
        config.server_host,
        config.server_port
    );

    // Durable credential state
    if let Some(parent) = config.credential_db_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = Arc::new(
        SqliteCredentialStore::open(&config.credential_db_file).with_context(|| {
            format!(
                "Failed to open credential store {}",
                config.credential_db_file.display()
            )
        })?,
    );
    tracing::info!(
        "✅ Credential store opened at {}",
        config.credential_db_file.display()
    );

    // Identity provider and credential lifecycle
    let identity_client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(config.http_connect_timeout))
        .timeout(std::time::Duration::from_secs(config.http_request_timeout))
        .build()
        .context("Failed to create identity HTTP client")?;
    if config.refresh_token.is_none() {
        tracing::warn!("No IDENTITY_REFRESH_TOKEN configured; token renewal will fail");
    }
    let provider = Arc::new(HttpIdentityProvider::new(
        identity_client,
        config.identity_endpoints(),
        config.refresh_token.clone().unwrap_or_default(),
    ));

    let credentials = CredentialManager::new(
        store.clone(),
        provider,
        Arc::new(SystemClock),
        config.refresh_policy()?,
    );

    sign_in_at_startup(&config, store.as_ref(), &credentials).await;

    // Document store and handlers
    let http_client = StoreHttpClient::new(
        credentials.clone(),
        config.http_max_connections,
        config.http_connect_timeout,
        config.http_request_timeout,
        config.http_max_retries,
    )?;
    tracing::info!("✅ HTTP client initialized with connection pooling");

    let documents = Arc::new(DocumentStore::new(
        http_client,
        config.document_store_url.clone(),
    ));

    let mut dispatcher = Dispatcher::new();
    register_all(
        &mut dispatcher,
        HandlerContext {
            credentials: credentials.clone(),
            documents,
            clock: Arc::new(SystemClock),
        },
    );
    tracing::info!("✅ Bridge dispatcher initialized");

    let app_state = routes::AppState {
        bridge_api_key: config.bridge_api_key.clone(),
        dispatcher: Arc::new(dispatcher),
        credentials,
        config: Arc::new(config.clone()),
    };

    let app = build_app(app_state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("👋 Server shutdown complete");

    Ok(())
}

/// Restore the stored identity, or sign in with the configured refresh token.
///
/// Failures are logged; the server still starts and privileged calls report
/// the auth error until an identity is available.
async fn sign_in_at_startup(
    config: &Config,
    store: &dyn CredentialStore,
    credentials: &CredentialManager,
) {
    let restored = match store.get_user() {
        Ok(user) => user,
        Err(e) => {
            tracing::error!("❌ Failed to read stored identity: {}", e);
            None
        }
    };

    if let Some(user) = restored {
        let user_id = user.id.clone();
        match credentials
            .on_identity_change(IdentityEvent::SignedIn(user))
            .await
        {
            Ok(()) => tracing::info!("✅ Restored identity {}", user_id),
            Err(e) => tracing::warn!("Restored identity {} but its credential is unusable: {}", user_id, e),
        }
        return;
    }

    if config.refresh_token.is_none() {
        tracing::info!("No identity signed in; privileged calls will require authentication");
        return;
    }

    match credentials.sign_in(None).await {
        Ok(user) => tracing::info!("✅ Signed in as {}", user.id),
        Err(e) => {
            tracing::error!("❌ Sign-in failed: {}", e);
            tracing::warn!("Server will start but privileged calls will fail until sign-in succeeds");
        }
    }
}

/// Build the application with all routes and middleware
fn build_app(state: routes::AppState) -> axum::Router {
    use axum::Router;

    Router::new()
        .merge(routes::health_routes(state.clone()))
        .merge(routes::bridge_routes(state))
        .layer(middleware::cors_layer())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}

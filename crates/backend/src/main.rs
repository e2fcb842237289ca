use axum::{
    http::{header, HeaderName, Method},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod config;
mod db;
mod email;
pub mod error;
mod handlers;
mod models;
pub mod repository;
mod schema;
#[cfg(test)]
mod test_support;

use config::AppConfig;
use email::cipher::TokenCipher;
use email::gmail::{GmailWatchApi, GmailWatcher};
use email::graph::{GraphSubscriptionManager, GraphSubscriptions};
use email::oauth::{HttpOAuthExchange, OAuthExchange};
use email::tokens::TokenBroker;
use repository::{AccountStore, PgAccountStore};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn AccountStore>,
    pub cipher: Arc<TokenCipher>,
    pub gmail: Arc<dyn GmailWatchApi>,
    pub graph: Arc<dyn GraphSubscriptions>,
    pub oauth: Arc<dyn OAuthExchange>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "billybot_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    // rustls needs a process-wide crypto provider before the first TLS handshake
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let config = Arc::new(AppConfig::from_env()?);
    let cipher = Arc::new(TokenCipher::from_config(&config)?);

    // Establish database connection pool
    let pool = db::establish_connection_pool(&config.database_url)?;
    let store: Arc<dyn AccountStore> = Arc::new(PgAccountStore::new(pool));

    let http = reqwest::Client::new();
    let tokens = Arc::new(TokenBroker::new(
        http.clone(),
        cipher.clone(),
        store.clone(),
        config.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        store,
        cipher: cipher.clone(),
        gmail: Arc::new(GmailWatcher::new(config.google.clone(), cipher)),
        graph: Arc::new(GraphSubscriptionManager::new(
            http.clone(),
            tokens,
            config.microsoft.clone(),
        )),
        oauth: Arc::new(HttpOAuthExchange::new(http)),
    };

    let app = app(state)
        .layer(build_cors_layer(config.cors_allowed_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// All routes, without the outer CORS and tracing layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // Email account routes
        .route("/api/email/accounts", get(handlers::list_email_accounts))
        .route(
            "/api/email/disconnect",
            post(handlers::disconnect_email_account),
        )
        .route(
            "/api/email/google/watch",
            post(handlers::register_google_watches),
        )
        // OAuth routes
        .route(
            "/api/email/oauth/:provider/start",
            get(handlers::start_oauth),
        )
        .route(
            "/api/email/oauth/:provider/callback",
            get(handlers::oauth_callback),
        )
        // Provider push callbacks
        .route(
            "/api/email/microsoft/notifications",
            post(handlers::microsoft_notifications),
        )
        // Scheduled job routes
        .route(
            "/api/internal/email/microsoft/renew",
            post(handlers::renew_microsoft_subscriptions),
        )
        .route(
            "/api/internal/email/google/watch-refresh",
            post(handlers::refresh_google_watches),
        )
        .with_state(state)
}

/// Build CORS layer from the configured origin list.
///
/// If CORS_ALLOWED_ORIGINS is set, only those origins are allowed.
/// If not set, defaults to permissive CORS (for development only).
fn build_cors_layer(allowed_origins: Option<&str>) -> CorsLayer {
    match allowed_origins {
        Some(origins) => {
            let origins: Vec<_> = origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();

            if origins.is_empty() {
                tracing::warn!(
                    "CORS_ALLOWED_ORIGINS is set but empty, using permissive CORS (not recommended for production)"
                );
                CorsLayer::permissive()
            } else {
                tracing::info!("CORS configured for origins: {:?}", origins);
                CorsLayer::new()
                    .allow_origin(AllowOrigin::list(origins))
                    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                    .allow_headers([
                        header::CONTENT_TYPE,
                        header::AUTHORIZATION,
                        HeaderName::from_static(auth::INTERNAL_TOKEN_HEADER),
                    ])
                    .allow_credentials(true)
            }
        }
        None => {
            tracing::warn!(
                "CORS_ALLOWED_ORIGINS not set, using permissive CORS (not recommended for production)"
            );
            CorsLayer::permissive()
        }
    }
}

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use template_maker::api::{create_router, AppState};
use template_maker::config::{load_config, AppConfig};
use template_maker::oauth::{run_handshake_cleanup, HandshakeStore, OAuthNegotiator};
use template_maker::session::{run_session_sweeper, SessionStore};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Period of the pending-handshake cleanup task
const HANDSHAKE_CLEANUP_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "template_maker=info".into()),
        )
        .init();

    info!("Template Maker starting...");

    let mut config = match std::env::var("TEMPLATE_MAKER_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => AppConfig::default(),
    };
    config.apply_env_overrides();

    info!(
        bind_addr = %config.server.bind_addr,
        session_ttl_hours = config.session.ttl_hours,
        max_sessions_per_user = config.session.max_sessions_per_user,
        "Configuration loaded"
    );

    if config.session.encryption_key.is_none() {
        warn!("No encryption key configured, deriving a process-local key");
    }
    let sessions = Arc::new(
        SessionStore::new(config.session.clone())
            .context("Failed to initialize session store (check TEMPLATE_MAKER_ENCRYPTION_KEY)")?,
    );
    info!(key_valid = sessions.validate_key(), "Session store initialized");

    let oauth = match config.oauth.provider_config() {
        Some(provider) => {
            info!(client_id = %provider.client_id, "Notion OAuth enabled");
            let timeout = Duration::from_secs(config.oauth.request_timeout_seconds);
            Some(Arc::new(OAuthNegotiator::new(provider).with_timeout(timeout)))
        }
        None => {
            warn!("Notion OAuth disabled (NOTION_CLIENT_ID / NOTION_CLIENT_SECRET / NOTION_REDIRECT_URI not set)");
            None
        }
    };
    let handshakes = HandshakeStore::new(config.oauth.handshake_ttl_seconds);

    if config.session.sweep_interval_seconds > 0 {
        tokio::spawn(run_session_sweeper(
            Arc::clone(&sessions),
            config.session.sweep_interval_seconds,
        ));
    }
    tokio::spawn(run_handshake_cleanup(
        handshakes.clone(),
        HANDSHAKE_CLEANUP_INTERVAL_SECS,
    ));

    let router = create_router(AppState {
        sessions,
        oauth,
        handshakes,
    })
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "HTTP API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl_c signal");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server error")?;

    info!("Template Maker stopped");
    Ok(())
}

use anyhow::Context;
use axum::http::{header, HeaderValue, Method};
use peerconnect::{config::Config, store::Store, AppState};
use tower_http::cors::CorsLayer;
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("peerconnect=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;

    let session_store = MemoryStore::default();
    let session_layer = SessionManagerLayer::new(session_store)
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(config.session_inactivity));

    let cors = match &config.allowed_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin.parse::<HeaderValue>().context("ALLOWED_ORIGIN is not a valid origin")?)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE])
            .allow_credentials(true),
        None => CorsLayer::permissive(),
    };

    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    let app_state = AppState::new(store, &config);
    let conversations = app_state.conversations.clone();

    let app = peerconnect::router()
        .with_state(app_state)
        .layer(session_layer)
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("listening on {}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    conversations.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

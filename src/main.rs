//! Parley server
//!
//! Serves one chat session over HTTP. A renderer polls `GET /v1/messages`
//! and submits with `POST /v1/messages`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parley::config::Config;
use parley::core::{ChatSession, HistoryStore, PowerProfileEstimator};
use parley::providers::Provider;
use parley::{routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let session_config = config.load_session()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let backend = Provider::from_settings(&session_config.llm, &config)?;
    tracing::info!(
        provider = %session_config.llm.provider,
        model = %session_config.llm.model,
        "inference backend ready"
    );

    let history = session_config
        .history
        .enabled
        .then(|| HistoryStore::new(config.history_dir(&session_config)));
    if let Some(store) = &history {
        tracing::info!(dir = %store.dir().display(), "history log enabled");
    }

    let session = Arc::new(ChatSession::new(
        session_config.user.name.clone(),
        Arc::new(backend),
        Arc::new(PowerProfileEstimator::new(
            session_config.energy.cpu_active_mah_per_sec,
        )),
        history,
    ));

    let state = AppState {
        session: Arc::clone(&session),
    };

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Parley API running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    session.shutdown().await;
    Ok(())
}

//! Lifeline sync agent.
//!
//! Runs the durable operation queue next to a host application: work queued
//! while offline is delivered to the upstream API once connectivity returns.

use lifeline_engine::{PolicyRegistry, SystemClock};
use lifeline_server::config::{Config, QueueBackend};
use lifeline_server::db::{self, MemoryStore, SharedStore, SqliteStore};
use lifeline_server::handlers::HandlerRegistry;
use lifeline_server::session::{HttpTokenProvider, SessionTokenRefresher};
use lifeline_server::AppState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lifeline_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        "Starting Lifeline agent on {}:{} ({:?} backend)",
        config.host,
        config.port,
        config.backend
    );

    let policies = match &config.policy_file {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading operation policies");
            PolicyRegistry::from_json(&tokio::fs::read_to_string(path).await?)?
        }
        None => PolicyRegistry::default(),
    };

    let store: SharedStore = match config.backend {
        QueueBackend::Sqlite => {
            let url = config
                .database_url
                .as_deref()
                .ok_or("DATABASE_URL is required for the sqlite backend")?;
            let pool = db::create_pool(url).await?;

            tracing::info!("Running database migrations...");
            db::run_migrations(&pool).await?;
            Arc::new(SqliteStore::new(pool, config.max_queue_size))
        }
        QueueBackend::Memory => match &config.snapshot_path {
            Some(path) => Arc::new(MemoryStore::open(config.max_queue_size, path.clone()).await?),
            None => {
                tracing::warn!("Memory backend without SNAPSHOT_PATH: queued work is lost on exit");
                Arc::new(MemoryStore::new(config.max_queue_size))
            }
        },
    };

    let client = reqwest::Client::builder()
        .timeout(config.attempt_timeout)
        .build()?;
    let handlers = HandlerRegistry::http(client.clone(), &config.api_base_url, &policies);
    tracing::info!(kinds = ?handlers.kinds(), "Registered handlers");

    let clock = Arc::new(SystemClock);
    let state = AppState::new(config.clone(), store.clone(), handlers, policies, clock.clone());
    state.executor.recover().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = vec![state
        .trigger
        .clone()
        .spawn(config.sync_interval, shutdown_rx.clone())];

    if let Some(url) = &config.token_refresh_url {
        let refresher = Arc::new(SessionTokenRefresher::new(
            state.sessions.clone(),
            Arc::new(HttpTokenProvider::new(client, url.clone())),
            clock,
            config.token_refresh_threshold,
            state.events.clone(),
        ));
        background.push(refresher.spawn(config.token_check_interval, shutdown_rx));
    }

    let app = lifeline_server::app(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Control API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown requested");
        })
        .await?;

    shutdown_tx.send(true).ok();
    for task in background {
        task.await.ok();
    }
    store.flush().await?;
    tracing::info!("Queue flushed, bye");

    Ok(())
}

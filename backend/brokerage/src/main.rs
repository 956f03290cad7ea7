//! Brokerage service — entry point.
//!
//! Opens the SQLite store, wires the reconciliation engine to the wall
//! clock and the configured notifier, and serves the REST API.

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use brokerage::api::{self, ApiState};
use brokerage::clock::SystemClock;
use brokerage::config::Config;
use brokerage::db;
use brokerage::notify::{HttpNotifier, LogNotifier, Notifier};
use brokerage::principal::HeaderPrincipalResolver;
use brokerage::store::LifecycleStore;
use brokerage::{Engine, EngineSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let notifier: Arc<dyn Notifier> = match &config.notify_url {
        Some(url) => {
            info!("Relaying notifications to {url}");
            Arc::new(HttpNotifier::new(url.clone(), config.email_from.clone())?)
        }
        None => {
            info!("NOTIFY_URL not set; notifications will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let settings = EngineSettings::from_config(&config)?;
    info!(
        "Marketplace window: {}:00-{}:59 {}",
        settings.gate.open_hour(),
        settings.gate.open_hour(),
        settings.gate.timezone()
    );

    let engine = Engine::new(
        LifecycleStore::new(pool),
        Arc::new(SystemClock),
        notifier,
        settings,
    );

    let state = Arc::new(ApiState {
        engine: Arc::new(engine),
        resolver: Arc::new(HeaderPrincipalResolver),
    });

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

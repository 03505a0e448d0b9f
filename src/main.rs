use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use compliance_core::api::{self, AppState};
use compliance_core::config::ComplianceConfig;
use compliance_core::database::Database;
use compliance_core::external::{ClinicalDataStore, InMemoryClinicalStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "compliance_core=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting compliance core");

    let config = ComplianceConfig::load()?;

    let database = Database::connect(&config).await?;
    info!("Database connected and migrated");

    let clinical: Arc<dyn ClinicalDataStore> = match &config.clinical_snapshot_path {
        Some(path) => Arc::new(InMemoryClinicalStore::load_yaml(Path::new(path))?),
        None => {
            info!("No clinical snapshot configured; ownership lookups rely on caller metadata");
            Arc::new(InMemoryClinicalStore::new())
        }
    };

    let state = AppState::new(database, clinical, config.health.clone());

    // Periodic health sweep
    state
        .scheduler
        .clone()
        .spawn(Duration::from_secs(config.health.interval_secs));
    info!("Health-check scheduler started (every {}s)", config.health.interval_secs);

    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

use axum::serve;
use docbase_api::api::routes::create_router;
use docbase_api::config::AppConfig;
use docbase_api::logic::QueryEngine;
use docbase_api::model::Registry;
use docbase_api::store::PostgresStore;
use log::info;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load()?;
    info!(
        "Configuration loaded: server={}:{}",
        config.server.host, config.server.port
    );

    // A broken registry aborts startup
    let registry = Registry::load(&config.engine.registry_path)?;
    info!(
        "Loaded {} entities from {}",
        registry.entity_names().count(),
        config.engine.registry_path
    );

    info!("Connecting to PostgreSQL...");
    let database_url = config.database_url()?;
    let store = PostgresStore::new(
        &database_url,
        config.database.max_connections.unwrap_or(20),
    )
    .await?;

    let engine = QueryEngine::new(Arc::new(registry), Arc::new(store))
        .with_settings(config.engine.settings());

    run_server(create_router().with_state(Arc::new(engine)), &config).await?;

    Ok(())
}

async fn run_server(app: axum::Router, config: &AppConfig) -> anyhow::Result<()> {
    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    info!("docbase server running on http://{}", bind_address);

    serve(listener, app).await?;

    Ok(())
}

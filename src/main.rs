mod accounts;
mod api;
mod bootstrap;
mod config;
mod error;
mod federation;
mod gateway;
mod ingest;
mod locks;
mod middleware;
mod notify;
mod relay;
mod server;
mod service;
mod store;
mod vault;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,bridge_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("🚀 Starting Stellar bridge");

    // Load configuration
    dotenv::dotenv().ok();
    let config = config::Config::from_env()?;

    let state = bootstrap::initialize_app_state(&config).await?;

    let app = server::create_app(state);

    server::run_server(app, &config.bind_address).await?;

    Ok(())
}

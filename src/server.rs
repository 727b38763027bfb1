use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{
        adjust_trust_line, adjust_vault, create_bridge, delete_bridge, federation_lookup,
        get_balance, get_balance_by_issuer, get_vault, health_check, list_failed_payments,
        send_payment, AppState,
    },
    middleware::create_cors_layer,
};

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let bridge_routes = Router::new()
        .route("/", post(create_bridge).delete(delete_bridge))
        .route("/trustlines/:asset_code/:issuer", put(adjust_trust_line))
        .route("/vault/:asset_code", put(adjust_vault).get(get_vault))
        .route("/payments", post(send_payment))
        .route("/balances/:asset_code", get(get_balance))
        .route("/balances/:asset_code/:issuer", get(get_balance_by_issuer));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/federation", get(federation_lookup))
        .nest("/modules/stellar/bridge", bridge_routes)
        .route("/admin/payments/failed", get(list_failed_payments))
        .layer(CompressionLayer::new())
        .layer(create_cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}

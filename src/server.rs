use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::{
        handler::{
            create_withdrawal, get_balance, health_check, list_orders, list_withdrawals,
            submit_order, AppState,
        },
        models::WithdrawRequest,
    },
    error::{AppError, AppResult},
    middleware::{create_cors_layer, validate_json},
    shutdown::Shutdown,
};

/// Per-request ceiling, well above the slowest withdrawal retry cycle
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn create_app(state: AppState, cors_origins: &[String]) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let user_routes = Router::new()
        .route("/orders", post(submit_order).get(list_orders))
        .route("/balance", get(get_balance))
        .route(
            "/balance/withdraw",
            post(create_withdrawal).route_layer(from_fn(validate_json::<WithdrawRequest>)),
        )
        .route("/withdrawals", get(list_withdrawals));

    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api/user", user_routes)
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(create_cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

/// Serve until `shutdown` fires, then let in-flight requests finish
pub async fn run_server(app: Router, bind_address: &str, shutdown: Shutdown) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| AppError::Internal(format!("bind {}: {}", bind_address, e)))?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.triggered().await })
        .await
        .map_err(|e| AppError::Internal(format!("server error: {}", e)))?;

    info!("🛑 HTTP server stopped");
    Ok(())
}

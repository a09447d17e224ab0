use std::sync::Arc;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::{
    accrual::{AccrualClient, AccrualSource},
    api::handler::AppState,
    config::AppConfig,
    error::AppResult,
    ledger::{LedgerRepository, OrderStore},
    reconciliation::Reconciler,
    shutdown::Shutdown,
};

/// Wire the store, the accrual client and the reconciler together.
///
/// The returned reconciler is not started yet; it shares its gate with the
/// returned state.
pub async fn initialize_app(
    config: &AppConfig,
    shutdown: Shutdown,
) -> AppResult<(AppState, Reconciler)> {
    info!("Initializing application components ...");

    let pool = initialize_database(config).await?;

    let store: Arc<dyn OrderStore> = Arc::new(LedgerRepository::with_retry_policy(
        pool,
        config.retry_policy(),
    ));

    let client = AccrualClient::new(&config.accrual_system_address)?;
    info!("✅ Accrual client targeting {}", client.base_url());
    let source: Arc<dyn AccrualSource> = Arc::new(client);

    let reconciler = Reconciler::new(config.reconciler_config(), store.clone(), source);

    let state = AppState {
        store,
        gate: reconciler.gate(),
        shutdown,
    };

    info!("✓ Application components initialized");
    Ok((state, reconciler))
}

/// Connect the pool and run pending migrations. Failure here is fatal.
pub async fn initialize_database(config: &AppConfig) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .idle_timeout(config.db_idle_timeout())
        .max_lifetime(config.db_max_lifetime())
        .connect(&config.database_uri)
        .await?;

    info!(
        "✓ Database pool configured: {}..{} connections",
        config.db_min_connections, config.db_max_connections
    );

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}

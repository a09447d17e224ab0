use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loyalty_ledger::{bootstrap, config::{AppConfig, CliArgs}, server, shutdown};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,loyalty_ledger=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting loyalty ledger");

    let args = CliArgs::parse();
    let config = AppConfig::load(args)?;

    let (trigger, shutdown) = shutdown::channel();
    let trigger = Arc::new(trigger);

    let (state, reconciler) = bootstrap::initialize_app(&config, shutdown.clone()).await?;
    let reconciler = reconciler.start(shutdown.clone());

    tokio::spawn({
        let trigger = trigger.clone();
        async move { shutdown::wait_for_signal(&trigger).await }
    });

    let app = server::create_app(state, &config.cors_allowed_origins);
    let served = server::run_server(app, &config.run_address, shutdown).await;

    // Stop the reconciler even when the server exited on its own
    trigger.trigger();
    if let Err(e) = reconciler.await {
        error!("❌ Reconciler task failed: {}", e);
    }

    served?;
    info!("👋 Shutdown complete");
    Ok(())
}

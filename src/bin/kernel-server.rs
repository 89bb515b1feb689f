//! Resilience Kernel Server
//!
//! Loads configuration, starts the kernel's background tasks and serves the
//! monitoring and log analysis API until Ctrl-C.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use resilience_kernel::clock::SystemClock;
use resilience_kernel::config::ConfigManager;
use resilience_kernel::kernel::ResilienceKernel;
use resilience_kernel::logging::init_structured_logging;
use resilience_kernel::web::{create_app, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manager = ConfigManager::load()?;
    let config = manager.config().clone();
    init_structured_logging(&config.logging, manager.environment());

    info!(
        environment = %manager.environment(),
        config_dir = %manager.config_directory().display(),
        "Starting resilience kernel server"
    );

    let kernel = Arc::new(ResilienceKernel::with_defaults(config, Arc::new(SystemClock))?);

    // Retry handlers are registered by the host application; without any,
    // due tasks are dead-lettered for operator attention.
    let background = kernel.spawn_background(HashMap::new());

    if !kernel.config().web.enabled {
        info!("Web API disabled; running background tasks only");
        signal::ctrl_c().await?;
        background.shutdown().await;
        return Ok(());
    }

    let bind_address = kernel.config().web.bind_address.clone();
    let app = create_app(Arc::new(AppState::new(Arc::clone(&kernel))));
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(bind_address = %bind_address, "Web API listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await;

    background.shutdown().await;
    served?;
    info!("Resilience kernel server stopped");
    Ok(())
}

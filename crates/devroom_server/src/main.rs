//! DevRoom Service - Main Entry Point
//!
//! Starts the HTTP/WebSocket server and the room lifecycle sweepers, then
//! waits for Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use devroom_server::*;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = Arc::new(Config::from_env().context("Failed to load configuration")?);

    // 2. Initialize logging and tracing
    logging::init(&config).context("Failed to initialize logging")?;

    // 3. Banner and configuration
    logging::print_banner(&config);
    logging::log_config(&config);

    info!("🚀 Starting all services...");

    // 4. Metrics registry
    let _metrics = metrics::init(&config).context("Failed to initialize metrics")?;
    logging::log_status("📊", "Metrics", "READY", true);

    // 5. Room hub and shutdown fan-out
    let hub = Arc::new(RoomHub::new(config.clone()));
    let shutdown = ShutdownCoordinator::new();

    // 6. HTTP + WebSocket server
    let http_hub = hub.clone();
    let http_shutdown = shutdown.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server::run_server(http_hub, http_shutdown).await {
            tracing::error!("❌ HTTP server failed: {}", e);
        }
    });
    logging::log_status("🌐", "HTTP Server", "LISTENING", true);

    // 7. Lifecycle sweepers
    let ghost_handle = tokio::spawn(sweeper::ghost_room_loop(
        hub.clone(),
        config.ghost_sweep_interval,
        config.ghost_room_max_age,
        shutdown.subscribe(),
    ));
    logging::log_status("👻", "Ghost Room Sweeper", "RUNNING", true);

    let limits_handle = tokio::spawn(sweeper::rate_limit_loop(
        hub.clone(),
        config.rate_limit_sweep_interval,
        shutdown.subscribe(),
    ));
    logging::log_status("🧹", "Rate Limit Sweeper", "RUNNING", true);

    println!("\n{}", "✅ All services started successfully!".bright_green().bold());
    println!("{}\n", "━".repeat(60).bright_black());

    // 8. Wait for shutdown signal
    shutdown.wait_for_signal().await;
    println!("\n{}", "🛑 Shutting down services...".bright_yellow().bold());
    println!("{}", "━".repeat(60).bright_black());

    // 9. Stop everything and wait with a timeout
    let result = shutdown
        .drain(
            vec![
                ("http", http_handle),
                ("ghost-sweeper", ghost_handle),
                ("rate-limit-sweeper", limits_handle),
            ],
            SHUTDOWN_TIMEOUT,
        )
        .await;
    logging::log_status("🌐", "HTTP Server", "STOPPED", result.is_ok());
    logging::log_status("🧹", "Sweepers", "STOPPED", result.is_ok());

    info!(
        rooms = hub.rooms().len(),
        connections = hub.connection_count(),
        "Final state at shutdown"
    );

    println!("\n{}", "👋 DevRoom service stopped cleanly".bright_green().bold());
    println!("{}\n", "━".repeat(60).bright_black());

    result
}

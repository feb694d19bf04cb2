//! Graceful shutdown
//!
//! One broadcast channel fans the stop signal out to the HTTP server and the
//! sweeper loops. Open sockets are closed by the server's graceful drain.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Shutdown coordinator
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    is_shutting_down: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            shutdown_tx,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Relaxed)
    }

    /// Get a shutdown receiver
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast the stop signal. Idempotent.
    pub fn shutdown(&self) {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Shutdown already in progress");
            return;
        }

        info!("Initiating graceful shutdown");

        if let Err(e) = self.shutdown_tx.send(()) {
            warn!(error = %e, "No component was listening for shutdown");
        }
    }

    /// Wait for Ctrl+C or SIGTERM
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C signal");
            }
            _ = terminate => {
                info!("Received SIGTERM signal");
            }
        }
    }

    /// Signal shutdown, then wait up to `shutdown_timeout` for `tasks` to finish.
    pub async fn drain(
        &self,
        tasks: Vec<(&'static str, tokio::task::JoinHandle<()>)>,
        shutdown_timeout: Duration,
    ) -> Result<()> {
        self.shutdown();

        let wait_tasks = async {
            for (name, task) in tasks {
                match task.await {
                    Ok(()) => info!(task = name, "Task stopped"),
                    Err(e) => error!(task = name, error = %e, "Task join failed"),
                }
            }
        };

        match timeout(shutdown_timeout, wait_tasks).await {
            Ok(()) => Ok(()),
            Err(_) => {
                error!("Shutdown timeout exceeded");
                anyhow::bail!("Shutdown timeout exceeded");
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

//! Supervisor (spec section 4.9).
//!
//! CLI parsing and `WorkerConfig` assembly already live in [`crate::config`];
//! this module owns the one-shot startup checks (required/audit extension
//! probes), signal handling, and the final dispatch into the Notification
//! Loop under exactly one of the two queue handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{QueueMode, WorkerConfig};
use crate::db::DbClient;
use crate::error::WorkerError;
use crate::http_executor::HttpExecutor;
use crate::notify::NotificationLoop;
use crate::queue::{EventQueueHandler, WorkQueueHandler};

/// Runs the worker to completion and returns the process exit code, per
/// spec section 6 / 7: a `Fatal` startup error or a `Shutdown` (terminate
/// signal) both exit 1; `0` is only reached on clean loop termination,
/// which the notification loop never produces in normal operation.
pub async fn run(config: WorkerConfig) -> i32 {
    match run_inner(config).await {
        Ok(()) => 0,
        Err(WorkerError::Shutdown) => {
            info!("shutdown complete");
            1
        }
        Err(WorkerError::Fatal(e)) => {
            error!("FATAL: {e:#}");
            1
        }
        Err(other) => {
            error!("FATAL: {other}");
            1
        }
    }
}

async fn run_inner(config: WorkerConfig) -> Result<(), WorkerError> {
    let options = config
        .connect_options()
        .context("build connection options")
        .map_err(WorkerError::Fatal)?;
    let mut db = DbClient::new(options.clone());

    let required_present = db
        .extension_installed(&config.required_extension)
        .await
        .context("probe required extension")
        .map_err(WorkerError::Fatal)?;
    if !required_present {
        return Err(WorkerError::Fatal(anyhow!(
            "required extension `{}` is not installed",
            config.required_extension
        )));
    }

    let audit_extension_available = db
        .extension_installed(&config.audit_extension)
        .await
        .context("probe audit extension")
        .map_err(WorkerError::Fatal)?;
    if audit_extension_available {
        info!(extension = %config.audit_extension, "audit integration available");
    } else {
        info!(
            extension = %config.audit_extension,
            "audit extension not installed, transaction labelling disabled"
        );
    }

    let shutdown = CancellationToken::new();
    let reload = Arc::new(AtomicBool::new(false));
    install_signal_handlers(shutdown.clone(), reload).map_err(WorkerError::Fatal)?;

    let http = HttpExecutor::new(&config.user_agent)
        .context("build HTTP client")
        .map_err(WorkerError::Fatal)?;

    let mut notifications = NotificationLoop::connect(&options, shutdown.clone())
        .await
        .context("connect notification listener")
        .map_err(WorkerError::Fatal)?;

    let channel = config.channel();
    let result = match config.mode {
        QueueMode::Event => {
            let handler = EventQueueHandler::new(db, config.async_guc_name.clone());
            notifications.listen(channel, handler).await
        }
        QueueMode::Work => {
            let handler =
                WorkQueueHandler::new(db, http, config.clone(), audit_extension_available);
            notifications.listen(channel, handler).await
        }
    };
    result.context("notification loop").map_err(WorkerError::Fatal)?;

    if shutdown.is_cancelled() {
        Err(WorkerError::Shutdown)
    } else {
        Ok(())
    }
}

/// Installs SIGTERM and SIGINT (either cancels the shared token, triggering
/// graceful shutdown: rollback any in-progress transaction, close the
/// connection, release HTTP resources, exit 1) and SIGHUP (sets the reload
/// flag, observed but not otherwise acted upon — spec section 9 Open
/// Question 3) as background tasks.
fn install_signal_handlers(
    shutdown: CancellationToken,
    reload: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let term_shutdown = shutdown.clone();
    tokio::spawn(async move {
        term.recv().await;
        warn!("SIGTERM received, shutting down");
        term_shutdown.cancel();
    });

    let mut int = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    tokio::spawn(async move {
        int.recv().await;
        warn!("SIGINT received, shutting down");
        shutdown.cancel();
    });

    let mut hup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    tokio::spawn(async move {
        loop {
            if hup.recv().await.is_none() {
                break;
            }
            reload.store(true, Ordering::SeqCst);
            info!("SIGHUP received, reload flag set (observed only, not acted upon)");
        }
    });

    Ok(())
}

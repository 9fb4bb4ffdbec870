//! Notification Loop (spec section 4.2).
//!
//! Listens on a channel, pre-drains, then alternates between waiting for the
//! next notification and draining the handler to empty, honouring a shared
//! cancellation token between iterations.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One dequeue-and-process attempt. Returns the number of rows processed;
/// `0` means "queue empty or spurious notification" and ends the inner
/// drain.
#[async_trait]
pub trait QueueHandler: Send {
    async fn handle_once(&mut self) -> Result<u32>;
}

pub struct NotificationLoop {
    listener: PgListener,
    shutdown: CancellationToken,
}

impl NotificationLoop {
    pub async fn connect(options: &PgConnectOptions, shutdown: CancellationToken) -> Result<Self> {
        // A single-connection pool: `PgListener` wants a `&PgPool`, but this
        // worker is single-connection by design (spec section 5), so the
        // pool exists only to satisfy that API and never grows past one.
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        let listener = PgListener::connect_with(&pool).await?;
        Ok(Self { listener, shutdown })
    }

    /// Subscribe to `channel` exactly once, pre-drain, then run the
    /// drain-on-wake loop until shutdown is observed.
    pub async fn listen<H: QueueHandler>(&mut self, channel: &str, mut handler: H) -> Result<()> {
        self.listener.listen(channel).await?;
        info!(channel, "subscribed to notification channel");

        drain(&mut handler).await?;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                notification = self.listener.recv() => {
                    match notification {
                        Ok(n) => {
                            debug!(payload = n.payload(), "received notification");
                            drain(&mut handler).await?;
                        }
                        Err(e) => {
                            warn!(error = %e, "notification stream error, resubscribing");
                            self.listener.listen(channel).await?;
                        }
                    }
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }
        }

        Ok(())
    }
}

/// Invoke `handler` until it reports zero rows processed, per the
/// drain-to-empty testable property in spec section 8.
async fn drain<H: QueueHandler>(handler: &mut H) -> Result<()> {
    loop {
        let processed = handler.handle_once().await?;
        if processed == 0 {
            return Ok(());
        }
    }
}

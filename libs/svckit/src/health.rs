//! Periodic heartbeat against the service directory.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::directory::{HeartbeatOutcome, Registration};
use crate::telemetry::ThrottledLog;

const OUTAGE_LOG_EVERY: Duration = Duration::from_secs(60);

/// Background task heartbeating one [`Registration`] at a fixed interval.
///
/// Directory outages are logged and retried on the next tick, never faster.
/// An expired record is registered again by [`Registration::heartbeat`].
pub struct HealthSignal {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthSignal {
    /// Spawn the heartbeat loop. The first tick fires one `interval` from now.
    #[must_use]
    pub fn spawn(registration: Arc<Registration>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(registration, interval, cancel.clone()));
        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Cancel the loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "Heartbeat task ended abnormally");
        }
    }
}

async fn run(registration: Arc<Registration>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut outage_log = ThrottledLog::new(OUTAGE_LOG_EVERY);
    let descriptor = registration.descriptor();

    tracing::debug!(
        service = descriptor.name(),
        instance_id = descriptor.instance_id(),
        interval = %humantime::format_duration(interval),
        "Heartbeat started"
    );

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            outcome = registration.heartbeat() => outcome,
        };

        match outcome {
            Ok(HeartbeatOutcome::Refreshed) => {
                outage_log.reset();
                tracing::trace!(instance_id = descriptor.instance_id(), "Heartbeat sent");
            }
            Ok(HeartbeatOutcome::Registered | HeartbeatOutcome::Reregistered) => {
                outage_log.reset();
                tracing::info!(
                    service = descriptor.name(),
                    instance_id = descriptor.instance_id(),
                    "Registered with directory"
                );
            }
            Err(err) => {
                if let Some(suppressed) = outage_log.check() {
                    tracing::warn!(
                        service = descriptor.name(),
                        instance_id = descriptor.instance_id(),
                        error = %err,
                        suppressed,
                        "Directory heartbeat failed, retrying on next interval"
                    );
                }
            }
        }
    }

    tracing::debug!(instance_id = descriptor.instance_id(), "Heartbeat stopped");
}

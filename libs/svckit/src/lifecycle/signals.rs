//! SIGINT/SIGTERM trap feeding the lifecycle's shutdown token.

use anyhow::Result;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancel `shutdown` on the first SIGINT or SIGTERM. The task ends as soon as
/// `shutdown` is cancelled by anyone, so joining it never hangs after a stop.
#[must_use]
pub fn trap(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown.cancelled() => {}
            received = wait_for_shutdown() => match received {
                Ok(name) => {
                    tracing::info!(signal = name, "Shutdown signal received, stopping service");
                    shutdown.cancel();
                }
                Err(err) => tracing::warn!(error = %err, "Signal handling unavailable"),
            },
        }
    })
}

/// Resolve with the name of the first termination signal received.
///
/// # Errors
/// Returns an error if a signal handler cannot be installed.
pub async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::select! {
        name = ctrl_c() => name,
        name = sigterm() => name,
    }
}

async fn ctrl_c() -> Result<&'static str> {
    signal::ctrl_c().await?;
    Ok("SIGINT")
}

#[cfg(unix)]
async fn sigterm() -> Result<&'static str> {
    signal::unix::signal(signal::unix::SignalKind::terminate())?
        .recv()
        .await;
    Ok("SIGTERM")
}

#[cfg(not(unix))]
async fn sigterm() -> Result<&'static str> {
    std::future::pending().await
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trap_exits_when_shutdown_is_cancelled_elsewhere() {
        let shutdown = CancellationToken::new();
        let handle = trap(shutdown.clone());

        shutdown.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

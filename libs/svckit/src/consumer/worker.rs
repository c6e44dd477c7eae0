//! The action pull loop.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::broker::{Broker, Subscription};
use super::handler::ActionHandler;
use super::message::ActionMessage;
use crate::backoff;
use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::telemetry::ThrottledLog;

const RECONNECT_LOG_EVERY: std::time::Duration = std::time::Duration::from_secs(60);

/// `idle → running → draining → stopped`; `idle → stopped` when stopped
/// before it ever ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        })
    }
}

/// Pulls [`ActionMessage`]s from a [`Broker`] and dispatches each one to a
/// single [`ActionHandler`], one at a time, in subscription order.
///
/// Handler errors and panics are logged and isolated to the message that
/// caused them. `stop` may be called from any task.
pub struct ActionConsumer {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn ActionHandler>,
    config: ConsumerConfig,
    state: watch::Sender<ConsumerState>,
    cancel: CancellationToken,
    dispatched: AtomicU64,
    failed: AtomicU64,
}

impl fmt::Debug for ActionConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionConsumer")
            .field("state", &*self.state.borrow())
            .field("config", &self.config)
            .field("dispatched", &self.dispatched())
            .field("failed", &self.failed())
            .finish_non_exhaustive()
    }
}

impl ActionConsumer {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        handler: Arc<dyn ActionHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            handler,
            config,
            state: watch::Sender::new(ConsumerState::Idle),
            cancel: CancellationToken::new(),
            dispatched: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Messages whose handler returned `Ok`.
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Messages whose handler failed or panicked.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Subscribe to the broker, retrying with exponential backoff up to
    /// `connect_attempts` times.
    ///
    /// # Errors
    /// [`ConsumerError::BrokerConnection`] once the attempts are exhausted,
    /// [`ConsumerError::Cancelled`] if [`Self::stop`] was called meanwhile.
    pub async fn connect(&self) -> Result<Box<dyn Subscription>, ConsumerError> {
        let attempts = self.config.connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ConsumerError::Cancelled);
            }
            match self.broker.subscribe().await {
                Ok(subscription) => {
                    tracing::debug!(attempt, "Subscribed to broker");
                    return Ok(subscription);
                }
                Err(source) if attempt >= attempts => {
                    return Err(ConsumerError::BrokerConnection { attempts, source });
                }
                Err(err) => {
                    tracing::warn!(attempt, attempts, error = %err, "Broker connection failed, retrying");
                    let delay = backoff::delay_for(
                        attempt,
                        self.config.backoff_base,
                        self.config.backoff_max,
                    );
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Err(ConsumerError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// [`Self::connect`], then [`Self::consume`].
    ///
    /// # Errors
    /// See [`Self::connect`] and [`Self::consume`].
    pub async fn run(&self) -> Result<(), ConsumerError> {
        let subscription = self.connect().await?;
        self.consume(subscription).await
    }

    /// Pull loop over an already open subscription. Returns after
    /// [`Self::stop`] once the in-flight dispatch has finished and the
    /// subscription is closed.
    ///
    /// Receive failures and closed subscriptions trigger reconnection with
    /// exponential backoff for as long as the consumer is running.
    ///
    /// # Errors
    /// [`ConsumerError::InvalidState`] unless the consumer is idle.
    pub async fn consume(
        &self,
        mut subscription: Box<dyn Subscription>,
    ) -> Result<(), ConsumerError> {
        let started = self.state.send_if_modified(|state| {
            if *state == ConsumerState::Idle {
                *state = ConsumerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            subscription.close().await;
            return Err(ConsumerError::InvalidState(self.state()));
        }
        tracing::info!("Action consumer running");

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                next = subscription.recv() => next,
            };

            match next {
                Ok(Some(message)) => self.dispatch(message).await,
                Ok(None) => {
                    tracing::warn!("Broker closed the subscription, reconnecting");
                    if !self.reconnect(&mut subscription).await {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Broker receive failed, reconnecting");
                    if !self.reconnect(&mut subscription).await {
                        break;
                    }
                }
            }
        }

        subscription.close().await;
        self.state.send_replace(ConsumerState::Stopped);
        tracing::info!(
            dispatched = self.dispatched(),
            failed = self.failed(),
            "Action consumer stopped"
        );
        Ok(())
    }

    /// Replace a broken subscription. Retries until it succeeds or the
    /// consumer is stopped; returns `false` in the latter case.
    async fn reconnect(&self, subscription: &mut Box<dyn Subscription>) -> bool {
        subscription.close().await;
        let mut log = ThrottledLog::new(RECONNECT_LOG_EVERY);
        let mut attempt: u32 = 1;
        loop {
            let delay = backoff::delay_for(attempt, self.config.backoff_base, self.config.backoff_max);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                () = tokio::time::sleep(delay) => {}
            }
            match self.broker.subscribe().await {
                Ok(fresh) => {
                    *subscription = fresh;
                    tracing::info!(attempt, "Reconnected to broker");
                    return true;
                }
                Err(err) => {
                    if let Some(suppressed) = log.check() {
                        tracing::warn!(attempt, suppressed, error = %err, "Broker reconnect failed");
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn dispatch(&self, message: ActionMessage) {
        let outcome = AssertUnwindSafe(self.handler.handle(&message))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    correlation_id = %message.correlation_id,
                    action_type = %message.action_type,
                    "Action handled"
                );
            }
            Ok(Err(err)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    correlation_id = %message.correlation_id,
                    action_type = %message.action_type,
                    error = %err,
                    "Action handler failed"
                );
            }
            Err(panic) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    correlation_id = %message.correlation_id,
                    action_type = %message.action_type,
                    panic = panic_message(&*panic),
                    "Action handler panicked"
                );
            }
        }
    }

    /// Mark the consumer stopped after its task was aborted mid-dispatch.
    pub(crate) fn force_stopped(&self) {
        self.state.send_replace(ConsumerState::Stopped);
    }

    /// Stop intake and wait for the in-flight dispatch, at most
    /// `drain_timeout`. Safe to call from any task, any number of times.
    pub async fn stop(&self) {
        let transitioned = self.state.send_if_modified(|state| match state {
            ConsumerState::Idle => {
                *state = ConsumerState::Stopped;
                true
            }
            ConsumerState::Running => {
                *state = ConsumerState::Draining;
                true
            }
            ConsumerState::Draining | ConsumerState::Stopped => false,
        });
        self.cancel.cancel();
        if transitioned {
            tracing::debug!(state = %self.state(), "Action consumer stop requested");
        }

        let mut state = self.state.subscribe();
        let drained = tokio::time::timeout(
            self.config.drain_timeout,
            state.wait_for(|s| *s == ConsumerState::Stopped),
        )
        .await
        .is_ok();
        if !drained {
            tracing::warn!(
                timeout = %humantime::format_duration(self.config.drain_timeout),
                "Action consumer did not drain in time"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

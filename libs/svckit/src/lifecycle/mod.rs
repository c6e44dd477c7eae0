//! The service lifecycle: one entry point to start and stop the directory
//! registration, the action consumer and the foreground server together.

pub mod signals;
mod state;

pub use state::LifecycleState;

use std::sync::{Arc, OnceLock};

use axum::Router;
use parking_lot::Mutex;
use svckit_directory_sdk::{DirectoryClient, ServiceDescriptor};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::consumer::{ActionConsumer, ActionHandler, Broker, ConsumerState};
use crate::directory::Registration;
use crate::error::{ConsumerError, LifecycleError, StartupStage};
use crate::health::HealthSignal;
use crate::server::{AxumServer, ForegroundServer, health_router};

enum ServerSpec {
    Router(Router),
    Custom(Box<dyn ForegroundServer>),
}

/// Builder for [`ServiceLifecycle`].
pub struct ServiceLifecycleBuilder {
    config: ServiceConfig,
    directory: Arc<dyn DirectoryClient>,
    action: Option<(Arc<dyn Broker>, Arc<dyn ActionHandler>)>,
    server: Option<ServerSpec>,
}

impl ServiceLifecycleBuilder {
    /// Consume action messages from `broker` with `handler` while running.
    #[must_use]
    pub fn with_action_handler(
        mut self,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        self.action = Some((broker, handler));
        self
    }

    /// Serve `router` in the foreground, with the health route merged in.
    #[must_use]
    pub fn with_router(mut self, router: Router) -> Self {
        self.server = Some(ServerSpec::Router(router));
        self
    }

    /// Use a custom foreground server. No health route is added.
    #[must_use]
    pub fn with_server(mut self, server: Box<dyn ForegroundServer>) -> Self {
        self.server = Some(ServerSpec::Custom(server));
        self
    }

    /// # Errors
    /// Returns [`LifecycleError::Config`] if the configuration is invalid.
    pub fn build(self) -> Result<ServiceLifecycle, LifecycleError> {
        self.config.validate()?;

        let (state, _) = watch::channel(LifecycleState::Created);
        let server: Option<Box<dyn ForegroundServer>> = match self.server {
            Some(ServerSpec::Router(router)) => Some(Box::new(AxumServer::new(router.merge(
                health_router(&self.config.health_check_path, state.subscribe()),
            )))),
            Some(ServerSpec::Custom(server)) => Some(server),
            None => None,
        };

        Ok(ServiceLifecycle {
            config: self.config,
            directory: self.directory,
            action: self.action,
            server: Mutex::new(server),
            state,
            shutdown: CancellationToken::new(),
            components: tokio::sync::Mutex::new(None),
            descriptor: OnceLock::new(),
            consumer_state: OnceLock::new(),
            signal_task: Mutex::new(None),
        })
    }
}

struct ConsumerTask {
    consumer: Arc<ActionConsumer>,
    task: JoinHandle<Result<(), ConsumerError>>,
}

/// Everything `start` brought up, in start order.
#[derive(Default)]
struct Components {
    consumer: Option<ConsumerTask>,
    registration: Option<Arc<Registration>>,
    health: Option<HealthSignal>,
    server_done: Option<watch::Receiver<bool>>,
}

/// Coordinates one service instance.
///
/// `start` runs the foreground server and returns only after the stop
/// sequence completed, whether it was triggered by [`Self::stop`], a signal
/// or a server error. `start` and `stop` are serialised by an internal lock.
pub struct ServiceLifecycle {
    config: ServiceConfig,
    directory: Arc<dyn DirectoryClient>,
    action: Option<(Arc<dyn Broker>, Arc<dyn ActionHandler>)>,
    server: Mutex<Option<Box<dyn ForegroundServer>>>,
    state: watch::Sender<LifecycleState>,
    shutdown: CancellationToken,
    components: tokio::sync::Mutex<Option<Components>>,
    descriptor: OnceLock<ServiceDescriptor>,
    consumer_state: OnceLock<watch::Receiver<ConsumerState>>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ServiceLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceLifecycle")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("descriptor", &self.descriptor.get())
            .finish_non_exhaustive()
    }
}

impl ServiceLifecycle {
    #[must_use]
    pub fn builder(
        config: ServiceConfig,
        directory: Arc<dyn DirectoryClient>,
    ) -> ServiceLifecycleBuilder {
        ServiceLifecycleBuilder {
            config,
            directory,
            action: None,
            server: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Identity of this instance, available once `start` got past binding.
    #[must_use]
    pub fn descriptor(&self) -> Option<&ServiceDescriptor> {
        self.descriptor.get()
    }

    /// State of the action consumer, once `start` created one.
    #[must_use]
    pub fn consumer_state(&self) -> Option<ConsumerState> {
        self.consumer_state.get().map(|state| *state.borrow())
    }

    /// Cancelling this token asks a running `start` to stop; `start` then
    /// performs the stop sequence itself.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start every component, then serve in the foreground until shutdown.
    ///
    /// # Errors
    /// - [`LifecycleError::AlreadyStarted`] unless the lifecycle is `created`.
    /// - [`LifecycleError::StartupFailure`] when a component fails to start;
    ///   the components started before it are torn down first.
    /// - [`LifecycleError::Server`] when the foreground server fails; the
    ///   stop sequence has run when this is returned.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Created {
                *state = LifecycleState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(LifecycleError::AlreadyStarted);
        }
        tracing::info!(service = %self.config.name, "Starting service");

        if self.config.trap_signals {
            self.spawn_signal_watcher();
        }

        let mut server = self.server.lock().take();
        let (server_done_tx, server_done) = watch::channel(false);

        let startup = {
            let mut slot = self.components.lock().await;
            let mut started = Components {
                server_done: Some(server_done),
                ..Components::default()
            };
            match self.start_components(&mut server, &mut started).await {
                Ok(()) => {
                    *slot = Some(started);
                    Ok(())
                }
                Err(err) => {
                    started.server_done = None;
                    self.teardown(started).await;
                    Err(err)
                }
            }
        };
        if let Err(err) = startup {
            tracing::error!(service = %self.config.name, error = %err, "Service failed to start");
            self.state.send_replace(LifecycleState::Failed);
            self.shutdown.cancel();
            self.join_signal_watcher().await;
            return Err(err);
        }

        // a concurrent stop may have won the lock right after startup
        let running = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Starting {
                *state = LifecycleState::Running;
                true
            } else {
                false
            }
        });

        let outcome = if !running || self.shutdown.is_cancelled() {
            Ok(())
        } else if let Some(server) = server {
            tracing::info!(service = %self.config.name, "Service running");
            self.serve_until_shutdown(server, &server_done_tx).await
        } else {
            tracing::info!(service = %self.config.name, "Service running without a foreground server");
            self.shutdown.cancelled().await;
            Ok(())
        };
        server_done_tx.send_replace(true);

        let result = outcome.map_err(|err| {
            tracing::error!(service = %self.config.name, error = %err, "Foreground server failed");
            self.state.send_replace(LifecycleState::Failed);
            LifecycleError::Server(err)
        });
        self.stop().await;
        result
    }

    /// Serve in the foreground. Once shutdown is requested the stop sequence
    /// runs while the server drains, and the drain is bounded by
    /// `shutdown_timeout`.
    async fn serve_until_shutdown(
        &self,
        server: Box<dyn ForegroundServer>,
        server_done: &watch::Sender<bool>,
    ) -> anyhow::Result<()> {
        let serving = server.serve(self.shutdown.clone());
        tokio::pin!(serving);

        tokio::select! {
            outcome = &mut serving => return outcome,
            () = self.shutdown.cancelled() => {}
        }

        let drain = async {
            let drained = tokio::time::timeout(self.config.shutdown_timeout, &mut serving).await;
            server_done.send_replace(true);
            drained.unwrap_or_else(|_| {
                tracing::warn!(
                    timeout = %humantime::format_duration(self.config.shutdown_timeout),
                    "Foreground server still had requests in flight, abandoning them"
                );
                Ok(())
            })
        };
        let (outcome, ()) = tokio::join!(drain, self.stop());
        outcome
    }

    async fn start_components(
        &self,
        server: &mut Option<Box<dyn ForegroundServer>>,
        started: &mut Components,
    ) -> Result<(), LifecycleError> {
        let port = match server.as_mut() {
            Some(server) => server
                .bind(&self.config.host, self.config.port)
                .await
                .map_err(|err| LifecycleError::startup(StartupStage::Bind, err))?
                .port(),
            None => self.config.port,
        };

        let descriptor = ServiceDescriptor::new(&self.config.name, &self.config.host, port)
            .map_err(|err| LifecycleError::startup(StartupStage::Descriptor, err))?
            .with_health_check_path(&self.config.health_check_path);
        if self.descriptor.set(descriptor.clone()).is_err() {
            tracing::debug!("Descriptor already assigned");
        }
        tracing::info!(
            service = descriptor.name(),
            instance_id = descriptor.instance_id(),
            address = %descriptor.address(),
            "Service instance created"
        );

        if let Some((broker, handler)) = &self.action {
            let consumer = Arc::new(ActionConsumer::new(
                Arc::clone(broker),
                Arc::clone(handler),
                self.config.consumer.clone(),
            ));
            let subscription = consumer
                .connect()
                .await
                .map_err(|err| LifecycleError::startup(StartupStage::Consumer, err))?;
            let task = tokio::spawn({
                let consumer = Arc::clone(&consumer);
                async move { consumer.consume(subscription).await }
            });
            if self.consumer_state.set(consumer.subscribe_state()).is_err() {
                tracing::debug!("Consumer state already assigned");
            }
            started.consumer = Some(ConsumerTask { consumer, task });
        }

        if self.config.auto_register {
            let registration = Arc::new(
                Registration::new(Arc::clone(&self.directory), descriptor, self.config.ttl)
                    .with_deregister_attempts(self.config.directory.deregister_attempts),
            );
            started.registration = Some(Arc::clone(&registration));

            match registration.register().await {
                Ok(record) => tracing::info!(
                    instance_id = record.instance_id(),
                    ttl = %humantime::format_duration(record.ttl),
                    health_check = %record.health_check_endpoint,
                    "Registered with directory"
                ),
                Err(err) if self.config.require_registration => {
                    return Err(LifecycleError::startup(StartupStage::Registration, err));
                }
                Err(err) => tracing::warn!(
                    error = %err,
                    "Directory registration failed, retrying on the heartbeat interval"
                ),
            }

            started.health = Some(HealthSignal::spawn(
                registration,
                self.config.heartbeat_interval(),
            ));
        }

        Ok(())
    }

    /// Stop everything `start` brought up: halt the foreground loop, stop the
    /// heartbeat, deregister, drain the consumer, then wait for the server to
    /// release. Idempotent; before `start` it just marks the lifecycle stopped.
    pub async fn stop(&self) {
        let mut slot = self.components.lock().await;
        let Some(components) = slot.take() else {
            let stopped_early = self.state.send_if_modified(|state| {
                if *state == LifecycleState::Created {
                    *state = LifecycleState::Stopped;
                    true
                } else {
                    false
                }
            });
            if stopped_early {
                tracing::debug!("Stopped before start");
            }
            return;
        };

        let failed = self.state() == LifecycleState::Failed;
        if !failed {
            self.state.send_replace(LifecycleState::Stopping);
        }
        tracing::info!(service = %self.config.name, "Stopping service");

        self.teardown(components).await;
        self.join_signal_watcher().await;

        if !failed {
            self.state.send_replace(LifecycleState::Stopped);
        }
        tracing::info!(service = %self.config.name, state = %self.state(), "Service stopped");
    }

    async fn teardown(&self, components: Components) {
        let Components {
            consumer,
            registration,
            health,
            server_done,
        } = components;

        self.shutdown.cancel();

        if let Some(health) = health {
            health.stop().await;
        }
        if let Some(registration) = registration {
            registration.deregister().await;
        }
        if let Some(ConsumerTask { consumer, task }) = consumer {
            consumer.stop().await;
            if consumer.state() == ConsumerState::Stopped {
                match task.await {
                    // stopped before its first poll during a rollback
                    Ok(Ok(()) | Err(ConsumerError::InvalidState(ConsumerState::Stopped))) => {}
                    Ok(Err(err)) => tracing::warn!(error = %err, "Action consumer exited with error"),
                    Err(err) => tracing::warn!(error = %err, "Action consumer task failed"),
                }
            } else {
                tracing::warn!("Aborting action consumer stuck in a handler");
                task.abort();
                consumer.force_stopped();
                if let Err(err) = task.await
                    && !err.is_cancelled()
                {
                    tracing::warn!(error = %err, "Action consumer task failed");
                }
            }
        }
        if let Some(mut done) = server_done {
            let released = tokio::time::timeout(
                self.config.shutdown_timeout,
                done.wait_for(|released| *released),
            )
            .await
            .is_ok();
            if !released {
                tracing::warn!(
                    timeout = %humantime::format_duration(self.config.shutdown_timeout),
                    "Foreground server did not release in time"
                );
            }
        }
    }

    fn spawn_signal_watcher(&self) {
        *self.signal_task.lock() = Some(signals::trap(self.shutdown.clone()));
    }

    async fn join_signal_watcher(&self) {
        let handle = self.signal_task.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "Signal watcher ended abnormally");
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::consumer::{ChannelBroker, handler_fn};
    use crate::directory::LocalDirectory;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn rollback_before_consumer_runs_is_not_an_error() {
        let directory = Arc::new(LocalDirectory::new());
        directory.set_available(false);
        let mut config = ServiceConfig::named("rollback");
        config.trap_signals = false;
        config.require_registration = true;
        let lifecycle = ServiceLifecycle::builder(config, directory)
            .with_action_handler(
                Arc::new(ChannelBroker::new(4)),
                Arc::new(handler_fn(|_msg| async { Ok(()) })),
            )
            .build()
            .unwrap();

        let err = lifecycle.start().await.unwrap_err();

        assert!(matches!(
            err,
            LifecycleError::StartupFailure {
                stage: StartupStage::Registration,
                ..
            }
        ));
        assert_eq!(lifecycle.consumer_state(), Some(ConsumerState::Stopped));
        assert!(logs_contain("Service failed to start"));
        assert!(!logs_contain("Action consumer exited with error"));
    }
}

//! svckit - lifecycle and messaging coordination for network services.
//!
//! A [`ServiceLifecycle`] ties together three pieces that run next to the
//! service's own foreground server:
//!
//! - directory registration kept alive by a [`HealthSignal`],
//! - an [`ActionConsumer`] pulling action messages from a broker,
//! - the foreground server itself ([`server::ForegroundServer`]).
//!
//! ```no_run
//! use std::sync::Arc;
//! use svckit::{LocalDirectory, ServiceConfig, ServiceLifecycle};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = ServiceConfig::named("billing");
//! let lifecycle = ServiceLifecycle::builder(config, Arc::new(LocalDirectory::new()))
//!     .with_router(axum::Router::new())
//!     .build()?;
//! lifecycle.start().await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod backoff;
pub mod config;
pub mod consumer;
pub mod directory;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod server;
pub mod telemetry;

pub use config::{ConsumerConfig, DirectoryConfig, DirectoryKind, LoggingConfig, ServiceConfig};
pub use consumer::{
    ActionConsumer, ActionHandler, ActionMessage, Broker, ChannelBroker, ChannelPublisher,
    ConsumerState, Subscription, handler_fn,
};
pub use directory::{ConsulDirectoryClient, LocalDirectory, Registration};
pub use error::{BrokerError, ConfigError, ConsumerError, HandlerError, LifecycleError, StartupStage};
pub use health::HealthSignal;
pub use lifecycle::{LifecycleState, ServiceLifecycle, ServiceLifecycleBuilder};

pub use svckit_directory_sdk as directory_sdk;

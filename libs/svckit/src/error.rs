//! Error types for the lifecycle, the consumer and configuration.

use std::fmt;

use thiserror::Error;

use crate::consumer::ConsumerState;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure talking to the message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker receive failed: {0}")]
    Receive(String),
    #[error("broker queue is full")]
    Full,
}

/// Failure reported by a user action handler for a single message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl HandlerError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: format!("{err:#}"),
            source: Some(err.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("broker connection failed after {attempts} attempts: {source}")]
    BrokerConnection {
        attempts: u32,
        #[source]
        source: BrokerError,
    },
    #[error("consumer cannot run from state {0}")]
    InvalidState(ConsumerState),
    #[error("consumer stopped before the broker connection was established")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[source] Box<figment::Error>),
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Point in `ServiceLifecycle::start` where a startup failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStage {
    Descriptor,
    Consumer,
    Registration,
    Bind,
}

impl fmt::Display for StartupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Descriptor => "descriptor",
            Self::Consumer => "consumer",
            Self::Registration => "registration",
            Self::Bind => "bind",
        })
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("service lifecycle was already started")]
    AlreadyStarted,

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unrecoverable error before the foreground loop was reached. Everything
    /// started before `stage` has been torn down when this is returned.
    #[error("startup failed at {stage}: {source}")]
    StartupFailure {
        stage: StartupStage,
        #[source]
        source: BoxError,
    },

    #[error("foreground server failed: {0:#}")]
    Server(anyhow::Error),
}

impl LifecycleError {
    pub(crate) fn startup(stage: StartupStage, source: impl Into<BoxError>) -> Self {
        Self::StartupFailure {
            stage,
            source: source.into(),
        }
    }
}

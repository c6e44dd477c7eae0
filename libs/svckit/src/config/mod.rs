//! Service configuration.
//!
//! Layers, lowest priority first: built-in defaults, an optional YAML file,
//! then `SVCKIT__*` environment variables (`SVCKIT__DIRECTORY__KIND=consul`).
//! Command-line overrides are applied by the binary on the extracted value.

pub mod humantime_serde;

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_PREFIX: &str = "SVCKIT__";

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

const fn default_port() -> u16 {
    8000
}

const fn default_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_health_check_path() -> String {
    svckit_directory_sdk::DEFAULT_HEALTH_CHECK_PATH.to_owned()
}

const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Options recognised by [`crate::ServiceLifecycle`].
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Directory name of the service. Required.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Forces debug-level logging.
    pub debug: bool,
    /// Register with the directory on start and heartbeat until stop.
    pub auto_register: bool,
    /// Treat a failed registration at start as fatal. When false the
    /// heartbeat loop keeps retrying registration in the background.
    pub require_registration: bool,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Defaults to half the TTL.
    #[serde(
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub heartbeat_interval: Option<Duration>,
    pub health_check_path: String,
    /// Upper bound on waiting for the foreground server to release.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Stop on SIGINT/SIGTERM.
    pub trap_signals: bool,
    pub directory: DirectoryConfig,
    pub consumer: ConsumerConfig,
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: default_host(),
            port: default_port(),
            debug: false,
            auto_register: true,
            require_registration: false,
            ttl: default_ttl(),
            heartbeat_interval: None,
            health_check_path: default_health_check_path(),
            shutdown_timeout: default_shutdown_timeout(),
            trap_signals: true,
            directory: DirectoryConfig::default(),
            consumer: ConsumerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Defaults with the given service name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Load defaults, then `path` (if given), then the environment.
    ///
    /// # Errors
    /// Returns [`ConfigError::Load`] when a layer cannot be parsed or does not
    /// match the schema. Semantic checks are left to [`Self::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::figment(path)
            .extract()
            .map_err(|err| ConfigError::Load(Box::new(err)))
    }

    #[must_use]
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Interval between heartbeats: the configured value or `ttl / 2`.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval.unwrap_or(self.ttl / 2)
    }

    /// # Errors
    /// Returns [`ConfigError::Invalid`] listing every violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("name must not be empty".to_owned());
        }
        if self.host.trim().is_empty() {
            problems.push("host must not be empty".to_owned());
        }
        if self.ttl.is_zero() {
            problems.push("ttl must be greater than zero".to_owned());
        }
        let interval = self.heartbeat_interval();
        if interval.is_zero() {
            problems.push("heartbeat_interval must be greater than zero".to_owned());
        } else if self.ttl < interval.saturating_mul(2) {
            problems.push(format!(
                "ttl ({}) must be at least twice the heartbeat interval ({})",
                humantime::format_duration(self.ttl),
                humantime::format_duration(interval)
            ));
        }
        if !self.health_check_path.starts_with('/') {
            problems.push("health_check_path must start with '/'".to_owned());
        }
        if self.consumer.connect_attempts == 0 {
            problems.push("consumer.connect_attempts must be at least 1".to_owned());
        }
        if self.consumer.backoff_base > self.consumer.backoff_max {
            problems.push("consumer.backoff_base must not exceed consumer.backoff_max".to_owned());
        }
        if self.directory.deregister_attempts == 0 {
            problems.push("directory.deregister_attempts must be at least 1".to_owned());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryKind {
    /// In-process directory; nothing leaves the process.
    #[default]
    Local,
    /// Consul agent HTTP API.
    Consul,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectoryConfig {
    pub kind: DirectoryKind,
    /// Base URL of the directory agent.
    pub address: String,
    /// ACL token, sent as `X-Consul-Token`.
    pub token: Option<String>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Directory-side cleanup of instances whose check stays critical.
    #[serde(with = "humantime_serde")]
    pub deregister_critical_after: Duration,
    /// Attempts made by best-effort deregistration before giving up.
    pub deregister_attempts: u32,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            kind: DirectoryKind::Local,
            address: "http://127.0.0.1:8500".to_owned(),
            token: None,
            request_timeout: Duration::from_secs(5),
            deregister_critical_after: Duration::from_secs(60),
            deregister_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerConfig {
    /// Subscribe attempts during start before giving up.
    pub connect_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    /// Upper bound on `ActionConsumer::stop` waiting for the in-flight message.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
        }
    }
}

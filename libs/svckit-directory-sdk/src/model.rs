//! Directory data model.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DirectoryError;

pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/healthz";

/// Identity of one running service instance.
///
/// `instance_id` is generated once in [`ServiceDescriptor::new`] and has no
/// setter, so it stays fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescriptor {
    name: String,
    host: String,
    port: u16,
    instance_id: String,
    health_check_path: String,
}

impl ServiceDescriptor {
    /// Build a descriptor with a fresh random instance id.
    ///
    /// # Errors
    /// Returns [`DirectoryError::InvalidDescriptor`] if `name` or `host` is blank.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Result<Self, DirectoryError> {
        let name = name.into();
        let host = host.into();
        if name.trim().is_empty() {
            return Err(DirectoryError::InvalidDescriptor(
                "service name must not be empty".to_owned(),
            ));
        }
        if host.trim().is_empty() {
            return Err(DirectoryError::InvalidDescriptor(
                "service host must not be empty".to_owned(),
            ));
        }
        Ok(Self {
            name,
            host,
            port,
            instance_id: Uuid::new_v4().to_string(),
            health_check_path: DEFAULT_HEALTH_CHECK_PATH.to_owned(),
        })
    }

    /// Override the path the directory probes (defaults to `/healthz`).
    #[must_use]
    pub fn with_health_check_path(mut self, path: impl Into<String>) -> Self {
        self.health_check_path = path.into();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn health_check_path(&self) -> &str {
        &self.health_check_path
    }

    /// `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn health_check_endpoint(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.health_check_path)
    }
}

/// Health of a registration as reported by the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Passing => "passing",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

/// Directory-side view of a registered instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub descriptor: ServiceDescriptor,
    pub health_check_endpoint: String,
    pub ttl: Duration,
    pub status: HealthStatus,
}

impl RegistrationRecord {
    /// Record for a freshly accepted registration.
    #[must_use]
    pub fn passing(descriptor: ServiceDescriptor, ttl: Duration) -> Self {
        Self {
            health_check_endpoint: descriptor.health_check_endpoint(),
            descriptor,
            ttl,
            status: HealthStatus::Passing,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        self.descriptor.instance_id()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }
}

/// Entry returned by [`crate::DirectoryClient::list_instances`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstanceInfo {
    pub name: String,
    pub instance_id: String,
    pub address: String,
    pub status: HealthStatus,
}

//! Directory API - contract for registering and keeping alive service instances.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DirectoryError;
use crate::model::{RegistrationRecord, ServiceDescriptor, ServiceInstanceInfo};

/// Client side of a service directory.
///
/// Implementations are network clients (or in-process stand-ins). Calls for
/// the same record must not overlap; `svckit::directory::Registration`
/// serialises them for the lifecycle.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Register `descriptor` with a TTL health check.
    ///
    /// Registering the same `instance_id` twice refreshes the existing entry
    /// instead of creating a second one.
    async fn register(
        &self,
        descriptor: &ServiceDescriptor,
        ttl: Duration,
    ) -> Result<RegistrationRecord, DirectoryError>;

    /// Mark the record's TTL check as passing.
    ///
    /// Returns [`DirectoryError::RecordExpired`] when the directory already
    /// dropped the entry; heartbeating again will not bring it back.
    async fn heartbeat(&self, record: &RegistrationRecord) -> Result<(), DirectoryError>;

    /// Remove the record from the directory.
    async fn deregister(&self, record: &RegistrationRecord) -> Result<(), DirectoryError>;

    /// List live instances registered under `name`.
    async fn list_instances(&self, name: &str) -> Result<Vec<ServiceInstanceInfo>, DirectoryError>;
}

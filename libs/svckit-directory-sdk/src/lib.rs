//! Service directory contract.
//!
//! Types shared by every directory backend and by the lifecycle that drives
//! them. Backends live in `svckit::directory`.

pub mod api;
pub mod error;
pub mod model;

pub use api::DirectoryClient;
pub use error::DirectoryError;
pub use model::{
    DEFAULT_HEALTH_CHECK_PATH, HealthStatus, RegistrationRecord, ServiceDescriptor,
    ServiceInstanceInfo,
};

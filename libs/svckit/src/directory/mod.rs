//! Directory backends and the per-instance registration handle.

pub mod consul;
pub mod local;
pub mod registration;

use std::sync::Arc;

pub use consul::ConsulDirectoryClient;
pub use local::LocalDirectory;
pub use registration::{HeartbeatOutcome, Registration};

use svckit_directory_sdk::{DirectoryClient, DirectoryError};

use crate::config::{DirectoryConfig, DirectoryKind};

/// Build the backend selected by `config.kind`.
///
/// # Errors
/// Returns [`DirectoryError::Unavailable`] if the HTTP client cannot be built.
pub fn from_config(config: &DirectoryConfig) -> Result<Arc<dyn DirectoryClient>, DirectoryError> {
    Ok(match config.kind {
        DirectoryKind::Local => Arc::new(LocalDirectory::new()),
        DirectoryKind::Consul => Arc::new(ConsulDirectoryClient::new(config)?),
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_kind_builds_an_in_process_directory() {
        let directory = from_config(&DirectoryConfig::default()).unwrap();
        assert!(directory.list_instances("nobody").await.unwrap().is_empty());
    }

    #[test]
    fn consul_kind_builds_a_client() {
        let config = DirectoryConfig {
            kind: DirectoryKind::Consul,
            ..DirectoryConfig::default()
        };
        assert!(from_config(&config).is_ok());
    }
}

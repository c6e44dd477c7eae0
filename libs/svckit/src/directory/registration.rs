//! One instance's registration, with every directory call serialised.

use std::sync::Arc;
use std::time::Duration;

use svckit_directory_sdk::{DirectoryClient, DirectoryError, RegistrationRecord, ServiceDescriptor};
use tokio::sync::Mutex;

use crate::backoff;

const DEREGISTER_RETRY_BASE: Duration = Duration::from_millis(200);
const DEREGISTER_RETRY_MAX: Duration = Duration::from_secs(2);

/// What a successful [`Registration::heartbeat`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// TTL check refreshed.
    Refreshed,
    /// First successful registration (it was deferred or had failed before).
    Registered,
    /// The directory had dropped the record; registered again.
    Reregistered,
}

#[derive(Debug, Default)]
struct State {
    record: Option<RegistrationRecord>,
    withdrawn: bool,
}

/// Owns the [`RegistrationRecord`] of one instance.
///
/// The internal async mutex is held for the full duration of each directory
/// call, so the lifecycle and the heartbeat loop never overlap calls for the
/// same record.
pub struct Registration {
    client: Arc<dyn DirectoryClient>,
    descriptor: ServiceDescriptor,
    ttl: Duration,
    deregister_attempts: u32,
    state: Mutex<State>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("descriptor", &self.descriptor)
            .field("ttl", &self.ttl)
            .field("deregister_attempts", &self.deregister_attempts)
            .finish_non_exhaustive()
    }
}

impl Registration {
    #[must_use]
    pub fn new(client: Arc<dyn DirectoryClient>, descriptor: ServiceDescriptor, ttl: Duration) -> Self {
        Self {
            client,
            descriptor,
            ttl,
            deregister_attempts: 3,
            state: Mutex::new(State::default()),
        }
    }

    #[must_use]
    pub fn with_deregister_attempts(mut self, attempts: u32) -> Self {
        self.deregister_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub async fn is_registered(&self) -> bool {
        self.state.lock().await.record.is_some()
    }

    pub async fn record(&self) -> Option<RegistrationRecord> {
        self.state.lock().await.record.clone()
    }

    /// Register (or refresh) the instance.
    ///
    /// # Errors
    /// Propagates the directory error. After [`Self::deregister`] the
    /// registration is closed and this returns [`DirectoryError::Unavailable`].
    pub async fn register(&self) -> Result<RegistrationRecord, DirectoryError> {
        let mut state = self.state.lock().await;
        if state.withdrawn {
            return Err(DirectoryError::unavailable("registration already withdrawn"));
        }
        let record = self.client.register(&self.descriptor, self.ttl).await?;
        state.record = Some(record.clone());
        Ok(record)
    }

    /// Heartbeat the current record, registering first if there is none and
    /// re-registering when the directory reports it expired.
    ///
    /// # Errors
    /// Returns [`DirectoryError::Unavailable`] on transient failures; callers
    /// retry on their own schedule.
    pub async fn heartbeat(&self) -> Result<HeartbeatOutcome, DirectoryError> {
        let mut state = self.state.lock().await;
        if state.withdrawn {
            return Err(DirectoryError::unavailable("registration already withdrawn"));
        }

        let Some(record) = state.record.clone() else {
            let record = self.client.register(&self.descriptor, self.ttl).await?;
            state.record = Some(record);
            return Ok(HeartbeatOutcome::Registered);
        };

        match self.client.heartbeat(&record).await {
            Ok(()) => Ok(HeartbeatOutcome::Refreshed),
            Err(DirectoryError::RecordExpired { instance_id }) => {
                tracing::warn!(
                    service = self.descriptor.name(),
                    instance_id = %instance_id,
                    "Directory dropped the registration, registering again"
                );
                state.record = None;
                let record = self.client.register(&self.descriptor, self.ttl).await?;
                state.record = Some(record);
                Ok(HeartbeatOutcome::Reregistered)
            }
            Err(err) => Err(err),
        }
    }

    /// Best-effort removal from the directory.
    ///
    /// Retries a bounded number of times, then logs and gives up; the
    /// directory's TTL expiry removes the entry eventually. Only the first
    /// call does any work.
    pub async fn deregister(&self) {
        let mut state = self.state.lock().await;
        if state.withdrawn {
            tracing::debug!(
                instance_id = self.descriptor.instance_id(),
                "Registration already withdrawn"
            );
            return;
        }
        state.withdrawn = true;

        let Some(record) = state.record.take() else {
            tracing::debug!(
                instance_id = self.descriptor.instance_id(),
                "Instance was never registered, nothing to deregister"
            );
            return;
        };

        for attempt in 1..=self.deregister_attempts {
            match self.client.deregister(&record).await {
                Ok(()) => {
                    tracing::info!(
                        service = record.name(),
                        instance_id = record.instance_id(),
                        "Deregistered from directory"
                    );
                    return;
                }
                Err(err) if attempt < self.deregister_attempts => {
                    tracing::warn!(
                        instance_id = record.instance_id(),
                        attempt,
                        error = %err,
                        "Deregistration failed, retrying"
                    );
                    tokio::time::sleep(backoff::delay_for(
                        attempt,
                        DEREGISTER_RETRY_BASE,
                        DEREGISTER_RETRY_MAX,
                    ))
                    .await;
                }
                Err(err) => {
                    tracing::error!(
                        instance_id = record.instance_id(),
                        attempts = self.deregister_attempts,
                        error = %err,
                        "Giving up on deregistration; the directory TTL will expire the record"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::directory::LocalDirectory;
    use svckit_directory_sdk::HealthStatus;

    fn setup(ttl: Duration) -> (Arc<LocalDirectory>, Registration) {
        let dir = Arc::new(LocalDirectory::new());
        let descriptor = ServiceDescriptor::new("orders", "127.0.0.1", 8000).unwrap();
        let reg = Registration::new(dir.clone(), descriptor, ttl);
        (dir, reg)
    }

    #[tokio::test]
    async fn heartbeat_registers_when_deferred() {
        let (dir, reg) = setup(Duration::from_secs(10));
        assert!(!reg.is_registered().await);

        assert_eq!(reg.heartbeat().await.unwrap(), HeartbeatOutcome::Registered);
        assert_eq!(reg.heartbeat().await.unwrap(), HeartbeatOutcome::Refreshed);
        assert_eq!(dir.instance_count("orders"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_record_is_registered_again() {
        let (dir, reg) = setup(Duration::from_secs(4));
        reg.register().await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(reg.heartbeat().await.unwrap(), HeartbeatOutcome::Reregistered);

        let id = reg.descriptor().instance_id().to_owned();
        assert_eq!(dir.status_of("orders", &id), Some(HealthStatus::Passing));
        assert_eq!(dir.stats().registers(), 2);
        assert_eq!(dir.instance_count("orders"), 1);
    }

    #[tokio::test]
    async fn unavailable_heartbeat_keeps_record() {
        let (dir, reg) = setup(Duration::from_secs(10));
        reg.register().await.unwrap();
        dir.set_available(false);

        let err = reg.heartbeat().await.unwrap_err();
        assert!(err.is_transient());
        assert!(reg.is_registered().await);
    }

    #[tokio::test]
    async fn second_deregister_makes_no_round_trip() {
        let (dir, reg) = setup(Duration::from_secs(10));
        reg.register().await.unwrap();

        reg.deregister().await;
        reg.deregister().await;

        assert_eq!(dir.stats().deregisters(), 1);
        assert_eq!(dir.instance_count("orders"), 0);
        assert!(!reg.is_registered().await);
        assert!(reg.register().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deregister_failures_are_bounded_and_swallowed() {
        let (dir, reg) = setup(Duration::from_secs(10));
        let reg = reg.with_deregister_attempts(3);
        reg.register().await.unwrap();
        dir.set_available(false);

        reg.deregister().await;

        assert_eq!(dir.stats().deregisters(), 3);
        // the stale entry is left for TTL expiry
        assert_eq!(dir.instance_count("orders"), 1);
    }

    #[tokio::test]
    async fn deregister_without_registration_is_a_noop() {
        let (dir, reg) = setup(Duration::from_secs(10));
        reg.deregister().await;
        assert_eq!(dir.stats().deregisters(), 0);
    }
}

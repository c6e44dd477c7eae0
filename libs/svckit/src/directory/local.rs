//! In-process directory with TTL semantics.
//!
//! Useful when a service runs without a shared directory, and as a test double
//! for anything that talks to [`DirectoryClient`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use svckit_directory_sdk::{
    DirectoryClient, DirectoryError, HealthStatus, RegistrationRecord, ServiceDescriptor,
    ServiceInstanceInfo,
};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    descriptor: ServiceDescriptor,
    ttl: Duration,
    last_pass: Instant,
}

impl Entry {
    fn status_at(&self, now: Instant) -> HealthStatus {
        if now.saturating_duration_since(self.last_pass) <= self.ttl {
            HealthStatus::Passing
        } else {
            HealthStatus::Critical
        }
    }
}

/// Number of calls received per operation, including failed ones.
#[derive(Debug, Default)]
pub struct CallStats {
    pub registers: AtomicU64,
    pub heartbeats: AtomicU64,
    pub deregisters: AtomicU64,
}

impl CallStats {
    #[must_use]
    pub fn registers(&self) -> u64 {
        self.registers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn deregisters(&self) -> u64 {
        self.deregisters.load(Ordering::Relaxed)
    }
}

/// Directory that keeps registrations in memory, keyed by service name.
///
/// An entry whose last passing signal is older than its TTL is critical and
/// is dropped the next time it is touched (or by [`Self::reap_expired`]).
pub struct LocalDirectory {
    services: DashMap<String, Vec<Entry>>,
    available: AtomicBool,
    stats: CallStats,
}

impl std::fmt::Debug for LocalDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDirectory")
            .field("services", &self.services.len())
            .field("available", &self.available.load(Ordering::Relaxed))
            .field("stats", &self.stats)
            .finish()
    }
}

impl Default for LocalDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            available: AtomicBool::new(true),
            stats: CallStats::default(),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`DirectoryError::Unavailable`]. Stored entries keep ageing.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Status of one instance without purging it; `None` if absent.
    #[must_use]
    pub fn status_of(&self, name: &str, instance_id: &str) -> Option<HealthStatus> {
        let now = Instant::now();
        self.services.get(name).and_then(|entries| {
            entries
                .iter()
                .find(|e| e.descriptor.instance_id() == instance_id)
                .map(|e| e.status_at(now))
        })
    }

    /// Number of stored entries for `name`, expired ones included.
    #[must_use]
    pub fn instance_count(&self, name: &str) -> usize {
        self.services.get(name).map_or(0, |entries| entries.len())
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for mut entries in self.services.iter_mut() {
            let before = entries.len();
            entries.retain(|e| e.status_at(now) == HealthStatus::Passing);
            removed += before - entries.len();
        }
        self.services.retain(|_, entries| !entries.is_empty());
        if removed > 0 {
            tracing::debug!(removed, "Reaped expired directory entries");
        }
        removed
    }

    fn ensure_available(&self) -> Result<(), DirectoryError> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(DirectoryError::unavailable("local directory is offline"))
        }
    }
}

#[async_trait]
impl DirectoryClient for LocalDirectory {
    async fn register(
        &self,
        descriptor: &ServiceDescriptor,
        ttl: Duration,
    ) -> Result<RegistrationRecord, DirectoryError> {
        self.stats.registers.fetch_add(1, Ordering::Relaxed);
        self.ensure_available()?;

        let entry = Entry {
            descriptor: descriptor.clone(),
            ttl,
            last_pass: Instant::now(),
        };
        let mut entries = self
            .services
            .entry(descriptor.name().to_owned())
            .or_default();
        // replace by instance_id if it already exists
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.descriptor.instance_id() == descriptor.instance_id())
        {
            *existing = entry;
        } else {
            entries.push(entry);
        }
        drop(entries);

        tracing::debug!(
            service = descriptor.name(),
            instance_id = descriptor.instance_id(),
            "Registered instance in local directory"
        );
        Ok(RegistrationRecord::passing(descriptor.clone(), ttl))
    }

    async fn heartbeat(&self, record: &RegistrationRecord) -> Result<(), DirectoryError> {
        self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
        self.ensure_available()?;

        let expired = || DirectoryError::RecordExpired {
            instance_id: record.instance_id().to_owned(),
        };
        let Some(mut entries) = self.services.get_mut(record.name()) else {
            return Err(expired());
        };
        let Some(pos) = entries
            .iter()
            .position(|e| e.descriptor.instance_id() == record.instance_id())
        else {
            return Err(expired());
        };

        let now = Instant::now();
        if entries[pos].status_at(now) == HealthStatus::Critical {
            entries.remove(pos);
            return Err(expired());
        }
        entries[pos].last_pass = now;
        Ok(())
    }

    async fn deregister(&self, record: &RegistrationRecord) -> Result<(), DirectoryError> {
        self.stats.deregisters.fetch_add(1, Ordering::Relaxed);
        self.ensure_available()?;

        if let Some(mut entries) = self.services.get_mut(record.name()) {
            entries.retain(|e| e.descriptor.instance_id() != record.instance_id());
        }
        self.services
            .remove_if(record.name(), |_, entries| entries.is_empty());
        Ok(())
    }

    async fn list_instances(&self, name: &str) -> Result<Vec<ServiceInstanceInfo>, DirectoryError> {
        self.ensure_available()?;
        self.reap_expired();

        Ok(self
            .services
            .get(name)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| ServiceInstanceInfo {
                        name: e.descriptor.name().to_owned(),
                        instance_id: e.descriptor.instance_id().to_owned(),
                        address: e.descriptor.address(),
                        status: HealthStatus::Passing,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

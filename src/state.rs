//! Application state shared across components (web, scheduler).

use crate::query::QueryService;
use crate::refresh::RefreshScheduler;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Health status of a service.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Active,
    Disabled,
    Error,
}

/// A timestamped status entry for a service.
#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub status: ServiceStatus,
    pub updated_at: Instant,
}

/// Thread-safe registry for services to self-report their health status.
#[derive(Debug, Clone, Default)]
pub struct ServiceStatusRegistry {
    inner: Arc<DashMap<String, StatusEntry>>,
}

impl ServiceStatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates the status for a named service.
    pub fn set(&self, name: &str, status: ServiceStatus) {
        self.inner.insert(
            name.to_owned(),
            StatusEntry {
                status,
                updated_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<ServiceStatus> {
        self.inner.get(name).map(|entry| entry.status)
    }

    /// All statuses with seconds since their last update.
    pub fn all(&self) -> Vec<(String, ServiceStatus, u64)> {
        self.inner
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().status,
                    entry.value().updated_at.elapsed().as_secs(),
                )
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub queries: QueryService,
    pub scheduler: RefreshScheduler,
    pub service_statuses: ServiceStatusRegistry,
}

impl AppState {
    pub fn new(scheduler: RefreshScheduler, service_statuses: ServiceStatusRegistry) -> Self {
        Self {
            queries: QueryService::new(scheduler.cache().clone()),
            scheduler,
            service_statuses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_overwrites_status() {
        let registry = ServiceStatusRegistry::new();
        registry.set("refresh", ServiceStatus::Starting);
        registry.set("refresh", ServiceStatus::Active);
        assert_eq!(registry.get("refresh"), Some(ServiceStatus::Active));
        assert_eq!(registry.get("web"), None);
        assert_eq!(registry.all().len(), 1);
    }
}

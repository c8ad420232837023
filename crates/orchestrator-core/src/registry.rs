// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Service identifier to endpoint resolution.

use crate::error::{OrchestratorError, Result};
use crate::workflow::ServiceId;
use dashmap::DashMap;

/// Static-ish mapping of `ServiceId` to base URL, seeded at startup.
///
/// Registration is append-only during a run; re-registering the same id
/// replaces its URL atomically (a single `DashMap` entry write).
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    endpoints: DashMap<ServiceId, String>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the base URL for a service.
    pub fn register(&self, service_id: ServiceId, base_url: impl Into<String>) {
        self.endpoints.insert(service_id, base_url.into());
    }

    /// Resolves a service id to its base URL.
    pub fn resolve(&self, service_id: ServiceId) -> Result<String> {
        self.endpoints
            .get(&service_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| OrchestratorError::UnknownService(service_id.to_string()))
    }

    /// True if the service has a registered endpoint.
    pub fn is_registered(&self, service_id: ServiceId) -> bool {
        self.endpoints.contains_key(&service_id)
    }

    /// Snapshot of all registered services, for introspection.
    pub fn all(&self) -> Vec<(ServiceId, String)> {
        self.endpoints
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

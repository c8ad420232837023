// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Engine-wide configuration, with defaults matching the documented
//! external interface.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Recognized configuration options. All fields have defaults, so a bare
/// `OrchestratorConfig::default()` is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub default_step_timeout_ms: u64,
    pub default_retry_count: u32,
    pub max_backoff_ms: u64,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_open_cooldown_ms: u64,
    pub circuit_breaker_cooldown_cap_ms: u64,
    pub event_queue_capacity: usize,
    pub completed_executions_buffer_size: usize,
    pub health_probe_interval_ms: u64,
    pub prepare_timeout_ms: u64,
    pub commit_timeout_ms: u64,
    pub transaction_default_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: 30_000,
            default_retry_count: 3,
            max_backoff_ms: 10_000,
            circuit_breaker_failure_threshold: 3,
            circuit_breaker_open_cooldown_ms: 30_000,
            circuit_breaker_cooldown_cap_ms: 300_000,
            event_queue_capacity: 1024,
            completed_executions_buffer_size: 1000,
            health_probe_interval_ms: 30_000,
            prepare_timeout_ms: 10_000,
            commit_timeout_ms: 15_000,
            transaction_default_timeout_ms: 60_000,
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from a YAML document, falling back to defaults
    /// for any field the document omits.
    pub fn from_yaml(yaml: &str) -> crate::error::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn circuit_breaker_open_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_open_cooldown_ms)
    }

    pub fn circuit_breaker_cooldown_cap(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_cooldown_cap_ms)
    }

    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_millis(self.health_probe_interval_ms)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn transaction_default_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_default_timeout_ms)
    }
}

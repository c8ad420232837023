// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Per-service circuit breaker state, driven by the step executor's call
//! outcomes and (optionally) a background probe loop.

use crate::config::OrchestratorConfig;
use crate::registry::ServiceRegistry;
use crate::remote::{RemoteCaller, RemoteRequest};
use crate::workflow::{HttpMethod, ServiceId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Circuit breaker state for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Suspect,
    Open,
}

/// Mutable health record for one service. All mutation happens through
/// `&mut self` behind a per-service `Mutex`, so updates are serialized
/// per service id while reads of other services proceed unblocked.
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_probe_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
    open_since: Option<Instant>,
    cooldown: Duration,
}

impl ServiceHealth {
    fn new(base_cooldown: Duration) -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_probe_time: None,
            last_success_time: None,
            open_since: None,
            cooldown: base_cooldown,
        }
    }
}

/// Outcome of one remote call attempt, as observed by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Tracks `ServiceHealth` for every registered service and exposes the
/// availability check the step executor consults before each attempt.
pub struct HealthMonitor {
    records: DashMap<ServiceId, Mutex<ServiceHealth>>,
    failure_threshold: u32,
    base_cooldown: Duration,
    cooldown_cap: Duration,
}

impl HealthMonitor {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            records: DashMap::new(),
            failure_threshold: config.circuit_breaker_failure_threshold,
            base_cooldown: config.circuit_breaker_open_cooldown(),
            cooldown_cap: config.circuit_breaker_cooldown_cap(),
        }
    }

    fn ensure_entry(&self, service_id: ServiceId) {
        self.records
            .entry(service_id)
            .or_insert_with(|| Mutex::new(ServiceHealth::new(self.base_cooldown)));
    }

    /// True if the service is currently available for new calls. OPEN
    /// services become available again (transition to HALF_OPEN, which
    /// behaves the same as available for this check) once `open_cooldown`
    /// has elapsed.
    pub fn is_available(&self, service_id: ServiceId) -> bool {
        self.ensure_entry(service_id);
        let guard = self.records.get(&service_id).unwrap();
        let mut health = guard.lock();
        match health.state {
            HealthState::Healthy | HealthState::Suspect => true,
            HealthState::Open => {
                let elapsed = health
                    .open_since
                    .map(|since| since.elapsed())
                    .unwrap_or_default();
                elapsed >= health.cooldown
            }
        }
    }

    /// Records the outcome of a remote call attempt and drives the
    /// HEALTHY -> SUSPECT -> OPEN -> HALF_OPEN(implicit) -> HEALTHY machine.
    pub fn record(&self, service_id: ServiceId, outcome: Outcome) {
        self.ensure_entry(service_id);
        let guard = self.records.get(&service_id).unwrap();
        let mut health = guard.lock();
        let now = Instant::now();
        health.last_probe_time = Some(now);

        match outcome {
            Outcome::Success => {
                health.last_success_time = Some(now);
                health.consecutive_failures = 0;
                health.state = HealthState::Healthy;
                health.open_since = None;
                health.cooldown = self.base_cooldown;
            }
            Outcome::Failure => {
                // If we were OPEN and past cooldown (i.e. this failure came
                // from the admitted HALF_OPEN probe), double the cooldown.
                let was_half_open_probe = health.state == HealthState::Open
                    && health
                        .open_since
                        .map(|since| since.elapsed() >= health.cooldown)
                        .unwrap_or(false);

                health.consecutive_failures += 1;

                if was_half_open_probe {
                    health.cooldown = (health.cooldown * 2).min(self.cooldown_cap);
                    health.open_since = Some(now);
                    health.state = HealthState::Open;
                } else if health.consecutive_failures >= self.failure_threshold {
                    health.state = HealthState::Open;
                    health.open_since = Some(now);
                } else {
                    health.state = HealthState::Suspect;
                }
            }
        }
    }

    /// Snapshot of the current state for a service (Healthy if never seen).
    pub fn state(&self, service_id: ServiceId) -> HealthState {
        self.ensure_entry(service_id);
        self.records.get(&service_id).unwrap().lock().state
    }

    pub fn consecutive_failures(&self, service_id: ServiceId) -> u32 {
        self.ensure_entry(service_id);
        self.records.get(&service_id).unwrap().lock().consecutive_failures
    }

    /// Spawns a background task that probes every service currently
    /// registered in `registry` on `interval`, issuing a lightweight root
    /// request through `caller` and recording the outcome exactly as a step
    /// attempt would. Unit tests construct a bare `HealthMonitor` and never
    /// call this, so the probe loop stays opt-in — a host wires it up once
    /// at startup from within its async runtime.
    pub fn spawn_probe_loop(
        self: &Arc<Self>,
        registry: Arc<ServiceRegistry>,
        caller: Arc<dyn RemoteCaller>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for (service_id, base_url) in registry.all() {
                    let request = RemoteRequest {
                        url: base_url,
                        method: HttpMethod::Get,
                        body: serde_json::Value::Null,
                        timeout: Duration::from_secs(5),
                    };
                    let outcome = match caller.call(request).await {
                        Ok(_) => Outcome::Success,
                        Err(_) => Outcome::Failure,
                    };
                    debug!(service = %service_id, ?outcome, "health probe complete");
                    monitor.record(service_id, outcome);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        let mut cfg = OrchestratorConfig::default();
        cfg.circuit_breaker_failure_threshold = 3;
        cfg.circuit_breaker_open_cooldown_ms = 0;
        cfg.circuit_breaker_cooldown_cap_ms = 1000;
        HealthMonitor::new(&cfg)
    }

    #[test]
    fn unseen_service_is_healthy_and_available() {
        let hm = monitor();
        assert_eq!(hm.state(ServiceId::Nlu), HealthState::Healthy);
        assert!(hm.is_available(ServiceId::Nlu));
    }

    #[test]
    fn one_failure_moves_to_suspect_but_stays_available() {
        let hm = monitor();
        hm.record(ServiceId::Nlu, Outcome::Failure);
        assert_eq!(hm.state(ServiceId::Nlu), HealthState::Suspect);
        assert!(hm.is_available(ServiceId::Nlu));
    }

    #[test]
    fn threshold_failures_open_the_circuit() {
        let hm = monitor();
        hm.record(ServiceId::Nlu, Outcome::Failure);
        hm.record(ServiceId::Nlu, Outcome::Failure);
        hm.record(ServiceId::Nlu, Outcome::Failure);
        assert_eq!(hm.state(ServiceId::Nlu), HealthState::Open);
    }

    #[test]
    fn zero_cooldown_makes_open_circuit_immediately_available() {
        let hm = monitor();
        hm.record(ServiceId::Nlu, Outcome::Failure);
        hm.record(ServiceId::Nlu, Outcome::Failure);
        hm.record(ServiceId::Nlu, Outcome::Failure);
        // cooldown is 0ms in this config, so the breaker is immediately
        // available again (half-open admits a probe).
        assert!(hm.is_available(ServiceId::Nlu));
    }

    #[test]
    fn success_from_any_state_resets_to_healthy() {
        let hm = monitor();
        hm.record(ServiceId::Nlu, Outcome::Failure);
        hm.record(ServiceId::Nlu, Outcome::Failure);
        hm.record(ServiceId::Nlu, Outcome::Failure);
        hm.record(ServiceId::Nlu, Outcome::Success);
        assert_eq!(hm.state(ServiceId::Nlu), HealthState::Healthy);
        assert_eq!(hm.consecutive_failures(ServiceId::Nlu), 0);
    }

    #[test]
    fn failed_half_open_probe_doubles_cooldown() {
        let mut cfg = OrchestratorConfig::default();
        cfg.circuit_breaker_failure_threshold = 1;
        cfg.circuit_breaker_open_cooldown_ms = 0;
        cfg.circuit_breaker_cooldown_cap_ms = 1000;
        let hm = HealthMonitor::new(&cfg);

        hm.record(ServiceId::Nlu, Outcome::Failure); // opens, cooldown 0ms
        assert!(hm.is_available(ServiceId::Nlu)); // half-open probe admitted
        hm.record(ServiceId::Nlu, Outcome::Failure); // probe fails, cooldown doubles (0 -> still 0, but path exercised)
        assert_eq!(hm.state(ServiceId::Nlu), HealthState::Open);
    }

    struct CountingCaller {
        calls: std::sync::atomic::AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl RemoteCaller for CountingCaller {
        async fn call(
            &self,
            _request: RemoteRequest,
        ) -> std::result::Result<serde_json::Value, crate::remote::RemoteCallError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.fail {
                Err(crate::remote::RemoteCallError::Status { status: 503 })
            } else {
                Ok(serde_json::json!({"status": "ok"}))
            }
        }
    }

    #[tokio::test]
    async fn probe_loop_records_outcomes_for_every_registered_service() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(ServiceId::Nlu, "http://nlu.internal");
        registry.register(ServiceId::ImageProcessing, "http://images.internal");

        let hm = Arc::new(monitor());
        let caller = Arc::new(CountingCaller {
            calls: std::sync::atomic::AtomicUsize::new(0),
            fail: true,
        });

        let handle = hm.spawn_probe_loop(registry, caller.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.abort();

        assert!(caller.calls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        assert_ne!(hm.state(ServiceId::Nlu), HealthState::Healthy);
        assert_ne!(hm.state(ServiceId::ImageProcessing), HealthState::Healthy);
        assert!(hm.consecutive_failures(ServiceId::Nlu) > 0);
    }

    #[test]
    fn independent_services_do_not_affect_each_other() {
        let hm = monitor();
        hm.record(ServiceId::Nlu, Outcome::Failure);
        hm.record(ServiceId::Nlu, Outcome::Failure);
        hm.record(ServiceId::Nlu, Outcome::Failure);
        assert_eq!(hm.state(ServiceId::Nlu), HealthState::Open);
        assert_eq!(hm.state(ServiceId::ImageProcessing), HealthState::Healthy);
    }
}

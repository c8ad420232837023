// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Executes one `WorkflowStep`: builds its request payload, retries with
//! backoff against the service's health, and falls back to a canned result
//! when retries are exhausted and the step permits it.

use crate::context::WorkflowContext;
use crate::error::{OrchestratorError, Result};
use crate::fallback;
use crate::health::{HealthMonitor, Outcome};
use crate::metrics::MetricsAggregator;
use crate::registry::ServiceRegistry;
use crate::remote::{RemoteCaller, RemoteCallError, RemoteRequest};
use crate::workflow::WorkflowStep;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The result of running one step to completion.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The remote call succeeded; carries the parsed response body.
    Success(Value),
    /// All attempts failed but the step permitted a fallback.
    Fallback(Value),
}

/// Drives one step's retry loop against a `RemoteCaller`, consulting
/// `HealthMonitor` before each attempt and recording outcomes to both the
/// health monitor and the metrics aggregator.
pub struct StepExecutor {
    registry: Arc<ServiceRegistry>,
    health: Arc<HealthMonitor>,
    caller: Arc<dyn RemoteCaller>,
    metrics: Arc<MetricsAggregator>,
    max_backoff: Duration,
}

impl StepExecutor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        health: Arc<HealthMonitor>,
        caller: Arc<dyn RemoteCaller>,
        metrics: Arc<MetricsAggregator>,
        max_backoff: Duration,
    ) -> Self {
        Self {
            registry,
            health,
            caller,
            metrics,
            max_backoff,
        }
    }

    /// Builds a step's request payload by shallow-merging, in increasing
    /// precedence: the user/session/execution/step identifiers, the step's
    /// `payload_template`, the workflow's caller-supplied `input`, and a
    /// `previous_results` field scoped to the step's declared dependencies.
    fn build_payload(&self, step: &WorkflowStep, ctx: &WorkflowContext) -> Value {
        let mut merged = serde_json::Map::new();
        merged.insert("user_id".to_string(), Value::String(ctx.user_id.clone()));
        merged.insert("session_id".to_string(), Value::String(ctx.session_id.clone()));
        merged.insert(
            "execution_id".to_string(),
            Value::String(ctx.execution_id.to_string()),
        );
        merged.insert("step_id".to_string(), Value::String(step.step_id.clone()));

        if let Some(template) = &step.payload_template {
            for (k, v) in template {
                merged.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &ctx.input {
            merged.insert(k.clone(), v.clone());
        }

        let previous = ctx.previous_results(&step.depends_on);
        merged.insert(
            "previous_results".to_string(),
            serde_json::to_value(previous).unwrap_or(Value::Null),
        );

        Value::Object(merged)
    }

    /// Runs a step to completion: up to `retry_count + 1` attempts, each
    /// bounded by the step's `timeout`, with `min(2^attempt, max_backoff)`
    /// sleep between attempts. Cooperative with `cancel`: checked before
    /// each attempt and during backoff sleeps.
    pub async fn execute(
        &self,
        step: &WorkflowStep,
        ctx: &WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        if !self.health.is_available(step.service_id) {
            warn!(step_id = %step.step_id, service = %step.service_id, "service circuit is open");
            return self.fail_or_fallback(step, OrchestratorError::ServiceUnavailable(step.service_id.to_string()));
        }

        let base_url = self.registry.resolve(step.service_id)?;
        let url = format!("{}{}", base_url.trim_end_matches('/'), step.endpoint);
        let payload = self.build_payload(step, ctx);

        let attempts = step.retry_count + 1;
        let mut last_error = None;

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            debug!(step_id = %step.step_id, attempt, "calling remote service");
            self.metrics.record_service_call(step.service_id);

            let request = RemoteRequest {
                url: url.clone(),
                method: step.method,
                body: payload.clone(),
                timeout: step.timeout,
            };

            let started = std::time::Instant::now();
            match self.caller.call(request).await {
                Ok(body) => {
                    self.health.record(step.service_id, Outcome::Success);
                    self.metrics.record_service_latency(step.service_id, started.elapsed());
                    info!(step_id = %step.step_id, attempt, "step succeeded");
                    return Ok(StepOutcome::Success(body));
                }
                Err(err) => {
                    self.health.record(step.service_id, Outcome::Failure);
                    self.metrics.record_service_error(step.service_id);
                    warn!(step_id = %step.step_id, attempt, error = %err, "step attempt failed");
                    last_error = Some(err);

                    if attempt + 1 < attempts {
                        let backoff = Duration::from_secs(1 << attempt.min(10)).min(self.max_backoff);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                        }
                    }
                }
            }
        }

        let message = last_error
            .map(Self::describe)
            .unwrap_or_else(|| "no attempts were made".to_string());
        self.fail_or_fallback(step, OrchestratorError::StepFailed {
            step_id: step.step_id.clone(),
            message,
        })
    }

    fn describe(err: RemoteCallError) -> String {
        err.to_string()
    }

    fn fail_or_fallback(&self, step: &WorkflowStep, err: OrchestratorError) -> Result<StepOutcome> {
        if step.fallback_enabled {
            info!(step_id = %step.step_id, "substituting fallback result");
            Ok(StepOutcome::Fallback(fallback::canned_result(step.service_id)))
        } else {
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::workflow::{HttpMethod, ServiceId, WorkflowStep};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct FlakyCaller {
        fail_times: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteCaller for FlakyCaller {
        async fn call(&self, _request: RemoteRequest) -> std::result::Result<Value, RemoteCallError> {
            let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
            if call_index < self.fail_times {
                Err(RemoteCallError::Network("connection reset".into()))
            } else {
                Ok(serde_json::json!({"status": "ok", "call_index": call_index}))
            }
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl RemoteCaller for AlwaysFails {
        async fn call(&self, _request: RemoteRequest) -> std::result::Result<Value, RemoteCallError> {
            Err(RemoteCallError::Status { status: 503 })
        }
    }

    struct EchoingCaller;

    #[async_trait]
    impl RemoteCaller for EchoingCaller {
        async fn call(&self, request: RemoteRequest) -> std::result::Result<Value, RemoteCallError> {
            Ok(request.body)
        }
    }

    fn executor(caller: Arc<dyn RemoteCaller>) -> StepExecutor {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(ServiceId::Nlu, "http://nlu.internal");
        let config = OrchestratorConfig::default();
        StepExecutor::new(
            registry,
            Arc::new(HealthMonitor::new(&config)),
            caller,
            Arc::new(MetricsAggregator::new()),
            Duration::from_millis(10),
        )
    }

    fn step(retry_count: u32, fallback_enabled: bool) -> WorkflowStep {
        WorkflowStep::builder("analyze", ServiceId::Nlu, "/analyze")
            .method(HttpMethod::Post)
            .retry_count(retry_count)
            .fallback_enabled(fallback_enabled)
            .timeout(Duration::from_secs(5))
            .build()
    }

    fn ctx() -> WorkflowContext {
        WorkflowContext::new("user-1", "session-1", Uuid::new_v4(), std::collections::HashMap::new())
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_with_no_retries_needed() {
        let caller = Arc::new(FlakyCaller { fail_times: 0, calls: AtomicUsize::new(0) });
        let exec = executor(caller);
        let outcome = exec.execute(&step(3, false), &ctx(), &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Success(_)));
    }

    #[tokio::test]
    async fn recovers_after_transient_failures_within_retry_budget() {
        let caller = Arc::new(FlakyCaller { fail_times: 2, calls: AtomicUsize::new(0) });
        let exec = executor(caller);
        let outcome = exec.execute(&step(3, false), &ctx(), &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Success(_)));
    }

    #[tokio::test]
    async fn exhausted_retries_without_fallback_propagate_step_failed() {
        let exec = executor(Arc::new(AlwaysFails));
        let err = exec.execute(&step(1, false), &ctx(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::StepFailed { .. }));
    }

    #[tokio::test]
    async fn exhausted_retries_with_fallback_return_canned_result() {
        let exec = executor(Arc::new(AlwaysFails));
        let outcome = exec.execute(&step(1, true), &ctx(), &CancellationToken::new()).await.unwrap();
        match outcome {
            StepOutcome::Fallback(value) => assert_eq!(value["status"], "fallback"),
            _ => panic!("expected fallback outcome"),
        }
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_to_fallback_without_calling() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(ServiceId::Nlu, "http://nlu.internal");
        let mut config = OrchestratorConfig::default();
        config.circuit_breaker_failure_threshold = 1;
        let health = Arc::new(HealthMonitor::new(&config));
        health.record(ServiceId::Nlu, Outcome::Failure);

        let caller = Arc::new(FlakyCaller { fail_times: 0, calls: AtomicUsize::new(0) });
        let exec = StepExecutor::new(
            registry,
            health,
            caller.clone(),
            Arc::new(MetricsAggregator::new()),
            Duration::from_millis(10),
        );

        let outcome = exec.execute(&step(3, true), &ctx(), &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Fallback(_)));
        assert_eq!(caller.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn request_payload_carries_every_core_injected_field() {
        let exec = executor(Arc::new(EchoingCaller));
        let context = ctx();
        let outcome = exec.execute(&step(0, false), &context, &CancellationToken::new()).await.unwrap();
        let body = match outcome {
            StepOutcome::Success(value) => value,
            _ => panic!("expected success"),
        };
        assert_eq!(body["user_id"], context.user_id);
        assert_eq!(body["session_id"], context.session_id);
        assert_eq!(body["execution_id"], context.execution_id.to_string());
        assert_eq!(body["step_id"], "analyze");
        assert!(body["previous_results"].is_object());
    }

    #[tokio::test]
    async fn successful_call_feeds_the_per_service_latency_reservoir() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(ServiceId::Nlu, "http://nlu.internal");
        let config = OrchestratorConfig::default();
        let metrics = Arc::new(MetricsAggregator::new());
        let exec = StepExecutor::new(
            registry,
            Arc::new(HealthMonitor::new(&config)),
            Arc::new(EchoingCaller),
            metrics.clone(),
            Duration::from_millis(10),
        );

        exec.execute(&step(0, false), &ctx(), &CancellationToken::new()).await.unwrap();

        let snap = metrics.snapshot();
        assert!(snap.service_latency_p50_ms.contains_key("nlu"));
    }

    #[tokio::test]
    async fn cancellation_token_aborts_before_any_attempt() {
        let exec = executor(Arc::new(AlwaysFails));
        let token = CancellationToken::new();
        token.cancel();
        let err = exec.execute(&step(3, false), &ctx(), &token).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
    }
}

// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Drives registered `WorkflowDefinition`s end to end: plans the DAG,
//! dispatches waves through the step executor, applies the error policy,
//! and publishes lifecycle events as execution progresses.

use crate::config::OrchestratorConfig;
use crate::context::WorkflowContext;
use crate::dag::WorkflowDag;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, EventType, ServiceEvent};
use crate::execution::{ExecutionStatus, WorkflowExecution};
use crate::executor::{StepExecutor, StepOutcome};
use crate::health::HealthMonitor;
use crate::metrics::MetricsAggregator;
use crate::registry::ServiceRegistry;
use crate::remote::RemoteCaller;
use crate::workflow::{ErrorPolicy, WorkflowDefinition};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Wires together the registry, health monitor, event bus, metrics, and
/// step executor into the single entry point a host binds to.
pub struct WorkflowEngine {
    definitions: DashMap<String, WorkflowDefinition>,
    active: DashMap<Uuid, Mutex<WorkflowExecution>>,
    completed: Mutex<VecDeque<WorkflowExecution>>,
    cancel_tokens: DashMap<Uuid, CancellationToken>,
    step_executor: StepExecutor,
    bus: EventBus,
    metrics: Arc<MetricsAggregator>,
    config: OrchestratorConfig,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        health: Arc<HealthMonitor>,
        caller: Arc<dyn RemoteCaller>,
        bus: EventBus,
        metrics: Arc<MetricsAggregator>,
        config: OrchestratorConfig,
    ) -> Self {
        let step_executor = StepExecutor::new(
            registry,
            health,
            caller,
            metrics.clone(),
            config.max_backoff(),
        );
        Self {
            definitions: DashMap::new(),
            active: DashMap::new(),
            completed: Mutex::new(VecDeque::with_capacity(config.completed_executions_buffer_size.min(64))),
            cancel_tokens: DashMap::new(),
            step_executor,
            bus,
            metrics,
            config,
        }
    }

    /// Validates and registers a workflow definition, replacing any prior
    /// definition under the same id.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;
        self.definitions.insert(definition.workflow_id.clone(), definition);
        Ok(())
    }

    pub fn definition(&self, workflow_id: &str) -> Result<WorkflowDefinition> {
        self.definitions
            .get(workflow_id)
            .map(|d| d.clone())
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(workflow_id.to_string()))
    }

    /// Starts a new execution of a registered workflow and drives it to a
    /// terminal state before returning.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        context: WorkflowContext,
    ) -> Result<WorkflowExecution> {
        let definition = self.definition(workflow_id)?;
        let dag = WorkflowDag::from_steps(&definition.steps)?;

        let execution_id = context.execution_id;
        let mut execution = WorkflowExecution::new(execution_id, workflow_id, context);
        execution.start();

        let cancel = CancellationToken::new();
        self.cancel_tokens.insert(execution_id, cancel.clone());
        self.active.insert(execution_id, Mutex::new(execution.clone()));

        self.metrics.record_workflow_started();
        self.bus.publish(ServiceEvent::new(
            EventType::WorkflowStarted,
            "orchestrator",
            serde_json::json!({"workflow_id": workflow_id, "execution_id": execution_id}),
        ));

        let started_at = Instant::now();
        let result = self.run_waves(&definition, &dag, &mut execution, &cancel).await;

        let elapsed = started_at.elapsed();
        let final_status = match &result {
            Ok(()) if cancel.is_cancelled() => ExecutionStatus::Cancelled,
            Ok(()) => ExecutionStatus::Completed,
            Err(OrchestratorError::Cancelled) => ExecutionStatus::Cancelled,
            Err(OrchestratorError::Timeout { .. }) => ExecutionStatus::TimedOut,
            Err(_) => ExecutionStatus::Failed,
        };
        execution.finish(final_status);

        match final_status {
            ExecutionStatus::Completed => self.metrics.record_workflow_completed(elapsed),
            ExecutionStatus::Cancelled => self.metrics.record_workflow_cancelled(elapsed),
            ExecutionStatus::TimedOut => self.metrics.record_workflow_timed_out(elapsed),
            _ => self.metrics.record_workflow_failed(elapsed),
        }

        let event_type = match final_status {
            ExecutionStatus::Completed => EventType::WorkflowCompleted,
            _ => EventType::WorkflowFailed,
        };
        self.bus.publish(ServiceEvent::new(
            event_type,
            "orchestrator",
            serde_json::json!({
                "workflow_id": workflow_id,
                "execution_id": execution_id,
                "status": format!("{:?}", final_status),
            }),
        ));

        self.active.remove(&execution_id);
        self.cancel_tokens.remove(&execution_id);
        self.push_completed(execution.clone());

        match result {
            Ok(()) => Ok(execution),
            Err(OrchestratorError::Cancelled) => Ok(execution),
            Err(err) => {
                if final_status == ExecutionStatus::Failed {
                    Err(err)
                } else {
                    Ok(execution)
                }
            }
        }
    }

    async fn run_waves(
        &self,
        definition: &WorkflowDefinition,
        dag: &WorkflowDag,
        execution: &mut WorkflowExecution,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + definition.max_total_duration;

        for wave in &dag.waves {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::Timeout {
                    duration: definition.max_total_duration,
                });
            }
            execution.current_wave += 1;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut wave_result = tokio::time::timeout(
                remaining,
                self.run_wave(definition, wave, execution, cancel),
            )
            .await
            .map_err(|_| OrchestratorError::Timeout {
                duration: definition.max_total_duration,
            })??;

            if !wave_result && definition.error_policy == ErrorPolicy::RetryWave {
                let retry: Vec<String> = wave
                    .iter()
                    .filter(|id| execution.failed_steps.contains(*id))
                    .cloned()
                    .collect();
                for id in &retry {
                    execution.failed_steps.remove(id);
                }
                info!(?retry, "retrying failed steps once before giving up");
                let remaining = deadline.saturating_duration_since(Instant::now());
                wave_result = tokio::time::timeout(
                    remaining,
                    self.run_wave(definition, &retry, execution, cancel),
                )
                .await
                .map_err(|_| OrchestratorError::Timeout {
                    duration: definition.max_total_duration,
                })??;
            }

            if let Some(entry) = self.active.get(&execution.execution_id) {
                *entry.lock() = execution.clone();
            }

            let must_stop = !wave_result
                && matches!(definition.error_policy, ErrorPolicy::StopOnRequired | ErrorPolicy::RetryWave);
            if must_stop {
                return Err(OrchestratorError::StepFailed {
                    step_id: wave.join(","),
                    message: "a required step in this wave failed".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Runs every step in a wave concurrently (or sequentially if the
    /// definition opts out of `parallel`). Returns `Ok(false)` rather than
    /// an error when `ContinueOnFailure` absorbs a required-step failure,
    /// so the caller can distinguish "wave had a failure" from "wave threw".
    async fn run_wave(
        &self,
        definition: &WorkflowDefinition,
        wave: &[String],
        execution: &mut WorkflowExecution,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut all_ok = true;

        if definition.parallel {
            let mut handles = Vec::with_capacity(wave.len());
            for step_id in wave {
                let step = definition
                    .step(step_id)
                    .expect("dag waves only name steps present in the definition")
                    .clone();
                let ctx = execution.context.clone();
                let cancel = cancel.clone();
                let step_executor = &self.step_executor;
                handles.push(async move { (step.step_id.clone(), step_executor.execute(&step, &ctx, &cancel).await) });
            }
            let results = futures::future::join_all(handles).await;
            for (step_id, outcome) in results {
                if !self.apply_outcome(definition, &step_id, outcome, execution)? {
                    all_ok = false;
                }
            }
        } else {
            for step_id in wave {
                let step = definition
                    .step(step_id)
                    .expect("dag waves only name steps present in the definition")
                    .clone();
                let outcome = self.step_executor.execute(&step, &execution.context, cancel).await;
                if !self.apply_outcome(definition, step_id, outcome, execution)? {
                    all_ok = false;
                }
            }
        }

        Ok(all_ok)
    }

    fn apply_outcome(
        &self,
        definition: &WorkflowDefinition,
        step_id: &str,
        outcome: Result<StepOutcome>,
        execution: &mut WorkflowExecution,
    ) -> Result<bool> {
        let step = definition.step(step_id).expect("step exists");

        match outcome {
            Ok(StepOutcome::Success(value)) | Ok(StepOutcome::Fallback(value)) => {
                execution.context.set_step_result(step_id, value);
                execution.completed_steps.insert(step_id.to_string());
                Ok(true)
            }
            Err(OrchestratorError::Cancelled) => Err(OrchestratorError::Cancelled),
            Err(err) => {
                warn!(step_id, error = %err, "step failed terminally");
                execution.failed_steps.insert(step_id.to_string());
                execution.record_error(step_id, err.to_string());

                if step.required && definition.error_policy == ErrorPolicy::StopOnRequired {
                    error!(step_id, "required step failed, stopping workflow");
                    return Err(err);
                }
                Ok(!step.required)
            }
        }
    }

    /// Idempotent cancellation: a second call against an already-finished
    /// or already-cancelled execution is a no-op.
    pub fn cancel_workflow(&self, execution_id: Uuid) -> Result<()> {
        match self.cancel_tokens.get(&execution_id) {
            Some(token) => {
                token.cancel();
                info!(%execution_id, "cancellation requested");
                Ok(())
            }
            None => {
                if self.completed.lock().iter().any(|e| e.execution_id == execution_id) {
                    Ok(())
                } else {
                    Err(OrchestratorError::UnknownExecution(execution_id))
                }
            }
        }
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution> {
        if let Some(entry) = self.active.get(&execution_id) {
            return Ok(entry.lock().clone());
        }
        self.completed
            .lock()
            .iter()
            .find(|e| e.execution_id == execution_id)
            .cloned()
            .ok_or(OrchestratorError::UnknownExecution(execution_id))
    }

    pub fn metrics_snapshot(&self) -> crate::metrics::MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn push_completed(&self, execution: WorkflowExecution) {
        let mut completed = self.completed.lock();
        if completed.len() >= self.config.completed_executions_buffer_size {
            completed.pop_front();
        }
        completed.push_back(execution);
    }
}

/// Helper used by callers that just want to shallow-merge caller input into
/// a fresh `WorkflowContext` without constructing one by hand.
pub fn new_context(
    user_id: impl Into<String>,
    session_id: impl Into<String>,
    input: HashMap<String, Value>,
) -> WorkflowContext {
    WorkflowContext::new(user_id, session_id, Uuid::new_v4(), input)
}

// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Fluent programmatic SDK over `orchestrator-core`: a `WorkflowBuilder` for
//! assembling `WorkflowDefinition`s step by step and an `OrchestratorBuilder`
//! for wiring an `Orchestrator` without touching its constituent parts
//! directly.

use orchestrator_core::{
    ErrorPolicy, HttpRemoteCaller, Orchestrator, OrchestratorConfig, RemoteCaller, ServiceId,
    WorkflowContext, WorkflowDefinition, WorkflowStep,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Builds a `WorkflowDefinition` one step at a time.
pub struct WorkflowBuilder {
    workflow_id: String,
    steps: Vec<WorkflowStep>,
    max_total_duration: Duration,
    parallel: bool,
    error_policy: ErrorPolicy,
}

impl WorkflowBuilder {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            steps: Vec::new(),
            max_total_duration: Duration::from_secs(300),
            parallel: true,
            error_policy: ErrorPolicy::StopOnRequired,
        }
    }

    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn max_total_duration(mut self, duration: Duration) -> Self {
        self.max_total_duration = duration;
        self
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn build(self) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_id: self.workflow_id,
            steps: self.steps,
            max_total_duration: self.max_total_duration,
            parallel: self.parallel,
            error_policy: self.error_policy,
        }
    }
}

/// Builds an `Orchestrator`, letting callers register service endpoints
/// before the first workflow is executed.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    caller: Option<Arc<dyn RemoteCaller>>,
    endpoints: Vec<(ServiceId, String)>,
    with_standard_templates: bool,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            caller: None,
            endpoints: Vec::new(),
            with_standard_templates: false,
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn caller(mut self, caller: Arc<dyn RemoteCaller>) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn endpoint(mut self, service_id: ServiceId, base_url: impl Into<String>) -> Self {
        self.endpoints.push((service_id, base_url.into()));
        self
    }

    pub fn with_standard_templates(mut self) -> Self {
        self.with_standard_templates = true;
        self
    }

    pub fn build(self) -> orchestrator_core::Result<Orchestrator> {
        let caller = self.caller.unwrap_or_else(|| Arc::new(HttpRemoteCaller::new()));
        let orchestrator = Orchestrator::with_caller(self.config, caller);
        for (service_id, base_url) in self.endpoints {
            orchestrator.registry.register(service_id, base_url);
        }
        if self.with_standard_templates {
            orchestrator.register_standard_templates()?;
        }
        Ok(orchestrator)
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience constructor for a fresh `WorkflowContext`, mirroring the
/// shallow-merge semantics the step executor applies to build each step's
/// request payload.
pub fn context(
    user_id: impl Into<String>,
    session_id: impl Into<String>,
    input: HashMap<String, serde_json::Value>,
) -> WorkflowContext {
    WorkflowContext::new(user_id, session_id, Uuid::new_v4(), input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::ServiceId;

    #[test]
    fn workflow_builder_assembles_a_valid_definition() {
        let definition = WorkflowBuilder::new("custom")
            .step(WorkflowStep::builder("a", ServiceId::Nlu, "/analyze").build())
            .step(
                WorkflowStep::builder("b", ServiceId::StyleProfile, "/profile")
                    .depends_on(["a"])
                    .build(),
            )
            .sequential()
            .error_policy(ErrorPolicy::ContinueOnFailure)
            .build();

        assert_eq!(definition.steps.len(), 2);
        assert!(!definition.parallel);
        definition.validate().unwrap();
    }

    #[test]
    fn orchestrator_builder_registers_endpoints_and_templates() {
        let orchestrator = OrchestratorBuilder::new()
            .endpoint(ServiceId::Nlu, "http://nlu.internal")
            .with_standard_templates()
            .build()
            .unwrap();

        assert!(orchestrator.registry.is_registered(ServiceId::Nlu));
        assert!(orchestrator.get_execution(Uuid::new_v4()).is_err());
    }
}

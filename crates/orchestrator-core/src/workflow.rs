// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Workflow definition model: the immutable, dependency-injectable
//! description of what a workflow execution should do.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Opaque identifier for a downstream service, drawn from a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceId {
    ImageProcessing,
    Nlu,
    StyleProfile,
    CombinationEngine,
    RecommendationEngine,
    FeedbackLoop,
}

impl ServiceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::ImageProcessing => "image-processing",
            ServiceId::Nlu => "nlu",
            ServiceId::StyleProfile => "style-profile",
            ServiceId::CombinationEngine => "combination-engine",
            ServiceId::RecommendationEngine => "recommendation-engine",
            ServiceId::FeedbackLoop => "feedback-loop",
        }
    }

    pub fn all() -> [ServiceId; 6] {
        [
            ServiceId::ImageProcessing,
            ServiceId::Nlu,
            ServiceId::StyleProfile,
            ServiceId::CombinationEngine,
            ServiceId::RecommendationEngine,
            ServiceId::FeedbackLoop,
        ]
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP method used to invoke a step's endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
}

/// One node in a workflow's dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_id: String,
    pub service_id: ServiceId,
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub payload_template: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub depends_on: HashSet<String>,
    #[serde(default = "default_timeout", with = "duration_millis")]
    pub timeout: Duration,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub fallback_enabled: bool,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_count() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

impl WorkflowStep {
    pub fn builder(step_id: impl Into<String>, service_id: ServiceId, endpoint: impl Into<String>) -> WorkflowStepBuilder {
        WorkflowStepBuilder::new(step_id, service_id, endpoint)
    }
}

/// Fluent constructor for `WorkflowStep`, kept small since most fields have
/// sensible defaults.
pub struct WorkflowStepBuilder {
    step: WorkflowStep,
}

impl WorkflowStepBuilder {
    pub fn new(step_id: impl Into<String>, service_id: ServiceId, endpoint: impl Into<String>) -> Self {
        Self {
            step: WorkflowStep {
                step_id: step_id.into(),
                service_id,
                endpoint: endpoint.into(),
                method: HttpMethod::Post,
                payload_template: None,
                depends_on: HashSet::new(),
                timeout: default_timeout(),
                retry_count: default_retry_count(),
                required: true,
                fallback_enabled: false,
            },
        }
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.step.method = method;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.step.timeout = timeout;
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.step.retry_count = retry_count;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.step.required = required;
        self
    }

    pub fn fallback_enabled(mut self, enabled: bool) -> Self {
        self.step.fallback_enabled = enabled;
        self
    }

    pub fn payload_template(mut self, template: HashMap<String, Value>) -> Self {
        self.step.payload_template = Some(template);
        self
    }

    pub fn build(self) -> WorkflowStep {
        self.step
    }
}

/// Policy applied when a step fails within a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorPolicy {
    /// Stop the workflow as soon as a required step fails terminally.
    StopOnRequired,
    /// Record the failure and keep going regardless of `required`.
    ContinueOnFailure,
    /// Re-attempt the whole wave once more before giving up (then behaves
    /// like `StopOnRequired`).
    RetryWave,
}

/// An immutable, registerable description of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "default_max_total_duration", with = "duration_millis")]
    pub max_total_duration: Duration,
    #[serde(default = "default_true")]
    pub parallel: bool,
    #[serde(default = "default_error_policy")]
    pub error_policy: ErrorPolicy,
}

fn default_max_total_duration() -> Duration {
    Duration::from_secs(300)
}

fn default_error_policy() -> ErrorPolicy {
    ErrorPolicy::StopOnRequired
}

impl WorkflowDefinition {
    /// Structural validation performed at registration time: step ids are
    /// unique, every dependency resolves to a known step, `retry_count` is
    /// non-negative (guaranteed by `u32`) and `timeout` is positive.
    ///
    /// Acyclicity is checked separately by the DAG planner, since that
    /// check doubles as wave computation.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.step_id.as_str()) {
                return Err(OrchestratorError::InvalidDefinition {
                    workflow_id: self.workflow_id.clone(),
                    reason: format!("duplicate step id '{}'", step.step_id),
                });
            }
            if step.timeout.is_zero() {
                return Err(OrchestratorError::InvalidDefinition {
                    workflow_id: self.workflow_id.clone(),
                    reason: format!("step '{}' has a zero timeout", step.step_id),
                });
            }
        }
        let known: HashSet<&str> = self.steps.iter().map(|s| s.step_id.as_str()).collect();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !known.contains(dep.as_str()) {
                    return Err(OrchestratorError::MissingDependency {
                        step_id: step.step_id.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }
        crate::dag::WorkflowDag::from_steps(&self.steps)?;
        Ok(())
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep::builder(id, ServiceId::Nlu, "/analyze")
            .depends_on(deps.iter().map(|s| s.to_string()))
            .build()
    }

    #[test]
    fn validate_rejects_duplicate_step_ids() {
        let def = WorkflowDefinition {
            workflow_id: "w".into(),
            steps: vec![step("a", &[]), step("a", &[])],
            max_total_duration: Duration::from_secs(10),
            parallel: true,
            error_policy: ErrorPolicy::StopOnRequired,
        };
        assert!(matches!(
            def.validate(),
            Err(OrchestratorError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn validate_rejects_missing_dependency() {
        let def = WorkflowDefinition {
            workflow_id: "w".into(),
            steps: vec![step("a", &["ghost"])],
            max_total_duration: Duration::from_secs(10),
            parallel: true,
            error_policy: ErrorPolicy::StopOnRequired,
        };
        assert!(matches!(
            def.validate(),
            Err(OrchestratorError::MissingDependency { .. })
        ));
    }

    #[test]
    fn validate_rejects_cycles() {
        let def = WorkflowDefinition {
            workflow_id: "w".into(),
            steps: vec![step("a", &["b"]), step("b", &["a"])],
            max_total_duration: Duration::from_secs(10),
            parallel: true,
            error_policy: ErrorPolicy::StopOnRequired,
        };
        assert!(matches!(
            def.validate(),
            Err(OrchestratorError::CyclicDependency(_))
        ));
    }

    #[test]
    fn validate_accepts_well_formed_dag() {
        let def = WorkflowDefinition {
            workflow_id: "w".into(),
            steps: vec![step("a", &[]), step("b", &["a"])],
            max_total_duration: Duration::from_secs(10),
            parallel: true,
            error_policy: ErrorPolicy::StopOnRequired,
        };
        assert!(def.validate().is_ok());
    }
}

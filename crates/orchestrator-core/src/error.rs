// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the orchestration and choreography engine.

use std::time::Duration;
use uuid::Uuid;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// All error kinds surfaced by the engine.
///
/// `ConfigError`-shaped variants are synchronous: they are returned at
/// submission or registration time, before any execution is created.
/// `TransientServiceError`-shaped variants are recovered internally by the
/// step executor (retries, fallback) to the extent policy permits; whatever
/// remains propagates as `StepFailed`.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// No service is registered under this identifier.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// No workflow definition is registered under this identifier.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// No execution is registered under this identifier.
    #[error("unknown execution: {0}")]
    UnknownExecution(Uuid),

    /// The step dependency graph contains a cycle.
    #[error("cyclic dependency among steps: {0:?}")]
    CyclicDependency(Vec<String>),

    /// A step's `depends_on` references a step id that does not exist.
    #[error("step '{step_id}' depends on unknown step '{dep}'")]
    MissingDependency { step_id: String, dep: String },

    /// A workflow definition is otherwise structurally invalid.
    #[error("invalid workflow definition '{workflow_id}': {reason}")]
    InvalidDefinition { workflow_id: String, reason: String },

    /// The step's service is unavailable (circuit open) and no fallback is
    /// permitted.
    #[error("service '{0}' is unavailable")]
    ServiceUnavailable(String),

    /// A step exhausted its retries (and has no permitted fallback).
    #[error("step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    /// The caller requested cancellation.
    #[error("cancelled")]
    Cancelled,

    /// An operation exceeded its allotted duration.
    #[error("timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// A remote call failed at the transport layer (network error, non-2xx,
    /// or an unparseable body). Recovered by retry/fallback inside the step
    /// executor; only observed directly in unit tests of the remote caller.
    #[error("transient service error: {0}")]
    TransientServiceError(String),

    /// A transaction committed on some participants but not others.
    /// Not automatically recovered; flagged for external reconciliation.
    #[error("transaction '{transaction_id}' is post-prepare inconsistent: {detail}")]
    PostPrepareInconsistency {
        transaction_id: Uuid,
        detail: String,
    },

    /// Catch-all for errors that don't fit a named kind.
    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(format!("serialization error: {err}"))
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Other(format!("yaml error: {err}"))
    }
}

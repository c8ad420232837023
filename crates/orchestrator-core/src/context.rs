// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Mutable, single-writer execution context threaded through one workflow
//! run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// The context for one workflow execution. The engine is the single writer;
/// step executors read from it (filtered to their declared dependencies)
/// and the engine appends each step's result as it completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub user_id: String,
    pub session_id: String,
    pub execution_id: Uuid,
    pub input: HashMap<String, Value>,
    pub step_results: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
}

impl WorkflowContext {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        execution_id: Uuid,
        input: HashMap<String, Value>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            execution_id,
            input,
            step_results: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Appends a step's result. `step_results` is append-only — one writer
    /// per `step_id`, so this will overwrite only if called twice for the
    /// same step, which never happens in the engine's wave loop.
    pub fn set_step_result(&mut self, step_id: &str, result: Value) {
        self.step_results.insert(step_id.to_string(), result);
    }

    /// The subset of `step_results` whose keys are in `depends_on`, used to
    /// build a step's `previous_results` payload field.
    pub fn previous_results(&self, depends_on: &std::collections::HashSet<String>) -> HashMap<String, Value> {
        self.step_results
            .iter()
            .filter(|(k, _)| depends_on.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! The runtime record of one workflow run, from submission to terminal
//! state.

use crate::context::WorkflowContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a `WorkflowExecution`. Transitions: `Pending ->
/// Running -> {Completed | Failed | Cancelled | TimedOut}`. No resurrection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

/// One (step_id, message, timestamp) error record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub step_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// The runtime record of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub definition_id: String,
    pub status: ExecutionStatus,
    pub context: WorkflowContext,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub completed_steps: HashSet<String>,
    pub failed_steps: HashSet<String>,
    pub current_wave: usize,
    pub errors: Vec<StepError>,
    #[serde(with = "duration_map_millis")]
    pub durations: HashMap<String, Duration>,
}

mod duration_map_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        map: &HashMap<String, Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let as_millis: HashMap<&String, u64> =
            map.iter().map(|(k, v)| (k, v.as_millis() as u64)).collect();
        as_millis.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<HashMap<String, Duration>, D::Error> {
        let as_millis: HashMap<String, u64> = HashMap::deserialize(d)?;
        Ok(as_millis
            .into_iter()
            .map(|(k, v)| (k, Duration::from_millis(v)))
            .collect())
    }
}

impl WorkflowExecution {
    pub fn new(execution_id: Uuid, definition_id: impl Into<String>, context: WorkflowContext) -> Self {
        Self {
            execution_id,
            definition_id: definition_id.into(),
            status: ExecutionStatus::Pending,
            context,
            start_time: None,
            end_time: None,
            completed_steps: HashSet::new(),
            failed_steps: HashSet::new(),
            current_wave: 0,
            errors: Vec::new(),
            durations: HashMap::new(),
        }
    }

    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.start_time = Some(Utc::now());
    }

    pub fn finish(&mut self, status: ExecutionStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.end_time = Some(Utc::now());
    }

    pub fn record_error(&mut self, step_id: &str, message: impl Into<String>) {
        self.errors.push(StepError {
            step_id: step_id.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}

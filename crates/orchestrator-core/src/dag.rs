// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Topological layering of workflow steps into concurrent-safe waves.

use crate::error::{OrchestratorError, Result};
use crate::workflow::WorkflowStep;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// A wave is a maximal set of steps whose dependencies are all satisfied by
/// earlier waves. Intra-wave ordering is unspecified.
pub type Wave = Vec<String>;

/// The planned execution order for one workflow: a sequence of waves.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    pub waves: Vec<Wave>,
}

impl WorkflowDag {
    /// Builds the wave layering for a step list, using Kahn-style
    /// repeated extraction of zero-unmet-dependency nodes.
    ///
    /// Fails with `CyclicDependency` if steps remain but none are
    /// selectable, and with `MissingDependency` if a `depends_on` entry
    /// names an unknown step (callers should usually have already run
    /// `WorkflowDefinition::validate`, which checks this first).
    pub fn from_steps(steps: &[WorkflowStep]) -> Result<Self> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();

        for step in steps {
            let idx = graph.add_node(step.step_id.clone());
            index_of.insert(step.step_id.as_str(), idx);
        }

        for step in steps {
            let to = index_of[step.step_id.as_str()];
            for dep in &step.depends_on {
                let from = *index_of.get(dep.as_str()).ok_or_else(|| {
                    OrchestratorError::MissingDependency {
                        step_id: step.step_id.clone(),
                        dep: dep.clone(),
                    }
                })?;
                graph.add_edge(from, to, ());
            }
        }

        let mut unmet: HashMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|idx| (idx, graph.neighbors_directed(idx, petgraph::Incoming).count()))
            .collect();

        let mut waves = Vec::new();
        let mut remaining: std::collections::HashSet<NodeIndex> = graph.node_indices().collect();

        while !remaining.is_empty() {
            let ready: Vec<NodeIndex> = remaining
                .iter()
                .copied()
                .filter(|idx| unmet[idx] == 0)
                .collect();

            if ready.is_empty() {
                let mut remaining_ids: Vec<String> = remaining
                    .iter()
                    .map(|idx| graph[*idx].clone())
                    .collect();
                remaining_ids.sort();
                return Err(OrchestratorError::CyclicDependency(remaining_ids));
            }

            let mut wave: Vec<String> = ready.iter().map(|idx| graph[*idx].clone()).collect();
            wave.sort();

            for idx in &ready {
                remaining.remove(idx);
                for succ in graph.neighbors_directed(*idx, petgraph::Outgoing) {
                    if let Some(count) = unmet.get_mut(&succ) {
                        *count -= 1;
                    }
                }
            }

            waves.push(wave);
        }

        Ok(Self { waves })
    }

    /// Total number of steps across all waves.
    pub fn step_count(&self) -> usize {
        self.waves.iter().map(|w| w.len()).sum()
    }
}

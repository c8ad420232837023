// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Workflow orchestration and service choreography engine.
//!
//! Composes a [`ServiceRegistry`], [`HealthMonitor`], [`EventBus`],
//! [`MetricsAggregator`], [`WorkflowEngine`] and [`TransactionCoordinator`]
//! into a single facade ([`Orchestrator`]) that a host binds once at
//! startup.

pub mod config;
pub mod context;
pub mod dag;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod executor;
pub mod fallback;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod remote;
pub mod transaction;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use config::OrchestratorConfig;
pub use context::WorkflowContext;
pub use engine::WorkflowEngine;
pub use error::{OrchestratorError, Result};
pub use events::{DurableEventSink, EventBus, EventType, InMemoryEventSink, ServiceEvent};
pub use execution::{ExecutionStatus, WorkflowExecution};
pub use health::HealthMonitor;
pub use metrics::{MetricsAggregator, MetricsSnapshot};
pub use registry::ServiceRegistry;
pub use remote::{HttpRemoteCaller, RemoteCaller, RemoteCallError, RemoteRequest};
pub use transaction::{TransactionContext, TransactionCoordinator, TransactionStatus};
pub use workflow::{ErrorPolicy, HttpMethod, ServiceId, WorkflowDefinition, WorkflowStep};

/// Top-level facade wiring every component together. Construct with
/// [`Orchestrator::new`] (production defaults, backed by `reqwest`) or
/// [`Orchestrator::with_caller`] (tests, with a substitute `RemoteCaller`).
pub struct Orchestrator {
    pub registry: Arc<ServiceRegistry>,
    pub health: Arc<HealthMonitor>,
    pub bus: EventBus,
    pub metrics: Arc<MetricsAggregator>,
    pub engine: WorkflowEngine,
    pub transactions: TransactionCoordinator,
    caller: Arc<dyn RemoteCaller>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_caller(config, Arc::new(HttpRemoteCaller::new()))
    }

    pub fn with_caller(config: OrchestratorConfig, caller: Arc<dyn RemoteCaller>) -> Self {
        let registry = Arc::new(ServiceRegistry::new());
        let health = Arc::new(HealthMonitor::new(&config));
        let metrics = Arc::new(MetricsAggregator::new());
        let bus = {
            let published = metrics.clone();
            let dropped = metrics.clone();
            let handler_latency = metrics.clone();
            EventBus::new(config.event_queue_capacity)
                .with_hooks(
                    move || published.record_event_published(),
                    move || dropped.record_event_dropped(),
                )
                .with_handler_metrics(move |duration| handler_latency.record_handler_latency(duration))
        };

        let engine = WorkflowEngine::new(
            registry.clone(),
            health.clone(),
            caller.clone(),
            bus.clone(),
            metrics.clone(),
            config.clone(),
        );
        let transactions = TransactionCoordinator::new(
            bus.clone(),
            metrics.clone(),
            config.prepare_timeout(),
            config.commit_timeout(),
        );

        Self {
            registry,
            health,
            bus,
            metrics,
            engine,
            transactions,
            caller,
            config,
        }
    }

    /// Spawns the background health probe loop against every registered
    /// service, on the interval configured by `health_probe_interval_ms`.
    /// Not started automatically by `new`/`with_caller` — a host calls this
    /// once, from within its own async runtime, after registering services.
    /// Tests that only need the circuit-breaker bookkeeping construct a bare
    /// `HealthMonitor` directly and never touch this.
    pub fn start_health_monitoring(&self) -> tokio::task::JoinHandle<()> {
        self.health.spawn_probe_loop(
            self.registry.clone(),
            self.caller.clone(),
            self.config.health_probe_interval(),
        )
    }

    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        self.engine.register_workflow(definition)
    }

    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        context: WorkflowContext,
    ) -> Result<WorkflowExecution> {
        self.engine.execute_workflow(workflow_id, context).await
    }

    pub fn cancel_workflow(&self, execution_id: Uuid) -> Result<()> {
        self.engine.cancel_workflow(execution_id)
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution> {
        self.engine.get_execution(execution_id)
    }

    pub fn snapshot_metrics(&self) -> MetricsSnapshot {
        self.engine.metrics_snapshot()
    }

    pub fn begin_transaction(
        &self,
        coordinator: impl Into<String>,
        participants: Vec<String>,
        operations: std::collections::HashMap<String, serde_json::Value>,
    ) -> Uuid {
        self.transactions.begin(
            coordinator,
            participants,
            operations,
            self.config.transaction_default_timeout(),
        )
    }

    /// Registers the three canonical fashion-pipeline templates shipped
    /// alongside this engine, so a fresh deployment has working examples to
    /// run before authoring bespoke workflows.
    pub fn register_standard_templates(&self) -> Result<()> {
        for definition in standard_templates() {
            self.register_workflow(definition)?;
        }
        Ok(())
    }
}

/// Returns the three canonical workflow templates: `complete_fashion_analysis`
/// (5-step parallel pipeline, `ContinueOnFailure`), `quick_style_assessment`
/// (3-step sequential pipeline, `StopOnRequired`), and `user_onboarding`
/// (3-step sequential pipeline, `RetryWave`).
pub fn standard_templates() -> Vec<WorkflowDefinition> {
    vec![
        complete_fashion_analysis(),
        quick_style_assessment(),
        user_onboarding(),
    ]
}

fn complete_fashion_analysis() -> WorkflowDefinition {
    WorkflowDefinition {
        workflow_id: "complete_fashion_analysis".to_string(),
        steps: vec![
            WorkflowStep::builder("image_analysis", ServiceId::ImageProcessing, "/analyze_image_advanced")
                .timeout(Duration::from_secs(15))
                .retry_count(2)
                .build(),
            WorkflowStep::builder("text_understanding", ServiceId::Nlu, "/analyze_text_advanced")
                .timeout(Duration::from_secs(10))
                .retry_count(2)
                .build(),
            WorkflowStep::builder("style_profiling", ServiceId::StyleProfile, "/analyze_style_advanced")
                .depends_on(["image_analysis", "text_understanding"])
                .timeout(Duration::from_secs(12))
                .retry_count(2)
                .build(),
            WorkflowStep::builder("combination_generation", ServiceId::CombinationEngine, "/generate_combination_advanced")
                .depends_on(["style_profiling"])
                .timeout(Duration::from_secs(8))
                .retry_count(2)
                .build(),
            WorkflowStep::builder("personalized_recommendations", ServiceId::RecommendationEngine, "/recommendations_advanced")
                .depends_on(["combination_generation"])
                .timeout(Duration::from_secs(10))
                .retry_count(2)
                .build(),
        ],
        max_total_duration: Duration::from_secs(120),
        parallel: true,
        error_policy: ErrorPolicy::ContinueOnFailure,
    }
}

fn quick_style_assessment() -> WorkflowDefinition {
    WorkflowDefinition {
        workflow_id: "quick_style_assessment".to_string(),
        steps: vec![
            WorkflowStep::builder("quick_image_scan", ServiceId::ImageProcessing, "/quick_analysis")
                .timeout(Duration::from_secs(5))
                .retry_count(1)
                .build(),
            WorkflowStep::builder("style_classification", ServiceId::StyleProfile, "/classify_style")
                .depends_on(["quick_image_scan"])
                .timeout(Duration::from_secs(3))
                .retry_count(1)
                .build(),
            WorkflowStep::builder("instant_recommendations", ServiceId::RecommendationEngine, "/quick_recommendations")
                .depends_on(["style_classification"])
                .timeout(Duration::from_secs(4))
                .retry_count(1)
                .build(),
        ],
        max_total_duration: Duration::from_secs(30),
        parallel: false,
        error_policy: ErrorPolicy::StopOnRequired,
    }
}

fn user_onboarding() -> WorkflowDefinition {
    WorkflowDefinition {
        workflow_id: "user_onboarding".to_string(),
        steps: vec![
            WorkflowStep::builder("preference_analysis", ServiceId::Nlu, "/analyze_preferences")
                .timeout(Duration::from_secs(8))
                .build(),
            WorkflowStep::builder("initial_profile_creation", ServiceId::StyleProfile, "/create_profile")
                .depends_on(["preference_analysis"])
                .timeout(Duration::from_secs(10))
                .build(),
            WorkflowStep::builder("welcome_recommendations", ServiceId::RecommendationEngine, "/welcome_recommendations")
                .depends_on(["initial_profile_creation"])
                .timeout(Duration::from_secs(12))
                .build(),
        ],
        max_total_duration: Duration::from_secs(60),
        parallel: false,
        error_policy: ErrorPolicy::RetryWave,
    }
}

// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! CLI for the workflow orchestration and service choreography engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use orchestrator_core::{Orchestrator, OrchestratorConfig, ServiceId, WorkflowDefinition};
use orchestrator_sdk::{context, OrchestratorBuilder};
use std::collections::HashMap;
use std::fs;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(version, about = "Workflow orchestration and service choreography engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a YAML configuration file overriding engine defaults
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition file
    Validate {
        /// Path to a workflow definition YAML file
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Register the standard templates and run one workflow to completion
    Run {
        /// Path to a workflow definition YAML file. If omitted, `workflow_id`
        /// is resolved against the standard templates.
        #[arg(short, long)]
        file: Option<String>,

        /// Workflow id to execute
        #[arg(value_name = "WORKFLOW_ID")]
        workflow_id: String,

        /// Input JSON object, e.g. '{"user_id": "u1"}'
        #[arg(short, long)]
        input: Option<String>,

        /// service-id=base-url pairs, repeatable
        #[arg(short, long = "endpoint")]
        endpoints: Vec<String>,
    },

    /// Print registered services and their resolved endpoints
    Services {
        #[arg(short, long = "endpoint")]
        endpoints: Vec<String>,
    },

    /// List the canonical workflow templates shipped with this engine
    Templates,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("orchestrator={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Run { file, workflow_id, input, endpoints } => {
            run_workflow(cli.config.as_deref(), file.as_deref(), &workflow_id, input.as_deref(), &endpoints).await
        }
        Commands::Services { endpoints } => list_services(&endpoints),
        Commands::Templates => list_templates(),
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&str>) -> Result<OrchestratorConfig> {
    match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {path}"))?;
            OrchestratorConfig::from_yaml(&content)
                .with_context(|| format!("failed to parse config file: {path}"))
        }
        None => Ok(OrchestratorConfig::default()),
    }
}

fn parse_endpoints(endpoints: &[String]) -> Result<Vec<(ServiceId, String)>> {
    endpoints
        .iter()
        .map(|entry| {
            let (service, url) = entry
                .split_once('=')
                .with_context(|| format!("endpoint '{entry}' is not in service-id=base-url form"))?;
            let service_id = ServiceId::all()
                .into_iter()
                .find(|s| s.as_str() == service)
                .with_context(|| format!("unknown service id: {service}"))?;
            Ok((service_id, url.to_string()))
        })
        .collect()
}

fn validate_workflow(file_path: &str) -> Result<()> {
    info!("validating workflow: {}", file_path);
    println!("{} {}", "Validating workflow:".cyan().bold(), file_path);

    let content = fs::read_to_string(file_path)
        .with_context(|| format!("failed to read workflow file: {file_path}"))?;
    let definition: WorkflowDefinition = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse workflow YAML: {file_path}"))?;

    definition.validate().with_context(|| "workflow validation failed")?;

    println!("{}", "\u{2713} workflow is valid".green().bold());
    println!("  id: {}", definition.workflow_id);
    println!("  steps: {}", definition.steps.len());
    println!("  error policy: {:?}", definition.error_policy);
    Ok(())
}

async fn run_workflow(
    config_path: Option<&str>,
    file_path: Option<&str>,
    workflow_id: &str,
    input: Option<&str>,
    endpoints: &[String],
) -> Result<()> {
    info!("running workflow: {}", workflow_id);
    println!("{} {}", "Running workflow:".cyan().bold(), workflow_id);

    let config = load_config(config_path)?;
    let mut builder = OrchestratorBuilder::new().config(config).with_standard_templates();
    for (service_id, base_url) in parse_endpoints(endpoints)? {
        builder = builder.endpoint(service_id, base_url);
    }
    let orchestrator: Orchestrator = builder.build().with_context(|| "failed to build orchestrator")?;
    let _health_probe = orchestrator.start_health_monitoring();

    if let Some(file_path) = file_path {
        let content = fs::read_to_string(file_path)
            .with_context(|| format!("failed to read workflow file: {file_path}"))?;
        let definition: WorkflowDefinition = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse workflow YAML: {file_path}"))?;
        orchestrator
            .register_workflow(definition)
            .with_context(|| "failed to register workflow")?;
    }

    let inputs: HashMap<String, serde_json::Value> = match input {
        Some(raw) => serde_json::from_str(raw).with_context(|| "input must be a JSON object")?,
        None => HashMap::new(),
    };

    println!("{}", "Executing workflow...".cyan());
    let execution = orchestrator
        .execute_workflow(workflow_id, context("cli-user", Uuid::new_v4().to_string(), inputs))
        .await
        .with_context(|| "workflow execution failed")?;

    println!("{}", "\u{2713} workflow finished".green().bold());
    println!("  status: {:?}", execution.status);
    println!("  completed steps: {}", execution.completed_steps.len());
    println!("  failed steps: {}", execution.failed_steps.len());
    println!(
        "\n{}\n{}",
        "Results:".cyan().bold(),
        serde_json::to_string_pretty(&execution.context.step_results)
            .unwrap_or_else(|_| format!("{:?}", execution.context.step_results))
    );

    Ok(())
}

fn list_services(endpoints: &[String]) -> Result<()> {
    let parsed = parse_endpoints(endpoints)?;
    println!("{}", "Registered services:".cyan().bold());
    for service_id in ServiceId::all() {
        match parsed.iter().find(|(id, _)| *id == service_id) {
            Some((_, url)) => println!("  {} -> {}", service_id, url.green()),
            None => println!("  {} -> {}", service_id, "(unregistered)".yellow()),
        }
    }
    Ok(())
}

fn list_templates() -> Result<()> {
    println!("{}", "Standard workflow templates:".cyan().bold());
    for definition in orchestrator_core::standard_templates() {
        println!(
            "  {} ({} steps, {:?}, {}s ceiling)",
            definition.workflow_id.bold(),
            definition.steps.len(),
            definition.error_policy,
            definition.max_total_duration.as_secs(),
        );
    }
    Ok(())
}

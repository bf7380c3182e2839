// ABOUTME: Engine (C6) — the stable entry point: construct once per embedder, call `execute`
// ABOUTME: once per run; sub-workflows get a child Engine sharing health/failover state

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::collaborators_bundle::EngineCollaborators;
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::failover::{AgentHealthTracker, FailoverEvent, FailoverLog};
use flowmark_core::{
    EngineError, EventSink, ExecutionContext, ExecutionRecord, Result, StateStore, Step,
    StepExecutor, StepResult, ToolRegistry, Workflow, WorkflowResult, WorkflowStatus,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Top-level entry point (spec §6). Holds the engine-instance-scoped state
/// (circuit breakers, health tracker, failover log) across every call to
/// `execute`; construct once per embedder process or tenant.
pub struct Engine {
    config: EngineConfig,
    collaborators: EngineCollaborators,
    breakers: Arc<CircuitBreakerRegistry>,
    health_tracker: Arc<AgentHealthTracker>,
    failover_log: Arc<FailoverLog>,
    events: Option<Arc<dyn EventSink>>,
    state_store: Option<Arc<dyn StateStore>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        collaborators: EngineCollaborators,
        events: Option<Arc<dyn EventSink>>,
        state_store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        Self {
            config,
            collaborators,
            breakers,
            health_tracker: Arc::new(AgentHealthTracker::default()),
            failover_log: Arc::new(FailoverLog::default()),
            events,
            state_store,
        }
    }

    /// Constructs a sub-workflow's `Engine`: a fresh per-run circuit-breaker
    /// map (spec §4.4 "breakers are keyed per service, per engine instance"),
    /// but the parent's health tracker and failover log so failover history
    /// aggregates across the whole run. No `StateStore`: only the top-level
    /// run is persisted as an execution record.
    pub(crate) fn child(
        config: EngineConfig,
        collaborators: EngineCollaborators,
        health_tracker: Arc<AgentHealthTracker>,
        failover_log: Arc<FailoverLog>,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        Self {
            config,
            collaborators,
            breakers,
            health_tracker,
            failover_log,
            events: None,
            state_store: None,
        }
    }

    pub async fn execute_file(
        &self,
        path: &str,
        inputs: HashMap<String, Value>,
        registry: &dyn ToolRegistry,
        executor: &dyn StepExecutor,
    ) -> Result<WorkflowResult> {
        let parser = self
            .collaborators
            .parser
            .as_ref()
            .ok_or_else(|| EngineError::internal("execute_file requires a Parser collaborator"))?;
        let parsed = parser
            .parse_file(path)
            .await
            .map_err(|e| EngineError::parse(e.to_string()))?;
        let mut workflow = parsed.workflow;
        workflow.source_path = Some(path.to_string());
        Ok(self.execute(&workflow, inputs, registry, executor).await)
    }

    /// Runs one workflow to completion, never returning an `Err` — unhandled
    /// step failures surface as `WorkflowStatus::Failed` in the result (spec
    /// §6 "execute never throws for step-level failures").
    pub async fn execute(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
        registry: &dyn ToolRegistry,
        executor: &dyn StepExecutor,
    ) -> WorkflowResult {
        let run_id = Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now();

        if let Err(e) = workflow.validate() {
            return failed_result(&workflow.metadata.id, &run_id, started_at, e);
        }

        let resolved_inputs = apply_input_defaults(workflow, inputs);
        let mut ctx = ExecutionContext::new(workflow.metadata.id.clone(), run_id.clone(), resolved_inputs);

        if let Some(events) = &self.events {
            events.on_workflow_start(&run_id, &workflow.metadata.id).await;
        }
        if let Some(store) = &self.state_store {
            let record = execution_record(&ctx);
            if let Err(e) = store.create_execution(record).await {
                error!(error = %e, "state store create_execution failed");
            }
        }

        let dispatcher = Dispatcher {
            config: &self.config,
            breakers: self.breakers.clone(),
            health_tracker: self.health_tracker.clone(),
            failover_log: self.failover_log.clone(),
            collaborators: &self.collaborators,
            registry,
            executor,
            events: self.events.clone(),
            run_id: run_id.clone(),
            base_path: workflow.source_path.clone(),
        };

        let mut step_results = Vec::with_capacity(workflow.steps.len());
        let outcome = dispatcher.execute_sequence(&workflow.steps, &mut ctx).await;

        let (status, error, executed) = match outcome {
            Ok(outcomes) => (WorkflowStatus::Completed, None, outcomes),
            Err((outcomes, error)) => (WorkflowStatus::Failed, Some(error), outcomes),
        };
        ctx.status = status;

        for (step, outcome) in workflow.steps.iter().zip(executed.iter()) {
            step_results.push(to_step_result(step, outcome));
        }

        let output = ctx
            .workflow_outputs
            .clone()
            .unwrap_or_else(|| Value::Object(ctx.variables.clone().into_iter().collect()));
        let completed_at = chrono::Utc::now();

        if let Some(events) = &self.events {
            events
                .on_workflow_complete(&run_id, status_str(status))
                .await;
        }
        if let Some(store) = &self.state_store {
            let record = execution_record(&ctx);
            if let Err(e) = store.update_execution(&run_id, record).await {
                error!(error = %e, "state store update_execution failed");
            }
        }

        info!(run_id = %run_id, workflow_id = %workflow.metadata.id, status = status_str(status), "workflow run finished");

        WorkflowResult {
            workflow_id: workflow.metadata.id.clone(),
            run_id,
            status,
            step_results,
            output,
            error,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds(),
        }
    }

    pub fn failover_history(&self) -> Vec<FailoverEvent> {
        self.failover_log.all()
    }

    pub fn reset_circuit_breakers(&self) {
        self.breakers.reset_all();
    }
}

fn apply_input_defaults(
    workflow: &Workflow,
    mut inputs: HashMap<String, Value>,
) -> HashMap<String, Value> {
    for (name, declaration) in &workflow.inputs {
        if !inputs.contains_key(name) {
            if let Some(default) = &declaration.default {
                inputs.insert(name.clone(), default.clone());
            }
        }
    }
    inputs
}

fn to_step_result(step: &Step, outcome: &crate::dispatcher::StepOutcome) -> StepResult {
    StepResult {
        step_id: step.id().to_string(),
        status: outcome.status,
        output: outcome.output.clone(),
        error: outcome.error.clone(),
        started_at: outcome.started_at,
        completed_at: outcome.completed_at,
        duration_ms: outcome.duration_ms(),
        retry_count: outcome.retry_count,
    }
}

fn status_str(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Pending => "pending",
        WorkflowStatus::Running => "running",
        WorkflowStatus::Completed => "completed",
        WorkflowStatus::Failed => "failed",
    }
}

fn execution_record(ctx: &ExecutionContext) -> ExecutionRecord {
    ExecutionRecord {
        run_id: ctx.run_id.clone(),
        workflow_id: ctx.workflow_id.clone(),
        status: status_str(ctx.status).to_string(),
        step_metadata: ctx.step_metadata.clone(),
    }
}

fn failed_result(
    workflow_id: &str,
    run_id: &str,
    started_at: chrono::DateTime<chrono::Utc>,
    error: String,
) -> WorkflowResult {
    let completed_at = chrono::Utc::now();
    WorkflowResult {
        workflow_id: workflow_id.to_string(),
        run_id: run_id.to_string(),
        status: WorkflowStatus::Failed,
        step_results: Vec::new(),
        output: Value::Null,
        error: Some(error),
        started_at,
        completed_at,
        duration_ms: (completed_at - started_at).num_milliseconds(),
    }
}

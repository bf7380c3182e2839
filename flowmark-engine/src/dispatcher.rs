// ABOUTME: Step Dispatcher (C5) — gate conditions, dispatch by step kind, leaf invocation via the
// ABOUTME: retry/breaker/failover pipeline; control-flow operators live in operators/*.rs

use crate::circuit_breaker::{service_of, CircuitBreakerRegistry};
use crate::collaborators_bundle::EngineCollaborators;
use crate::condition;
use crate::config::EngineConfig;
use crate::failover::{self, AgentHealthTracker, FailoverEvent, FailoverLog, FailoverReason};
use crate::pipeline::{self, AttemptFn};
use crate::template;
use flowmark_core::{
    ErrorAction, ErrorHandling, ExecutionContext, ExecutorContext, Step, StepExecutor, StepKind,
    StepStatus, ToolRegistry,
};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of dispatching a single `Step`, before the envelope (output
/// variable write, metadata record) is applied by `execute_step`.
/// `started_at`/`completed_at` are stamped by `execute_step` itself, so every
/// constructor below leaves them at a placeholder the caller overwrites.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub output: Value,
    pub error: Option<String>,
    pub retry_count: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

impl StepOutcome {
    pub fn completed(output: Value) -> Self {
        Self {
            status: StepStatus::Completed,
            output,
            error: None,
            retry_count: 0,
            started_at: chrono::Utc::now(),
            completed_at: chrono::Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            output: Value::Null,
            error: Some(error.into()),
            retry_count: 0,
            started_at: chrono::Utc::now(),
            completed_at: chrono::Utc::now(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            output: Value::Null,
            error: None,
            retry_count: 0,
            started_at: chrono::Utc::now(),
            completed_at: chrono::Utc::now(),
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }
}

/// Per-run dispatcher: bundles engine-instance-scoped state (breaker
/// registry, health tracker, failover log) with the per-call collaborators
/// (`ToolRegistry`, `StepExecutor`) for the duration of one `execute` call.
pub struct Dispatcher<'a> {
    pub config: &'a EngineConfig,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub health_tracker: Arc<AgentHealthTracker>,
    pub failover_log: Arc<FailoverLog>,
    pub collaborators: &'a EngineCollaborators,
    pub registry: &'a dyn ToolRegistry,
    pub executor: &'a dyn StepExecutor,
    pub events: Option<Arc<dyn flowmark_core::EventSink>>,
    pub run_id: String,
    pub base_path: Option<String>,
}

/// Finds the `errorHandling.action` embedded in a step's variant, defaulting
/// to `Stop` for variants that don't carry one (If/Switch/Map/Filter/
/// Reduce/Parallel/Try — spec §7 "local operators ... unless the operator
/// has explicit continue or try/catch semantics").
pub fn error_handling_of(step: &Step) -> ErrorHandling {
    match &step.kind {
        StepKind::Action(a) => a.error_handling.clone().unwrap_or_default(),
        StepKind::SubWorkflow(s) => s.error_handling.clone().unwrap_or_default(),
        StepKind::ForEach(f) => f.error_handling.clone().unwrap_or_default(),
        StepKind::While(w) => w.error_handling.clone().unwrap_or_default(),
        _ => ErrorHandling::default(),
    }
}

/// Output convention shared by If/Switch/Try/Parallel-branch bodies: the
/// list of child outputs whose steps assigned an `outputVariable` (spec
/// §4.5 "Operator's own output is the list of child outputs...").
pub fn collect_list_output(steps: &[Step], outcomes: &[StepOutcome]) -> Value {
    let values: Vec<Value> = steps
        .iter()
        .zip(outcomes.iter())
        .filter(|(s, _)| s.common.output_variable.is_some())
        .map(|(_, o)| o.output.clone())
        .collect();
    Value::Array(values)
}

impl<'a> Dispatcher<'a> {
    /// Runs a list of child steps sequentially. Each step's own error
    /// handling action decides whether a failure is swallowed (`Continue`)
    /// and the list proceeds, or fatal (`Stop`/`Rollback`), in which case
    /// the already-collected outcomes and the fatal one are returned as
    /// `Err` so the caller can propagate without re-walking the list.
    pub fn execute_sequence<'f>(
        &'f self,
        steps: &'f [Step],
        ctx: &'f mut ExecutionContext,
    ) -> BoxFuture<'f, Result<Vec<StepOutcome>, (Vec<StepOutcome>, String)>> {
        Box::pin(async move {
            let mut outcomes = Vec::with_capacity(steps.len());
            for step in steps {
                let outcome = self.execute_step(step, ctx).await;
                let failed = outcome.status == StepStatus::Failed;
                let error_text = outcome.error.clone().unwrap_or_default();
                outcomes.push(outcome);
                if failed {
                    let handling = error_handling_of(step);
                    match handling.action {
                        ErrorAction::Continue => continue,
                        ErrorAction::Rollback => {
                            self.rollback(ctx).await;
                            return Err((outcomes, error_text));
                        }
                        ErrorAction::Stop => return Err((outcomes, error_text)),
                    }
                }
            }
            Ok(outcomes)
        })
    }

    /// Runs the `RollbackRegistry` collaborator, if configured, against the
    /// current variables/inputs snapshot; a no-op when none is set.
    pub(crate) async fn rollback(&self, ctx: &mut ExecutionContext) {
        if let Some(rb) = &self.collaborators.rollback_registry {
            let inputs = ctx.inputs.clone();
            let variables = ctx.variables.clone();
            if let Err(e) = rb.rollback_all(ctx, &inputs, &variables).await {
                warn!(error = %e, "rollback registry failed");
            }
        }
    }

    /// Evaluates `step.conditions` as a short-circuit conjunction (C3).
    fn gate_passes(&self, step: &Step, ctx: &ExecutionContext) -> bool {
        if step.common.conditions.is_empty() {
            return true;
        }
        let renderer = self.collaborators.template_renderer.as_deref();
        let passes = condition::evaluate_all(&step.common.conditions, ctx, renderer);
        if !passes {
            debug!(step_id = step.id(), "step skipped: conditions not met");
        }
        passes
    }

    fn timeout_for(&self, step: &Step) -> Duration {
        step.common
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_timeout)
    }

    fn executor_ctx(&self, step: &Step) -> ExecutorContext {
        ExecutorContext {
            model: step.common.model.clone().or_else(|| self.config.default_model.clone()),
            agent: step.common.agent.clone().or_else(|| self.config.default_agent.clone()),
            permissions: step.common.permissions.clone(),
            security_policy: None,
            base_path: self.base_path.clone(),
        }
    }

    /// Dispatches one step: evaluates its gate, dispatches by kind, then
    /// applies the universal post-conditions from spec §4.5 (output
    /// variable write, metadata record, `__workflow_outputs__` sentinel).
    pub fn execute_step<'f>(
        &'f self,
        step: &'f Step,
        ctx: &'f mut ExecutionContext,
    ) -> BoxFuture<'f, StepOutcome> {
        Box::pin(async move {
            let started_at = chrono::Utc::now();

            if !self.gate_passes(step, ctx) {
                let mut outcome = StepOutcome::skipped();
                outcome.started_at = started_at;
                outcome.completed_at = started_at;
                ctx.record_step_metadata(step.id(), outcome.status, 0, None);
                return outcome;
            }

            if let Some(events) = &self.events {
                events.on_step_start(&self.run_id, step.id()).await;
            }

            let mut outcome = self.dispatch_kind(step, ctx).await;
            outcome.started_at = started_at;
            outcome.completed_at = chrono::Utc::now();

            if outcome.status == StepStatus::Completed {
                if let Some(name) = &step.common.output_variable {
                    crate::env::set(ctx, name, outcome.output.clone());
                }
                if let Value::Object(map) = &outcome.output {
                    if let Some(sentinel) = map.get("__workflow_outputs__") {
                        ctx.workflow_outputs = Some(sentinel.clone());
                    }
                }
            }

            ctx.record_step_metadata(
                step.id(),
                outcome.status,
                outcome.retry_count,
                outcome.error.clone(),
            );

            if let Some(events) = &self.events {
                match &outcome.error {
                    Some(error) => events.on_step_error(&self.run_id, step.id(), error).await,
                    None => {
                        events
                            .on_step_complete(&self.run_id, step.id(), outcome.status.as_str())
                            .await
                    }
                }
            }

            outcome
        })
    }

    async fn dispatch_kind(&self, step: &Step, ctx: &mut ExecutionContext) -> StepOutcome {
        match &step.kind {
            StepKind::Action(action) => self.execute_action(step, action, ctx).await,
            StepKind::SubWorkflow(sub) => self.execute_sub_workflow(step, sub, ctx).await,
            StepKind::Script(script) => self.execute_script(step, script, ctx).await,
            StepKind::If(if_step) => self.execute_if(if_step, ctx).await,
            StepKind::Switch(switch_step) => self.execute_switch(switch_step, ctx).await,
            StepKind::ForEach(for_each) => self.execute_for_each(for_each, ctx).await,
            StepKind::While(while_step) => self.execute_while(while_step, ctx).await,
            StepKind::Map(map_step) => self.execute_map(map_step, ctx),
            StepKind::Filter(filter_step) => self.execute_filter(filter_step, ctx),
            StepKind::Reduce(reduce_step) => self.execute_reduce(reduce_step, ctx),
            StepKind::Parallel(parallel_step) => self.execute_parallel(parallel_step, ctx).await,
            StepKind::Try(try_step) => self.execute_try(try_step, ctx).await,
        }
    }

    fn render_value(&self, template_value: &Value, ctx: &ExecutionContext) -> Value {
        template::render(template_value, ctx, self.collaborators.template_renderer.as_deref())
    }

    async fn execute_action(
        &self,
        step: &Step,
        action: &flowmark_core::ActionStep,
        ctx: &mut ExecutionContext,
    ) -> StepOutcome {
        let timeout = self.timeout_for(step);
        let retry_config = step_retry_config(action.error_handling.as_ref(), self.config);
        let service = service_of(&action.action).to_string();
        let breaker = self.breakers.get_or_create(&service);

        let rendered_inputs_fn = {
            let template = action.inputs.clone();
            move |ctx: &ExecutionContext, renderer: Option<&dyn flowmark_core::TemplateRenderer>| {
                template::render(&template, ctx, renderer)
            }
        };

        let registry = self.registry;
        let executor = self.executor;
        let outcome = self
            .run_leaf(&service, &retry_config, Some(&breaker), timeout, {
                let action_str = action.action.clone();
                let executor_ctx = self.executor_ctx(step);
                let snapshot = ctx.clone();
                let renderer = self.collaborators.template_renderer.clone();
                move |_attempt: u32| {
                    let action_str = action_str.clone();
                    let executor_ctx = executor_ctx.clone();
                    let snapshot = snapshot.clone();
                    let renderer2 = renderer.clone();
                    let rendered_inputs_fn = rendered_inputs_fn.clone();
                    Box::pin(async move {
                        let rendered = rendered_inputs_fn(&snapshot, renderer2.as_deref());
                        let synthetic_step_common = flowmark_core::StepCommon {
                            id: "__attempt__".to_string(),
                            ..Default::default()
                        };
                        let synthetic_step = flowmark_core::Step {
                            common: synthetic_step_common,
                            kind: flowmark_core::StepKind::Action(flowmark_core::ActionStep {
                                action: action_str,
                                inputs: rendered,
                                error_handling: None,
                                prompt: None,
                                prompt_inputs: None,
                            }),
                        };
                        executor
                            .execute(&synthetic_step, &snapshot, registry, &executor_ctx)
                            .await
                    })
                }
            })
            .await;

        if outcome.status != StepStatus::Failed {
            self.health_tracker.mark_healthy(service_of(&action.action));
            return outcome;
        }

        self.maybe_failover(step, action, ctx, outcome).await
    }

    async fn run_leaf<'f, F>(
        &'f self,
        service: &str,
        retry_config: &crate::retry::RetryConfig,
        breaker: Option<&crate::circuit_breaker::CircuitBreaker>,
        timeout: Duration,
        attempt_fn: F,
    ) -> StepOutcome
    where
        F: Fn(u32) -> BoxFuture<'f, anyhow::Result<Value>> + Send + Sync + 'f,
    {
        let boxed: Box<AttemptFn<'f>> = Box::new(attempt_fn);
        let outcome =
            pipeline::execute_with_retry(service, retry_config, breaker, timeout, &*boxed).await;
        let now = chrono::Utc::now();
        StepOutcome {
            status: outcome.status,
            output: outcome.output,
            error: outcome.error,
            retry_count: outcome.retry_count,
            started_at: now,
            completed_at: now,
        }
    }

    async fn maybe_failover(
        &self,
        step: &Step,
        action: &flowmark_core::ActionStep,
        ctx: &mut ExecutionContext,
        primary: StepOutcome,
    ) -> StepOutcome {
        let error_text = primary.error.clone().unwrap_or_default();
        let is_timeout = error_text.contains("timed out");
        let failover_cfg = &self.config.failover;

        let primary_tool = service_of(&action.action).to_string();
        self.health_tracker.mark_unhealthy(&primary_tool);

        let failover_admitted = if is_timeout {
            failover_cfg.failover_on_timeout
        } else {
            failover_cfg.failover_on_step_failure
        };
        if !failover_admitted {
            return primary;
        }

        let reason = if is_timeout {
            FailoverReason::Timeout
        } else {
            FailoverReason::StepFailure
        };

        let mut attempts = 0u32;
        for fallback_tool in &failover_cfg.fallback_agents {
            if fallback_tool == &primary_tool {
                continue;
            }
            if attempts >= failover_cfg.max_failover_attempts {
                break;
            }
            attempts += 1;

            let fallback_action = failover::substitute_tool(&action.action, fallback_tool);
            let fallback_service = service_of(&fallback_action).to_string();
            let breaker = self.breakers.get_or_create(&fallback_service);
            let timeout = self.timeout_for(step);
            let retry_config = step_retry_config(action.error_handling.as_ref(), self.config);

            let executor_ctx = self.executor_ctx(step);
            let template = action.inputs.clone();
            let snapshot = ctx.clone();
            let renderer = self.collaborators.template_renderer.clone();
            let registry = self.registry;
            let executor = self.executor;
            let fallback_action_for_closure = fallback_action.clone();

            let outcome = self
                .run_leaf(&fallback_service, &retry_config, Some(&breaker), timeout, move |_attempt| {
                    let action_str = fallback_action_for_closure.clone();
                    let executor_ctx = executor_ctx.clone();
                    let snapshot = snapshot.clone();
                    let renderer2 = renderer.clone();
                    let template = template.clone();
                    Box::pin(async move {
                        let rendered = template::render(&template, &snapshot, renderer2.as_deref());
                        let synthetic_common = flowmark_core::StepCommon {
                            id: "__failover_attempt__".to_string(),
                            ..Default::default()
                        };
                        let synthetic_step = flowmark_core::Step {
                            common: synthetic_common,
                            kind: flowmark_core::StepKind::Action(flowmark_core::ActionStep {
                                action: action_str,
                                inputs: rendered,
                                error_handling: None,
                                prompt: None,
                                prompt_inputs: None,
                            }),
                        };
                        executor
                            .execute(&synthetic_step, &snapshot, registry, &executor_ctx)
                            .await
                    })
                })
                .await;

            self.failover_log.append(FailoverEvent {
                timestamp: chrono::Utc::now(),
                from_agent: primary_tool.clone(),
                to_agent: fallback_tool.clone(),
                reason,
                step_index: ctx.current_step_index,
                error: Some(error_text.clone()),
            });

            if outcome.status == StepStatus::Completed {
                self.health_tracker.mark_healthy(fallback_tool);
                return outcome;
            }
        }

        primary
    }

    async fn execute_sub_workflow(
        &self,
        step: &Step,
        sub: &flowmark_core::SubWorkflowStep,
        ctx: &mut ExecutionContext,
    ) -> StepOutcome {
        if sub.use_subagent {
            return self.execute_agent_sub_workflow(step, sub, ctx).await;
        }

        let Some(parser) = &self.collaborators.parser else {
            return StepOutcome::failed(
                "SubWorkflow step requires a Parser collaborator, none configured",
            );
        };

        let base_path = self.base_path.clone().unwrap_or_default();
        let resolved_path = resolve_relative_path(&base_path, &sub.workflow);

        let parsed = match parser.parse_file(&resolved_path).await {
            Ok(p) => p,
            Err(e) => return StepOutcome::failed(format!("Sub-workflow parse error: {e}")),
        };

        let rendered_inputs = self.render_value(&sub.inputs, ctx);
        let inputs_map = value_to_map(&rendered_inputs);

        let child_engine = crate::runner::Engine::child(
            self.config.clone(),
            self.collaborators.clone(),
            self.health_tracker.clone(),
            self.failover_log.clone(),
        );

        let result = child_engine
            .execute(&parsed.workflow, inputs_map, self.registry, self.executor)
            .await;

        match result.status {
            flowmark_core::WorkflowStatus::Completed => StepOutcome::completed(result.output),
            _ => StepOutcome::failed(
                result
                    .error
                    .unwrap_or_else(|| "Sub-workflow execution failed".to_string()),
            ),
        }
    }

    async fn execute_agent_sub_workflow(
        &self,
        step: &Step,
        sub: &flowmark_core::SubWorkflowStep,
        ctx: &mut ExecutionContext,
    ) -> StepOutcome {
        let max_turns = sub
            .subagent_config
            .as_ref()
            .and_then(|c| c.max_turns)
            .unwrap_or(4);

        let agent = step
            .common
            .agent
            .clone()
            .or_else(|| self.config.default_agent.clone())
            .unwrap_or_else(|| "default".to_string());

        let base_path = self.base_path.clone().unwrap_or_default();
        let resolved_path = resolve_relative_path(&base_path, &sub.workflow);
        let workflow_text = match std::fs::read_to_string(&resolved_path) {
            Ok(t) => t,
            Err(e) => return StepOutcome::failed(format!("cannot read sub-workflow file: {e}")),
        };

        let rendered_inputs = self.render_value(&sub.inputs, ctx);
        let executor_ctx = self.executor_ctx(step);

        for _turn in 0..max_turns {
            let action_str = format!("{agent}.chat.completions");
            let synthetic_common = flowmark_core::StepCommon {
                id: "__agent_turn__".to_string(),
                ..Default::default()
            };
            let synthetic_step = flowmark_core::Step {
                common: synthetic_common,
                kind: flowmark_core::StepKind::Action(flowmark_core::ActionStep {
                    action: action_str,
                    inputs: serde_json::json!({
                        "workflow_text": workflow_text,
                        "inputs": rendered_inputs,
                        "allowed_tools": sub.subagent_config.as_ref().map(|c| c.allowed_tools.clone()).unwrap_or_default(),
                    }),
                    error_handling: None,
                    prompt: None,
                    prompt_inputs: None,
                }),
            };

            let response = self
                .executor
                .execute(&synthetic_step, ctx, self.registry, &executor_ctx)
                .await;

            let response_value = match response {
                Ok(v) => v,
                Err(e) => return StepOutcome::failed(e.to_string()),
            };

            if let Some(parsed) = parse_agent_response(&response_value) {
                if parsed.completed {
                    return match parsed.error {
                        Some(err) => StepOutcome::failed(err),
                        None => StepOutcome::completed(parsed.output.unwrap_or(Value::Null)),
                    };
                }
            }
        }

        StepOutcome::failed(format!("Sub-agent exceeded maximum turns ({max_turns})"))
    }

    async fn execute_script(
        &self,
        step: &Step,
        script: &flowmark_core::ScriptStep,
        ctx: &mut ExecutionContext,
    ) -> StepOutcome {
        let timeout = script
            .timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.timeout_for(step));
        let retry_config = step_retry_config(None, self.config);
        let service = "script".to_string();

        let env_value = serde_json::json!({
            "variables": ctx.variables,
            "inputs": ctx.inputs,
            "steps": ctx.step_metadata,
        });
        let sandbox = self.collaborators.script_sandbox.clone();
        let code = script.code.clone();
        let timeout_ms = timeout.as_millis() as u64;

        self.run_leaf(&service, &retry_config, None, timeout, move |_attempt| {
            let sandbox = sandbox.clone();
            let code = code.clone();
            let env_value = env_value.clone();
            Box::pin(async move {
                let outcome = sandbox.execute(&code, &env_value, timeout_ms).await?;
                if outcome.success {
                    Ok(outcome.value.unwrap_or(Value::Null))
                } else {
                    anyhow::bail!(outcome.error.unwrap_or_else(|| "script failed".to_string()))
                }
            })
        })
        .await
    }
}

fn step_retry_config(
    error_handling: Option<&ErrorHandling>,
    config: &EngineConfig,
) -> crate::retry::RetryConfig {
    let mut base = config.retry_config();
    if let Some(eh) = error_handling {
        if let Some(max_retries) = eh.max_retries {
            base.max_retries = max_retries;
        }
        if let Some(delay) = eh.retry_delay_seconds {
            base.base_delay = Duration::from_secs(delay);
        }
    }
    base
}

fn resolve_relative_path(base: &str, relative: &str) -> String {
    if relative.starts_with('/') || base.is_empty() {
        return relative.to_string();
    }
    let base_dir = std::path::Path::new(base)
        .parent()
        .unwrap_or_else(|| std::path::Path::new(""));
    base_dir.join(relative).to_string_lossy().to_string()
}

fn value_to_map(value: &Value) -> std::collections::HashMap<String, Value> {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => std::collections::HashMap::new(),
    }
}

struct AgentTurnResponse {
    completed: bool,
    output: Option<Value>,
    error: Option<String>,
}

/// Parses the agent's expected `{completed, output?, error?}` JSON reply,
/// either a fenced ```json block or raw content (spec §4.6 "Agent sub-workflow").
fn parse_agent_response(value: &Value) -> Option<AgentTurnResponse> {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let json_text = extract_fenced_json(&text).unwrap_or(text);
    let parsed: Value = serde_json::from_str(&json_text).ok()?;
    let completed = parsed.get("completed")?.as_bool()?;
    Some(AgentTurnResponse {
        completed,
        output: parsed.get("output").cloned(),
        error: parsed.get("error").and_then(|e| e.as_str()).map(String::from),
    })
}

fn extract_fenced_json(text: &str) -> Option<String> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

// ABOUTME: Collaborator trait contracts the engine consumes (Parser, ToolRegistry,
// ABOUTME: StepExecutor, StateStore, ...) — narrow interfaces, no implementations here

use crate::context::{ExecutionContext, StepMetadataEntry};
use crate::model::{Permissions, Step, Workflow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Parsed-workflow-plus-warnings, the `Parser` collaborator's return shape.
#[derive(Debug, Clone)]
pub struct ParsedWorkflow {
    pub workflow: Workflow,
    pub warnings: Vec<String>,
}

/// External markdown+structured-header → `Workflow` collaborator. Entirely
/// out of scope for this crate (spec §1); the engine only ever sees the
/// `Workflow` values this trait hands back.
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse_file(&self, path: &str) -> anyhow::Result<ParsedWorkflow>;
    async fn parse_content(&self, text: &str) -> anyhow::Result<ParsedWorkflow>;
}

/// Opaque handle to a loaded tool, returned by `ToolRegistry::load`. The
/// engine never inspects a handle's contents; it only forwards it to the
/// `StepExecutor` callback.
pub trait ToolHandle: Send + Sync + std::any::Any {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Resolves tool aliases (e.g. `slack`, the first segment of
/// `slack.chat.postMessage`) to concrete handles.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn load(&self, tool_name: &str) -> anyhow::Result<Arc<dyn ToolHandle>>;
    fn has(&self, tool_name: &str) -> bool;
    fn register_tools(&self, tools: HashMap<String, Arc<dyn ToolHandle>>) -> anyhow::Result<()>;
}

/// Effective per-invocation context handed to the `StepExecutor`: resolved
/// model/agent/permissions, derived security policy, and the workflow's base
/// path (for relative prompt/sub-workflow resolution).
#[derive(Debug, Clone, Default)]
pub struct ExecutorContext {
    pub model: Option<String>,
    pub agent: Option<String>,
    pub permissions: Option<Permissions>,
    pub security_policy: Option<Value>,
    pub base_path: Option<String>,
}

/// The single hook through which external effects happen. Invoked by the
/// retry/circuit-breaker/failover pipeline (C4) once per attempt, with
/// templates already rendered into `step`'s inputs for that attempt.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &Step,
        env: &ExecutionContext,
        registry: &dyn ToolRegistry,
        executor_ctx: &ExecutorContext,
    ) -> anyhow::Result<Value>;
}

/// A run record as persisted by an optional `StateStore`. Recording progress
/// only — no durable resumption is implemented or implied (spec §1 Non-goals).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecutionRecord {
    pub run_id: String,
    pub workflow_id: String,
    pub status: String,
    pub step_metadata: HashMap<String, StepMetadataEntry>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_execution(&self, record: ExecutionRecord) -> anyhow::Result<()>;
    async fn update_execution(&self, run_id: &str, patch: ExecutionRecord) -> anyhow::Result<()>;
}

/// Invoked when a step's `errorHandling.action` is `rollback`.
#[async_trait]
pub trait RollbackRegistry: Send + Sync {
    async fn rollback_all(
        &self,
        context: &ExecutionContext,
        inputs: &HashMap<String, Value>,
        variables: &HashMap<String, Value>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct LoadedPrompt {
    pub id: String,
    pub template: String,
}

/// Loads and validates external prompt files referenced by `Action.prompt`.
#[async_trait]
pub trait PromptLoader: Send + Sync {
    async fn load_prompt_file(&self, id: &str, base_path: &str) -> anyhow::Result<LoadedPrompt>;
    fn resolve_prompt_template(&self, prompt: &LoadedPrompt, inputs: &Value) -> anyhow::Result<String>;
    fn validate_prompt_inputs(&self, prompt: &LoadedPrompt, inputs: &Value) -> anyhow::Result<()>;
}

/// Result of a sandboxed script execution.
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<String>,
}

/// Executes `Script` step bodies. The engine defines the permission envelope
/// it passes through but does not itself enforce syscall-level isolation
/// (spec §1 Non-goals).
#[async_trait]
pub trait ScriptSandbox: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        env: &Value,
        timeout_ms: u64,
    ) -> anyhow::Result<ScriptOutcome>;
}

/// The richer filter/regex/loop template syntax the engine delegates to
/// (spec §4.2 rule 4). The engine's own `TemplateRenderer` (C2, in
/// `flowmark-engine`) handles the single-expression and plain-interpolation
/// cases itself and only reaches this collaborator for everything else.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, ctx: &Value) -> anyhow::Result<Value>;
}

/// Optional telemetry sink. All methods have no-op defaults so embedders can
/// implement only the ones they care about.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_step_start(&self, _run_id: &str, _step_id: &str) {}
    async fn on_step_complete(&self, _run_id: &str, _step_id: &str, _status: &str) {}
    async fn on_step_error(&self, _run_id: &str, _step_id: &str, _error: &str) {}
    async fn on_workflow_start(&self, _run_id: &str, _workflow_id: &str) {}
    async fn on_workflow_complete(&self, _run_id: &str, _status: &str) {}
}

// ABOUTME: In-memory mock collaborators for deterministic tests — scripted tool responses,
// ABOUTME: a permissive tool registry, a no-op sandbox, and an event-collecting sink

use async_trait::async_trait;
use flowmark_core::{
    EventSink, ExecutionContext, ExecutorContext, ScriptOutcome, ScriptSandbox, Step, StepExecutor,
    ToolHandle, ToolRegistry,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A `ToolRegistry` that accepts every alias; `load` returns an opaque unit
/// handle since `test_utils`'s `StepExecutor` never inspects it.
#[derive(Default)]
pub struct MockToolRegistry;

struct UnitHandle;
impl ToolHandle for UnitHandle {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl ToolRegistry for MockToolRegistry {
    async fn load(&self, _tool_name: &str) -> anyhow::Result<Arc<dyn ToolHandle>> {
        Ok(Arc::new(UnitHandle))
    }

    fn has(&self, _tool_name: &str) -> bool {
        true
    }

    fn register_tools(&self, _tools: HashMap<String, Arc<dyn ToolHandle>>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Scripted `StepExecutor`: looks up the step's `action` string in a table of
/// canned responses (`Ok(value)` or `Err(message)`), recording every call it
/// saw for assertions. Unlisted actions fall back to `Ok(Value::Null)`.
pub struct ScriptedExecutor {
    responses: HashMap<String, Vec<Result<Value, String>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queues one response for `action`; subsequent calls to the same action
    /// consume queued responses in order, then repeat the last one.
    pub fn on(mut self, action: &str, response: Result<Value, String>) -> Self {
        self.responses.entry(action.to_string()).or_default().push(response);
        self
    }

    pub fn call_count(&self, action: &str) -> usize {
        self.calls.lock().iter().filter(|a| a.as_str() == action).count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        step: &Step,
        _env: &ExecutionContext,
        _registry: &dyn ToolRegistry,
        _executor_ctx: &ExecutorContext,
    ) -> anyhow::Result<Value> {
        let action = match &step.kind {
            flowmark_core::StepKind::Action(a) => a.action.clone(),
            _ => return Ok(Value::Null),
        };
        self.calls.lock().push(action.clone());

        let queue = self.responses.get(&action);
        let call_index = self.call_count(&action).saturating_sub(1);
        match queue {
            None => Ok(Value::Null),
            Some(responses) => {
                let response = responses.get(call_index).or_else(|| responses.last());
                match response {
                    Some(Ok(value)) => Ok(value.clone()),
                    Some(Err(message)) => anyhow::bail!(message.clone()),
                    None => Ok(Value::Null),
                }
            }
        }
    }
}

/// Always-succeeds `ScriptSandbox` echoing back the expression it's given as
/// a JSON string (good enough for tests that only exercise control flow
/// around `Script` steps, not an actual script language).
#[derive(Default)]
pub struct NoopSandbox;

#[async_trait]
impl ScriptSandbox for NoopSandbox {
    async fn execute(&self, code: &str, _env: &Value, _timeout_ms: u64) -> anyhow::Result<ScriptOutcome> {
        Ok(ScriptOutcome {
            success: true,
            value: Some(Value::String(code.to_string())),
            error: None,
        })
    }
}

/// Records every event callback invocation for assertions.
#[derive(Default)]
pub struct RecordingEventSink {
    pub events: Mutex<Vec<String>>,
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn on_step_start(&self, _run_id: &str, step_id: &str) {
        self.events.lock().push(format!("step_start:{step_id}"));
    }

    async fn on_step_complete(&self, _run_id: &str, step_id: &str, status: &str) {
        self.events
            .lock()
            .push(format!("step_complete:{step_id}:{status}"));
    }

    async fn on_step_error(&self, _run_id: &str, step_id: &str, error: &str) {
        self.events.lock().push(format!("step_error:{step_id}:{error}"));
    }

    async fn on_workflow_start(&self, _run_id: &str, workflow_id: &str) {
        self.events.lock().push(format!("workflow_start:{workflow_id}"));
    }

    async fn on_workflow_complete(&self, _run_id: &str, status: &str) {
        self.events.lock().push(format!("workflow_complete:{status}"));
    }
}

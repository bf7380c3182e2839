// ABOUTME: EngineCollaborators — the optional/required collaborator handles an Engine is built with
// ABOUTME: ToolRegistry/StepExecutor are supplied per-call to execute(); these are constructor-time

use flowmark_core::{Parser, PromptLoader, RollbackRegistry, ScriptSandbox, TemplateRenderer};
use std::sync::Arc;

/// Collaborators supplied once, at `Engine` construction, as distinct from
/// `ToolRegistry`/`StepExecutor` which spec §6 passes per-call to `execute`.
/// `script_sandbox` is required (every workflow may contain a `Script` step);
/// the rest are optional narrow extensions the engine falls back gracefully
/// without (richer templating, prompt files, sub-workflow parsing, rollback).
#[derive(Clone)]
pub struct EngineCollaborators {
    pub script_sandbox: Arc<dyn ScriptSandbox>,
    pub template_renderer: Option<Arc<dyn TemplateRenderer>>,
    pub parser: Option<Arc<dyn Parser>>,
    pub prompt_loader: Option<Arc<dyn PromptLoader>>,
    pub rollback_registry: Option<Arc<dyn RollbackRegistry>>,
}

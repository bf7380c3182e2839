// ABOUTME: The Workflow/Step data model — the immutable input the engine executes
// ABOUTME: Step is a tagged sum type with one constructor per control-flow/leaf variant

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Top-level metadata for a workflow, analogous to a package manifest.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Opaque per-alias tool configuration; the engine only ever reads the alias
/// itself (the "service" segment of an action string) and forwards the rest
/// to the `ToolRegistry` collaborator untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolConfig {
    #[serde(flatten)]
    pub config: HashMap<String, Value>,
}

/// A declared workflow input parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDeclaration {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Workflow-level permission envelope. Threaded to collaborators verbatim;
/// this crate does not itself enforce any of these constraints (spec §1).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Permissions {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub execute: bool,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    #[serde(default)]
    pub allowed_directories: Vec<String>,
    #[serde(default)]
    pub blocked_paths: Vec<String>,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub max_file_size: Option<u64>,
}

/// Policy for handling a failed leaf or operator step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    Stop,
    Continue,
    Rollback,
}

impl Default for ErrorAction {
    fn default() -> Self {
        Self::Stop
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorHandling {
    #[serde(default)]
    pub action: ErrorAction,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_seconds: Option<u64>,
    #[serde(default)]
    pub fallback_action: Option<String>,
}

/// Fields common to every step variant.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepCommon {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub output_variable: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub permissions: Option<Permissions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    pub action: String,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub error_handling: Option<ErrorHandling>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub prompt_inputs: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubWorkflowStep {
    pub workflow: String,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub error_handling: Option<ErrorHandling>,
    #[serde(default)]
    pub use_subagent: bool,
    #[serde(default)]
    pub subagent_config: Option<SubagentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubagentConfig {
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptStep {
    pub code: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfStep {
    pub condition: String,
    #[serde(default, alias = "steps")]
    pub then: Vec<Step>,
    #[serde(default)]
    pub r#else: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchStep {
    pub expression: String,
    pub cases: HashMap<String, Vec<Step>>,
    #[serde(default)]
    pub default: Option<Vec<Step>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEachStep {
    pub items: String,
    pub item_variable: String,
    #[serde(default)]
    pub index_variable: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub error_handling: Option<ErrorHandling>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhileStep {
    pub condition: String,
    pub max_iterations: u32,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub error_handling: Option<ErrorHandling>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapStep {
    pub items: String,
    pub item_variable: String,
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterStep {
    pub items: String,
    pub item_variable: String,
    pub condition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceStep {
    pub items: String,
    pub item_variable: String,
    pub accumulator_variable: String,
    #[serde(default)]
    pub initial_value: Option<Value>,
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub id: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelErrorAction {
    Stop,
    Continue,
}

impl Default for ParallelErrorAction {
    fn default() -> Self {
        Self::Stop
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelStep {
    pub branches: Vec<ParallelBranch>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub on_error: ParallelErrorAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryStep {
    pub r#try: Vec<Step>,
    #[serde(default)]
    pub catch: Option<Vec<Step>>,
    #[serde(default)]
    pub r#finally: Option<Vec<Step>>,
}

/// The step sum type. One constructor per variant from spec §3 — the
/// Rust-native replacement for the source's runtime type-tag dispatch
/// (spec §9 "Source-side dynamic dispatch on step type").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Action(ActionStep),
    SubWorkflow(SubWorkflowStep),
    Script(ScriptStep),
    If(IfStep),
    Switch(SwitchStep),
    ForEach(ForEachStep),
    While(WhileStep),
    Map(MapStep),
    Filter(FilterStep),
    Reduce(ReduceStep),
    Parallel(ParallelStep),
    Try(TryStep),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub common: StepCommon,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    pub fn id(&self) -> &str {
        &self.common.id
    }
}

/// The immutable workflow model, the sole input a `Runner` operates on.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Workflow {
    pub metadata: WorkflowMetadata,
    #[serde(default)]
    pub tools: HashMap<String, ToolConfig>,
    #[serde(default)]
    pub inputs: HashMap<String, InputDeclaration>,
    #[serde(default)]
    pub triggers: Option<Value>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub permissions: Option<Permissions>,
    #[serde(default)]
    pub default_agent: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    /// Path this workflow was loaded from, used to resolve relative
    /// `SubWorkflow.workflow` paths. `None` for in-memory / test workflows.
    #[serde(default, skip_serializing)]
    pub source_path: Option<String>,
}

impl Workflow {
    /// Validates the step-id-uniqueness invariant from spec §3.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id().to_string()) {
                return Err(format!("duplicate step id: {}", step.id()));
            }
        }
        Ok(())
    }
}

//! ABOUTME: Core data model, error types, and collaborator traits for the flowmark workflow engine
//! ABOUTME: Foundation layer consumed by flowmark-engine; contains no execution logic itself

pub mod collaborators;
pub mod context;
pub mod error;
pub mod model;

pub use collaborators::{
    EventSink, ExecutionRecord, ExecutorContext, LoadedPrompt, Parser, ParsedWorkflow,
    PromptLoader, RollbackRegistry, ScriptOutcome, ScriptSandbox, StateStore, StepExecutor,
    TemplateRenderer, ToolHandle, ToolRegistry,
};
pub use context::{
    ExecutionContext, StepMetadataEntry, StepResult, StepStatus, WorkflowResult, WorkflowStatus,
};
pub use error::{EngineError, Result};
pub use model::{
    ActionStep, ErrorAction, ErrorHandling, FilterStep, ForEachStep, IfStep, InputDeclaration,
    MapStep, ParallelBranch, ParallelErrorAction, ParallelStep, Permissions, ReduceStep,
    ScriptStep, Step, StepCommon, StepKind, SubWorkflowStep, SubagentConfig, SwitchStep,
    ToolConfig, TryStep, WhileStep, Workflow, WorkflowMetadata,
};

// ABOUTME: ExecutionContext, StepResult, and WorkflowResult — the mutable and terminal
// ABOUTME: state a single workflow run produces, per spec §3

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Terminal (and in-flight) status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Overall workflow run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Metadata recorded for a step on every terminal outcome, per invariant 2 in
/// spec §3: written unconditionally, with a lowercased status, so that later
/// `conditions` can test `step_id.status == 'failed'`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetadataEntry {
    pub status: String,
    pub retry_count: u32,
    #[serde(default)]
    pub error: Option<String>,
}

/// The mutable environment carried through a single workflow run. Owned
/// exclusively by the `Runner` for the duration of the run (spec §3).
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub run_id: String,
    pub inputs: HashMap<String, Value>,
    pub variables: HashMap<String, Value>,
    pub step_metadata: HashMap<String, StepMetadataEntry>,
    pub workflow_outputs: Option<Value>,
    pub current_step_index: usize,
    pub status: WorkflowStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl ExecutionContext {
    pub fn new(workflow_id: String, run_id: String, inputs: HashMap<String, Value>) -> Self {
        Self {
            workflow_id,
            run_id,
            inputs,
            variables: HashMap::new(),
            step_metadata: HashMap::new(),
            workflow_outputs: None,
            current_step_index: 0,
            status: WorkflowStatus::Running,
            started_at: chrono::Utc::now(),
        }
    }

    /// Clone used to hand a `Parallel` branch its own isolated copy (spec §3
    /// "for parallel branches, the Runner clones the context, hands each
    /// branch its own copy").
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Merge a completed branch's variables back under `<branch_id>.<name>`
    /// (spec §3, §4.5 Parallel, §8 P8).
    pub fn merge_branch(&mut self, branch_id: &str, branch_ctx: &ExecutionContext) {
        for (name, value) in &branch_ctx.variables {
            self.variables
                .insert(format!("{branch_id}.{name}"), value.clone());
        }
    }

    pub fn record_step_metadata(
        &mut self,
        step_id: &str,
        status: StepStatus,
        retry_count: u32,
        error: Option<String>,
    ) {
        self.step_metadata.insert(
            step_id.to_string(),
            StepMetadataEntry {
                status: status.as_str().to_string(),
                retry_count,
                error,
            },
        );
    }
}

/// Result of one step's execution, regardless of variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
    pub duration_ms: i64,
    pub retry_count: u32,
}

/// Result of one full workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub run_id: String,
    pub status: WorkflowStatus,
    pub step_results: Vec<StepResult>,
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
    pub duration_ms: i64,
}

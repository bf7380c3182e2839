// ABOUTME: Integration tests for ForEach/While loop bodies, loop-variable scoping, and
// ABOUTME: the layered errorHandling applied over per-iteration failures

use flowmark_core::{
    ActionStep, ErrorAction, ErrorHandling, ForEachStep, Step, StepCommon, StepKind, WhileStep,
    Workflow, WorkflowMetadata, WorkflowStatus,
};
use flowmark_engine::collaborators_bundle::EngineCollaborators;
use flowmark_engine::config::EngineConfig;
use flowmark_engine::runner::Engine;
use flowmark_engine::test_utils::{MockToolRegistry, NoopSandbox, ScriptedExecutor};
use std::collections::HashMap;
use std::sync::Arc;

fn action_step(id: &str, action: &str, output_variable: Option<&str>) -> Step {
    Step {
        common: StepCommon {
            id: id.to_string(),
            output_variable: output_variable.map(String::from),
            ..Default::default()
        },
        kind: StepKind::Action(ActionStep {
            action: action.to_string(),
            inputs: serde_json::json!({}),
            error_handling: None,
            prompt: None,
            prompt_inputs: None,
        }),
    }
}

fn workflow(steps: Vec<Step>) -> Workflow {
    Workflow {
        metadata: WorkflowMetadata {
            id: "wf-loop".into(),
            name: "test".into(),
            version: "1.0".into(),
            ..Default::default()
        },
        steps,
        ..Default::default()
    }
}

fn engine() -> Engine {
    Engine::new(
        EngineConfig::default(),
        EngineCollaborators {
            script_sandbox: Arc::new(NoopSandbox),
            template_renderer: None,
            parser: None,
            prompt_loader: None,
            rollback_registry: None,
        },
        None,
        None,
    )
}

#[tokio::test]
async fn for_each_iterates_over_every_item_and_returns_them() {
    let executor = ScriptedExecutor::new().on("tool.visit", Ok(serde_json::json!("visited")));
    let for_each = Step {
        common: StepCommon {
            id: "loop".into(),
            ..Default::default()
        },
        kind: StepKind::ForEach(ForEachStep {
            items: "inputs.items".to_string(),
            item_variable: "item".to_string(),
            index_variable: Some("idx".to_string()),
            steps: vec![action_step("visit", "tool.visit", Some("out"))],
            error_handling: None,
        }),
    };
    let wf = workflow(vec![for_each]);
    let mut inputs = HashMap::new();
    inputs.insert("items".to_string(), serde_json::json!(["a", "b", "c"]));

    let result = engine()
        .execute(&wf, inputs, &MockToolRegistry, &executor)
        .await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(executor.call_count("tool.visit"), 3);
    assert_eq!(
        result.step_results[0].output,
        serde_json::json!(["a", "b", "c"])
    );
}

#[tokio::test]
async fn for_each_rejects_non_array_items() {
    let executor = ScriptedExecutor::new();
    let for_each = Step {
        common: StepCommon {
            id: "loop".into(),
            ..Default::default()
        },
        kind: StepKind::ForEach(ForEachStep {
            items: "inputs.items".to_string(),
            item_variable: "item".to_string(),
            index_variable: None,
            steps: vec![action_step("visit", "tool.visit", None)],
            error_handling: None,
        }),
    };
    let wf = workflow(vec![for_each]);
    let mut inputs = HashMap::new();
    inputs.insert("items".to_string(), serde_json::json!("not-an-array"));

    let result = engine()
        .execute(&wf, inputs, &MockToolRegistry, &executor)
        .await;

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert!(result.error.unwrap().contains("Items must be an array"));
}

#[tokio::test]
async fn for_each_continue_handling_keeps_running_after_iteration_failure() {
    let executor = ScriptedExecutor::new().on("tool.visit", Err("nope".to_string()));
    let for_each = Step {
        common: StepCommon {
            id: "loop".into(),
            ..Default::default()
        },
        kind: StepKind::ForEach(ForEachStep {
            items: "inputs.items".to_string(),
            item_variable: "item".to_string(),
            index_variable: None,
            steps: vec![action_step("visit", "tool.visit", None)],
            error_handling: Some(ErrorHandling {
                action: ErrorAction::Continue,
                max_retries: Some(0),
                retry_delay_seconds: None,
                fallback_action: None,
            }),
        }),
    };
    let wf = workflow(vec![for_each]);
    let mut inputs = HashMap::new();
    inputs.insert("items".to_string(), serde_json::json!([1, 2]));

    let result = engine()
        .execute(&wf, inputs, &MockToolRegistry, &executor)
        .await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(executor.call_count("tool.visit"), 2);
}

#[tokio::test]
async fn for_each_stop_handling_aborts_on_first_iteration_failure() {
    let executor = ScriptedExecutor::new().on("tool.visit", Err("nope".to_string()));
    let for_each = Step {
        common: StepCommon {
            id: "loop".into(),
            ..Default::default()
        },
        kind: StepKind::ForEach(ForEachStep {
            items: "inputs.items".to_string(),
            item_variable: "item".to_string(),
            index_variable: None,
            steps: vec![action_step("visit", "tool.visit", None)],
            error_handling: Some(ErrorHandling {
                action: ErrorAction::Stop,
                max_retries: Some(0),
                retry_delay_seconds: None,
                fallback_action: None,
            }),
        }),
    };
    let wf = workflow(vec![for_each]);
    let mut inputs = HashMap::new();
    inputs.insert("items".to_string(), serde_json::json!([1, 2, 3]));

    let result = engine()
        .execute(&wf, inputs, &MockToolRegistry, &executor)
        .await;

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(executor.call_count("tool.visit"), 1);
}

#[tokio::test]
async fn while_loop_runs_until_condition_flips_false() {
    let executor = ScriptedExecutor::new().on("tool.bump", Ok(serde_json::json!("bumped")));
    let while_step = Step {
        common: StepCommon {
            id: "loop".into(),
            ..Default::default()
        },
        kind: StepKind::While(WhileStep {
            condition: "inputs.keepGoing == true".to_string(),
            max_iterations: 5,
            steps: vec![action_step("bump", "tool.bump", None)],
            error_handling: None,
        }),
    };
    let wf = workflow(vec![while_step]);
    let mut inputs = HashMap::new();
    inputs.insert("keepGoing".to_string(), serde_json::json!(false));

    let result = engine()
        .execute(&wf, inputs, &MockToolRegistry, &executor)
        .await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(executor.call_count("tool.bump"), 0);
    assert_eq!(
        result.step_results[0].output,
        serde_json::json!({"iterations": 0})
    );
}

#[tokio::test]
async fn while_loop_fails_when_max_iterations_exceeded() {
    let executor = ScriptedExecutor::new().on("tool.bump", Ok(serde_json::json!("bumped")));
    let while_step = Step {
        common: StepCommon {
            id: "loop".into(),
            ..Default::default()
        },
        kind: StepKind::While(WhileStep {
            condition: "inputs.keepGoing == true".to_string(),
            max_iterations: 3,
            steps: vec![action_step("bump", "tool.bump", None)],
            error_handling: None,
        }),
    };
    let wf = workflow(vec![while_step]);
    let mut inputs = HashMap::new();
    inputs.insert("keepGoing".to_string(), serde_json::json!(true));

    let result = engine()
        .execute(&wf, inputs, &MockToolRegistry, &executor)
        .await;

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert!(result.error.unwrap().contains("Max iterations (3) exceeded"));
}

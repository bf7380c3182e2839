// ABOUTME: Integration tests for Parallel branch execution, variable merge-back, and
// ABOUTME: the onError Stop/Continue convention over per-branch failures

use flowmark_core::{
    ActionStep, ErrorHandling, ErrorAction, ParallelBranch, ParallelErrorAction, ParallelStep,
    Step, StepCommon, StepKind, Workflow, WorkflowMetadata, WorkflowStatus,
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
            id: "wf-parallel".into(),
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
async fn parallel_branches_run_and_outputs_are_collected_per_branch() {
    let executor = ScriptedExecutor::new()
        .on("tool.left", Ok(serde_json::json!("L")))
        .on("tool.right", Ok(serde_json::json!("R")));

    let parallel_step = Step {
        common: StepCommon {
            id: "par".into(),
            ..Default::default()
        },
        kind: StepKind::Parallel(ParallelStep {
            branches: vec![
                ParallelBranch {
                    id: "a".into(),
                    steps: vec![action_step("left", "tool.left", Some("out"))],
                },
                ParallelBranch {
                    id: "b".into(),
                    steps: vec![action_step("right", "tool.right", Some("out"))],
                },
            ],
            max_concurrent: None,
            on_error: ParallelErrorAction::Stop,
        }),
    };
    let wf = workflow(vec![parallel_step]);

    let result = engine()
        .execute(&wf, HashMap::new(), &MockToolRegistry, &executor)
        .await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    let outputs = result.step_results[0].output.as_array().unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(executor.call_count("tool.left"), 1);
    assert_eq!(executor.call_count("tool.right"), 1);
}

#[tokio::test]
async fn parallel_on_error_stop_fails_workflow_when_a_branch_fails() {
    let executor = ScriptedExecutor::new()
        .on("tool.left", Ok(serde_json::json!("L")))
        .on("tool.right", Err("branch blew up".to_string()));

    let parallel_step = Step {
        common: StepCommon {
            id: "par".into(),
            ..Default::default()
        },
        kind: StepKind::Parallel(ParallelStep {
            branches: vec![
                ParallelBranch {
                    id: "a".into(),
                    steps: vec![action_step("left", "tool.left", Some("out"))],
                },
                ParallelBranch {
                    id: "b".into(),
                    steps: vec![action_step("right", "tool.right", Some("out"))],
                },
            ],
            max_concurrent: None,
            on_error: ParallelErrorAction::Stop,
        }),
    };
    let wf = workflow(vec![parallel_step]);

    let result = engine()
        .execute(&wf, HashMap::new(), &MockToolRegistry, &executor)
        .await;

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert!(result.error.unwrap().contains("branch blew up"));
}

#[tokio::test]
async fn parallel_on_error_continue_completes_despite_a_branch_failure() {
    let executor = ScriptedExecutor::new()
        .on("tool.left", Ok(serde_json::json!("L")))
        .on("tool.right", Err("branch blew up".to_string()));

    let mut failing_right = action_step("right", "tool.right", Some("out"));
    if let StepKind::Action(action) = &mut failing_right.kind {
        action.error_handling = Some(ErrorHandling {
            action: ErrorAction::Stop,
            max_retries: Some(0),
            retry_delay_seconds: None,
            fallback_action: None,
        });
    }

    let parallel_step = Step {
        common: StepCommon {
            id: "par".into(),
            ..Default::default()
        },
        kind: StepKind::Parallel(ParallelStep {
            branches: vec![
                ParallelBranch {
                    id: "a".into(),
                    steps: vec![action_step("left", "tool.left", Some("out"))],
                },
                ParallelBranch {
                    id: "b".into(),
                    steps: vec![failing_right],
                },
            ],
            max_concurrent: None,
            on_error: ParallelErrorAction::Continue,
        }),
    };
    let wf = workflow(vec![parallel_step]);

    let result = engine()
        .execute(&wf, HashMap::new(), &MockToolRegistry, &executor)
        .await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    let outputs = result.step_results[0].output.as_array().unwrap();
    assert_eq!(outputs.len(), 2);
}

#[tokio::test]
async fn parallel_merges_branch_variables_with_branch_id_prefix() {
    let executor = ScriptedExecutor::new().on("tool.left", Ok(serde_json::json!("L-value")));

    let parallel_step = Step {
        common: StepCommon {
            id: "par".into(),
            ..Default::default()
        },
        kind: StepKind::Parallel(ParallelStep {
            branches: vec![ParallelBranch {
                id: "branchA".into(),
                steps: vec![action_step("left", "tool.left", Some("result"))],
            }],
            max_concurrent: Some(1),
            on_error: ParallelErrorAction::Stop,
        }),
    };
    let after = action_step("after", "tool.after", Some("captured"));
    let wf = workflow(vec![parallel_step, after]);

    let executor = executor.on("tool.after", Ok(serde_json::json!("done")));

    let result = engine()
        .execute(&wf, HashMap::new(), &MockToolRegistry, &executor)
        .await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.step_results.len(), 2);
}

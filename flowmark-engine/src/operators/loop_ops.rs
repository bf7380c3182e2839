// ABOUTME: ForEach / While — bind loop variables via LoopScope, run the body through
// ABOUTME: execute_sequence, and layer the loop's own errorHandling over child failures

use crate::condition;
use crate::dispatcher::{Dispatcher, StepOutcome};
use crate::env::{Environment, LoopScope};
use flowmark_core::{ErrorAction, ExecutionContext, ForEachStep, WhileStep};
use serde_json::Value;

impl<'a> Dispatcher<'a> {
    pub(crate) async fn execute_for_each(
        &self,
        for_each: &ForEachStep,
        ctx: &mut ExecutionContext,
    ) -> StepOutcome {
        let items = match Environment::new(ctx).get(&for_each.items) {
            Some(Value::Array(items)) => items,
            _ => return StepOutcome::failed("Items must be an array"),
        };

        let handling = for_each.error_handling.clone().unwrap_or_default();

        for (index, item) in items.iter().enumerate() {
            let mut bindings = vec![(for_each.item_variable.clone(), item.clone())];
            if let Some(index_var) = &for_each.index_variable {
                bindings.push((index_var.clone(), Value::from(index)));
            }
            bindings.push((
                "loop".to_string(),
                serde_json::json!({
                    "index": index,
                    "first": index == 0,
                    "last": index == items.len() - 1,
                    "length": items.len(),
                }),
            ));
            let scope = LoopScope::enter(ctx, bindings);
            let result = self.execute_sequence(&for_each.steps, ctx).await;
            scope.exit(ctx);

            if let Err((_, error)) = result {
                match handling.action {
                    ErrorAction::Continue => continue,
                    ErrorAction::Rollback => {
                        self.rollback(ctx).await;
                        return StepOutcome::failed(error);
                    }
                    ErrorAction::Stop => return StepOutcome::failed(error),
                }
            }
        }

        StepOutcome::completed(Value::Array(items))
    }

    pub(crate) async fn execute_while(
        &self,
        while_step: &WhileStep,
        ctx: &mut ExecutionContext,
    ) -> StepOutcome {
        let renderer = self.collaborators.template_renderer.as_deref();
        let handling = while_step.error_handling.clone().unwrap_or_default();
        let mut iterations = 0u32;

        loop {
            if !condition::evaluate(&while_step.condition, ctx, renderer) {
                break;
            }
            if iterations >= while_step.max_iterations {
                return StepOutcome::failed(format!(
                    "Max iterations ({}) exceeded",
                    while_step.max_iterations
                ));
            }

            if let Err((_, error)) = self.execute_sequence(&while_step.steps, ctx).await {
                match handling.action {
                    ErrorAction::Continue => {}
                    ErrorAction::Rollback => {
                        self.rollback(ctx).await;
                        return StepOutcome::failed(error);
                    }
                    ErrorAction::Stop => return StepOutcome::failed(error),
                }
            }

            iterations += 1;
        }

        StepOutcome::completed(serde_json::json!({ "iterations": iterations }))
    }
}

// ABOUTME: Map / Filter / Reduce — pure, synchronous list transforms over a resolved items array
// ABOUTME: Each binds its loop variable(s) through LoopScope before evaluating its expression

use crate::condition;
use crate::dispatcher::{Dispatcher, StepOutcome};
use crate::env::{Environment, LoopScope};
use crate::template;
use flowmark_core::{ExecutionContext, FilterStep, MapStep, ReduceStep};
use serde_json::Value;

impl<'a> Dispatcher<'a> {
    pub(crate) fn execute_map(&self, map_step: &MapStep, ctx: &mut ExecutionContext) -> StepOutcome {
        let items = match Environment::new(ctx).get(&map_step.items) {
            Some(Value::Array(items)) => items,
            _ => return StepOutcome::failed("Items must be an array"),
        };
        let renderer = self.collaborators.template_renderer.as_deref();

        let mut mapped = Vec::with_capacity(items.len());
        for item in &items {
            let scope = LoopScope::enter(ctx, vec![(map_step.item_variable.clone(), item.clone())]);
            let value = template::render(
                &Value::String(format!("{{{{ {} }}}}", map_step.expression)),
                ctx,
                renderer,
            );
            scope.exit(ctx);
            mapped.push(value);
        }

        StepOutcome::completed(Value::Array(mapped))
    }

    pub(crate) fn execute_filter(&self, filter_step: &FilterStep, ctx: &mut ExecutionContext) -> StepOutcome {
        let items = match Environment::new(ctx).get(&filter_step.items) {
            Some(Value::Array(items)) => items,
            _ => return StepOutcome::failed("Items must be an array"),
        };
        let renderer = self.collaborators.template_renderer.as_deref();

        let mut kept = Vec::new();
        for item in &items {
            let scope = LoopScope::enter(ctx, vec![(filter_step.item_variable.clone(), item.clone())]);
            let passes = condition::evaluate(&filter_step.condition, ctx, renderer);
            scope.exit(ctx);
            if passes {
                kept.push(item.clone());
            }
        }

        StepOutcome::completed(Value::Array(kept))
    }

    pub(crate) fn execute_reduce(&self, reduce_step: &ReduceStep, ctx: &mut ExecutionContext) -> StepOutcome {
        let items = match Environment::new(ctx).get(&reduce_step.items) {
            Some(Value::Array(items)) => items,
            _ => return StepOutcome::failed("Items must be an array"),
        };
        let renderer = self.collaborators.template_renderer.as_deref();

        let mut accumulator = reduce_step.initial_value.clone().unwrap_or(Value::Null);
        for item in &items {
            let scope = LoopScope::enter(
                ctx,
                vec![
                    (reduce_step.item_variable.clone(), item.clone()),
                    (reduce_step.accumulator_variable.clone(), accumulator.clone()),
                ],
            );
            accumulator = template::render(
                &Value::String(format!("{{{{ {} }}}}", reduce_step.expression)),
                ctx,
                renderer,
            );
            scope.exit(ctx);
        }

        StepOutcome::completed(accumulator)
    }
}

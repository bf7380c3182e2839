// ABOUTME: If / Switch / Try — branch dispatch over `execute_sequence`, sharing the If/Switch
// ABOUTME: output convention (list of outputs from children that set an outputVariable)

use crate::condition;
use crate::dispatcher::{collect_list_output, Dispatcher, StepOutcome};
use crate::env::LoopScope;
use crate::template;
use flowmark_core::{ExecutionContext, IfStep, Step, StepStatus, SwitchStep, TryStep};
use serde_json::Value;

impl<'a> Dispatcher<'a> {
    pub(crate) async fn execute_if(&self, if_step: &IfStep, ctx: &mut ExecutionContext) -> StepOutcome {
        let renderer = self.collaborators.template_renderer.as_deref();
        let branch: &[Step] = if condition::evaluate(&if_step.condition, ctx, renderer) {
            &if_step.then
        } else {
            &if_step.r#else
        };

        match self.execute_sequence(branch, ctx).await {
            Ok(outcomes) => StepOutcome::completed(collect_list_output(branch, &outcomes)),
            Err((outcomes, error)) => {
                let mut outcome = StepOutcome::failed(error);
                outcome.output = collect_list_output(branch, &outcomes);
                outcome
            }
        }
    }

    pub(crate) async fn execute_switch(
        &self,
        switch_step: &SwitchStep,
        ctx: &mut ExecutionContext,
    ) -> StepOutcome {
        let renderer = self.collaborators.template_renderer.as_deref();
        let resolved = template::render(
            &Value::String(format!("{{{{ {} }}}}", switch_step.expression)),
            ctx,
            renderer,
        );
        let key = template::stringify(Some(&resolved));

        let branch: &[Step] = match switch_step.cases.get(&key) {
            Some(steps) => steps,
            None => match &switch_step.default {
                Some(steps) => steps,
                None => return StepOutcome::completed(Value::Array(Vec::new())),
            },
        };

        match self.execute_sequence(branch, ctx).await {
            Ok(outcomes) => StepOutcome::completed(collect_list_output(branch, &outcomes)),
            Err((outcomes, error)) => {
                let mut outcome = StepOutcome::failed(error);
                outcome.output = collect_list_output(branch, &outcomes);
                outcome
            }
        }
    }

    pub(crate) async fn execute_try(&self, try_step: &TryStep, ctx: &mut ExecutionContext) -> StepOutcome {
        let outcome = match self.execute_sequence(&try_step.r#try, ctx).await {
            Ok(outcomes) => StepOutcome::completed(collect_list_output(&try_step.r#try, &outcomes)),
            Err((try_outcomes, error)) => match &try_step.catch {
                Some(catch_steps) => {
                    let failing_step = try_step
                        .r#try
                        .iter()
                        .zip(try_outcomes.iter())
                        .find(|(_, outcome)| outcome.status == StepStatus::Failed)
                        .map(|(step, _)| step.id().to_string())
                        .unwrap_or_default();
                    let scope = LoopScope::enter(
                        ctx,
                        vec![(
                            "error".to_string(),
                            serde_json::json!({"message": error, "step": failing_step}),
                        )],
                    );
                    let outcome = match self.execute_sequence(catch_steps, ctx).await {
                        Ok(outcomes) => StepOutcome::completed(collect_list_output(catch_steps, &outcomes)),
                        Err((outcomes, catch_error)) => {
                            let mut outcome = StepOutcome::failed(catch_error);
                            outcome.output = collect_list_output(catch_steps, &outcomes);
                            outcome
                        }
                    };
                    scope.exit(ctx);
                    outcome
                }
                None => StepOutcome::failed(error),
            },
        };

        if let Some(finally_steps) = &try_step.r#finally {
            if let Err((_, finally_error)) = self.execute_sequence(finally_steps, ctx).await {
                return StepOutcome::failed(format!("finally block failed: {finally_error}"));
            }
        }

        outcome
    }
}

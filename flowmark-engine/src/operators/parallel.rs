// ABOUTME: Parallel — forks the context per branch, runs branches concurrently up to
// ABOUTME: maxConcurrent, then merges each branch's variables back under `<branchId>.<name>`

use crate::dispatcher::{collect_list_output, Dispatcher, StepOutcome};
use flowmark_core::{ExecutionContext, ParallelErrorAction, ParallelStep};
use futures::stream::{self, StreamExt};
use serde_json::Value;

impl<'a> Dispatcher<'a> {
    pub(crate) async fn execute_parallel(
        &self,
        parallel: &ParallelStep,
        ctx: &mut ExecutionContext,
    ) -> StepOutcome {
        let concurrency = parallel
            .max_concurrent
            .filter(|&n| n > 0)
            .unwrap_or_else(|| parallel.branches.len().max(1));

        let ctx_snapshot: &ExecutionContext = ctx;
        let results = stream::iter(parallel.branches.iter())
            .map(|branch| async move {
                let mut branch_ctx = ctx_snapshot.fork();
                let result = self.execute_sequence(&branch.steps, &mut branch_ctx).await;
                (branch.id.clone(), &branch.steps, branch_ctx, result)
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut branch_outputs = Vec::with_capacity(results.len());
        let mut first_failure: Option<String> = None;
        for (branch_id, steps, branch_ctx, result) in results {
            ctx.merge_branch(&branch_id, &branch_ctx);
            match result {
                Ok(outcomes) => branch_outputs.push(collect_list_output(steps, &outcomes)),
                Err((outcomes, error)) => {
                    branch_outputs.push(collect_list_output(steps, &outcomes));
                    if first_failure.is_none() {
                        first_failure = Some(error);
                    }
                }
            }
        }

        if let Some(error) = first_failure {
            if matches!(parallel.on_error, ParallelErrorAction::Stop) {
                let mut outcome = StepOutcome::failed(error);
                outcome.output = Value::Array(branch_outputs);
                return outcome;
            }
        }

        StepOutcome::completed(Value::Array(branch_outputs))
    }
}

// ABOUTME: Retry + Circuit-Breaker + Timeout pipeline (C4) wrapping one leaf-step invocation
// ABOUTME: Failover substitution lives in failover.rs and is layered on top by the dispatcher

use crate::circuit_breaker::CircuitBreaker;
use crate::retry::{backoff_delay, RetryConfig};
use flowmark_core::StepStatus;
use futures::future::BoxFuture;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// One attempt of a leaf invocation, boxed so the dispatcher can build it
/// from whichever collaborator (StepExecutor, ScriptSandbox, sub-engine)
/// actually performs the effect, without this module knowing which. Carries
/// an explicit lifetime so it can borrow the dispatcher's collaborators
/// instead of needing to clone everything into an owned, `'static` closure.
pub type AttemptFn<'f> = dyn Fn(u32) -> BoxFuture<'f, anyhow::Result<Value>> + Send + Sync + 'f;

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub status: StepStatus,
    pub output: Value,
    pub error: Option<String>,
    pub retry_count: u32,
}

/// Runs `attempt_fn` under the retry loop described in spec §4.4: a
/// per-service circuit-breaker gate, a deadline per attempt, and
/// exponential-with-jitter backoff between attempts. `service` is only used
/// for the breaker rejection message; `breaker` being `None` means the
/// invocation (e.g. a `Script` step) isn't breaker-gated.
pub async fn execute_with_retry<'f>(
    service: &str,
    config: &RetryConfig,
    breaker: Option<&CircuitBreaker>,
    timeout: Duration,
    attempt_fn: &AttemptFn<'f>,
) -> PipelineOutcome {
    for attempt in 0..=config.max_retries {
        if let Some(breaker) = breaker {
            if !breaker.can_execute() {
                let message = format!("Circuit breaker open for service: {service}");
                warn!(service, "circuit breaker rejected call");
                return PipelineOutcome {
                    status: StepStatus::Failed,
                    output: Value::Null,
                    error: Some(message),
                    retry_count: 0,
                };
            }
        }

        debug!(service, attempt, "invoking leaf step");
        let result = tokio::time::timeout(timeout, attempt_fn(attempt)).await;

        let error_message = match result {
            Ok(Ok(value)) => {
                if let Some(breaker) = breaker {
                    breaker.record_success();
                }
                return PipelineOutcome {
                    status: StepStatus::Completed,
                    output: value,
                    error: None,
                    retry_count: attempt,
                };
            }
            Ok(Err(e)) => e.to_string(),
            Err(_elapsed) => format!("Step timed out after {}ms", timeout.as_millis()),
        };

        if let Some(breaker) = breaker {
            breaker.record_failure();
        }

        if attempt < config.max_retries {
            let delay = backoff_delay(attempt, config);
            debug!(service, attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
            tokio::time::sleep(delay).await;
        } else {
            return PipelineOutcome {
                status: StepStatus::Failed,
                output: Value::Null,
                error: Some(error_message),
                retry_count: attempt,
            };
        }
    }
    unreachable!("loop always returns by the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{BreakerConfig, CircuitBreaker};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_after_n_failures_with_exact_retry_count() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let attempt_fn: Box<AttemptFn<'static>> = Box::new(move |_attempt| {
            let calls = calls2.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    anyhow::bail!("boom")
                } else {
                    Ok(Value::String("ok".into()))
                }
            })
        });

        let config = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
            jitter: 0.0,
        };
        let outcome =
            execute_with_retry("svc", &config, None, Duration::from_secs(1), &*attempt_fn).await;
        assert_eq!(outcome.status, StepStatus::Completed);
        assert_eq!(outcome.retry_count, 2);
    }

    #[tokio::test]
    async fn exhausts_retries_and_reports_failed() {
        let attempt_fn: Box<AttemptFn<'static>> =
            Box::new(|_attempt| Box::pin(async move { anyhow::bail!("always fails") }));
        let config = RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            exponential_base: 2.0,
            jitter: 0.0,
        };
        let outcome =
            execute_with_retry("svc", &config, None, Duration::from_secs(1), &*attempt_fn).await;
        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(outcome.retry_count, 2);
        assert!(outcome.error.unwrap().contains("always fails"));
    }

    #[tokio::test]
    async fn breaker_rejects_synchronously_without_invoking_executor() {
        let breaker = CircuitBreaker::new(
            "svc".into(),
            BreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        );
        breaker.record_failure();
        assert_eq!(breaker.state(), crate::circuit_breaker::BreakerState::Open);

        let invoked = Arc::new(AtomicU32::new(0));
        let invoked2 = invoked.clone();
        let attempt_fn: Box<AttemptFn<'static>> = Box::new(move |_attempt| {
            invoked2.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(Value::String("should not run".into())) })
        });
        let config = RetryConfig::default();
        let outcome =
            execute_with_retry("svc", &config, Some(&breaker), Duration::from_secs(1), &*attempt_fn)
                .await;
        assert_eq!(outcome.status, StepStatus::Failed);
        assert!(outcome
            .error
            .unwrap()
            .contains("Circuit breaker open for service: svc"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_error_message_contains_timed_out() {
        let attempt_fn: Box<AttemptFn<'static>> = Box::new(|_attempt| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Value::Null)
            })
        });
        let mut config = RetryConfig::default();
        config.max_retries = 0;
        let outcome =
            execute_with_retry("svc", &config, None, Duration::from_millis(5), &*attempt_fn).await;
        assert_eq!(outcome.status, StepStatus::Failed);
        assert!(outcome.error.unwrap().contains("timed out"));
    }
}

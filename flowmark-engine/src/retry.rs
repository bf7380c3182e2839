// ABOUTME: Exponential backoff with jitter for the retry loop (C4), per spec §4.4
// ABOUTME: Grounded on llmspell-hooks::builtin::retry's BackoffStrategy/JitterStrategy shape

use rand::Rng;
use std::time::Duration;

/// Step-then-engine-then-default precedence parameters for one leaf
/// invocation's retry loop.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: 0.1,
        }
    }
}

/// `min(baseDelay * exponentialBase^attempt, maxDelay)` perturbed by uniform
/// jitter in `[-jitter, +jitter]` of the clamped delay, itself clamped to
/// non-negative (spec §4.4 "Retry loop").
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exp = config.exponential_base.powi(attempt as i32);
    let raw_ms = config.base_delay.as_secs_f64() * exp * 1000.0;
    let clamped_ms = raw_ms.min(config.max_delay.as_secs_f64() * 1000.0);

    let jitter_fraction = if config.jitter > 0.0 {
        rand::thread_rng().gen_range(-config.jitter..=config.jitter)
    } else {
        0.0
    };
    let jittered_ms = (clamped_ms * (1.0 + jitter_fraction)).max(0.0);
    Duration::from_secs_f64(jittered_ms / 1000.0)
}

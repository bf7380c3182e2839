// ABOUTME: EngineConfig — step-then-engine-then-default precedence parameters, per spec §6
// ABOUTME: Constructed by the embedder; this crate never reads a workflow file itself

use crate::circuit_breaker::BreakerConfig;
use crate::failover::FailoverConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: f64,
    pub breaker: BreakerConfig,
    pub failover: FailoverConfig,
    pub default_agent: Option<String>,
    pub default_model: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: 0.1,
            breaker: BreakerConfig::default(),
            failover: FailoverConfig::default(),
            default_agent: None,
            default_model: None,
        }
    }
}

impl EngineConfig {
    pub fn retry_config(&self) -> crate::retry::RetryConfig {
        crate::retry::RetryConfig {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            exponential_base: self.exponential_base,
            jitter: self.jitter,
        }
    }
}

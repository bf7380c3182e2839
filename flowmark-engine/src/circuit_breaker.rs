// ABOUTME: Per-service circuit breaker (closed/open/half-open) for the retry pipeline (C4)
// ABOUTME: Grounded on llmspell-hooks::circuit_breaker, narrowed to a pure failure-count breaker

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

struct BreakerStats {
    failures: AtomicU32,
    half_open_calls: AtomicU32,
    last_failure_time: RwLock<Option<Instant>>,
    state_changed_at: RwLock<Instant>,
}

impl Default for BreakerStats {
    fn default() -> Self {
        Self {
            failures: AtomicU32::new(0),
            half_open_calls: AtomicU32::new(0),
            last_failure_time: RwLock::new(None),
            state_changed_at: RwLock::new(Instant::now()),
        }
    }
}

/// A single service's breaker. `state` transitions are guarded by
/// `parking_lot::RwLock` so concurrent `Parallel` branches can share one
/// instance safely (spec §5 "breaker transitions are atomic").
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    state: RwLock<BreakerState>,
    stats: BreakerStats,
}

impl CircuitBreaker {
    pub fn new(service: String, config: BreakerConfig) -> Self {
        Self {
            service,
            config,
            state: RwLock::new(BreakerState::Closed),
            stats: BreakerStats::default(),
        }
    }

    pub fn state(&self) -> BreakerState {
        *self.state.read()
    }

    pub fn failure_count(&self) -> u32 {
        self.stats.failures.load(Ordering::Relaxed)
    }

    fn transition_to(&self, new_state: BreakerState) {
        let mut state = self.state.write();
        if *state != new_state {
            info!(service = %self.service, from = ?*state, to = ?new_state, "circuit breaker state transition");
            *state = new_state;
            *self.stats.state_changed_at.write() = Instant::now();
            if new_state == BreakerState::HalfOpen {
                self.stats.half_open_calls.store(0, Ordering::Relaxed);
            }
            if new_state == BreakerState::Closed {
                self.stats.failures.store(0, Ordering::Relaxed);
            }
        }
    }

    /// `true` if a call is currently admitted. `Open` transitions itself to
    /// `HalfOpen` once `recovery_timeout` has elapsed since the last failure
    /// (spec §4.4 "after recoveryTimeout since last failure, transition").
    pub fn can_execute(&self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let changed_at = *self.stats.state_changed_at.read();
                if changed_at.elapsed() >= self.config.recovery_timeout {
                    self.transition_to(BreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                let calls = self.stats.half_open_calls.fetch_add(1, Ordering::SeqCst);
                calls < self.config.half_open_max_calls
            }
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            BreakerState::Closed => {
                self.stats.failures.store(0, Ordering::Relaxed);
            }
            BreakerState::HalfOpen => {
                self.transition_to(BreakerState::Closed);
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        *self.stats.last_failure_time.write() = Some(Instant::now());
        match self.state() {
            BreakerState::Closed => {
                let failures = self.stats.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to(BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                self.transition_to(BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    pub fn reset(&self) {
        self.stats.failures.store(0, Ordering::Relaxed);
        self.stats.half_open_calls.store(0, Ordering::Relaxed);
        self.transition_to(BreakerState::Closed);
    }
}

/// Engine-instance-scoped registry of breakers keyed by service (the first
/// `.`-segment of an action string). Lazily created on first use, never a
/// process-wide singleton (spec §9 "Global-ish engine state").
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service.to_string(), self.config.clone())))
            .clone()
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

/// Extracts the service segment (everything before the first `.`) from an
/// action string such as `slack.chat.postMessage`.
pub fn service_of(action: &str) -> &str {
    action.split('.').next().unwrap_or(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("svc".into(), BreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        for _ in 0..3 {
            assert!(breaker.can_execute());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn success_in_closed_state_resets_failure_count() {
        let breaker = CircuitBreaker::new("svc".into(), BreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn half_open_admits_limited_calls_and_single_failure_reopens() {
        let breaker = CircuitBreaker::new(
            "svc".into(),
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(0),
                half_open_max_calls: 2,
            },
        );
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_success_closes_and_zeroes_failures() {
        let breaker = CircuitBreaker::new(
            "svc".into(),
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(0),
                half_open_max_calls: 3,
            },
        );
        breaker.record_failure();
        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn service_of_extracts_first_segment() {
        assert_eq!(service_of("slack.chat.postMessage"), "slack");
        assert_eq!(service_of("calculator"), "calculator");
    }
}

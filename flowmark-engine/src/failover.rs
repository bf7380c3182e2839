// ABOUTME: Failover bookkeeping — FailoverEvent log and AgentHealthTracker, per spec §3/§4.4
// ABOUTME: Both are engine-instance-scoped and safe to append to from any Parallel branch

use dashmap::DashMap;
use parking_lot::RwLock;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Ordered list of tool aliases tried, in order, after the primary fails.
    pub fallback_agents: Vec<String>,
    pub failover_on_timeout: bool,
    pub failover_on_step_failure: bool,
    pub max_failover_attempts: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            fallback_agents: Vec::new(),
            failover_on_timeout: true,
            failover_on_step_failure: true,
            max_failover_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailoverReason {
    Timeout,
    StepFailure,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FailoverEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub from_agent: String,
    pub to_agent: String,
    pub reason: FailoverReason,
    pub step_index: usize,
    pub error: Option<String>,
}

/// Append-only failover log, one per engine instance (spec §3, §9).
#[derive(Default)]
pub struct FailoverLog {
    events: RwLock<Vec<FailoverEvent>>,
}

impl FailoverLog {
    pub fn append(&self, event: FailoverEvent) {
        self.events.write().push(event);
    }

    pub fn all(&self) -> Vec<FailoverEvent> {
        self.events.read().clone()
    }
}

/// Tracks which tool aliases have recently succeeded/failed, so failover
/// selection can prefer currently-healthy fallbacks. A tool not yet observed
/// is assumed healthy.
#[derive(Default)]
pub struct AgentHealthTracker {
    healthy: DashMap<String, bool>,
}

impl AgentHealthTracker {
    pub fn mark_healthy(&self, tool: &str) {
        self.healthy.insert(tool.to_string(), true);
    }

    pub fn mark_unhealthy(&self, tool: &str) {
        self.healthy.insert(tool.to_string(), false);
    }

    pub fn is_healthy(&self, tool: &str) -> bool {
        self.healthy.get(tool).map(|v| *v).unwrap_or(true)
    }
}

/// Splits `slack.chat.postMessage` into `("slack", "chat.postMessage")`.
pub fn split_action(action: &str) -> (&str, &str) {
    match action.split_once('.') {
        Some((tool, method)) => (tool, method),
        None => (action, ""),
    }
}

/// Builds the synthesized fallback action string, preserving the method
/// segment (spec glossary "Failover").
pub fn substitute_tool(action: &str, fallback_tool: &str) -> String {
    let (_, method) = split_action(action);
    if method.is_empty() {
        fallback_tool.to_string()
    } else {
        format!("{fallback_tool}.{method}")
    }
}

/// `recovery_timeout`-style default used when callers need a `Duration`
/// rather than a pure count; kept here so `pipeline.rs` doesn't need its own
/// constant for the rare caller that wants it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_tool_preserves_method_segment() {
        assert_eq!(
            substitute_tool("primary.ask", "secondary"),
            "secondary.ask"
        );
        assert_eq!(
            substitute_tool("slack.chat.postMessage", "slack_backup"),
            "slack_backup.chat.postMessage"
        );
    }

    #[test]
    fn health_tracker_defaults_to_healthy_for_unknown_tools() {
        let tracker = AgentHealthTracker::default();
        assert!(tracker.is_healthy("never_seen"));
        tracker.mark_unhealthy("never_seen");
        assert!(!tracker.is_healthy("never_seen"));
        tracker.mark_healthy("never_seen");
        assert!(tracker.is_healthy("never_seen"));
    }

    #[test]
    fn failover_log_appends_and_lists_events() {
        let log = FailoverLog::default();
        log.append(FailoverEvent {
            timestamp: chrono::Utc::now(),
            from_agent: "primary".into(),
            to_agent: "secondary".into(),
            reason: FailoverReason::Timeout,
            step_index: 0,
            error: Some("timed out".into()),
        });
        assert_eq!(log.all().len(), 1);
    }
}

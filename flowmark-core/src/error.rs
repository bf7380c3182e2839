// ABOUTME: Error types and handling for flowmark-core
// ABOUTME: Provides EngineError enum and Result type alias shared by the whole workspace

use thiserror::Error;

/// Comprehensive error enum for all flowmark engine operations.
///
/// Every variant carries a `message` that, where spec'd, preserves specific
/// substrings other components key off of (`"timed out"`, `"Circuit breaker
/// open for service: ..."`, etc.) — see `Display` call sites in
/// `flowmark-engine` for where those substrings are constructed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Tool error: {message}")]
    Tool { message: String },

    #[error("Workflow execution error: {message}")]
    Workflow { message: String },

    #[error("Template rendering error: {message}")]
    Template { message: String },

    #[error("Condition evaluation error: {message}")]
    Condition { message: String },

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Circuit breaker error: {message}")]
    CircuitOpen { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn workflow(message: impl Into<String>) -> Self {
        Self::Workflow {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn circuit_open(service: &str) -> Self {
        Self::CircuitOpen {
            message: format!("Circuit breaker open for service: {service}"),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// `true` if the error message contains the literal substring `"timed out"`,
    /// the signal the failover pipeline keys off of (spec §4.4, §7.3).
    pub fn is_timeout(&self) -> bool {
        self.to_string().contains("timed out")
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

/// Convenience Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;

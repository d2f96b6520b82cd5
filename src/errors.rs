//! Typed error hierarchy for the chaos engine.
//!
//! A single `EngineError` enum covers phase dispatch. It is `Clone` because a
//! phase failure is delivered to every waiter of that phase's completion
//! signal. Repository and configuration code works in `anyhow` and is folded
//! into `EngineError::Repository` at the engine boundary.

use thiserror::Error;

/// Errors raised while dispatching and reconciling an experiment phase.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Malformed scene code '{code}': expected <family>.<target>.<action>[.stop]")]
    MalformedSceneCode { code: String },

    #[error("Unknown experiment scope '{0}'")]
    UnknownScope(String),

    #[error("No invoker registered for '{original}' (scope: {scope}, phase: {phase})")]
    InvokerNotFound {
        original: String,
        scope: String,
        phase: String,
    },

    /// The remote call itself failed (connect, timeout, undecodable body).
    #[error("Invocation failed: {0}")]
    Invocation(String),

    /// The remote answered and reported a failure. Displays the remote text as is.
    #[error("{0}")]
    Business(String),

    #[error("Experiment task {id} not found")]
    ExperimentTaskNotFound { id: i64 },

    #[error("Activity task {id} not found")]
    ActivityTaskNotFound { id: i64 },

    #[error("Resource '{name}' did not reach a terminal state after {attempts} status polls")]
    ReconcileExhausted { name: String, attempts: u32 },

    #[error("Repository error: {0}")]
    Repository(String),
}

impl EngineError {
    /// Configuration errors abort the phase and are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MalformedSceneCode { .. } | Self::UnknownScope(_) | Self::InvokerNotFound { .. }
        )
    }

    /// Business error from a remote response: the error text when present,
    /// otherwise the raw result payload.
    pub fn from_response(error: Option<&str>, result: Option<&str>) -> Self {
        match error.filter(|e| !e.trim().is_empty()) {
            Some(error) => Self::Business(error.to_string()),
            None => Self::Business(result.unwrap_or_default().to_string()),
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Repository(format!("{:#}", err))
    }
}

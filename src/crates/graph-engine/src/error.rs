//! Error types for graph construction and execution
//!
//! Two families of errors exist:
//!
//! - [`GraphEngineError`] - raised inside the engine (invalid graphs, limit
//!   violations, condition failures, propagated node exceptions). A
//!   [`GraphEngineError::RunFailed`] carries the caller-facing error string
//!   that ends up in the terminal `GraphRunFailed` event.
//! - [`NodeError`] - raised by a node's own event stream. The node runner
//!   translates these into lifecycle events; they never cross the engine
//!   boundary directly.

use thiserror::Error;

/// Convenience result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, GraphEngineError>;

/// Errors produced by the engine itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphEngineError {
    /// Terminal run failure. The inner string is the exact text surfaced to
    /// the caller in `GraphRunFailed { error }`.
    #[error("{0}")]
    RunFailed(String),

    /// Graph structure rejected at construction time.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// The event stream consumer went away while the executor was still
    /// producing. The path unwinds quietly; nothing is surfaced.
    #[error("event stream closed")]
    StreamClosed,
}

impl GraphEngineError {
    /// Shorthand for the terminal run-failure variant.
    pub fn run_failed(error: impl Into<String>) -> Self {
        Self::RunFailed(error.into())
    }

    /// The caller-facing error string for this error.
    pub fn error_text(&self) -> String {
        match self {
            Self::RunFailed(error) => error.clone(),
            other => other.to_string(),
        }
    }
}

/// Failures reported by a node's event stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    /// The node observed the caller-initiated stop signal.
    #[error("Workflow stopped.")]
    Stopped,

    /// Node-internal failure. Aborts the whole run when it propagates.
    #[error("{0}")]
    Failed(String),
}

impl NodeError {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed(error.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_failed_displays_bare_error_text() {
        let err = GraphEngineError::run_failed("Max steps 5 reached.");
        assert_eq!(err.to_string(), "Max steps 5 reached.");
        assert_eq!(err.error_text(), "Max steps 5 reached.");
    }

    #[test]
    fn stopped_node_error_uses_public_wording() {
        assert_eq!(NodeError::Stopped.to_string(), "Workflow stopped.");
    }
}

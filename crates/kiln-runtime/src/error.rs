//! Runtime error types.

use thiserror::Error;

use kiln_core::error::{EngineError, HubError};

use crate::context::ApplicationPhase;

/// Errors surfaced by the application context.
#[derive(Debug, Clone, Error)]
pub enum ContextError {
    /// The operation is not legal in the current phase.
    #[error("context is {actual}, operation requires {expected}")]
    InvalidPhase {
        /// Phase(s) the operation requires.
        expected: &'static str,
        /// Phase the context was in.
        actual: ApplicationPhase,
    },

    /// Another phase transition is underway; this attempt was dropped.
    #[error("a phase transition is already in progress")]
    TransitionInProgress,

    /// A plugin engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// An event hub failure.
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Result type for context operations.
pub type ContextResult<T> = Result<T, ContextError>;

//! Interpreter error types.

use crate::interpreter::InterpreterState;
use statecraft_core::{CoreError, ErrorKind, Event};
use thiserror::Error;

/// Errors raised by a data model.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DataModelError {
    #[error("syntax error in '{expr}': {reason}")]
    Syntax { expr: String, reason: String },

    #[error("{reason}")]
    Execution { reason: String },

    #[error("cannot assign to reserved binding '{location}'")]
    Reserved { location: String },

    #[error("extension '{name}' rejected: {reason}")]
    Extension { name: String, reason: String },
}

impl DataModelError {
    pub(crate) fn execution(reason: impl Into<String>) -> Self {
        DataModelError::Execution {
            reason: reason.into(),
        }
    }

    /// Converts an expression error raised while handling `expr`.
    pub(crate) fn from_core(expr: &str, err: CoreError) -> Self {
        match err {
            CoreError::InvalidExpr { reason } | CoreError::Decode { reason, .. } => {
                DataModelError::Syntax {
                    expr: expr.to_string(),
                    reason,
                }
            }
            other => DataModelError::Execution {
                reason: other.to_string(),
            },
        }
    }

    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            DataModelError::Syntax { .. } => "SYNTAX_ERROR",
            DataModelError::Execution { .. } => "EXECUTION_ERROR",
            DataModelError::Reserved { .. } => "ASSIGNMENT_DENIED",
            DataModelError::Extension { .. } => "EXTENSION_REJECTED",
        }
    }
}

/// Interpreter errors.
#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("document error: {0}")]
    Document(#[from] CoreError),

    #[error("data model error: {0}")]
    DataModel(#[from] DataModelError),

    #[error("queue error: {0}")]
    Queue(#[from] statecraft_queue::QueueError),

    #[error("execution failed: {reason}")]
    Execution { reason: String },

    #[error("cannot deliver to '{target}': {reason}")]
    Communication {
        target: String,
        reason: String,
        send_id: Option<String>,
    },

    #[error("no {kind} registered as '{name}'")]
    Unsupported { kind: &'static str, name: String },

    #[error("session is {state}")]
    Terminated { state: InterpreterState },

    #[error("session is busy")]
    Busy,

    #[error("macrostep did not settle within {limit} microsteps")]
    MicrostepLimit { limit: usize },

    #[error("snapshot does not match document: {reason}")]
    SnapshotMismatch { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InterpreterError {
    pub(crate) fn execution(reason: impl Into<String>) -> Self {
        InterpreterError::Execution {
            reason: reason.into(),
        }
    }

    pub(crate) fn communication(
        target: impl Into<String>,
        reason: impl Into<String>,
        send_id: Option<String>,
    ) -> Self {
        InterpreterError::Communication {
            target: target.into(),
            reason: reason.into(),
            send_id,
        }
    }

    /// The platform error event this failure raises inside a session.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            InterpreterError::Communication { .. } => ErrorKind::Communication,
            InterpreterError::DataModel(_)
            | InterpreterError::Execution { .. }
            | InterpreterError::Unsupported { .. } => ErrorKind::Execution,
            _ => ErrorKind::Platform,
        }
    }

    /// Builds the error event raised into the internal queue.
    pub fn to_event(&self) -> Event {
        let send_id = match self {
            InterpreterError::Communication { send_id, .. } => send_id.clone(),
            _ => None,
        };
        Event::error(self.error_kind(), self.to_string(), send_id)
    }

    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            InterpreterError::Document(e) => e.error_code(),
            InterpreterError::DataModel(e) => e.error_code(),
            InterpreterError::Queue(e) => e.error_code(),
            InterpreterError::Execution { .. } => "EXECUTION_ERROR",
            InterpreterError::Communication { .. } => "COMMUNICATION_ERROR",
            InterpreterError::Unsupported { .. } => "UNSUPPORTED",
            InterpreterError::Terminated { .. } => "SESSION_TERMINATED",
            InterpreterError::Busy => "SESSION_BUSY",
            InterpreterError::MicrostepLimit { .. } => "MICROSTEP_LIMIT",
            InterpreterError::SnapshotMismatch { .. } => "SNAPSHOT_MISMATCH",
            InterpreterError::Json(_) => "BAD_REQUEST",
        }
    }
}

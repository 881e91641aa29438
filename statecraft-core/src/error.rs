//! Core error types.

use thiserror::Error;

/// Errors from loading documents and decoding values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid document: {reason}")]
    InvalidDocument { reason: String },

    #[error("unknown state '{id}' referenced from '{referrer}'")]
    UnknownState { id: String, referrer: String },

    #[error("duplicate state id: {id}")]
    DuplicateState { id: String },

    #[error("history '{id}' resolves cyclically through its default transition")]
    CyclicHistory { id: String },

    #[error("invalid event descriptor '{descriptor}': {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },

    #[error("cannot decode data at offset {offset}: {reason}")]
    Decode { offset: usize, reason: String },

    #[error("invalid expression: {reason}")]
    InvalidExpr { reason: String },

    #[error("evaluation failed: {reason}")]
    Evaluation { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        CoreError::InvalidDocument {
            reason: reason.into(),
        }
    }

    /// Returns true if this error means the document cannot be run.
    pub fn is_document_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidDocument { .. }
                | CoreError::UnknownState { .. }
                | CoreError::DuplicateState { .. }
                | CoreError::CyclicHistory { .. }
                | CoreError::InvalidDescriptor { .. }
                | CoreError::Json(_)
        )
    }

    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDocument { .. } => "INVALID_DOCUMENT",
            CoreError::UnknownState { .. } => "INVALID_DOCUMENT",
            CoreError::DuplicateState { .. } => "INVALID_DOCUMENT",
            CoreError::CyclicHistory { .. } => "INVALID_DOCUMENT",
            CoreError::InvalidDescriptor { .. } => "INVALID_DOCUMENT",
            CoreError::Decode { .. } => "BAD_DATA",
            CoreError::InvalidExpr { .. } => "BAD_EXPRESSION",
            CoreError::Evaluation { .. } => "EVALUATION_FAILED",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }
}

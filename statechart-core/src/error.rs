//! Core error types.

use thiserror::Error;

/// Structural errors found while validating a document.
///
/// All of these are fatal: a document that fails validation never becomes
/// executable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("document declares no states")]
    EmptyDocument,

    #[error("initial state '{initial}' not found")]
    NoInitialState { initial: String },

    #[error("initial target of state '{state}' is not a descendant of it")]
    BadInitialState { state: String },

    #[error("transition target '{target}' not found")]
    TargetNotFound { target: String },

    #[error("illegal targets '{next}' for transition from '{state}'")]
    IllegalTransitionTargets { state: String, next: String },

    #[error("atomic state '{state}' cannot declare history")]
    HistorySimpleState { state: String },

    #[error("shallow history '{history}' must target direct children of '{state}'")]
    BadShallowHistory { history: String, state: String },

    #[error("deep history '{history}' must target descendants of '{state}'")]
    BadDeepHistory { history: String, state: String },

    #[error("history '{history}' of '{state}' has no default transition target")]
    HistoryNoDefault { history: String, state: String },

    #[error("invoke in state '{state}' declares both src and srcexpr")]
    AmbiguousInvokeSource { state: String },

    #[error("invoke in state '{state}' declares neither src nor srcexpr")]
    MissingInvokeSource { state: String },

    #[error("invoke in state '{state}' has no type")]
    MissingInvokeType { state: String },

    #[error("region '{region}' of parallel '{parallel}' must be composite or parallel")]
    AtomicRegion { parallel: String, region: String },

    #[error("parallel '{parallel}' cannot declare an initial state")]
    ParallelInitial { parallel: String },

    #[error("duplicate id '{id}'")]
    DuplicateId { id: String },

    #[error("document has not been validated")]
    NotValidated,
}

impl ModelError {
    /// Returns a stable code for diagnostics.
    pub fn error_code(&self) -> &'static str {
        match self {
            ModelError::EmptyDocument => "EMPTY_DOCUMENT",
            ModelError::NoInitialState { .. } => "NO_INITIAL_STATE",
            ModelError::BadInitialState { .. } => "BAD_INITIAL_STATE",
            ModelError::TargetNotFound { .. } => "TARGET_NOT_FOUND",
            ModelError::IllegalTransitionTargets { .. } => "ILLEGAL_TRANSITION_TARGETS",
            ModelError::HistorySimpleState { .. } => "HISTORY_SIMPLE_STATE",
            ModelError::BadShallowHistory { .. } => "BAD_SHALLOW_HISTORY",
            ModelError::BadDeepHistory { .. } => "BAD_DEEP_HISTORY",
            ModelError::HistoryNoDefault { .. } => "HISTORY_NO_DEFAULT",
            ModelError::AmbiguousInvokeSource { .. } => "AMBIGUOUS_INVOKE_SOURCE",
            ModelError::MissingInvokeSource { .. } => "MISSING_INVOKE_SOURCE",
            ModelError::MissingInvokeType { .. } => "MISSING_INVOKE_TYPE",
            ModelError::AtomicRegion { .. } => "ATOMIC_REGION",
            ModelError::ParallelInitial { .. } => "PARALLEL_INITIAL",
            ModelError::DuplicateId { .. } => "DUPLICATE_ID",
            ModelError::NotValidated => "NOT_VALIDATED",
        }
    }
}

/// Errors surfaced to the caller of a machine operation.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid document: {0}")]
    Model(#[from] ModelError),

    #[error("illegal configuration: {reason}")]
    IllegalConfiguration { reason: String },

    #[error("machine has not been started")]
    NotStarted,

    #[error("invalid snapshot: {reason}")]
    InvalidSnapshot { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns whether the machine that raised the error can keep running.
    ///
    /// Every `CoreError` aborts the operation that raised it. An
    /// `IllegalConfiguration` aborts the whole macrostep and leaves the
    /// machine at the configuration it had before the macrostep. Snapshot and
    /// JSON errors are raised before anything changes. Only model errors
    /// leave no machine behind.
    pub fn is_machine_usable(&self) -> bool {
        !matches!(self, CoreError::Model(_))
    }

    /// Returns a stable code for diagnostics.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::Model(e) => e.error_code(),
            CoreError::IllegalConfiguration { .. } => "ILLEGAL_CONFIGURATION",
            CoreError::NotStarted => "NOT_STARTED",
            CoreError::InvalidSnapshot { .. } => "INVALID_SNAPSHOT",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }
}

/// A failure inside the evaluator. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (in '{expr}')")]
pub struct ExpressionError {
    pub expr: String,
    pub message: String,
}

impl ExpressionError {
    pub fn new(expr: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            message: message.into(),
        }
    }
}

/// Failures reported by invokers or while creating them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokerError {
    #[error("no invoker registered for type '{invoke_type}'")]
    UnknownType { invoke_type: String },

    #[error("invoker failed to start: {reason}")]
    Start { reason: String },

    #[error("invoker rejected forwarded events: {reason}")]
    Forward { reason: String },

    #[error("invoker failed to cancel: {reason}")]
    Cancel { reason: String },
}

/// Codes for non-fatal conditions passed to an `ErrorReporter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ExpressionError,
    IllegalConfiguration,
    InvokeFailed,
    InvokeCancelFailed,
    CommunicationError,
    MicrostepLimit,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ExpressionError => "EXPRESSION_ERROR",
            ErrorCode::IllegalConfiguration => "ILLEGAL_CONFIGURATION",
            ErrorCode::InvokeFailed => "INVOKE_FAILED",
            ErrorCode::InvokeCancelFailed => "INVOKE_CANCEL_FAILED",
            ErrorCode::CommunicationError => "COMMUNICATION_ERROR",
            ErrorCode::MicrostepLimit => "MICROSTEP_LIMIT",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_error_codes() {
        let err = ModelError::TargetNotFound {
            target: "missing".to_string(),
        };
        assert_eq!(err.error_code(), "TARGET_NOT_FOUND");
        assert_eq!(err.to_string(), "transition target 'missing' not found");
    }

    #[test]
    fn test_core_error_wraps_model_error() {
        let err: CoreError = ModelError::EmptyDocument.into();
        assert_eq!(err.error_code(), "EMPTY_DOCUMENT");
        assert!(!err.is_machine_usable());

        let err = CoreError::IllegalConfiguration {
            reason: "x".to_string(),
        };
        assert_eq!(err.error_code(), "ILLEGAL_CONFIGURATION");
        assert!(err.is_machine_usable());
        assert!(CoreError::NotStarted.is_machine_usable());
    }

    #[test]
    fn test_illegal_targets_display() {
        let err = ModelError::IllegalTransitionTargets {
            state: "S".to_string(),
            next: "X Y".to_string(),
        };
        assert_eq!(err.error_code(), "ILLEGAL_TRANSITION_TARGETS");
        assert_eq!(err.to_string(), "illegal targets 'X Y' for transition from 'S'");
    }

    #[test]
    fn test_expression_error_display() {
        let err = ExpressionError::new("ctx.", "empty field name");
        assert_eq!(err.to_string(), "empty field name (in 'ctx.')");
    }
}

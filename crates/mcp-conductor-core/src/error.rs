use thiserror::Error;

use crate::categorize::ErrorCategory;

/// RPC-level failure surfaced by a transport client.
#[derive(Debug, Clone, Error)]
#[error("transport error ({kind}): {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Dial,
    Protocol,
    Timeout,
    Closed,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportErrorKind::Dial => "dial",
            TransportErrorKind::Protocol => "protocol",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl TransportError {
    pub fn dial(message: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Dial, message: message.into(), retryable: true }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Protocol, message: message.into(), retryable: false }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Timeout, message: message.into(), retryable: true }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Closed, message: message.into(), retryable: true }
    }
}

/// Surface error taxonomy of the orchestrator. Everything a caller can see
/// is one of these kinds; `code()` is the stable machine code carried in
/// failure results.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("critical server '{server}' failed to initialize: {reason}")]
    Initialization { server: String, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("resource catalog is empty")]
    NoResourcesAvailable,

    #[error("no ready server advertises execute_query")]
    NoExecutorAvailable,

    #[error("prompt generation failed: {0}")]
    PromptGeneration(String),

    #[error("response parse failed: {0}")]
    ResponseParse(String),

    #[error("sql validation failed: {0}")]
    SqlValidation(String),

    #[error("sql execution failed ({category}): {message}")]
    SqlExecution { category: ErrorCategory, message: String },

    #[error("recovery exhausted after {attempts} attempts: {last_error}")]
    RecoveryExhausted { attempts: u32, last_error: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Initialization { .. } => "initialization",
            Error::Transport(_) => "transport",
            Error::NoResourcesAvailable => "no_resources_available",
            Error::NoExecutorAvailable => "no_executor_available",
            Error::PromptGeneration(_) => "prompt_generation",
            Error::ResponseParse(_) => "response_parse",
            Error::SqlValidation(_) => "sql_validation",
            Error::SqlExecution { .. } => "sql_execution",
            Error::RecoveryExhausted { .. } => "recovery_exhausted",
            Error::PermissionDenied(_) => "permission_denied",
            Error::Cancelled => "cancelled",
        }
    }

    /// Category attached to execution failures, if this kind carries one.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Error::SqlExecution { category, .. } => Some(*category),
            Error::PermissionDenied(_) => Some(ErrorCategory::PermissionError),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

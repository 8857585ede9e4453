use thiserror::Error;

use crate::{Label, ScopeId, Value};

/// Failures surfaced to running code as language-level exceptions.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("TypeError: {0}")]
    TypeError(String),
    #[error("NameError: uninitialized constant {0}")]
    NameError(String),
    #[error("NoMethodError: {message}")]
    NoMethodError { name: String, message: String },
    #[error(
        "ArgumentError: wrong number of arguments (given {given}, expected {expected})"
    )]
    ArgumentError { given: usize, expected: usize },
    #[error("LocalJumpError: {0}")]
    LocalJump(&'static str),
    #[error("SystemStackError: stack level too deep")]
    StackOverflow,
    #[error("RuntimeError: {0}")]
    Raised(Value),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn type_error(message: impl Into<String>) -> Self {
        RuntimeError::TypeError(message.into())
    }

    /// The message without the exception class prefix.
    pub fn message(&self) -> String {
        match self {
            RuntimeError::TypeError(message) => message.clone(),
            RuntimeError::NoMethodError { message, .. } => message.clone(),
            RuntimeError::LocalJump(message) => (*message).to_owned(),
            RuntimeError::Raised(value) => value.to_string(),
            RuntimeError::Internal(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Problems found while assembling a compiled body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    #[error("label {0} is defined more than once")]
    DuplicateLabel(Label),
    #[error("jump to undefined label {0}")]
    UnknownLabel(Label),
    #[error("{var} is out of range (declared {declared})")]
    TempOutOfRange { var: String, declared: usize },
    #[error("local {name} does not exist at depth {depth} offset {offset}")]
    LocalOutOfRange { name: String, depth: u32, offset: u32 },
    #[error("unknown local variable {0}")]
    UnknownLocal(String),
    #[error("local {0} is stored in a body without a scope of its own")]
    SharedScopeLocal(String),
    #[error("SCOPE_ELIMINATED and REUSE_PARENT_SCOPE are mutually exclusive")]
    ConflictingScopeFlags,
}

/// How control leaves an interpreted body other than falling through.
#[derive(Debug)]
pub(crate) enum Unwind {
    Error(RuntimeError),
    /// A non-local return travelling to the activation owning `target`.
    Return { target: ScopeId, value: Value },
}

impl Unwind {
    /// Converts an unwind that escaped every activation into an error.
    pub(crate) fn into_error(self) -> RuntimeError {
        match self {
            Unwind::Error(error) => error,
            Unwind::Return { .. } => RuntimeError::LocalJump("unexpected return"),
        }
    }
}

impl From<RuntimeError> for Unwind {
    fn from(error: RuntimeError) -> Self {
        Unwind::Error(error)
    }
}

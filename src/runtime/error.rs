use crate::runtime::ffi::FfiError;
use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Type error: expected {expected}, got {got} ({context})")]
    BadType {
        expected: String,
        got: String,
        context: String,
    },
    #[error("Type error: expected {expected}, got {got}")]
    BadTypeContextless { expected: String, got: String },
    #[error("Cannot access a field of nil")]
    NilAccess,
    #[error("Cannot access a field of a value of type {type_name}")]
    BadDotAccess { type_name: String },
    #[error("Cannot call a value of type {type_name}")]
    BadCall { type_name: String },
    #[error("Iterator of a generic for must be a function, got {type_name}")]
    ForInBadType { type_name: String },
    #[error("Generic for requires at least an iterator expression")]
    BadForIn,
    #[error("Tables cannot be keyed by {type_name}")]
    BadKey { type_name: String },
    #[error("Expression {expression} evaluated to {got}, expected {expected}")]
    ValueEqualityExpected {
        expression: String,
        expected: String,
        got: String,
    },
    #[error("Expression {expression} has type {got}, expected {expected}")]
    TypeEqualityExpected {
        expression: String,
        expected: String,
        got: String,
    },
    #[error("Failure expected in expression {expression}")]
    FailureExpected { expression: String },
    #[error("Unknown type name `{type_name}` in ensure_value_type")]
    UnknownTypeName { type_name: String },
    #[error("FFI error: {0}")]
    Ffi(#[from] FfiError),
    #[error("Block stack corrupted: expected block {expected}, found {found}")]
    StackCorruption { expected: u32, found: u32 },
    #[error("Interpreter invariant violated: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn bad_type(
        expected: impl Into<String>,
        got: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        RuntimeError::BadType {
            expected: expected.into(),
            got: got.into(),
            context: context.into(),
        }
    }

    pub fn bad_type_contextless(expected: impl Into<String>, got: impl Into<String>) -> Self {
        RuntimeError::BadTypeContextless {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// True for the `BadType` family, the errors `expect_failure` swallows.
    pub fn is_type_error(&self) -> bool {
        matches!(
            self,
            RuntimeError::BadType { .. } | RuntimeError::BadTypeContextless { .. }
        )
    }
}

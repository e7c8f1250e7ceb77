//! VM error types

use std::fmt;

use thiserror::Error;

use crate::value::Value;

/// VM execution errors
#[derive(Debug, Error)]
pub enum VmError {
    /// Type error (e.g., calling non-function)
    #[error("TypeError: {0}")]
    TypeError(String),

    /// Reference error (undefined variable)
    #[error("ReferenceError: {0}")]
    ReferenceError(String),

    /// Range error (e.g., invalid array length)
    #[error("RangeError: {0}")]
    RangeError(String),

    /// Syntax error, raised by eval
    #[error("SyntaxError: {0}")]
    SyntaxError(String),

    /// Eval error
    #[error("EvalError: {0}")]
    EvalError(String),

    /// URI error (malformed URI sequence)
    #[error("URIError: {0}")]
    URIError(String),

    /// Internal error, aborts execution
    #[error("InternalError: {0}")]
    InternalError(String),

    /// Call depth limit reached
    #[error("RangeError: Maximum call stack size exceeded")]
    StackOverflow,

    /// Allocation failed, aborts execution
    #[error("OutOfMemory")]
    OutOfMemory,

    /// Thrown JS exception
    #[error("Uncaught exception: {0}")]
    Exception(Box<ThrownValue>),

    /// Bytecode error
    #[error("Bytecode error: {0}")]
    Bytecode(#[from] tern_vm_bytecode::BytecodeError),

    /// Execution was interrupted (cancellation)
    #[error("Execution interrupted")]
    Interrupted,
}

/// A thrown JavaScript value
#[derive(Debug)]
pub struct ThrownValue {
    /// The thrown value
    pub value: Value,
    /// The thrown value (as a string representation)
    pub message: String,
    /// Stack trace captured where the value was thrown
    pub stack: Vec<StackFrame>,
}

impl fmt::Display for ThrownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// A stack frame in error trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Function name
    pub function_name: String,
    /// Source file
    pub file: String,
    /// Line number
    pub line: u32,
    /// Column number
    pub column: u32,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "at {} ({}:{}:{})",
            self.function_name, self.file, self.line, self.column
        )
    }
}

/// Kind of a native error object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// `Error`
    Error,
    /// `TypeError`
    TypeError,
    /// `ReferenceError`
    ReferenceError,
    /// `RangeError`
    RangeError,
    /// `SyntaxError`
    SyntaxError,
    /// `EvalError`
    EvalError,
    /// `URIError`
    URIError,
}

impl ErrorKind {
    /// All kinds, in intrinsic-table order
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Error,
        ErrorKind::TypeError,
        ErrorKind::ReferenceError,
        ErrorKind::RangeError,
        ErrorKind::SyntaxError,
        ErrorKind::EvalError,
        ErrorKind::URIError,
    ];

    /// Constructor name
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::EvalError => "EvalError",
            ErrorKind::URIError => "URIError",
        }
    }

    /// Index into the intrinsic prototype table
    pub fn index(self) -> usize {
        self as usize
    }
}

impl VmError {
    /// Create a type error
    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::TypeError(msg.into())
    }

    /// Create a reference error
    pub fn reference_error(msg: impl Into<String>) -> Self {
        Self::ReferenceError(msg.into())
    }

    /// Create a range error
    pub fn range_error(msg: impl Into<String>) -> Self {
        Self::RangeError(msg.into())
    }

    /// Create a syntax error
    pub fn syntax_error(msg: impl Into<String>) -> Self {
        Self::SyntaxError(msg.into())
    }

    /// Create an eval error
    pub fn eval_error(msg: impl Into<String>) -> Self {
        Self::EvalError(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// Create an interrupted error (for cancellation)
    pub fn interrupted() -> Self {
        Self::Interrupted
    }

    /// Create an exception from a thrown JS value
    pub fn exception(value: Value) -> Self {
        let message = match &value {
            Value::String(s) => s.to_string(),
            other => format!("{other:?}"),
        };
        Self::exception_with(value, message, Vec::new())
    }

    /// Create an exception with a precomputed message and stack trace
    pub fn exception_with(value: Value, message: String, stack: Vec<StackFrame>) -> Self {
        Self::Exception(Box::new(ThrownValue {
            value,
            message,
            stack,
        }))
    }

    /// Whether the error aborts execution instead of becoming a JS exception.
    ///
    /// Fatal errors unwind every frame up to the outermost entry point
    /// without running `catch` or `finally` handlers.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InternalError(_) | Self::OutOfMemory | Self::Bytecode(_) | Self::Interrupted
        )
    }

    /// Native error kind and message for a catchable error
    pub fn error_kind(&self) -> Option<(ErrorKind, String)> {
        match self {
            Self::TypeError(msg) => Some((ErrorKind::TypeError, msg.clone())),
            Self::ReferenceError(msg) => Some((ErrorKind::ReferenceError, msg.clone())),
            Self::RangeError(msg) => Some((ErrorKind::RangeError, msg.clone())),
            Self::SyntaxError(msg) => Some((ErrorKind::SyntaxError, msg.clone())),
            Self::EvalError(msg) => Some((ErrorKind::EvalError, msg.clone())),
            Self::URIError(msg) => Some((ErrorKind::URIError, msg.clone())),
            Self::StackOverflow => Some((
                ErrorKind::RangeError,
                "Maximum call stack size exceeded".to_string(),
            )),
            _ => None,
        }
    }

    /// The thrown value, for an uncaught exception
    pub fn thrown_value(&self) -> Option<&Value> {
        match self {
            Self::Exception(thrown) => Some(&thrown.value),
            _ => None,
        }
    }
}

impl From<tern_vm_gc::GcError> for VmError {
    fn from(_: tern_vm_gc::GcError) -> Self {
        VmError::OutOfMemory
    }
}

/// Result type for VM operations
pub type VmResult<T> = std::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(VmError::OutOfMemory.is_fatal());
        assert!(VmError::internal("x").is_fatal());
        assert!(!VmError::type_error("x").is_fatal());
        assert!(!VmError::StackOverflow.is_fatal());
        assert!(!VmError::exception(Value::Int32(1)).is_fatal());
    }

    #[test]
    fn test_error_kind_mapping() {
        let (kind, msg) = VmError::StackOverflow.error_kind().unwrap();
        assert_eq!(kind, ErrorKind::RangeError);
        assert!(msg.contains("call stack"));
        assert_eq!(
            VmError::reference_error("x is not defined").to_string(),
            "ReferenceError: x is not defined"
        );
        assert!(VmError::OutOfMemory.error_kind().is_none());
    }
}

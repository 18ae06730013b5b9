//! Error taxonomy for the virtual machine.
//!
//! Two worlds of failure are kept strictly apart:
//!
//! - [`RunError::Exc`] carries a catchable exception triple. It is converted
//!   into the `exception` signal by the dispatch loop and routed through the
//!   block-unwinding algorithm, so an enclosing except-guard or finally block
//!   in the executing program can consume it.
//! - [`RunError::Internal`] and [`RunError::UnknownOpcode`] are fatal. They
//!   indicate a malformed code object or a bug in the embedder/VM, bypass all
//!   program-level handlers, and terminate the `run` call immediately.

use std::{
    borrow::Cow,
    fmt::{self, Display},
    rc::Rc,
};

use strum::{Display as StrumDisplay, EnumIter, EnumString, IntoStaticStr};

use crate::value::Value;

/// Result type alias for operations that can produce a runtime error.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// Exception classes supported by the interpreter.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and `Into<&'static str>`
/// implementations. The string representation matches the variant name exactly
/// (e.g., `ValueError` -> "ValueError").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumString, EnumIter, IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum ExcType {
    /// Primary exception class - matches any ordinary exception in handler checks.
    Exception,
    /// Root of the hierarchy; also catches the exceptions `Exception` does not.
    BaseException,

    // --- ArithmeticError hierarchy ---
    /// Intermediate class for arithmetic errors.
    ArithmeticError,
    /// Subclass of ArithmeticError.
    OverflowError,
    /// Subclass of ArithmeticError.
    ZeroDivisionError,

    // --- LookupError hierarchy ---
    /// Intermediate class for lookup errors.
    LookupError,
    /// Subclass of LookupError.
    IndexError,
    /// Subclass of LookupError.
    KeyError,

    // --- RuntimeError hierarchy ---
    /// Intermediate class for runtime errors.
    RuntimeError,
    /// Subclass of RuntimeError, raised when the call stack exceeds its limit.
    RecursionError,

    // --- NameError hierarchy ---
    NameError,
    /// Subclass of NameError - for accessing a local variable before assignment.
    UnboundLocalError,

    // --- Standalone exception types ---
    AttributeError,
    StopIteration,
    TypeError,
    ValueError,
}

impl ExcType {
    /// Checks if this exception type is a subclass of another exception type.
    ///
    /// Implements the exception hierarchy used by except-guard matching:
    /// `LookupError` is the base for `KeyError` and `IndexError`,
    /// `ArithmeticError` for `ZeroDivisionError` and `OverflowError`,
    /// `RuntimeError` for `RecursionError`, and `NameError` for
    /// `UnboundLocalError`.
    ///
    /// Returns true if `self` would be caught by a handler for `handler_type`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        if self == handler_type {
            return true;
        }
        match handler_type {
            // BaseException catches everything
            Self::BaseException => true,
            // Exception catches everything except BaseException itself
            Self::Exception => self != Self::BaseException,
            // LookupError catches KeyError and IndexError
            Self::LookupError => matches!(self, Self::KeyError | Self::IndexError),
            // ArithmeticError catches ZeroDivisionError and OverflowError
            Self::ArithmeticError => matches!(self, Self::ZeroDivisionError | Self::OverflowError),
            // RuntimeError catches RecursionError
            Self::RuntimeError => matches!(self, Self::RecursionError),
            // NameError catches UnboundLocalError
            Self::NameError => matches!(self, Self::UnboundLocalError),
            // All other types only match exactly (handled above)
            _ => false,
        }
    }
}

/// A raised exception instance: a class plus an optional message.
///
/// This is the payload of the `value` slot of an exception triple, and what
/// calling an [`ExcType`] value (e.g. `ValueError("boom")`) produces.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleException {
    pub exc_type: ExcType,
    pub message: Option<Rc<str>>,
}

impl SimpleException {
    #[must_use]
    pub fn new(exc_type: ExcType) -> Self {
        Self { exc_type, message: None }
    }

    pub fn new_msg(exc_type: ExcType, message: impl Into<Rc<str>>) -> Self {
        Self {
            exc_type,
            message: Some(message.into()),
        }
    }
}

impl Display for SimpleException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {}", self.exc_type, m),
            None => write!(f, "{}", self.exc_type),
        }
    }
}

/// The exception triple threaded through block unwinding.
///
/// Mirrors the classic `(type, value, traceback)` shape: all three slots are
/// pushed onto the operand stack when a handler is entered, and rebuilt from
/// the stack by `EndFinally` re-raises. The traceback slot is `Value::None`
/// until the first frame line is recorded, then a list of line numbers,
/// innermost first.
#[derive(Debug, Clone)]
pub(crate) struct Exc {
    pub exc_type: ExcType,
    pub value: Value,
    pub traceback: Value,
}

impl Exc {
    /// Builds a triple for a freshly raised exception instance.
    pub fn from_exception(exc: SimpleException) -> Self {
        Self {
            exc_type: exc.exc_type,
            value: Value::Exception(Rc::new(exc)),
            traceback: Value::None,
        }
    }

    /// Rebuilds a triple from the three stack slots popped by `EndFinally`
    /// or an except-handler unwind.
    pub fn from_slots(exc_type: ExcType, value: Value, traceback: Value) -> Self {
        Self { exc_type, value, traceback }
    }

    /// Records the source line of the frame the exception is passing through.
    pub fn push_line(&mut self, line: u32) {
        match &self.traceback {
            Value::List(lines) => lines.borrow_mut().push(Value::Int(i64::from(line))),
            _ => self.traceback = Value::new_list(vec![Value::Int(i64::from(line))]),
        }
    }

    /// Best-effort message text for reporting an uncaught exception.
    fn message(&self) -> Option<String> {
        match &self.value {
            Value::Exception(exc) => exc.message.as_deref().map(str::to_owned),
            Value::Str(s) => Some(s.to_string()),
            _ => None,
        }
    }

    /// Traceback line numbers recorded so far, innermost first.
    fn traceback_lines(&self) -> Vec<u32> {
        match &self.traceback {
            Value::List(lines) => lines
                .borrow()
                .iter()
                .filter_map(|v| match v {
                    Value::Int(line) => u32::try_from(*line).ok(),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Errors produced while executing bytecode.
#[derive(Debug)]
pub(crate) enum RunError {
    /// Internal interpreter error - indicates a malformed code object or a bug
    /// in coil, not in the program being executed. Never catchable.
    Internal(Cow<'static, str>),
    /// A decoded byte with no registered opcode handler. Never catchable.
    UnknownOpcode { byte: u8, offset: usize },
    /// Catchable program-level exception.
    Exc(Box<Exc>),
    /// Resource-limit exception that skips program-level handlers.
    ///
    /// Displays like a normal exception but cannot be caught by except-guard
    /// blocks, so the executing program cannot suppress a limit violation.
    Uncatchable(Box<Exc>),
}

impl RunError {
    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<SimpleException> for RunError {
    fn from(exc: SimpleException) -> Self {
        Self::Exc(Box::new(Exc::from_exception(exc)))
    }
}

impl From<Exc> for RunError {
    fn from(exc: Exc) -> Self {
        Self::Exc(Box::new(exc))
    }
}

/// Shorthand constructors used throughout the opcode handlers.
impl ExcType {
    pub(crate) fn raise(self, message: impl Into<Rc<str>>) -> RunError {
        SimpleException::new_msg(self, message).into()
    }

    pub(crate) fn raise_plain(self) -> RunError {
        SimpleException::new(self).into()
    }
}

/// An exception that escaped the outermost frame, reported to the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    /// The exception class.
    pub exc_type: ExcType,
    /// The message the exception was raised with, if any.
    pub message: Option<String>,
    /// Source lines the exception propagated through, innermost first.
    pub traceback: Vec<u32>,
}

impl Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {}", self.exc_type, m),
            None => write!(f, "{}", self.exc_type),
        }
    }
}

impl From<&Exc> for Exception {
    fn from(exc: &Exc) -> Self {
        Self {
            exc_type: exc.exc_type,
            message: exc.message(),
            traceback: exc.traceback_lines(),
        }
    }
}

/// Error returned from the VM's public entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// A program-level exception reached the outermost frame uncaught.
    Uncaught(Exception),
    /// A decoded byte had no registered opcode handler; the code object is
    /// malformed or uses an unsupported instruction.
    UnknownOpcode {
        /// The offending opcode byte.
        byte: u8,
        /// Instruction offset at which it was decoded.
        offset: usize,
    },
    /// Internal-consistency violation (frames or operands left over, block
    /// stack misuse, operand stack underflow).
    Internal(String),
}

impl Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uncaught(exc) => write!(f, "uncaught exception: {exc}"),
            Self::UnknownOpcode { byte, offset } => {
                write!(f, "unknown opcode 0x{byte:02x} at offset {offset}")
            }
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for VmError {}

impl From<RunError> for VmError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Internal(msg) => Self::Internal(msg.into_owned()),
            RunError::UnknownOpcode { byte, offset } => Self::UnknownOpcode { byte, offset },
            RunError::Exc(exc) | RunError::Uncatchable(exc) => Self::Uncaught(Exception::from(&*exc)),
        }
    }
}

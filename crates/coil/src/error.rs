//! Error taxonomy for assembly and execution.
//!
//! Runtime exceptions are *data*, not host errors: they flow through the
//! block-stack unwinding machinery, can be caught by `except` handlers, and
//! carry enough context (kind, message, source position, traceback frames)
//! for the embedding program to handle or display them. Only corruption and
//! internal bugs are terminal.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// User-level exception kinds understood by the interpreter core.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and
/// `Into<&'static str>` implementations; the string form matches the
/// variant name exactly (e.g. `ValueError` -> "ValueError").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExcKind {
    /// Root of the hierarchy; matches every exception.
    BaseException,
    /// Base class of everything a user program ordinarily catches.
    Exception,

    // --- ArithmeticError hierarchy ---
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,

    // --- LookupError hierarchy ---
    LookupError,
    IndexError,
    KeyError,

    // --- NameError hierarchy ---
    NameError,
    /// Subclass of NameError - local variable referenced before assignment.
    UnboundLocalError,

    // --- RuntimeError hierarchy ---
    RuntimeError,
    RecursionError,
    NotImplementedError,

    // --- Standalone types ---
    AttributeError,
    StopIteration,
    TypeError,
    ValueError,
}

impl ExcKind {
    /// Checks if this exception kind is a subclass of another kind.
    ///
    /// Implements the hierarchy used by `except` matching: `BaseException`
    /// catches everything, `Exception` catches everything else, and the
    /// intermediate classes (`ArithmeticError`, `LookupError`, `NameError`,
    /// `RuntimeError`) catch their subclasses.
    ///
    /// Returns true if `self` would be caught by `except handler_kind:`.
    #[must_use]
    pub fn is_subclass_of(self, handler_kind: Self) -> bool {
        if self == handler_kind {
            return true;
        }
        match handler_kind {
            Self::BaseException => true,
            Self::Exception => self != Self::BaseException,
            Self::ArithmeticError => matches!(self, Self::ZeroDivisionError | Self::OverflowError),
            Self::LookupError => matches!(self, Self::IndexError | Self::KeyError),
            Self::NameError => matches!(self, Self::UnboundLocalError),
            Self::RuntimeError => matches!(self, Self::RecursionError | Self::NotImplementedError),
            _ => false,
        }
    }
}

/// One traceback entry.
///
/// Accumulated on a [`VmException`] as it propagates outward through
/// frames, so the innermost frame comes first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracebackFrame {
    /// Source filename of the code object that was executing.
    pub filename: String,
    /// Name of the code object (function name, or `<module>`).
    pub code_name: String,
    /// Source line of the instruction that raised or propagated.
    pub line: u32,
}

/// A runtime exception value.
///
/// This is the payload of the `Raise` unwind reason: the thing `except`
/// handlers match on and `finally` handlers re-raise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmException {
    /// Exception kind, used for `except` matching.
    pub kind: ExcKind,
    /// Human-readable message.
    pub message: String,
    /// Source line where the exception was raised, if known.
    pub line: Option<u32>,
    /// Traceback frames, innermost first.
    pub frames: Vec<TracebackFrame>,
}

impl VmException {
    /// Creates a new exception with no position information yet.
    #[must_use]
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
            frames: Vec::new(),
        }
    }

    /// Records the raising line if none has been recorded yet.
    ///
    /// The innermost position wins; re-raises further out must not
    /// overwrite it.
    pub fn set_line_once(&mut self, line: u32) {
        if self.line.is_none() {
            self.line = Some(line);
        }
    }

    /// Appends a traceback frame as the exception propagates out of a frame.
    pub fn record_frame(&mut self, filename: &str, code_name: &str, line: u32) {
        self.frames.push(TracebackFrame {
            filename: filename.to_owned(),
            code_name: code_name.to_owned(),
            line,
        });
    }
}

impl Display for VmException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// Terminal outcome of running a frame, or a defect in the host system.
///
/// `Exc` is the normal contract (an uncaught user-level exception);
/// everything else indicates misuse or a bug and is never silently
/// recovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunError {
    /// An uncaught user-level exception propagated out of the frame.
    Exc(Box<VmException>),
    /// The bytecode or the value/block stacks are in an impossible state.
    ///
    /// Indicates an assembler bug or hand-corrupted bytecode; never
    /// produced by well-formed input.
    Corruption(String),
    /// `advance()` was called on a generator that is already executing.
    AlreadyRunning,
    /// An internal invariant of the interpreter itself was violated.
    Internal(String),
}

impl RunError {
    /// Shorthand for raising a typed exception.
    #[must_use]
    pub fn exc(kind: ExcKind, message: impl Into<String>) -> Self {
        Self::Exc(Box::new(VmException::new(kind, message)))
    }

    /// Shorthand for a bytecode-corruption error.
    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption(message.into())
    }

    /// Shorthand for an internal invariant violation.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exc(exc) => write!(f, "{exc}"),
            Self::Corruption(msg) => write!(f, "bytecode corruption: {msg}"),
            Self::AlreadyRunning => write!(f, "generator already executing"),
            Self::Internal(msg) => write!(f, "internal interpreter error: {msg}"),
        }
    }
}

impl std::error::Error for RunError {}

/// Failure modes of [`CodeAssembler::assemble`](crate::CodeAssembler::assemble).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssembleError {
    /// A resolved jump operand exceeds the encodable range.
    ///
    /// Not recoverable locally: the source function is too large to compile
    /// as one unit and must be restructured by the caller.
    CodeTooLarge {
        /// Name of the code object being assembled.
        code_name: String,
        /// The operand value that did not fit.
        operand: u64,
    },
    /// A bug in the component driving emission (malformed jump resolution,
    /// a `MakeClosure` with no preceding code constant, an unencodable
    /// constant). Never caused by user input.
    Internal(String),
}

impl Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CodeTooLarge { code_name, operand } => {
                write!(f, "code object '{code_name}' too large: operand {operand} exceeds encodable range")
            }
            Self::Internal(msg) => write!(f, "internal compiler error: {msg}"),
        }
    }
}

impl std::error::Error for AssembleError {}

//! Goat runtime error taxonomy.
//!
//! The set is small and closed: property-store status codes that bubble up to
//! the `VAR` / `CONST` / `STORE` executors, the runtime faults that halt the
//! interpreter, and the bytecode-container errors raised by the image reader.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Property-store status codes
// ---------------------------------------------------------------------------

/// Outcome of `add_property` / `set_property`. The executors inspect these to
/// decide the next action (e.g. `STORE` turns `NotFound` into a declaration).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropError {
    /// The target object forbids mutation (singletons, built-in prototypes,
    /// numbers, strings, functions).
    ImmutableObject,
    /// `add_property` on a key that is already present.
    AlreadyExists,
    /// `set_property` on a key that is absent.
    NotFound,
    /// `set_property` on a key that was declared constant.
    IsConstant,
}

impl PropError {
    /// Attach the offending key's printable form, producing a runtime fault.
    pub fn into_vm_error(self, key: impl Into<String>) -> VmError {
        let key = key.into();
        match self {
            PropError::ImmutableObject => VmError::ImmutableObject,
            PropError::AlreadyExists => VmError::PropertyAlreadyExists(key),
            PropError::NotFound => VmError::PropertyNotFound(key),
            PropError::IsConstant => VmError::PropertyIsConstant(key),
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime faults
// ---------------------------------------------------------------------------

/// A fault that halts the interpreter with a non-zero exit status.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    #[error("cannot modify an immutable object")]
    ImmutableObject,
    #[error("property '{0}' already exists")]
    PropertyAlreadyExists(String),
    #[error("property '{0}' not found")]
    PropertyNotFound(String),
    #[error("property '{0}' is constant")]
    PropertyIsConstant(String),
    #[error("bad bytecode: {0}")]
    BadBytecode(#[from] BadBytecode),
    #[error("operation '{op}' not supported between {left} and {right}")]
    OperationUnsupported {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
    #[error("a {0} object is not callable")]
    NotCallable(&'static str),
}

impl VmError {
    /// Process exit status for this fault. Zero is reserved for success.
    pub fn exit_code(&self) -> i32 {
        match self {
            VmError::BadBytecode(_) => 2,
            VmError::ImmutableObject => 3,
            VmError::PropertyAlreadyExists(_) => 4,
            VmError::PropertyNotFound(_) => 5,
            VmError::PropertyIsConstant(_) => 6,
            VmError::OperationUnsupported { .. } | VmError::NotCallable(_) => 7,
        }
    }
}

/// An ill-formed instruction stream. Always terminal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BadBytecode {
    #[error("instruction pointer {0} out of range")]
    IpOutOfRange(usize),
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("too many ARG words before one instruction")]
    ScratchOverflow,
    #[error("instruction requires a preceding ARG word")]
    MissingArg,
    #[error("data descriptor {0} out of range")]
    BadDescriptor(u32),
    #[error("malformed string literal in data descriptor {0}")]
    BadLiteral(u32),
    #[error("pop from an empty data stack")]
    StackUnderflow,
    #[error("no enclosing scope to leave")]
    NoScope,
    #[error("return outside of a function call")]
    ReturnOutsideCall,
}

// ---------------------------------------------------------------------------
// Bytecode container errors
// ---------------------------------------------------------------------------

/// Raised while loading a bytecode container, before execution starts.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("cannot read bytecode file: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad signature (expected \"goat v.1\")")]
    BadSignature,
    #[error("bytecode container truncated")]
    Truncated,
    #[error("section offsets out of order or out of range")]
    BadLayout,
}

//! Error types for the bridge.

use thiserror::Error;

/// Errors that can occur while driving a sandboxed module.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A host value cannot be expressed as a tagged value.
    #[error("unsupported value type: {0}")]
    UnsupportedValueType(String),

    /// No global function is registered under the name.
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// A global function with this name already exists.
    #[error("global function already registered: {0}")]
    AlreadyRegistered(String),

    /// The foreign module reported a failure.
    #[error("{kind}: {message}")]
    ForeignError { kind: String, message: String },

    /// A host callback failed while being called from the foreign module.
    #[error("CallbackError: {message}")]
    CallbackError { message: String },

    /// The object is not attached to the current scope.
    #[error("object is not attached to the current scope")]
    NotFound,

    /// The object is attached more than once to the current scope.
    #[error("object is attached to the current scope more than once")]
    DuplicateAttachment,

    /// A scope operation ran with no open scope.
    #[error("no open scope")]
    NoOpenScope,

    /// `move_to_parent` ran with fewer than two open scopes.
    #[error("no parent scope to move into")]
    NoParentScope,

    /// The handle has already been disposed.
    #[error("handle {0:#x} has already been disposed")]
    DisposedHandle(u32),

    /// A callback argument needs ownership conversion while the module is
    /// resuming from a suspend point.
    #[error("cannot convert {0} argument while resuming a suspended call")]
    IllegalArgumentInSuspendedContext(&'static str),

    /// A foreign call suspended outside `call_async`.
    #[error("foreign call suspended outside of an asynchronous call")]
    SuspendedOutsideAsync,

    /// The sandbox does not support suspension.
    #[error("sandbox does not support suspension: {0}")]
    SuspensionUnsupported(String),

    /// The suspension protocol was driven into an invalid state.
    #[error("invalid suspension state: {0}")]
    Suspension(String),

    /// The wire record carries a tag this bridge does not know.
    #[error("unknown type tag {0}")]
    UnknownTag(u32),

    /// A value had a different type than the caller expected.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// A memory access fell outside the sandbox's linear memory.
    #[error("sandbox memory access out of bounds: {addr:#x}+{len}")]
    OutOfBounds { addr: u32, len: usize },

    /// The sandbox engine failed (trap, missing export, instantiation).
    #[error("sandbox error: {0}")]
    Sandbox(String),
}

impl Error {
    /// Build a sandbox error from an engine error.
    pub fn sandbox(e: impl std::fmt::Display) -> Self {
        Error::Sandbox(e.to_string())
    }

    /// Split into the `{kind, message}` pair written to the foreign error
    /// channel.
    pub fn kind_and_message(&self) -> (String, String) {
        match self {
            Error::ForeignError { kind, message } => (kind.clone(), message.clone()),
            Error::CallbackError { message } => ("CallbackError".to_string(), message.clone()),
            other => ("CallbackError".to_string(), other.to_string()),
        }
    }

    /// Rebuild a host error from a foreign `{kind, message}` pair.
    pub fn from_foreign(kind: String, message: String) -> Self {
        if kind == "CallbackError" {
            Error::CallbackError { message }
        } else {
            Error::ForeignError { kind, message }
        }
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

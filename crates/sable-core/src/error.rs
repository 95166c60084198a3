use crate::device::Device;
use crate::shape::Shape;

/// All errors that can occur within Sable.
///
/// Structural failures (shape, device, layout mismatch and unimplemented
/// paths) abort the operation before anything observable is mutated.
/// A busy storage is not an error: `TensorStorage::copy` reports it as
/// `Ok(false)` so callers can retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operand shapes are incompatible for the requested operation.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operands reside on different devices.
    #[error("device mismatch: expected {expected}, got {got}")]
    DeviceMismatch { expected: Device, got: Device },

    /// Dense/sparse layout mismatch where no conversion applies.
    #[error("type mismatch: expected {expected} storage, got {got}")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },

    /// A code path that exists in the API but is not realized.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),

    /// The memory pool or accelerator could not satisfy a request.
    #[error("allocation of {requested} elements failed: {reason}")]
    Allocation { requested: usize, reason: String },

    /// Unknown registry key.
    #[error("{kind} with key {key} not found")]
    NotFound { kind: &'static str, key: usize },

    /// A shape with no dimensions or with a zero extent.
    #[error("invalid shape {0:?}: dimension count and every extent must be positive")]
    InvalidShape(Vec<usize>),

    /// An argument violates an operation's precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure reported by an accelerator runtime.
    #[error("accelerator error: {0}")]
    Accelerator(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn invalid_argument(s: impl Into<String>) -> Self {
        Error::InvalidArgument(s.into())
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Error::Msg(format!("{what} lock poisoned"))
    }
}

/// Convenience Result type used throughout Sable.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

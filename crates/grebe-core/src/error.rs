//! Status codes returned by engine operations.
//!
//! Every public operation returns `Result<T, Error>`. Errors are plain
//! values; nothing in the engine unwinds. Kernel-not-applicable signals
//! (a specialized worker declining a type/op combination) are internal to
//! the dispatchers and never appear here.

/// Errors produced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An allocation failed. Carries the context of the allocation site.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Operator and operand types cannot be combined, even with typecasting.
    #[error("domain mismatch: {0}")]
    DomainMismatch(String),

    /// Matrix dimensions are not compatible for the requested operation.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A matrix or serialized payload violates its structural invariants.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// A required argument was absent.
    #[error("null pointer: {0}")]
    NullPointer(String),

    /// An argument value is out of range (index past a dimension, bad
    /// descriptor option, malformed thunk).
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// An object was used before being fully constructed.
    #[error("uninitialized object: {0}")]
    UninitializedObject(String),

    /// The operation's context was cancelled. No user-visible output was
    /// modified.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::DimensionMismatch("output is 2-by-2, input is 3-by-2".into());
        assert_eq!(
            err.to_string(),
            "dimension mismatch: output is 2-by-2, input is 3-by-2"
        );
        assert_eq!(Error::Cancelled.to_string(), "operation cancelled");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}

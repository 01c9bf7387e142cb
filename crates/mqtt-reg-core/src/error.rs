//! Error types shared by registers, collections, and stores.

/// Errors raised by a durable key-value store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The storage backend failed
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors raised while converting a value to or from its stored bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Value has no numeric representation
    #[error("expected a number, got {0}")]
    NotANumber(String),

    /// Stored value has the wrong width
    #[error("expected {expected} bytes, got {actual}")]
    Length {
        /// Width the codec requires
        expected: usize,
        /// Width found in the store
        actual: usize,
    },

    /// JSON serialization failed
    #[error("invalid JSON: {0}")]
    Json(String),
}

/// Errors raised by register operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegisterError {
    /// Attempt to mutate a read-only register
    #[error("register '{name}' is read-only")]
    ReadOnly {
        /// Register name
        name: String,
    },

    /// Lookup of a name that was never declared
    #[error("unknown register '{name}'")]
    Unknown {
        /// Register name
        name: String,
    },

    /// Two registers declared with the same name in one collection
    #[error("register '{name}' declared more than once")]
    Duplicate {
        /// Register name
        name: String,
    },

    /// Value could not be converted to or from its stored representation
    #[error("codec error for register '{name}': {source}")]
    Codec {
        /// Register name
        name: String,
        /// Underlying codec failure
        #[source]
        source: CodecError,
    },

    /// Durable store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

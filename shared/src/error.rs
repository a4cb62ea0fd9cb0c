/*!
Common error types for the device link pipeline.

Every component has its own error enum next to its code; [`SharedError`]
wraps them so callers crossing component boundaries can use `?` throughout.
None of these are fatal: the worst outcome is a device moving to
`Disconnected`.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, SharedError>;

/// Comprehensive error type for all shared operations
#[derive(Error, Debug)]
pub enum SharedError {
    /// Malformed wire telegram
    #[error("Framing error: {0}")]
    Framing(#[from] crate::telegram::FramingError),

    /// Payload does not cover the catalog layout
    #[error("Signal range error: {0}")]
    SignalRange(#[from] crate::signal::SignalRangeError),

    /// Physical values cannot be packed into the message
    #[error("Signal encode error: {0}")]
    SignalEncode(#[from] crate::signal::SignalEncodeError),

    /// Unsupported command or invalid command arguments
    #[error("Command error: {0}")]
    Command(#[from] crate::semantic::CommandError),

    /// Device state store rejected the operation
    #[error("Device state error: {0}")]
    Store(#[from] crate::state::StoreError),

    /// Invalid message catalog or device profile
    #[error("Catalog error: {0}")]
    Catalog(#[from] crate::catalog::CatalogError),

    /// I/O errors (profile files, transports)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Profile file could not be parsed
    #[error("Profile parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SharedError {
    /// True when the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(crate::state::StoreError::CommandBusy { .. }))
    }
}

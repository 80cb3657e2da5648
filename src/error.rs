use std::io;
use thiserror::Error;

/// Main error type for remotefs operations
///
/// Every backend reports failures through this taxonomy regardless of the
/// protocol behind it. Protocol-native errors are translated at the adapter
/// boundary where a clear mapping exists and otherwise pass through as
/// [`RemoteFsError::Transport`] with their original message.
#[derive(Error, Debug)]
pub enum RemoteFsError {
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Not allowed: {0}")]
    NotAllowed(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl RemoteFsError {
    /// Status code the host application reports for this error
    pub fn http_status(&self) -> u16 {
        match self {
            RemoteFsError::AuthenticationFailed => 401,
            RemoteFsError::NotFound(_) => 404,
            RemoteFsError::PermissionDenied => 403,
            RemoteFsError::NotAllowed(_) => 403,
            RemoteFsError::NotImplemented(_) => 501,
            RemoteFsError::Transport(_) => 409,
            RemoteFsError::Io(_) => 500,
            RemoteFsError::Config(_) => 500,
            RemoteFsError::InvalidArgument(_) => 400,
        }
    }
}

/// Result type alias for remotefs operations
pub type Result<T> = std::result::Result<T, RemoteFsError>;

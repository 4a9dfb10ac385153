use std::fmt;

use thiserror::Error;

/// Closed set of outcomes every client operation maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// The operation completed.
    Success,
    /// The directory answered that the entity does not exist or is unhealthy.
    NotFound,
    /// The caller supplied invalid arguments or configuration. No network call was made.
    InvalidArgs,
    /// No directory address produced a usable answer.
    NoDirectoryAvailable,
    /// The directory rejected the request or answered with an unexpected body.
    ServerError,
    /// A response could not be decoded.
    ProtocolError,
    /// The host to announce could not be resolved to an IP address.
    DnsResolveError,
    /// The client was disabled after failing to find any working directory.
    Disabled,
}

impl ResultCode {
    /// Stable, lowercase name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::NotFound => "not-found",
            ResultCode::InvalidArgs => "invalid-args",
            ResultCode::NoDirectoryAvailable => "no-directory-available",
            ResultCode::ServerError => "server-error",
            ResultCode::ProtocolError => "protocol-error",
            ResultCode::DnsResolveError => "dns-resolve-error",
            ResultCode::Disabled => "disabled",
        }
    }

    /// Maps the outcome of any client operation onto its code.
    pub fn of<T>(result: &Result<T>) -> ResultCode {
        match result {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types that can be produced by the discovery client.
#[derive(Error, Debug)]
pub enum SvcDirError {
    /// Arguments rejected before any network call.
    #[error("Invalid argument: {0}")]
    InvalidArgs(String),

    /// The directory reports that the entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Every directory address failed or none could be located.
    #[error("No directory available: {0}")]
    NoDirectoryAvailable(String),

    /// The directory rejected the request.
    #[error("Server error: {0}")]
    ServerError(String),

    /// A directory response could not be decoded.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Forward resolution of an announced host failed.
    #[error("DNS resolution failed for '{host}': {reason}")]
    DnsResolve { host: String, reason: String },

    /// The client gave up on discovery after its first attempt found no directory.
    #[error("Discovery client is disabled")]
    Disabled,

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Configuration files that are not valid JSON.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Malformed URLs (healthcheck or directory).
    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),
}

impl SvcDirError {
    /// The result code this error surfaces as.
    pub fn code(&self) -> ResultCode {
        match self {
            SvcDirError::InvalidArgs(_)
            | SvcDirError::ConfigError(_)
            | SvcDirError::IoError(_)
            | SvcDirError::JsonError(_)
            | SvcDirError::UrlError(_) => ResultCode::InvalidArgs,
            SvcDirError::NotFound(_) => ResultCode::NotFound,
            SvcDirError::NoDirectoryAvailable(_) => ResultCode::NoDirectoryAvailable,
            SvcDirError::ServerError(_) => ResultCode::ServerError,
            SvcDirError::ProtocolError(_) => ResultCode::ProtocolError,
            SvcDirError::DnsResolve { .. } => ResultCode::DnsResolveError,
            SvcDirError::Disabled => ResultCode::Disabled,
        }
    }
}

/// Result type for the discovery client.
pub type Result<T> = std::result::Result<T, SvcDirError>;

use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the smartproxy application
#[derive(Error, Debug)]
pub enum ProxyError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid backend address: {0}")]
    InvalidBackendAddress(String),

    #[error("No usable SSH credential, add a password or generate ssh keys")]
    NoCredentials,

    // Backend tunnel errors
    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Backend reconnect failed: {0}")]
    ReconnectFailed(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for smartproxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 405 Method Not Allowed
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,

            // 504 Gateway Timeout
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            ProxyError::InvalidConfig(_)
            | ProxyError::InvalidBackendAddress(_)
            | ProxyError::NoCredentials
            | ProxyError::Ssh(_)
            | ProxyError::ReconnectFailed(_)
            | ProxyError::Tunnel(_)
            | ProxyError::Io(_)
            | ProxyError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Configuration errors are fatal at startup, everything else is
    /// recoverable per request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::InvalidConfig(_)
                | ProxyError::InvalidBackendAddress(_)
                | ProxyError::NoCredentials
        )
    }
}

// Convert from hyper errors
impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        ProxyError::InvalidBackendAddress(err.to_string())
    }
}

impl From<russh::Error> for ProxyError {
    fn from(err: russh::Error) -> Self {
        ProxyError::Ssh(err.to_string())
    }
}

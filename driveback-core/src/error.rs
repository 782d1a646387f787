use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("backend returned an error: {0}")]
    Backend(String),
    #[error("backend is temporarily unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    NotFound,
    Transient,
    Permanent,
}

impl ConnectorError {
    pub fn classification(&self) -> ErrorClass {
        match self {
            ConnectorError::NotAuthenticated(_) => ErrorClass::Auth,
            ConnectorError::NotFound(_) => ErrorClass::NotFound,
            ConnectorError::Unavailable(_) => ErrorClass::Transient,
            ConnectorError::Io(err) => classify_io(err),
            ConnectorError::InvalidPath(_) | ConnectorError::Backend(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification() == ErrorClass::Transient
    }
}

fn classify_io(err: &io::Error) -> ErrorClass {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorClass::NotFound,
        io::ErrorKind::PermissionDenied => ErrorClass::Auth,
        io::ErrorKind::Interrupted
        | io::ErrorKind::TimedOut
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

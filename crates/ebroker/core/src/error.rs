use std::path::PathBuf;

use thiserror::Error;

use crate::codes::ProvCode;

/// How a backend client call went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Throttling, connection resets and other hiccups worth retrying.
    Transient,
    /// The call exceeded the provider-specific timeout.
    Timeout,
    /// The backend refused the call.
    Rejected,
    /// The backend answered with something we could not parse.
    Unrecognized,
    /// The backend answered with nothing.
    Empty,
}

/// Failure raised by a backend client. Never crosses the gateway: the
/// lifecycle turns it into a registry code.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} backend error: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        BackendError { kind, message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transient, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Timeout, message)
    }

    pub fn unrecognized(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unrecognized, message)
    }

    /// The call may have taken effect on the backend even though it failed.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self.kind, BackendErrorKind::Timeout | BackendErrorKind::Unrecognized)
    }

    /// Code attached when this error surfaces while polling a request.
    pub fn poll_code(&self) -> Option<ProvCode> {
        match self.kind {
            BackendErrorKind::Transient | BackendErrorKind::Timeout => None,
            BackendErrorKind::Rejected => Some(ProvCode::ErrBackendResponse),
            BackendErrorKind::Unrecognized => Some(ProvCode::UnrecognizedBackendResponse),
            BackendErrorKind::Empty => Some(ProvCode::Empty),
        }
    }
}

impl From<String> for BackendError {
    fn from(message: String) -> Self {
        BackendError::new(BackendErrorKind::Rejected, message)
    }
}

impl From<&str> for BackendError {
    fn from(message: &str) -> Self {
        BackendError::new(BackendErrorKind::Rejected, message)
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("error code registry is malformed: {0}")]
    RegistryIntegrity(String),

    /// A verb refused its input; rendered through the registry.
    #[error("{code}: {detail}")]
    Refused { code: ProvCode, detail: String },

    #[error("request '{0}' is held by another invocation")]
    LockTimeout(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl BrokerError {
    pub fn refused(code: ProvCode, detail: impl Into<String>) -> Self {
        BrokerError::Refused { code, detail: detail.into() }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BrokerError::Io { path: path.into(), source }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        BrokerError::Json { path: path.into(), source }
    }

    /// Registry code reported to the resource manager for this failure.
    pub fn code(&self) -> ProvCode {
        match self {
            BrokerError::Refused { code, .. } => *code,
            BrokerError::RegistryIntegrity(_) | BrokerError::LockTimeout(_) => ProvCode::ErrInner,
            BrokerError::Io { .. } => ProvCode::ErrReadFile,
            BrokerError::Json { .. } => ProvCode::BadJsonFile,
        }
    }

    pub fn detail(&self) -> String {
        match self {
            BrokerError::Refused { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }
}

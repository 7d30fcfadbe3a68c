//! Typed error types for the acquisition core.
//!
//! Three layers, one per concern:
//! - [`BackendFailure`]: why a single backend attempt failed. The orchestrator
//!   logs and swallows these while falling through to the next backend.
//! - [`StoreError`]: filesystem and artifact validation failures. Always surfaced.
//! - [`AcquisitionError`]: what callers of `acquire` and the queue see.
//!
//! Error codes are designed for frontend programmatic handling:
//! - `E_VAL_*`: Validation errors (user can fix input)
//! - `E_IO_*`: File system errors
//! - `E_DL_*`: Download errors (may be retryable)
//! - `E_NET_*`: Network errors (often retryable)
//! - `E_Q_*`: Queue errors
//! - `E_INT_*`: Internal errors (should be reported)

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::downloader::BackendKind;

/// Error codes for frontend programmatic handling.
/// These provide stable identifiers that don't change with message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (E_VAL_*)
    EValInvalidSource,
    EValInvalidSettings,

    // IO errors (E_IO_*)
    EIoWriteFailed,
    EIoNotFound,
    EIoPermissionDenied,
    EIoStorageFull,

    // Download errors (E_DL_*)
    EDlAllBackendsFailed,
    EDlCorruptArtifact,
    EDlCancelled,
    EDlDisabled,

    // Network errors (E_NET_*)
    ENetConnectionFailed,
    ENetTimeout,
    ENetRejected,

    // Queue errors (E_Q_*)
    EQueueDuplicate,
    EQueueNotFound,

    // Internal errors (E_INT_*)
    EInternal,
}

impl ErrorCode {
    /// Returns whether this error is typically retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ENetConnectionFailed
                | Self::ENetTimeout
                | Self::ENetRejected
                | Self::EDlAllBackendsFailed
                | Self::EDlCorruptArtifact
        )
    }

    /// Returns the error code as a string (e.g., "E_VAL_INVALID_SOURCE").
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EValInvalidSource => "E_VAL_INVALID_SOURCE",
            Self::EValInvalidSettings => "E_VAL_INVALID_SETTINGS",
            Self::EIoWriteFailed => "E_IO_WRITE_FAILED",
            Self::EIoNotFound => "E_IO_NOT_FOUND",
            Self::EIoPermissionDenied => "E_IO_PERMISSION_DENIED",
            Self::EIoStorageFull => "E_IO_STORAGE_FULL",
            Self::EDlAllBackendsFailed => "E_DL_ALL_BACKENDS_FAILED",
            Self::EDlCorruptArtifact => "E_DL_CORRUPT_ARTIFACT",
            Self::EDlCancelled => "E_DL_CANCELLED",
            Self::EDlDisabled => "E_DL_DISABLED",
            Self::ENetConnectionFailed => "E_NET_CONNECTION_FAILED",
            Self::ENetTimeout => "E_NET_TIMEOUT",
            Self::ENetRejected => "E_NET_REJECTED",
            Self::EQueueDuplicate => "E_Q_DUPLICATE",
            Self::EQueueNotFound => "E_Q_NOT_FOUND",
            Self::EInternal => "E_INTERNAL",
        }
    }
}

/// Failure of one backend attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendFailure {
    /// Transport-level failure (connect, TLS, body read).
    #[error("{backend} network error: {message}")]
    Network { backend: BackendKind, message: String },

    /// The request or the overall polling budget ran out of time.
    #[error("{backend} timed out: {message}")]
    Timeout { backend: BackendKind, message: String },

    /// The remote side answered with a structured error.
    #[error("{backend} rejected the request: {message}")]
    Rejected { backend: BackendKind, message: String },

    /// The local agent reported a status value outside the protocol.
    #[error("{backend} reported unknown status '{status}'")]
    UnknownStatus { backend: BackendKind, status: String },

    /// Polling gave up after the configured number of status requests.
    #[error("{backend} gave up after {attempts} status polls")]
    PollLimitReached { backend: BackendKind, attempts: u32 },

    /// The backend cannot produce media for this source.
    #[error("{backend} cannot acquire media: {reason}")]
    Unsupported { backend: BackendKind, reason: String },

    /// The backend failed to touch its scratch space.
    #[error("{backend} io error: {message}")]
    Io { backend: BackendKind, message: String },

    #[error("{backend} attempt cancelled")]
    Cancelled { backend: BackendKind },
}

impl BackendFailure {
    /// The backend that produced this failure.
    pub fn backend(&self) -> BackendKind {
        match self {
            Self::Network { backend, .. }
            | Self::Timeout { backend, .. }
            | Self::Rejected { backend, .. }
            | Self::UnknownStatus { backend, .. }
            | Self::PollLimitReached { backend, .. }
            | Self::Unsupported { backend, .. }
            | Self::Io { backend, .. }
            | Self::Cancelled { backend } => *backend,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Classify a reqwest error into network vs. timeout.
    pub fn from_reqwest(backend: BackendKind, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                backend,
                message: err.to_string(),
            }
        } else {
            Self::Network {
                backend,
                message: err.to_string(),
            }
        }
    }

    pub fn rejected(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::Rejected {
            backend,
            message: message.into(),
        }
    }

    pub fn unsupported(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            backend,
            reason: reason.into(),
        }
    }

    fn code(&self) -> ErrorCode {
        match self {
            Self::Network { .. } | Self::Io { .. } => ErrorCode::ENetConnectionFailed,
            Self::Timeout { .. } | Self::PollLimitReached { .. } => ErrorCode::ENetTimeout,
            Self::Rejected { .. } | Self::UnknownStatus { .. } | Self::Unsupported { .. } => ErrorCode::ENetRejected,
            Self::Cancelled { .. } => ErrorCode::EDlCancelled,
        }
    }
}

/// Why a file on disk does not count as a playable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("file does not exist")]
    Missing,

    #[error("path is not a regular file")]
    NotAFile,

    #[error("file is {size} bytes, expected more than {min}")]
    TooSmall { size: u64, min: u64 },

    #[error("extension '{extension}' is not allowed")]
    DisallowedExtension { extension: String },
}

/// Filesystem-level failures of the artifact store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The file was written but failed post-write validation and has been removed.
    #[error("corrupt artifact at {}: {reason}", path.display())]
    CorruptArtifact { path: PathBuf, reason: ValidationFailure },

    #[error("identifier '{0}' cannot be used as a file name")]
    InvalidIdentifier(String),

    #[error("path {} is not an artifact in the artifact directory", .0.display())]
    OutsideStore(PathBuf),
}

impl StoreError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    fn code(&self) -> ErrorCode {
        match self {
            Self::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::EIoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::EIoPermissionDenied,
                std::io::ErrorKind::StorageFull => ErrorCode::EIoStorageFull,
                _ => ErrorCode::EIoWriteFailed,
            },
            Self::CorruptArtifact { .. } => ErrorCode::EDlCorruptArtifact,
            Self::InvalidIdentifier(_) | Self::OutsideStore(_) => ErrorCode::EInternal,
        }
    }
}

/// Kinds of queue errors. Use this to classify queue failures
/// in a stable, machine-readable way instead of probing message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueueErrorKind {
    Duplicate,
    NotFound,
}

/// Unified error type returned to callers of the acquisition core.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("invalid source reference: {0}")]
    InvalidSource(String),

    /// Terminal: every backend failed. Carries the most recent backend's reason.
    #[error("all download backends failed; last error: {last}")]
    AllBackendsFailed { last: BackendFailure },

    /// A backend succeeded but the stored file was unusable and has been evicted.
    #[error("downloaded artifact failed validation: {reason}")]
    CorruptArtifact { path: PathBuf, reason: ValidationFailure },

    #[error(transparent)]
    Store(StoreError),

    #[error("acquisition cancelled")]
    Cancelled,

    #[error("video downloads are disabled in settings")]
    DownloadsDisabled,

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("queue error ({kind:?}): {message}")]
    Queue { kind: QueueErrorKind, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AcquisitionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CorruptArtifact { path, reason } => Self::CorruptArtifact { path, reason },
            other => Self::Store(other),
        }
    }
}

/// Structured error for frontend consumption.
/// Contains both human-readable message and machine-readable code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrontendError {
    /// Machine-readable error code (e.g., "E_VAL_INVALID_SOURCE")
    pub code: &'static str,
    /// Human-readable error message
    pub message: String,
    /// Whether the operation can be retried
    pub retryable: bool,
}

impl AcquisitionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidSource(_) => ErrorCode::EValInvalidSource,
            Self::AllBackendsFailed { .. } => ErrorCode::EDlAllBackendsFailed,
            Self::CorruptArtifact { .. } => ErrorCode::EDlCorruptArtifact,
            Self::Store(err) => err.code(),
            Self::Cancelled => ErrorCode::EDlCancelled,
            Self::DownloadsDisabled => ErrorCode::EDlDisabled,
            Self::InvalidSettings(_) => ErrorCode::EValInvalidSettings,
            Self::Queue { kind, .. } => match kind {
                QueueErrorKind::Duplicate => ErrorCode::EQueueDuplicate,
                QueueErrorKind::NotFound => ErrorCode::EQueueNotFound,
            },
            Self::Internal(_) => ErrorCode::EInternal,
        }
    }

    /// Convert to a structured frontend error.
    pub fn to_frontend_error(&self) -> FrontendError {
        let code = self.code();
        FrontendError {
            code: code.as_str(),
            message: self.to_string(),
            retryable: code.is_retryable(),
        }
    }

    /// Convert to JSON string for frontend consumption.
    pub fn to_frontend_json(&self) -> String {
        serde_json::to_string(&self.to_frontend_error()).unwrap_or_else(|_| self.to_string())
    }

    pub fn queue_duplicate(message: impl Into<String>) -> Self {
        Self::Queue {
            kind: QueueErrorKind::Duplicate,
            message: message.into(),
        }
    }

    pub fn queue_not_found(message: impl Into<String>) -> Self {
        Self::Queue {
            kind: QueueErrorKind::NotFound,
            message: message.into(),
        }
    }

    /// Error code of the backend failure that ended the cascade, if any.
    pub fn last_backend_code(&self) -> Option<ErrorCode> {
        match self {
            Self::AllBackendsFailed { last } => Some(last.code()),
            _ => None,
        }
    }
}

impl From<AcquisitionError> for String {
    fn from(err: AcquisitionError) -> String {
        err.to_string()
    }
}

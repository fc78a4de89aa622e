//! Error taxonomy for appliance import.
//!
//! Errors fall into three phases:
//!
//! ```text
//! parse      Format, ManifestMismatch, MissingFile     fatal, nothing created yet
//! interpret  UnsupportedHardware                        recoverable, item skipped
//! import     StorageIo, Cancelled, Registration         fatal to one virtual system
//! ```
//!
//! `Rollback` only ever appears inside rollback reports; it is never returned
//! to an import caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ImportResult<T> = Result<T, ImportError>;

/// Errors raised while reading, interpreting or importing an appliance.
///
/// Service-originated variants carry the result code reported by the
/// underlying registry or storage backend, when there is one.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportError {
    /// Descriptor is malformed or structurally incomplete.
    #[error("format error: {0}")]
    Format(String),

    /// A file's checksum does not match the manifest.
    #[error("manifest mismatch: {0}")]
    ManifestMismatch(String),

    /// A file referenced by the descriptor is absent.
    #[error("missing file: {0}")]
    MissingFile(String),

    /// Hardware resource of a kind the importer does not handle.
    #[error("unsupported hardware: {0}")]
    UnsupportedHardware(String),

    #[error("storage I/O error: {message}")]
    StorageIo {
        message: String,
        result_code: Option<i32>,
    },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("registration error: {message}")]
    Registration {
        message: String,
        result_code: Option<i32>,
    },

    /// Failure of a single undo step.
    #[error("rollback error: {0}")]
    Rollback(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable numeric codes, one per error kind. Zero means success.
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const FORMAT: i32 = -1;
    pub const MANIFEST_MISMATCH: i32 = -2;
    pub const MISSING_FILE: i32 = -3;
    pub const UNSUPPORTED_HARDWARE: i32 = -4;
    pub const STORAGE_IO: i32 = -5;
    pub const CANCELLED: i32 = -6;
    pub const REGISTRATION: i32 = -7;
    pub const ROLLBACK: i32 = -8;
    pub const INVALID_STATE: i32 = -9;
    pub const INVALID_ARGUMENT: i32 = -10;
    pub const NOT_FOUND: i32 = -11;
    pub const DATABASE: i32 = -12;
    pub const CONFIG: i32 = -13;
    pub const INTERNAL: i32 = -14;
}

impl ImportError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageIo {
            message: message.into(),
            result_code: None,
        }
    }

    pub fn storage_with_code(message: impl Into<String>, result_code: i32) -> Self {
        Self::StorageIo {
            message: message.into(),
            result_code: Some(result_code),
        }
    }

    pub fn registration(message: impl Into<String>) -> Self {
        Self::Registration {
            message: message.into(),
            result_code: None,
        }
    }

    pub fn registration_with_code(message: impl Into<String>, result_code: i32) -> Self {
        Self::Registration {
            message: message.into(),
            result_code: Some(result_code),
        }
    }

    /// Numeric code identifying the error kind.
    pub fn code(&self) -> i32 {
        match self {
            Self::Format(_) => codes::FORMAT,
            Self::ManifestMismatch(_) => codes::MANIFEST_MISMATCH,
            Self::MissingFile(_) => codes::MISSING_FILE,
            Self::UnsupportedHardware(_) => codes::UNSUPPORTED_HARDWARE,
            Self::StorageIo { .. } => codes::STORAGE_IO,
            Self::Cancelled(_) => codes::CANCELLED,
            Self::Registration { .. } => codes::REGISTRATION,
            Self::Rollback(_) => codes::ROLLBACK,
            Self::InvalidState(_) => codes::INVALID_STATE,
            Self::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            Self::NotFound(_) => codes::NOT_FOUND,
            Self::Database(_) => codes::DATABASE,
            Self::Config(_) => codes::CONFIG,
            Self::Internal(_) => codes::INTERNAL,
        }
    }

    /// Result code reported by the originating service call, if any.
    pub fn result_code(&self) -> Option<i32> {
        match self {
            Self::StorageIo { result_code, .. } | Self::Registration { result_code, .. } => {
                *result_code
            }
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// True for errors raised before anything was created in the registry.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            Self::Format(_) | Self::ManifestMismatch(_) | Self::MissingFile(_)
        )
    }
}

impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        Self::StorageIo {
            message: err.to_string(),
            result_code: err.raw_os_error(),
        }
    }
}

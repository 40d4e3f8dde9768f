//! Datera CSI error code

use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;
use tonic::{Code, Status};

/// Business error name the backend reports for an unknown resource
const API_NOT_FOUND: &str = "NotFoundError";
/// Legacy spelling of `API_NOT_FOUND`
const API_NOT_FOUND_LEGACY: &str = "NotFound";
/// Business error name the backend reports for bad credentials
const API_AUTH_FAILED: &str = "AuthFailedError";
/// Business error name of a rejected request
const API_INVALID_REQUEST: &str = "InvalidRequestError";
/// Code carried by `InvalidRequestError` when the resource identity is taken
const API_CODE_DUPLICATE: i64 = 15;

/// Datera CSI Result type
pub type DateraResult<T> = Result<T, DateraError>;

/// Business error returned by the backend control plane.
/// The backend always answers with a JSON body of this shape on failure.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    /// Error class, e.g. `NotFoundError`
    #[serde(default)]
    pub name: String,
    /// Numeric sub code
    #[serde(default)]
    pub code: i64,
    /// HTTP status the backend attached
    #[serde(default)]
    pub http: u16,
    /// Human readable message
    #[serde(default)]
    pub message: String,
}

impl ApiError {
    /// Build an `ApiError` with name and message
    #[must_use]
    pub fn new(name: &str, code: i64, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            code,
            http: 0,
            message: message.to_owned(),
        }
    }

    /// The requested resource does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.name == API_NOT_FOUND || self.name == API_NOT_FOUND_LEGACY
    }

    /// The resource identity is already taken
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        self.name == API_INVALID_REQUEST && self.code == API_CODE_DUPLICATE
    }

    /// The credentials were refused
    #[must_use]
    pub fn is_auth_failed(&self) -> bool {
        self.name == API_AUTH_FAILED
    }

    /// A duplicate identity error
    #[must_use]
    pub fn duplicate(message: &str) -> Self {
        Self::new(API_INVALID_REQUEST, API_CODE_DUPLICATE, message)
    }

    /// A not found error
    #[must_use]
    pub fn not_found(message: &str) -> Self {
        Self::new(API_NOT_FOUND, 0, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}): {}", self.name, self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Datera CSI error code
#[derive(Error, Debug)]
pub enum DateraError {
    /// Error caused by std::io::Error
    #[error("IoErr, the error is {:?}, context is {:#?}", .source, .context)]
    IoErr {
        /// Error source
        source: std::io::Error,
        /// Context of the error
        context: Vec<String>,
    },

    /// Error caused by serde_json::Error
    #[error("serde_json::Error, the error is {:?}, context is {:#?}", .source, .context)]
    SerdeJsonErr {
        /// Error source
        source: serde_json::Error,
        /// Context of the error
        context: Vec<String>,
    },

    /// Transport failure talking to the backend
    #[error("HttpErr, the error is {:?}, context is {:#?}", .source, .context)]
    HttpErr {
        /// Error source
        source: reqwest::Error,
        /// Context of the error
        context: Vec<String>,
    },

    /// Business error reported by the backend
    #[error("ApiErr, the error is {}, context is {:#?}", .source, .context)]
    ApiErr {
        /// Error source
        source: ApiError,
        /// Context of the error
        context: Vec<String>,
    },

    /// Error caused by nix::Error
    #[error("NixErr, the error is {:?}, context is {:#?}", .source, .context)]
    NixErr {
        /// Error source
        source: nix::Error,
        /// Context of the error
        context: Vec<String>,
    },

    /// Volume is not found
    #[error("Volume ID={} not found, context is {:#?}", .volume_id, .context)]
    VolumeNotFound {
        /// Volume ID
        volume_id: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// Snapshot is not found
    #[error("Snapshot ID={} not found, context is {:#?}", .snapshot_id, .context)]
    SnapshotNotFound {
        /// Snapshot ID
        snapshot_id: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// Volume has already existed
    #[error("Volume ID={} already exists, context is {:#?}", .volume_id, .context)]
    VolumeAlreadyExist {
        /// Volume ID
        volume_id: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// Volume still owns snapshots
    #[error("Volume ID={} has snapshots, context is {:#?}", .volume_id, .context)]
    VolumeHasSnapshots {
        /// Volume ID
        volume_id: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// Snapshot is not ready
    #[error("Snapshot ID={} is not ready, context is {:#?}", .snapshot_id, .context)]
    SnapshotNotReady {
        /// Snapshot ID
        snapshot_id: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// Argument is invalid
    #[error("Argument is invalid, context is {:#?}", .context)]
    ArgumentInvalid {
        /// Context of the error
        context: Vec<String>,
    },

    /// Starting token is invalid
    #[error("Starting token={} is invalid, context is {:#?}", .starting_token, .context)]
    StartingTokenInvalid {
        /// Starting token
        starting_token: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// Argument is out of range
    #[error("Argument is out of range, context is {:#?}", .context)]
    ArgumentOutOfRange {
        /// Context of the error
        context: Vec<String>,
    },

    /// An identical request is already running
    #[error("Operation is still in progress, context is {:#?}", .context)]
    OperationInProgress {
        /// Context of the error
        context: Vec<String>,
    },

    /// A local command exited with failure
    #[error("CommandErr, {:?} failed with output {:?}, context is {:#?}", .command, .output, .context)]
    CommandErr {
        /// The argv joined by space
        command: String,
        /// Combined stdout and stderr
        output: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// Failed to mount
    #[error("MountErr, fail to mount {:?} to {:?}, context is {:#?}", .from, .target, .context)]
    MountErr {
        /// Source to mount
        from: PathBuf,
        /// Mount point
        target: PathBuf,
        /// Context of the error
        context: Vec<String>,
    },

    /// Failed to umount
    #[error("UmountErr, fail to umount {:?}, context is {:#?}", .target, .context)]
    UmountErr {
        /// Mount point to umount
        target: PathBuf,
        /// Context of the error
        context: Vec<String>,
    },

    /// Backend can not be reached or is not healthy
    #[error("Backend unavailable, context is {:#?}", .context)]
    BackendUnavailable {
        /// Context of the error
        context: Vec<String>,
    },

    /// API is not implemented
    #[error("Not implemented, context is {:#?}", .context)]
    Unimplemented {
        /// Context of the error
        context: Vec<String>,
    },
}

/// Add context to `DateraResult`
pub trait Context<T, E> {
    /// Add context to `DateraResult`
    fn add_context<C>(self, ctx: C) -> DateraResult<T>
    where
        C: Into<String>;

    /// Add context to `DateraResult` lazily
    fn with_context<C, F>(self, f: F) -> DateraResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> Context<T, E> for Result<T, E>
where
    E: Into<DateraError>,
{
    #[inline]
    fn add_context<C>(self, ctx: C) -> DateraResult<T>
    where
        C: Into<String>,
    {
        self.map_err(|e| e.into().add_context(ctx))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> DateraResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.into().add_context(f()))
    }
}

impl DateraError {
    /// Add context for `DateraError`
    #[must_use]
    pub fn add_context<C>(mut self, ctx: C) -> Self
    where
        C: Into<String>,
    {
        macro_rules! append_context {
            ($context: ident, [$($target:ident),*]) => {
                match self {
                    $(Self::$target { ref mut context, ..} => {
                        context.push($context.into());
                    },)*
                }
            }
        }
        append_context!(
            ctx,
            [
                IoErr,
                SerdeJsonErr,
                HttpErr,
                ApiErr,
                NixErr,
                VolumeNotFound,
                SnapshotNotFound,
                VolumeAlreadyExist,
                VolumeHasSnapshots,
                SnapshotNotReady,
                ArgumentInvalid,
                StartingTokenInvalid,
                ArgumentOutOfRange,
                OperationInProgress,
                CommandErr,
                MountErr,
                UmountErr,
                BackendUnavailable,
                Unimplemented
            ]
        );
        self
    }

    /// Add context for `DateraError` lazily
    #[must_use]
    pub fn with_context<C, F>(self, f: F) -> Self
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.add_context(f())
    }

    /// The backend reported the resource as missing
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match *self {
            Self::ApiErr { ref source, .. } => source.is_not_found(),
            Self::VolumeNotFound { .. } | Self::SnapshotNotFound { .. } => true,
            _ => false,
        }
    }

    /// The backend refused a duplicate identity
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(*self, Self::ApiErr { ref source, .. } if source.is_duplicate())
    }
}

macro_rules! implement_from {
    ($source: path, $target: ident) => {
        impl From<$source> for DateraError {
            #[inline]
            fn from(error: $source) -> Self {
                Self::$target {
                    source: error,
                    context: vec![],
                }
            }
        }
    };
}
implement_from!(std::io::Error, IoErr);
implement_from!(serde_json::Error, SerdeJsonErr);
implement_from!(reqwest::Error, HttpErr);
implement_from!(ApiError, ApiErr);
implement_from!(nix::Error, NixErr);

impl From<&DateraError> for Code {
    #[inline]
    fn from(error: &DateraError) -> Self {
        match *error {
            DateraError::IoErr { .. }
            | DateraError::SerdeJsonErr { .. }
            | DateraError::NixErr { .. }
            | DateraError::CommandErr { .. }
            | DateraError::MountErr { .. }
            | DateraError::UmountErr { .. } => Self::Internal,
            DateraError::HttpErr { .. } | DateraError::BackendUnavailable { .. } => {
                Self::Unavailable
            }
            DateraError::ApiErr { ref source, .. } => {
                if source.is_auth_failed() {
                    Self::Unauthenticated
                } else if source.is_not_found() {
                    Self::NotFound
                } else {
                    Self::Unknown
                }
            }
            DateraError::SnapshotNotFound { .. } | DateraError::VolumeNotFound { .. } => {
                Self::NotFound
            }
            DateraError::VolumeAlreadyExist { .. } => Self::AlreadyExists,
            DateraError::VolumeHasSnapshots { .. } => Self::FailedPrecondition,
            DateraError::SnapshotNotReady { .. } => Self::Unavailable,
            DateraError::ArgumentInvalid { .. } => Self::InvalidArgument,
            DateraError::ArgumentOutOfRange { .. } => Self::OutOfRange,
            DateraError::StartingTokenInvalid { .. } | DateraError::OperationInProgress { .. } => {
                Self::Aborted
            }
            DateraError::Unimplemented { .. } => Self::Unimplemented,
        }
    }
}

impl From<DateraError> for Status {
    #[inline]
    fn from(error: DateraError) -> Self {
        let code = Code::from(&error);
        match error {
            DateraError::OperationInProgress { .. } => {
                Self::new(code, "Operation is still in progress")
            }
            DateraError::ApiErr { ref source, .. } => Self::new(code, source.to_string()),
            _ => Self::new(code, error.to_string()),
        }
    }
}

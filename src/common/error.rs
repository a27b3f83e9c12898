//! `SessionFs` error code

use thiserror::Error;

use crate::rpc::message::StatusCode;

/// `SessionFs` result type
pub type SessionFsResult<T> = Result<T, SessionFsError>;

/// `SessionFs` error code
#[derive(Error, Debug)]
pub enum SessionFsError {
    /// Error caused by `std::io::Error`
    #[error("IoErr, the error is {:?}, context is {:#?}", .source, .context)]
    IoErr {
        /// Error source
        source: std::io::Error,
        /// Context of the error
        context: Vec<String>,
    },

    /// Path does not exist on the server
    #[error("Path {} not found, context is {:#?}", .path, .context)]
    NotFound {
        /// The missing path
        path: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// Create collides with an existing entry
    #[error("Path {} already exists, context is {:#?}", .path, .context)]
    AlreadyExists {
        /// The colliding path
        path: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// Local or remote I/O forbidden by the OS
    #[error("Permission denied, context is {:#?}", .context)]
    PermissionDenied {
        /// Context of the error
        context: Vec<String>,
    },

    /// Cache entry inconsistent with the server after a failed compare
    #[error("Cache entry for {} is stale, context is {:#?}", .path, .context)]
    Stale {
        /// The stale path
        path: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// RPC failed after all retry attempts
    #[error("Backend unavailable, context is {:#?}", .context)]
    BackendUnavailable {
        /// Context of the error
        context: Vec<String>,
    },

    /// Internal invariant violated
    #[error("Invalid state, context is {:#?}", .context)]
    InvalidState {
        /// Context of the error
        context: Vec<String>,
    },

    /// Argument is invalid
    #[error("Argument is invalid, context is {:#?}", .context)]
    ArgumentInvalid {
        /// Context of the error
        context: Vec<String>,
    },

    /// Error caused by `bincode::Error`
    #[error("BincodeErr, the error is {:?}, context is {:#?}", .source, .context)]
    BincodeErr {
        /// Error source
        source: bincode::Error,
        /// Context of the error
        context: Vec<String>,
    },

    /// Error caused by `nix::Error`
    #[error("NixErr, the error is {:?}, context is {:#?}", .source, .context)]
    NixErr {
        /// Error source
        source: nix::Error,
        /// Context of the error
        context: Vec<String>,
    },

    /// Error caused by `std::time::SystemTimeError`
    #[error("SystemTimeErr, the error is {:?}, context is {:#?}", .source, .context)]
    SystemTimeErr {
        /// Error source
        source: std::time::SystemTimeError,
        /// Context of the error
        context: Vec<String>,
    },
}

/// Add context to `SessionFsResult`
pub trait Context<T, E> {
    /// Add context to `SessionFsResult`
    fn add_context<C>(self, ctx: C) -> SessionFsResult<T>
    where
        C: Into<String>;

    /// Add context to `SessionFsResult` lazily
    fn with_context<C, F>(self, f: F) -> SessionFsResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> Context<T, E> for Result<T, E>
where
    E: Into<SessionFsError>,
{
    fn add_context<C>(self, ctx: C) -> SessionFsResult<T>
    where
        C: Into<String>,
    {
        self.map_err(|e| e.into().add_context(ctx))
    }

    fn with_context<C, F>(self, f: F) -> SessionFsResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.into().add_context(f()))
    }
}

impl SessionFsError {
    /// Add context for `SessionFsError`
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
                NotFound,
                AlreadyExists,
                PermissionDenied,
                Stale,
                BackendUnavailable,
                InvalidState,
                ArgumentInvalid,
                BincodeErr,
                NixErr,
                SystemTimeErr
            ]
        );
        self
    }

    /// Add context for `SessionFsError` lazily
    #[must_use]
    pub fn with_context<C, F>(self, f: F) -> Self
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.add_context(f())
    }
}

macro_rules! implement_from {
    ($source: path, $target: ident) => {
        impl From<$source> for SessionFsError {
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
implement_from!(bincode::Error, BincodeErr);
implement_from!(nix::Error, NixErr);
implement_from!(std::time::SystemTimeError, SystemTimeErr);

impl From<SessionFsError> for StatusCode {
    fn from(error: SessionFsError) -> Self {
        match error {
            SessionFsError::NotFound { .. } => Self::NotFound,
            SessionFsError::AlreadyExists { .. } => Self::AlreadyExists,
            SessionFsError::PermissionDenied { .. } => Self::PermissionDenied,
            SessionFsError::ArgumentInvalid { .. } => Self::InvalidArgument,
            SessionFsError::IoErr { ref source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => Self::NotFound,
                std::io::ErrorKind::AlreadyExists => Self::AlreadyExists,
                std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
                _ => Self::Internal,
            },
            SessionFsError::NixErr { source, .. } => match source {
                nix::Error::ENOENT => Self::NotFound,
                nix::Error::EEXIST => Self::AlreadyExists,
                nix::Error::EACCES | nix::Error::EPERM => Self::PermissionDenied,
                _ => Self::Internal,
            },
            SessionFsError::Stale { .. }
            | SessionFsError::BackendUnavailable { .. }
            | SessionFsError::InvalidState { .. }
            | SessionFsError::BincodeErr { .. }
            | SessionFsError::SystemTimeErr { .. } => Self::Internal,
        }
    }
}

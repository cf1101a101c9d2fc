//! Error types for the storage result backend

use std::io;
use thiserror::Error;

/// Boxed error carried as the cause of a configuration failure
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias using the backend's error type
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors surfaced by [`StorageResultBackend`](crate::StorageResultBackend)
#[derive(Error, Debug)]
pub enum BackendError {
    /// The provider could not be selected or constructed, or the
    /// configuration itself is unusable
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Reading a result failed after the retry policy gave up
    #[error("failed to fetch {key} after {attempts} attempt(s)")]
    Fetch {
        key: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// Writing a result failed after the retry policy gave up
    #[error("failed to store {key} after {attempts} attempt(s)")]
    Store {
        key: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// Provider failure passed through as-is, either because it was not safe
    /// to retry or because the operation is never retried
    #[error(transparent)]
    Storage(#[from] io::Error),
}

impl BackendError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        BackendError::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn configuration_caused_by(message: impl Into<String>, source: BoxError) -> Self {
        BackendError::Configuration {
            message: message.into(),
            source: Some(source),
        }
    }

    /// The provider error at the root of this failure, if any
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            BackendError::Fetch { source, .. }
            | BackendError::Store { source, .. }
            | BackendError::Storage(source) => Some(source),
            BackendError::Configuration { source, .. } => source
                .as_ref()
                .and_then(|source| source.downcast_ref::<io::Error>()),
        }
    }

    /// Number of provider attempts made before giving up
    pub fn attempts(&self) -> Option<u32> {
        match self {
            BackendError::Fetch { attempts, .. } | BackendError::Store { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn fetch_error_keeps_cause() {
        let err = BackendError::Fetch {
            key: "celery-task-meta-1".to_string(),
            attempts: 4,
            source: io::Error::new(io::ErrorKind::TimedOut, "slow disk"),
        };
        assert_eq!(
            err.to_string(),
            "failed to fetch celery-task-meta-1 after 4 attempt(s)"
        );
        assert_eq!(err.attempts(), Some(4));
        assert_eq!(err.io_error().unwrap().kind(), io::ErrorKind::TimedOut);
        assert!(err.source().is_some());
    }

    #[test]
    fn storage_error_is_transparent() {
        let err = BackendError::from(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert_eq!(err.to_string(), "denied");
        assert_eq!(err.attempts(), None);
    }

    #[test]
    fn configuration_error_exposes_io_cause() {
        let cause: BoxError = Box::new(io::Error::new(io::ErrorKind::PermissionDenied, "ro"));
        let err = BackendError::configuration_caused_by("cannot create provider", cause);
        assert_eq!(
            err.io_error().unwrap().kind(),
            io::ErrorKind::PermissionDenied
        );
        assert!(BackendError::configuration("bad").io_error().is_none());
    }
}

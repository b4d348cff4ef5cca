//! The sync engine's internal error type and its classification into a
//! coarse `ServiceStatus`, used by the orchestrator to decide whether a
//! failure is worth an immediate retry, a backoff, or is simply the
//! "local conflict detected" branch that §4.4(g) of the design treats as
//! expected control flow rather than a real error.

use error_support::{ErrorHandling, GetErrorHandling};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("could not decode server response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("server returned HTTP {status} for {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("failed to obtain an auth token: {0}")]
    Authentication(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Interrupted(#[from] interrupt_support::Interrupted),

    #[error("{0}")]
    Other(String),
}

/// A coarse bucket for an `Error`, mirroring the teacher's
/// `sync15::status::ServiceStatus`. The orchestrator uses this (not the
/// error itself) to decide whether to retry immediately, back off, or
/// just log and move to the next entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Ok,
    NetworkError,
    ServiceError,
    AuthenticationError,
    StorageError,
    Interrupted,
    OtherError,
}

impl ServiceStatus {
    pub fn from_err(err: &Error) -> ServiceStatus {
        match err {
            Error::Transport(_) => ServiceStatus::NetworkError,
            Error::UnexpectedStatus { status, .. } if *status == 401 || *status == 403 => {
                ServiceStatus::AuthenticationError
            }
            Error::UnexpectedStatus { .. } => ServiceStatus::ServiceError,
            Error::Authentication(_) => ServiceStatus::AuthenticationError,
            Error::Decode(_) => ServiceStatus::ServiceError,
            Error::Storage(_) | Error::Migration(_) | Error::Io(_) => ServiceStatus::StorageError,
            Error::Interrupted(_) => ServiceStatus::Interrupted,
            Error::InvalidUrl(_) | Error::Other(_) => ServiceStatus::OtherError,
        }
    }
}

impl GetErrorHandling for Error {
    type ExternalError = Error;

    fn get_error_handling(&self) -> ErrorHandling<Self::ExternalError> {
        match self {
            // Transport hiccups and auth failures are routine in an
            // offline-first engine; `warn!` is plenty.
            Error::Transport(_) | Error::Authentication(_) | Error::UnexpectedStatus { .. } => {
                ErrorHandling::log(self.to_string().into(), log::Level::Warn)
            }
            Error::Interrupted(_) => ErrorHandling::passthrough(self.to_string().into()),
            // Anything that indicates a protocol mismatch or a local
            // storage failure is worth surfacing to the app's reporter.
            _ => ErrorHandling::unexpected(self.to_string().into(), Some("sync-engine")),
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

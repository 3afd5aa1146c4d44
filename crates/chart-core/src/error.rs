//! Task-facing errors for package operations

use chart_schema::IndexError;
use thiserror::Error;

use crate::io::archive::ArchiveError;
use crate::io::fetch::FetchError;
use crate::platform::PlatformError;

/// Result alias for pipeline entry points.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything a sync, publish or upload can fail with.
///
/// Messages name the phase they failed in so the task record tells an
/// operator where to look.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid input; not retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The index or an artifact could not be fetched. Retry by re-running
    /// the whole operation.
    #[error("Fetch failed for {url}: {source}")]
    RemoteFetch {
        /// URL that failed.
        url: String,
        /// Underlying cause.
        #[source]
        source: FetchError,
    },

    /// The index document could not be decoded.
    #[error("Parse failed: {0}")]
    MalformedIndex(#[from] IndexError),

    /// Uploaded archive is unusable.
    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    /// Registering publication files or metadata failed. The publication was
    /// discarded.
    #[error("Publication storage failed: {0}")]
    PublicationStorage(#[source] PlatformError),

    /// A platform collaborator failed while committing.
    #[error("Commit failed: {0}")]
    Platform(#[source] PlatformError),

    /// The invocation was cancelled before anything was committed.
    #[error("Cancelled before commit")]
    Cancelled,
}

impl Error {
    /// Returns `true` if re-issuing the invocation might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteFetch { .. })
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl std::fmt::Display) -> Self {
        Self::Configuration(msg.to_string())
    }
}

impl From<PlatformError> for Error {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::ArtifactFetch { url, source } => Self::RemoteFetch { url, source },
            other => Self::Platform(other),
        }
    }
}

impl From<ArchiveError> for Error {
    fn from(err: ArchiveError) -> Self {
        Self::InvalidArchive(err.to_string())
    }
}

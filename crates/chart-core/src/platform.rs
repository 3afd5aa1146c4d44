//! Contracts with the hosting content platform.
//!
//! The pipelines never touch storage directly. They hand declared content to
//! a [`ContentSink`], read frozen versions through a [`RepositoryReader`] and
//! write publications through a [`PublicationStore`]. Implementations must
//! honor two guarantees:
//!
//! - **create-or-reuse**: a unit whose `(name, version, digest)` already
//!   exists resolves to the existing unit, even under concurrent callers;
//! - **commit-or-abort**: a repository version or publication is visible
//!   either completely or not at all.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use chart_schema::{ChartContent, Sha256Digest};
use futures::stream::BoxStream;
use thiserror::Error;

use crate::io::fetch::FetchError;

/// Identifies a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryId(pub u64);

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "repository/{}", self.0)
    }
}

/// One immutable version of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryVersionRef {
    /// Owning repository.
    pub repository: RepositoryId,
    /// Version number; `0` is the empty version every repository starts with.
    pub number: u64,
}

impl fmt::Display for RepositoryVersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/versions/{}", self.repository, self.number)
    }
}

/// Identifies a persisted content unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub u64);

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "content/chart/{}", self.0)
    }
}

/// Identifies a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicationId(pub u64);

impl fmt::Display for PublicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "publications/chart/{}", self.0)
    }
}

/// A file fetched from a remote.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    /// Where it came from.
    pub url: String,
    /// The full body.
    pub data: Bytes,
    /// SHA256 of `data`.
    pub sha256: Sha256Digest,
}

/// An artifact a sync wants attached to a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclarativeArtifact {
    /// Expected SHA256 of the archive.
    pub digest: Sha256Digest,
    /// Absolute source URL.
    pub url: String,
    /// Path the artifact is stored and published under.
    pub relative_path: String,
    /// Leave the bytes remote until first access.
    pub deferred: bool,
}

/// A candidate unit plus the artifacts it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclarativeContent {
    /// The unit as built from the remote entry.
    pub content: ChartContent,
    /// Artifacts to attach.
    pub artifacts: Vec<DeclarativeArtifact>,
}

/// Whether an attached artifact's bytes are held locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactState {
    /// Bytes are in artifact storage.
    Downloaded,
    /// Bytes are still at `url`.
    Deferred {
        /// Remote source.
        url: String,
    },
}

/// An artifact attached to a persisted unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentArtifact {
    /// Path the artifact is published under.
    pub relative_path: String,
    /// SHA256 of the archive.
    pub sha256: Sha256Digest,
    /// Local or remote.
    pub state: ArtifactState,
}

/// A persisted unit with its artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    /// Platform identifier.
    pub id: ContentId,
    /// The immutable record.
    pub content: ChartContent,
    /// Attached artifacts.
    pub artifacts: Vec<ContentArtifact>,
}

/// An artifact already validated and stored by the platform, as handed to
/// the upload path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    /// Location of the bytes on local disk.
    pub path: PathBuf,
    /// SHA256 of the bytes.
    pub sha256: Sha256Digest,
}

/// A published metadata file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRef {
    /// Publication the file belongs to.
    pub publication: PublicationId,
    /// Name within the publication, e.g. `index.yaml`.
    pub relative_path: String,
    /// SHA256 of the file.
    pub sha256: Sha256Digest,
}

/// A committed publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationRef {
    /// Platform identifier.
    pub id: PublicationId,
    /// Version it renders.
    pub version: RepositoryVersionRef,
}

/// Failures reported by platform collaborators.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// A repository, version, unit or publication does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// An artifact could not be downloaded.
    #[error("Failed to download artifact {url}: {source}")]
    ArtifactFetch {
        /// Source URL.
        url: String,
        /// Underlying cause.
        #[source]
        source: FetchError,
    },

    /// Downloaded bytes do not hash to the declared digest.
    #[error("Digest mismatch for {url}: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Source URL.
        url: String,
        /// Declared digest.
        expected: Sha256Digest,
        /// Digest of the bytes received.
        actual: Sha256Digest,
    },

    /// Two artifacts of one publication claim the same path.
    #[error("{relative_path} is already published; {content} cannot be published there too")]
    DuplicatePath {
        /// The contested path.
        relative_path: String,
        /// What was refused the path (unit key or artifact digest).
        content: String,
    },

    /// Backing storage failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Retrieves remote files.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Fetch the full body at `url`.
    async fn fetch(&self, url: &str) -> Result<FetchedFile, FetchError>;
}

/// Declarative version creation.
#[async_trait]
pub trait ContentSink: Send + Sync {
    /// Consume `declared` and commit a new version of `repository`.
    ///
    /// Units are created or reused by their `(name, version, digest)` key and
    /// non-deferred artifacts are downloaded before anything is committed.
    /// With `mirror` the new version holds exactly the declared units;
    /// otherwise they are added to the latest version's content. When the
    /// resulting content equals the latest version, that version is returned
    /// and nothing new is created.
    async fn create_version(
        &self,
        repository: RepositoryId,
        declared: BoxStream<'static, DeclarativeContent>,
        mirror: bool,
    ) -> Result<RepositoryVersionRef, PlatformError>;
}

/// Read access to frozen repository versions.
#[async_trait]
pub trait RepositoryReader: Send + Sync {
    /// Units in `version`, or `None` when the version does not exist.
    async fn version_content(
        &self,
        version: RepositoryVersionRef,
    ) -> Result<Option<Vec<StoredContent>>, PlatformError>;
}

/// Write-once publication storage.
///
/// Nothing registered against a publication is visible until
/// [`PublicationStore::finalize`] succeeds; [`PublicationStore::discard`]
/// drops everything registered so far.
#[async_trait]
pub trait PublicationStore: Send + Sync {
    /// Open a new, invisible publication of `version`.
    async fn create_publication(
        &self,
        version: RepositoryVersionRef,
    ) -> Result<PublicationId, PlatformError>;

    /// Expose `artifact` at `relative_path`.
    async fn register_published_file(
        &self,
        publication: PublicationId,
        relative_path: &str,
        artifact: &ContentArtifact,
    ) -> Result<(), PlatformError>;

    /// Store `data` as the metadata file `name`.
    async fn register_published_metadata(
        &self,
        publication: PublicationId,
        name: &str,
        data: Bytes,
    ) -> Result<MetadataRef, PlatformError>;

    /// Make the publication visible.
    async fn finalize(&self, publication: PublicationId) -> Result<PublicationRef, PlatformError>;

    /// Drop an unfinished publication.
    async fn discard(&self, publication: PublicationId);
}

/// Direct content creation, used by uploads.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// Create or reuse the unit for `content` with `artifact` attached.
    async fn save_content(
        &self,
        content: ChartContent,
        artifact: ContentArtifact,
    ) -> Result<ContentId, PlatformError>;

    /// New version of `repository`: the latest content plus `content`.
    async fn add_content(
        &self,
        repository: RepositoryId,
        content: &[ContentId],
    ) -> Result<RepositoryVersionRef, PlatformError>;
}

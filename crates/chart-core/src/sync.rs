//! Remote index → new repository version.
//!
//! A sync is two phases. The only suspension point of the first is the index
//! fetch, which races the cancellation token. The second decodes and turns
//! every entry into declared content without touching shared state. Only a
//! fully validated batch is handed to the [`ContentSink`], so a malformed
//! entry anywhere in the document commits nothing.

use chart_schema::index::{self, IndexEntry};
use chart_schema::{ChartContent, IndexError};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::config::Remote;
use crate::error::{Error, Result};
use crate::paths;
use crate::platform::{
    ContentSink, DeclarativeArtifact, DeclarativeContent, RemoteFetcher, RepositoryId,
    RepositoryVersionRef,
};
use crate::reporter::{NullReporter, ProgressReport, Reporter, codes};

/// Sync `remote` into `repository`.
///
/// Shorthand for [`Synchronizer::synchronize`] with no reporter and no
/// cancellation.
pub async fn synchronize(
    fetcher: &dyn RemoteFetcher,
    sink: &dyn ContentSink,
    remote: &Remote,
    repository: RepositoryId,
    mirror: bool,
) -> Result<RepositoryVersionRef> {
    Synchronizer::new(fetcher, sink)
        .synchronize(remote, repository, mirror)
        .await
}

/// Configurable sync runner.
pub struct Synchronizer<'a> {
    fetcher: &'a dyn RemoteFetcher,
    sink: &'a dyn ContentSink,
    reporter: &'a dyn Reporter,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Synchronizer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<'a> Synchronizer<'a> {
    /// A runner that reports nothing and is never cancelled.
    pub fn new(fetcher: &'a dyn RemoteFetcher, sink: &'a dyn ContentSink) -> Self {
        Self {
            fetcher,
            sink,
            reporter: &NullReporter,
            cancel: CancellationToken::new(),
        }
    }

    /// Send progress to `reporter`.
    pub fn with_reporter(mut self, reporter: &'a dyn Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Abort (without committing) once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fetch the remote's index, declare one unit per entry and commit a new
    /// version of `repository`.
    ///
    /// Returns the latest version unchanged when the sync adds nothing.
    pub async fn synchronize(
        &self,
        remote: &Remote,
        repository: RepositoryId,
        mirror: bool,
    ) -> Result<RepositoryVersionRef> {
        if remote.url.trim().is_empty() {
            return Err(Error::configuration(format!(
                "remote '{}' must have a url specified to synchronize",
                remote.name
            )));
        }
        let index_url = paths::index_url(&remote.url).map_err(|e| {
            Error::configuration(format!(
                "remote '{}' has an invalid url '{}': {e}",
                remote.name, remote.url
            ))
        })?;
        let deferred = remote.policy.is_deferred();

        info!(
            remote = %remote.name,
            %repository,
            url = %index_url,
            mirror,
            deferred,
            "Synchronizing"
        );

        // Phase 1: the index
        let mut pb = ProgressReport::start(
            self.reporter,
            codes::DOWNLOADING_METADATA,
            "Downloading Index",
            Some(1),
        );
        let fetched = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = self.fetcher.fetch(index_url.as_str()) => {
                result.map_err(|source| Error::RemoteFetch {
                    url: index_url.to_string(),
                    source,
                })?
            }
        };
        pb.increment();
        pb.finish();
        debug!(size = fetched.data.len(), sha256 = %fetched.sha256, "index downloaded");

        // Phase 2: decode and declare
        let entries = index::decode(&fetched.data)?;
        let declared = declare_entries(&index_url, &entries, deferred, Utc::now(), self.reporter)?;
        let count = declared.len();

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Phase 3: hand off
        let stream = futures::stream::iter(declared).boxed();
        let version = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = self.sink.create_version(repository, stream, mirror) => result?,
        };

        info!(%version, declared = count, "Sync complete");
        Ok(version)
    }
}

/// Turn decoded entries into declared content, in document order.
///
/// Each artifact is sourced from the entry's first URL resolved against
/// `index_url` and stored as `{name}-{version}.tgz`. Entries without a
/// `created` timestamp are stamped with `now`.
pub fn declare_entries(
    index_url: &Url,
    entries: &[IndexEntry],
    deferred: bool,
    now: DateTime<Utc>,
    reporter: &dyn Reporter,
) -> Result<Vec<DeclarativeContent>> {
    let total = entries.len() as u64;
    let mut pb = ProgressReport::start(
        reporter,
        codes::PARSING_METADATA,
        "Parsing Entries",
        Some(total),
    );

    let mut declared = Vec::with_capacity(entries.len());
    for entry in entries {
        let source = entry.source_url().unwrap_or_default();
        let url = paths::resolve_artifact_url(index_url, source).map_err(|e| {
            IndexError::InvalidUrl {
                name: entry.name.clone(),
                version: entry.version.clone(),
                url: source.to_string(),
                reason: e.to_string(),
            }
        })?;

        let content = ChartContent::from_entry(entry, now);
        let artifact = DeclarativeArtifact {
            digest: content.digest.clone(),
            url: url.to_string(),
            relative_path: content.artifact_filename(),
            deferred,
        };
        declared.push(DeclarativeContent {
            content,
            artifacts: vec![artifact],
        });
        pb.increment();
    }
    pb.finish();

    Ok(declared)
}

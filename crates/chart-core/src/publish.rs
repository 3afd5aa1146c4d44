//! Repository version → publication.
//!
//! Every artifact of every unit is exposed at its relative path and a fresh
//! `index.yaml` describing them is generated. The publication only becomes
//! visible once all of that succeeded; any failure discards it.

use std::collections::HashSet;

use chart_schema::{INDEX_FILENAME, IndexDocument};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::platform::{
    PlatformError, PublicationId, PublicationRef, PublicationStore, RepositoryReader,
    RepositoryVersionRef, StoredContent,
};
use crate::reporter::{NullReporter, ProgressReport, Reporter, codes};

/// Publish `version` with no progress reporting.
pub async fn publish(
    reader: &dyn RepositoryReader,
    store: &dyn PublicationStore,
    version: RepositoryVersionRef,
) -> Result<PublicationRef> {
    publish_with_reporter(reader, store, version, &NullReporter).await
}

/// Publish `version`, reporting progress to `reporter`.
///
/// A version the reader does not know is published as an empty repository.
pub async fn publish_with_reporter(
    reader: &dyn RepositoryReader,
    store: &dyn PublicationStore,
    version: RepositoryVersionRef,
    reporter: &dyn Reporter,
) -> Result<PublicationRef> {
    info!(%version, "Publishing");

    let mut units = match reader.version_content(version).await {
        Ok(Some(units)) => units,
        Ok(None) => {
            warn!(%version, "version not found, publishing an empty repository");
            reporter.warning(&format!(
                "{version} not found, publishing an empty repository"
            ));
            Vec::new()
        }
        Err(e) => return Err(Error::PublicationStorage(e)),
    };
    sort_units(&mut units);

    let publication = store
        .create_publication(version)
        .await
        .map_err(Error::PublicationStorage)?;

    if let Err(e) = write_publication(store, publication, &units, reporter).await {
        warn!(%publication, error = %e, "discarding publication");
        store.discard(publication).await;
        return Err(Error::PublicationStorage(e));
    }

    match store.finalize(publication).await {
        Ok(published) => {
            info!(publication = %published.id, units = units.len(), "Publication complete");
            Ok(published)
        }
        Err(e) => {
            store.discard(publication).await;
            Err(Error::PublicationStorage(e))
        }
    }
}

async fn write_publication(
    store: &dyn PublicationStore,
    publication: PublicationId,
    units: &[StoredContent],
    reporter: &dyn Reporter,
) -> Result<(), PlatformError> {
    let total = units.iter().map(|u| u.artifacts.len() as u64).sum();
    let mut pb = ProgressReport::start(
        reporter,
        codes::PUBLISHING_CONTENT,
        "Publishing Content",
        Some(total),
    );
    let mut published = HashSet::new();
    for unit in units {
        for artifact in &unit.artifacts {
            if !published.insert(artifact.relative_path.as_str()) {
                return Err(PlatformError::DuplicatePath {
                    relative_path: artifact.relative_path.clone(),
                    content: unit.content.key().to_string(),
                });
            }
            store
                .register_published_file(publication, &artifact.relative_path, artifact)
                .await?;
            pb.increment();
        }
    }
    pb.finish();

    let mut pb = ProgressReport::start(
        reporter,
        codes::PUBLISHING_METADATA,
        "Writing Index",
        Some(1),
    );
    let document = build_index(units, Utc::now());
    let data = document
        .encode()
        .map_err(|e| PlatformError::Storage(format!("failed to encode {INDEX_FILENAME}: {e}")))?;
    let metadata = store
        .register_published_metadata(publication, INDEX_FILENAME, data.into())
        .await?;
    debug!(sha256 = %metadata.sha256, entries = document.len(), "index registered");
    pb.increment();
    pb.finish();

    Ok(())
}

/// Name ascending, then newest first.
fn sort_units(units: &mut [StoredContent]) {
    units.sort_by(|a, b| {
        a.content
            .name
            .cmp(&b.content.name)
            .then_with(|| b.content.created.cmp(&a.content.created))
    });
}

/// Render `units` as an index document stamped with `generated`.
///
/// Each entry's `urls` are the relative paths its artifacts are published
/// under.
pub fn build_index(units: &[StoredContent], generated: DateTime<Utc>) -> IndexDocument {
    let mut document = IndexDocument::new(generated);
    for unit in units {
        let urls = unit
            .artifacts
            .iter()
            .map(|a| a.relative_path.clone())
            .collect();
        document.push(unit.content.to_entry(urls));
    }
    document.sort_entries();
    document
}

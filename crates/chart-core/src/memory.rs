//! In-process platform.
//!
//! Implements every collaborator trait over maps behind a single
//! [`tokio::sync::Mutex`]. Artifact downloads happen before the lock is
//! taken; everything a commit changes is then applied in one lock scope, so
//! readers never observe a half-built version or publication.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chart_schema::{ChartContent, ContentKey, Sha256Digest};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::FetchConfig;
use crate::platform::{
    ArtifactState, ContentArtifact, ContentId, ContentRepository, ContentSink,
    DeclarativeArtifact, DeclarativeContent, MetadataRef, PlatformError, PublicationId,
    PublicationRef, PublicationStore, RemoteFetcher, RepositoryId, RepositoryReader,
    RepositoryVersionRef, StoredContent,
};

/// An in-memory content platform.
pub struct MemoryPlatform {
    fetcher: Arc<dyn RemoteFetcher>,
    concurrency: usize,
    state: Mutex<State>,
}

impl std::fmt::Debug for MemoryPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPlatform")
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    content: BTreeMap<ContentId, StoredContent>,
    keys: HashMap<ContentKey, ContentId>,
    artifacts: HashMap<Sha256Digest, Bytes>,
    repositories: HashMap<RepositoryId, Repository>,
    drafts: HashMap<PublicationId, Publication>,
    publications: HashMap<PublicationId, Publication>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn repository(&self, id: RepositoryId) -> Result<&Repository, PlatformError> {
        self.repositories
            .get(&id)
            .ok_or_else(|| PlatformError::NotFound(id.to_string()))
    }

    /// Create or reuse the unit keyed by `content`.
    fn upsert(&mut self, content: ChartContent, artifacts: Vec<ContentArtifact>) -> ContentId {
        let key = content.key();
        if let Some(&id) = self.keys.get(&key) {
            if let Some(existing) = self.content.get_mut(&id) {
                for artifact in &mut existing.artifacts {
                    if matches!(artifact.state, ArtifactState::Deferred { .. })
                        && self.artifacts.contains_key(&artifact.sha256)
                    {
                        artifact.state = ArtifactState::Downloaded;
                    }
                }
            }
            debug!(%key, content = %id, "reusing existing unit");
            return id;
        }

        let id = ContentId(self.next_id());
        self.keys.insert(key, id);
        self.content.insert(
            id,
            StoredContent {
                id,
                content,
                artifacts,
            },
        );
        id
    }

    /// Append `content` as a new version unless it equals the latest one.
    fn commit(
        &mut self,
        repository: RepositoryId,
        content: BTreeSet<ContentId>,
    ) -> Result<RepositoryVersionRef, PlatformError> {
        let repo = self
            .repositories
            .get_mut(&repository)
            .ok_or_else(|| PlatformError::NotFound(repository.to_string()))?;
        let latest = repo.latest();
        if repo.versions.last() == Some(&content) {
            return Ok(RepositoryVersionRef {
                repository,
                number: latest,
            });
        }
        repo.versions.push(content);
        Ok(RepositoryVersionRef {
            repository,
            number: latest + 1,
        })
    }
}

struct Repository {
    versions: Vec<BTreeSet<ContentId>>,
}

impl Repository {
    fn latest(&self) -> u64 {
        self.versions.len().saturating_sub(1) as u64
    }
}

struct Publication {
    version: RepositoryVersionRef,
    files: BTreeMap<String, ContentArtifact>,
    metadata: BTreeMap<String, Bytes>,
}

impl MemoryPlatform {
    /// A platform that downloads artifacts through `fetcher`.
    pub fn new(fetcher: Arc<dyn RemoteFetcher>) -> Self {
        Self {
            fetcher,
            concurrency: FetchConfig::default().download_concurrency,
            state: Mutex::new(State::default()),
        }
    }

    /// Download at most `limit` artifacts at once.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    /// Create an empty repository. Its version `0` holds no content.
    pub async fn create_repository(&self, name: &str) -> RepositoryId {
        let mut state = self.state.lock().await;
        let id = RepositoryId(state.next_id());
        state.repositories.insert(
            id,
            Repository {
                versions: vec![BTreeSet::new()],
            },
        );
        info!(repository = %id, name, "created repository");
        id
    }

    /// Latest version of `repository`.
    pub async fn latest_version(&self, repository: RepositoryId) -> Option<RepositoryVersionRef> {
        let state = self.state.lock().await;
        state
            .repositories
            .get(&repository)
            .map(|repo| RepositoryVersionRef {
                repository,
                number: repo.latest(),
            })
    }

    /// Number of distinct units across all repositories.
    pub async fn content_count(&self) -> usize {
        self.state.lock().await.content.len()
    }

    /// Locally held bytes for `digest`.
    pub async fn artifact(&self, digest: &Sha256Digest) -> Option<Bytes> {
        self.state.lock().await.artifacts.get(digest).cloned()
    }

    /// Version rendered by a finalized publication.
    pub async fn publication_version(&self, id: PublicationId) -> Option<RepositoryVersionRef> {
        let state = self.state.lock().await;
        state.publications.get(&id).map(|p| p.version)
    }

    /// Relative paths exposed by a finalized publication.
    pub async fn publication_files(&self, id: PublicationId) -> Option<Vec<String>> {
        let state = self.state.lock().await;
        state
            .publications
            .get(&id)
            .map(|p| p.files.keys().cloned().collect())
    }

    /// Metadata file `name` of a finalized publication.
    pub async fn publication_metadata(&self, id: PublicationId, name: &str) -> Option<Bytes> {
        let state = self.state.lock().await;
        state
            .publications
            .get(&id)
            .and_then(|p| p.metadata.get(name).cloned())
    }

    /// Fetch and verify one artifact.
    async fn download(&self, artifact: DeclarativeArtifact) -> Result<(Sha256Digest, Bytes), PlatformError> {
        let fetched = self
            .fetcher
            .fetch(&artifact.url)
            .await
            .map_err(|source| PlatformError::ArtifactFetch {
                url: artifact.url.clone(),
                source,
            })?;
        if fetched.sha256 != artifact.digest {
            return Err(PlatformError::DigestMismatch {
                url: artifact.url,
                expected: artifact.digest,
                actual: fetched.sha256,
            });
        }
        debug!(url = %artifact.url, size = fetched.data.len(), "artifact verified");
        Ok((artifact.digest, fetched.data))
    }
}

#[async_trait]
impl ContentSink for MemoryPlatform {
    async fn create_version(
        &self,
        repository: RepositoryId,
        declared: BoxStream<'static, DeclarativeContent>,
        mirror: bool,
    ) -> Result<RepositoryVersionRef, PlatformError> {
        let declared: Vec<DeclarativeContent> = declared.collect().await;

        let pending: Vec<DeclarativeArtifact> = {
            let state = self.state.lock().await;
            state.repository(repository)?;
            let mut seen = BTreeSet::new();
            declared
                .iter()
                .flat_map(|d| &d.artifacts)
                .filter(|a| !a.deferred && !state.artifacts.contains_key(&a.digest))
                .filter(|a| seen.insert(a.digest.clone()))
                .cloned()
                .collect()
        };

        if !pending.is_empty() {
            info!(count = pending.len(), "downloading artifacts");
        }
        let downloaded: Vec<(Sha256Digest, Bytes)> = stream::iter(pending)
            .map(|artifact| self.download(artifact))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let mut state = self.state.lock().await;
        state.artifacts.extend(downloaded);

        let mut ids = BTreeSet::new();
        for DeclarativeContent { content, artifacts } in declared {
            let artifacts = artifacts
                .into_iter()
                .map(|a| {
                    let state_of = if state.artifacts.contains_key(&a.digest) {
                        ArtifactState::Downloaded
                    } else {
                        ArtifactState::Deferred { url: a.url }
                    };
                    ContentArtifact {
                        relative_path: a.relative_path,
                        sha256: a.digest,
                        state: state_of,
                    }
                })
                .collect();
            ids.insert(state.upsert(content, artifacts));
        }

        if !mirror {
            let repo = state.repository(repository)?;
            if let Some(latest) = repo.versions.last() {
                ids.extend(latest.iter().copied());
            }
        }
        state.commit(repository, ids)
    }
}

#[async_trait]
impl RepositoryReader for MemoryPlatform {
    async fn version_content(
        &self,
        version: RepositoryVersionRef,
    ) -> Result<Option<Vec<StoredContent>>, PlatformError> {
        let state = self.state.lock().await;
        let Some(ids) = state
            .repositories
            .get(&version.repository)
            .and_then(|repo| repo.versions.get(version.number as usize))
        else {
            return Ok(None);
        };
        let units = ids
            .iter()
            .map(|id| {
                state
                    .content
                    .get(id)
                    .cloned()
                    .ok_or_else(|| PlatformError::NotFound(id.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(units))
    }
}

#[async_trait]
impl PublicationStore for MemoryPlatform {
    async fn create_publication(
        &self,
        version: RepositoryVersionRef,
    ) -> Result<PublicationId, PlatformError> {
        let mut state = self.state.lock().await;
        let id = PublicationId(state.next_id());
        state.drafts.insert(
            id,
            Publication {
                version,
                files: BTreeMap::new(),
                metadata: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn register_published_file(
        &self,
        publication: PublicationId,
        relative_path: &str,
        artifact: &ContentArtifact,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.lock().await;
        let draft = state
            .drafts
            .get_mut(&publication)
            .ok_or_else(|| PlatformError::NotFound(publication.to_string()))?;
        if draft.files.contains_key(relative_path) {
            return Err(PlatformError::DuplicatePath {
                relative_path: relative_path.to_string(),
                content: artifact.sha256.to_string(),
            });
        }
        draft
            .files
            .insert(relative_path.to_string(), artifact.clone());
        Ok(())
    }

    async fn register_published_metadata(
        &self,
        publication: PublicationId,
        name: &str,
        data: Bytes,
    ) -> Result<MetadataRef, PlatformError> {
        let mut state = self.state.lock().await;
        let draft = state
            .drafts
            .get_mut(&publication)
            .ok_or_else(|| PlatformError::NotFound(publication.to_string()))?;
        let sha256 = Sha256Digest::compute(&data);
        draft.metadata.insert(name.to_string(), data);
        Ok(MetadataRef {
            publication,
            relative_path: name.to_string(),
            sha256,
        })
    }

    async fn finalize(&self, publication: PublicationId) -> Result<PublicationRef, PlatformError> {
        let mut state = self.state.lock().await;
        let draft = state
            .drafts
            .remove(&publication)
            .ok_or_else(|| PlatformError::NotFound(publication.to_string()))?;
        let version = draft.version;
        state.publications.insert(publication, draft);
        Ok(PublicationRef {
            id: publication,
            version,
        })
    }

    async fn discard(&self, publication: PublicationId) {
        self.state.lock().await.drafts.remove(&publication);
    }
}

#[async_trait]
impl ContentRepository for MemoryPlatform {
    async fn save_content(
        &self,
        content: ChartContent,
        artifact: ContentArtifact,
    ) -> Result<ContentId, PlatformError> {
        let mut state = self.state.lock().await;
        Ok(state.upsert(content, vec![artifact]))
    }

    async fn add_content(
        &self,
        repository: RepositoryId,
        content: &[ContentId],
    ) -> Result<RepositoryVersionRef, PlatformError> {
        let mut state = self.state.lock().await;
        if let Some(missing) = content.iter().find(|id| !state.content.contains_key(*id)) {
            return Err(PlatformError::NotFound(missing.to_string()));
        }
        let mut ids = state
            .repository(repository)?
            .versions
            .last()
            .cloned()
            .unwrap_or_default();
        ids.extend(content.iter().copied());
        state.commit(repository, ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::fetch::FetchError;
    use crate::platform::FetchedFile;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves `url -> body` and counts requests.
    #[derive(Default)]
    struct MapFetcher {
        bodies: HashMap<String, Bytes>,
        calls: AtomicUsize,
    }

    impl MapFetcher {
        fn with(mut self, url: &str, body: &'static [u8]) -> Self {
            self.bodies.insert(url.to_string(), Bytes::from_static(body));
            self
        }
    }

    #[async_trait]
    impl RemoteFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedFile, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let data = self.bodies.get(url).cloned().ok_or(FetchError::Status {
                url: url.to_string(),
                status: 404,
            })?;
            Ok(FetchedFile {
                url: url.to_string(),
                sha256: Sha256Digest::compute(&data),
                data,
            })
        }
    }

    fn declared(name: &str, version: &str, body: &[u8], deferred: bool) -> DeclarativeContent {
        let digest = Sha256Digest::compute(body);
        let content = ChartContent {
            name: name.to_string(),
            version: version.to_string(),
            digest: digest.clone(),
            created: Utc::now(),
            app_version: None,
            description: None,
            icon: None,
            keywords: Vec::new(),
        };
        let relative_path = content.artifact_filename();
        DeclarativeContent {
            content,
            artifacts: vec![DeclarativeArtifact {
                digest,
                url: format!("https://charts.example.com/{relative_path}"),
                relative_path,
                deferred,
            }],
        }
    }

    fn boxed(items: Vec<DeclarativeContent>) -> BoxStream<'static, DeclarativeContent> {
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn immediate_artifacts_are_downloaded_and_verified() {
        let fetcher = Arc::new(
            MapFetcher::default().with("https://charts.example.com/app-1.0.0.tgz", b"chart-a"),
        );
        let platform = MemoryPlatform::new(fetcher.clone()).with_concurrency(2);
        let repo = platform.create_repository("charts").await;

        let version = platform
            .create_version(repo, boxed(vec![declared("app", "1.0.0", b"chart-a", false)]), true)
            .await
            .unwrap();
        assert_eq!(version.number, 1);

        let digest = Sha256Digest::compute(b"chart-a");
        assert_eq!(platform.artifact(&digest).await.unwrap(), &b"chart-a"[..]);
        let units = platform.version_content(version).await.unwrap().unwrap();
        assert_eq!(units[0].artifacts[0].state, ArtifactState::Downloaded);
    }

    #[tokio::test]
    async fn digest_mismatch_commits_nothing() {
        let fetcher = Arc::new(
            MapFetcher::default().with("https://charts.example.com/app-1.0.0.tgz", b"tampered"),
        );
        let platform = MemoryPlatform::new(fetcher);
        let repo = platform.create_repository("charts").await;

        let err = platform
            .create_version(repo, boxed(vec![declared("app", "1.0.0", b"chart-a", false)]), true)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::DigestMismatch { .. }));
        assert_eq!(platform.latest_version(repo).await.unwrap().number, 0);
        assert_eq!(platform.content_count().await, 0);
    }

    #[tokio::test]
    async fn deferred_artifacts_are_not_fetched() {
        let fetcher = Arc::new(MapFetcher::default());
        let platform = MemoryPlatform::new(fetcher.clone());
        let repo = platform.create_repository("charts").await;

        let version = platform
            .create_version(repo, boxed(vec![declared("app", "1.0.0", b"chart-a", true)]), true)
            .await
            .unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);

        let units = platform.version_content(version).await.unwrap().unwrap();
        assert!(matches!(units[0].artifacts[0].state, ArtifactState::Deferred { .. }));
    }

    #[tokio::test]
    async fn unchanged_content_reuses_latest_version() {
        let platform = MemoryPlatform::new(Arc::new(MapFetcher::default()));
        let repo = platform.create_repository("charts").await;
        let batch = || boxed(vec![declared("app", "1.0.0", b"chart-a", true)]);

        let first = platform.create_version(repo, batch(), true).await.unwrap();
        let second = platform.create_version(repo, batch(), true).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(platform.content_count().await, 1);
    }

    #[tokio::test]
    async fn additive_sync_keeps_prior_content() {
        let platform = MemoryPlatform::new(Arc::new(MapFetcher::default()));
        let repo = platform.create_repository("charts").await;

        platform
            .create_version(repo, boxed(vec![declared("app", "1.0.0", b"a", true)]), true)
            .await
            .unwrap();
        let additive = platform
            .create_version(repo, boxed(vec![declared("web", "1.0.0", b"w", true)]), false)
            .await
            .unwrap();
        assert_eq!(platform.version_content(additive).await.unwrap().unwrap().len(), 2);

        let mirrored = platform
            .create_version(repo, boxed(vec![declared("web", "1.0.0", b"w", true)]), true)
            .await
            .unwrap();
        let units = platform.version_content(mirrored).await.unwrap().unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].content.name, "web");
    }

    #[tokio::test]
    async fn unknown_repository_is_not_found() {
        let platform = MemoryPlatform::new(Arc::new(MapFetcher::default()));
        let err = platform
            .create_version(RepositoryId(99), boxed(Vec::new()), true)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::NotFound(_)));
    }

    #[tokio::test]
    async fn discarded_publication_is_never_visible() {
        let platform = MemoryPlatform::new(Arc::new(MapFetcher::default()));
        let repo = platform.create_repository("charts").await;
        let version = platform.latest_version(repo).await.unwrap();

        let id = platform.create_publication(version).await.unwrap();
        platform
            .register_published_metadata(id, "index.yaml", Bytes::from_static(b"entries: {}\n"))
            .await
            .unwrap();
        assert!(platform.publication_metadata(id, "index.yaml").await.is_none());

        platform.discard(id).await;
        assert!(platform.finalize(id).await.is_err());
        assert!(platform.publication_files(id).await.is_none());
    }

    #[tokio::test]
    async fn publication_paths_are_unique() {
        let platform = MemoryPlatform::new(Arc::new(MapFetcher::default()));
        let repo = platform.create_repository("charts").await;
        let version = platform.latest_version(repo).await.unwrap();
        let artifact = |body: &[u8]| ContentArtifact {
            relative_path: "app-1.0.0.tgz".to_string(),
            sha256: Sha256Digest::compute(body),
            state: ArtifactState::Downloaded,
        };

        let id = platform.create_publication(version).await.unwrap();
        platform
            .register_published_file(id, "app-1.0.0.tgz", &artifact(&b"a"[..]))
            .await
            .unwrap();
        let err = platform
            .register_published_file(id, "app-1.0.0.tgz", &artifact(&b"b"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::DuplicatePath { .. }));
    }
}

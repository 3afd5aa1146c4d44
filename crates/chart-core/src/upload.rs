//! Direct upload of a single chart archive.

use chart_schema::ChartContent;
use chart_schema::index::{lenient_list, lenient_string};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::io::archive;
use crate::platform::{
    ArtifactState, ContentArtifact, ContentId, ContentRepository, RepositoryId,
    RepositoryVersionRef, StoredArtifact,
};

/// What an upload created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedContent {
    /// The new (or reused) unit.
    pub content: ContentId,
    /// The repository version holding it, when a repository was given.
    pub version: Option<RepositoryVersionRef>,
}

/// The subset of `Chart.yaml` a unit is built from.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartFile {
    #[serde(default, deserialize_with = "lenient_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    version: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    app_version: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    description: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    icon: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    keywords: Vec<String>,
}

/// Turn an already validated archive into a content unit.
///
/// The archive's `Chart.yaml` supplies the metadata and the artifact's own
/// SHA-256 becomes the unit's digest. The artifact is stored as
/// `{name}-{version}.tgz` whatever `filename` it was uploaded under. With
/// `repository`, a new version holding the latest content plus this unit is
/// created.
pub async fn one_shot_upload(
    repo: &dyn ContentRepository,
    artifact: &StoredArtifact,
    filename: &str,
    repository: Option<RepositoryId>,
) -> Result<CreatedContent> {
    let path = artifact.path.clone();
    let raw = tokio::task::spawn_blocking(move || archive::read_chart_metadata(&path))
        .await
        .map_err(|e| Error::InvalidArchive(format!("archive inspection aborted: {e}")))??;
    let (name, version, chart) = parse_chart_file(&raw)?;
    debug!(%name, %version, "read Chart.yaml");

    let content = ChartContent {
        name,
        version,
        digest: artifact.sha256.clone(),
        created: Utc::now(),
        app_version: chart.app_version.filter(|v| !v.is_empty()),
        description: chart.description.filter(|v| !v.is_empty()),
        icon: chart.icon.filter(|v| !v.is_empty()),
        keywords: chart.keywords,
    };
    let key = content.key();
    let stored = ContentArtifact {
        relative_path: content.artifact_filename(),
        sha256: artifact.sha256.clone(),
        state: ArtifactState::Downloaded,
    };

    let id = repo.save_content(content, stored).await?;
    let version = match repository {
        Some(repository) => Some(repo.add_content(repository, &[id]).await?),
        None => None,
    };

    info!(content = %id, %key, filename, "Upload complete");
    Ok(CreatedContent {
        content: id,
        version,
    })
}

/// Parse `Chart.yaml`, returning the required name and version alongside the
/// rest of the file.
fn parse_chart_file(raw: &[u8]) -> Result<(String, String, ChartFile)> {
    let mut chart: ChartFile = serde_yaml_ng::from_slice(raw)
        .map_err(|e| Error::InvalidArchive(format!("Chart.yaml is not valid: {e}")))?;
    let name = chart.name.take().filter(|n| !n.trim().is_empty());
    let version = chart.version.take().filter(|v| !v.trim().is_empty());
    match (name, version) {
        (Some(name), Some(version)) => Ok((name, version, chart)),
        _ => Err(Error::InvalidArchive(
            "Chart.yaml must set name and version".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::archive::tests::build_archive;
    use crate::platform::PlatformError;
    use async_trait::async_trait;
    use chart_schema::Sha256Digest;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRepo {
        saved: Mutex<Vec<(ChartContent, ContentArtifact)>>,
        added: Mutex<Vec<(RepositoryId, Vec<ContentId>)>>,
    }

    #[async_trait]
    impl ContentRepository for RecordingRepo {
        async fn save_content(
            &self,
            content: ChartContent,
            artifact: ContentArtifact,
        ) -> Result<ContentId, PlatformError> {
            let mut saved = self.saved.lock().unwrap();
            saved.push((content, artifact));
            Ok(ContentId(saved.len() as u64))
        }

        async fn add_content(
            &self,
            repository: RepositoryId,
            content: &[ContentId],
        ) -> Result<RepositoryVersionRef, PlatformError> {
            self.added
                .lock()
                .unwrap()
                .push((repository, content.to_vec()));
            Ok(RepositoryVersionRef {
                repository,
                number: 2,
            })
        }
    }

    fn stored(bytes: &[u8]) -> (tempfile::NamedTempFile, StoredArtifact) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        let artifact = StoredArtifact {
            path: file.path().to_path_buf(),
            sha256: Sha256Digest::compute(bytes),
        };
        (file, artifact)
    }

    #[tokio::test]
    async fn creates_unit_from_chart_yaml() {
        let bytes = build_archive(
            &[
                (
                    "app/Chart.yaml",
                    "apiVersion: v2\nname: app\nversion: 1.2.0\nappVersion: \"3.1\"\ndescription: An app\nkeywords: [web, http]\n",
                ),
                ("app/values.yaml", "replicas: 1\n"),
            ],
            true,
        );
        let (_file, artifact) = stored(&bytes);
        let repo = RecordingRepo::default();

        let created = one_shot_upload(&repo, &artifact, "uploads/app-1.2.0.tgz", Some(RepositoryId(4)))
            .await
            .unwrap();
        assert_eq!(created.content, ContentId(1));
        assert_eq!(
            created.version,
            Some(RepositoryVersionRef {
                repository: RepositoryId(4),
                number: 2
            })
        );

        let saved = repo.saved.lock().unwrap();
        let (content, stored) = &saved[0];
        assert_eq!(content.name, "app");
        assert_eq!(content.version, "1.2.0");
        assert_eq!(content.app_version.as_deref(), Some("3.1"));
        assert_eq!(content.keywords, ["web", "http"]);
        assert_eq!(content.digest, artifact.sha256);
        assert_eq!(stored.relative_path, "app-1.2.0.tgz");
        assert_eq!(content.description.as_deref(), Some("An app"));
        assert_eq!(*repo.added.lock().unwrap(), [(RepositoryId(4), vec![ContentId(1)])]);
    }

    #[tokio::test]
    async fn plain_tar_without_repository() {
        let bytes = build_archive(&[("app/Chart.yaml", "name: app\nversion: 0.1.0\n")], false);
        let (_file, artifact) = stored(&bytes);
        let repo = RecordingRepo::default();

        let created = one_shot_upload(&repo, &artifact, "app-0.1.0.tgz", None)
            .await
            .unwrap();
        assert_eq!(created.version, None);
        assert!(repo.added.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn artifact_path_ignores_upload_filename() {
        let repo = RecordingRepo::default();
        for name in ["alpha", "beta"] {
            let path = format!("{name}/Chart.yaml");
            let chart_yaml = format!("name: {name}\nversion: 1.0.0\n");
            let bytes = build_archive(&[(path.as_str(), chart_yaml.as_str())], true);
            let (_file, artifact) = stored(&bytes);
            one_shot_upload(&repo, &artifact, "chart.tgz", None)
                .await
                .unwrap();
        }

        let saved = repo.saved.lock().unwrap();
        let paths: Vec<_> = saved.iter().map(|(_, a)| a.relative_path.as_str()).collect();
        assert_eq!(paths, ["alpha-1.0.0.tgz", "beta-1.0.0.tgz"]);
    }

    #[tokio::test]
    async fn lenient_keywords_in_chart_yaml() {
        let repo = RecordingRepo::default();
        let bytes = build_archive(
            &[("app/Chart.yaml", "name: app\nversion: 1.0.0\nkeywords:\n")],
            true,
        );
        let (_file, artifact) = stored(&bytes);
        one_shot_upload(&repo, &artifact, "app.tgz", None).await.unwrap();

        let bytes = build_archive(
            &[("app/Chart.yaml", "name: app\nversion: 1.1.0\nkeywords: [web, 2048]\n")],
            true,
        );
        let (_file, artifact) = stored(&bytes);
        one_shot_upload(&repo, &artifact, "app.tgz", None).await.unwrap();

        let saved = repo.saved.lock().unwrap();
        assert!(saved[0].0.keywords.is_empty());
        assert_eq!(saved[1].0.keywords, ["web", "2048"]);
    }

    #[tokio::test]
    async fn rejects_archive_without_metadata() {
        let bytes = build_archive(&[("app/values.yaml", "replicas: 1\n")], true);
        let (_file, artifact) = stored(&bytes);
        let repo = RecordingRepo::default();

        let err = one_shot_upload(&repo, &artifact, "app.tgz", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArchive(_)));
        assert!(repo.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_archive_with_two_charts() {
        let bytes = build_archive(
            &[
                ("a/Chart.yaml", "name: a\nversion: 1.0.0\n"),
                ("b/Chart.yaml", "name: b\nversion: 1.0.0\n"),
            ],
            true,
        );
        let (_file, artifact) = stored(&bytes);
        let err = one_shot_upload(&RecordingRepo::default(), &artifact, "x.tgz", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArchive(_)));
    }

    #[tokio::test]
    async fn rejects_chart_yaml_without_version() {
        let bytes = build_archive(&[("app/Chart.yaml", "name: app\n")], true);
        let (_file, artifact) = stored(&bytes);
        let err = one_shot_upload(&RecordingRepo::default(), &artifact, "x.tgz", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArchive(_)));
    }
}

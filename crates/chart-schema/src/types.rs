//! The chart content unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::API_VERSION;
use crate::hash::Sha256Digest;
use crate::index::IndexEntry;

/// One immutable version of one named chart.
///
/// This is the unit of deduplication: two units with the same
/// [`ContentKey`] are the same unit, regardless of which sync or upload
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartContent {
    /// Chart name (e.g. `nginx`).
    pub name: String,
    /// Chart version string (e.g. `1.2.0`). Not required to be semver.
    pub version: String,
    /// SHA256 of the chart archive.
    pub digest: Sha256Digest,
    /// Creation time; defaults to the moment the unit was built.
    pub created: DateTime<Utc>,
    /// Version of the application packaged by the chart.
    pub app_version: Option<String>,
    /// Human readable description.
    pub description: Option<String>,
    /// Icon URI or data reference.
    pub icon: Option<String>,
    /// Search keywords, in declaration order.
    pub keywords: Vec<String>,
}

/// The `(name, version, digest)` triple that uniquely identifies a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey {
    /// Chart name.
    pub name: String,
    /// Chart version.
    pub version: String,
    /// Archive digest.
    pub digest: Sha256Digest,
}

impl std::fmt::Display for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{} ({})", self.name, self.version, self.digest)
    }
}

impl ChartContent {
    /// Build a unit from a decoded index entry.
    ///
    /// An entry without a `created` timestamp gets `now`.
    pub fn from_entry(entry: &IndexEntry, now: DateTime<Utc>) -> Self {
        Self {
            name: entry.name.clone(),
            version: entry.version.clone(),
            digest: entry.digest.clone(),
            created: entry.created.unwrap_or(now),
            app_version: non_empty(entry.app_version.as_deref()),
            description: non_empty(entry.description.as_deref()),
            icon: non_empty(entry.icon.as_deref()),
            keywords: entry.keywords.clone(),
        }
    }

    /// The dedup key of this unit.
    pub fn key(&self) -> ContentKey {
        ContentKey {
            name: self.name.clone(),
            version: self.version.clone(),
            digest: self.digest.clone(),
        }
    }

    /// Filename of the chart archive: `{name}-{version}.tgz`.
    pub fn artifact_filename(&self) -> String {
        artifact_filename(&self.name, &self.version)
    }

    /// Project this unit into an index entry served from `urls`.
    ///
    /// Empty optional values are dropped so they never reach the encoded
    /// document.
    pub fn to_entry(&self, urls: Vec<String>) -> IndexEntry {
        IndexEntry {
            api_version: API_VERSION.to_string(),
            app_version: non_empty(self.app_version.as_deref()),
            created: Some(self.created),
            description: non_empty(self.description.as_deref()),
            digest: self.digest.clone(),
            icon: non_empty(self.icon.as_deref()),
            keywords: self.keywords.clone(),
            name: self.name.clone(),
            urls,
            version: self.version.clone(),
        }
    }
}

/// Filename of a chart archive: `{name}-{version}.tgz`.
pub fn artifact_filename(name: &str, version: &str) -> String {
    format!("{name}-{version}.tgz")
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

//! `index.yaml` codec.
//!
//! Decoding is a two-step affair: the YAML is first read into loosely typed
//! raw records, then every record is validated into an [`IndexEntry`]. The
//! whole document is rejected at the first invalid entry; nothing untyped
//! escapes this module.
//!
//! Encoding groups entries by chart name (sorted), orders each group newest
//! first and never writes null or empty fields.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml_ng::{Mapping, Value};
use thiserror::Error;

use crate::API_VERSION;
use crate::hash::Sha256Digest;
use crate::types::non_empty;

/// Where in a document an invalid entry was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryLocation {
    /// Key of the package group under `entries`.
    pub package: String,
    /// Zero-based position within the package group.
    pub position: usize,
    /// Entry name, if the entry carried a readable one.
    pub name: Option<String>,
    /// Entry version, if the entry carried a readable one.
    pub version: Option<String>,
}

impl fmt::Display for EntryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'[{}]", self.package, self.position)?;
        match (&self.name, &self.version) {
            (Some(name), Some(version)) => write!(f, " ({name}-{version})"),
            (Some(name), None) => write!(f, " ({name})"),
            (None, Some(version)) => write!(f, " (version {version})"),
            (None, None) => Ok(()),
        }
    }
}

/// Errors raised by the index codec.
#[derive(Error, Debug)]
pub enum IndexError {
    /// The bytes are not a YAML mapping of the expected shape.
    #[error("Malformed index: {0}")]
    Syntax(#[from] serde_yaml_ng::Error),

    /// The document has no `entries` mapping.
    #[error("Malformed index: document has no 'entries' mapping")]
    MissingEntries,

    /// One entry failed validation.
    #[error("Malformed index entry {location}: {reason}")]
    MalformedEntry {
        /// Where the entry sits in the document.
        location: EntryLocation,
        /// What is wrong with it.
        reason: String,
    },

    /// An entry's download URL cannot be resolved.
    #[error("Malformed index entry {name}-{version}: invalid download URL '{url}': {reason}")]
    InvalidUrl {
        /// Entry name.
        name: String,
        /// Entry version.
        version: String,
        /// The URL as found in the document.
        url: String,
        /// Why it could not be resolved.
        reason: String,
    },

    /// Serializing a document failed.
    #[error("Failed to encode index: {0}")]
    Encode(#[source] serde_yaml_ng::Error),
}

impl IndexError {
    /// True for every decode-side failure.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Self::Encode(_))
    }
}

/// One validated version record of a chart.
///
/// Field order is alphabetical so the serialized form matches the key order
/// other index producers emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    /// Entry schema version, normally `v1`.
    pub api_version: String,
    /// Version of the packaged application.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    /// When the chart version was created.
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_created"
    )]
    pub created: Option<DateTime<Utc>>,
    /// Human readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// SHA256 of the chart archive.
    pub digest: Sha256Digest,
    /// Icon URI or data reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Search keywords.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// Chart name.
    pub name: String,
    /// Download locations; the first one is the canonical source.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    /// Chart version.
    pub version: String,
}

impl IndexEntry {
    /// The URL the archive should be fetched from.
    pub fn source_url(&self) -> Option<&str> {
        self.urls.first().map(String::as_str)
    }
}

/// A full index document, ready to be encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    /// Document schema version.
    pub api_version: String,
    /// Entries grouped by chart name.
    pub entries: BTreeMap<String, Vec<IndexEntry>>,
    /// When the document was produced.
    #[serde(serialize_with = "serialize_timestamp")]
    pub generated: DateTime<Utc>,
}

impl IndexDocument {
    /// An empty document stamped with `generated`.
    pub fn new(generated: DateTime<Utc>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            entries: BTreeMap::new(),
            generated,
        }
    }

    /// Append `entry` to its chart's group.
    pub fn push(&mut self, entry: IndexEntry) {
        self.entries
            .entry(entry.name.clone())
            .or_default()
            .push(entry);
    }

    /// Total number of entries across all groups.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// True when no group holds an entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Order every group newest first. Entries without a timestamp go last;
    /// ties keep their insertion order.
    pub fn sort_entries(&mut self) {
        for versions in self.entries.values_mut() {
            versions.sort_by(|a, b| b.created.cmp(&a.created));
        }
    }

    /// Serialize to YAML bytes.
    ///
    /// Output is byte-stable for a given document: groups are emitted by name
    /// and each group newest first.
    pub fn encode(&self) -> Result<Vec<u8>, IndexError> {
        let mut sorted = self.clone();
        sorted.sort_entries();
        serde_yaml_ng::to_string(&sorted)
            .map(String::into_bytes)
            .map_err(IndexError::Encode)
    }
}

/// The typed view of a decoded document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedIndex {
    /// Document `apiVersion`, if present.
    pub api_version: Option<String>,
    /// Document `generated` timestamp, if present and readable.
    pub generated: Option<DateTime<Utc>>,
    /// Every entry, in document order.
    pub entries: Vec<IndexEntry>,
}

/// Decode `bytes` into entries, in document order.
pub fn decode(bytes: &[u8]) -> Result<Vec<IndexEntry>, IndexError> {
    decode_document(bytes).map(|doc| doc.entries)
}

/// Encode `entries` as a document stamped with `generated`.
pub fn encode(
    entries: &BTreeMap<String, Vec<IndexEntry>>,
    generated: DateTime<Utc>,
) -> Result<Vec<u8>, IndexError> {
    IndexDocument {
        api_version: API_VERSION.to_string(),
        entries: entries.clone(),
        generated,
    }
    .encode()
}

/// Decode `bytes` into a [`DecodedIndex`].
pub fn decode_document(bytes: &[u8]) -> Result<DecodedIndex, IndexError> {
    let raw: RawDocument = serde_yaml_ng::from_slice(bytes)?;
    let groups = raw.entries.ok_or(IndexError::MissingEntries)?;

    let mut entries = Vec::new();
    for (key, versions) in &groups {
        let Some(package) = key.as_str() else {
            return Err(IndexError::MalformedEntry {
                location: EntryLocation {
                    package: format!("{key:?}"),
                    position: 0,
                    name: None,
                    version: None,
                },
                reason: "package key is not a string".to_string(),
            });
        };

        let Some(versions) = versions.as_sequence() else {
            return Err(IndexError::MalformedEntry {
                location: EntryLocation {
                    package: package.to_string(),
                    position: 0,
                    name: None,
                    version: None,
                },
                reason: "expected a list of versions".to_string(),
            });
        };

        for (position, value) in versions.iter().enumerate() {
            let location = EntryLocation {
                package: package.to_string(),
                position,
                name: scalar_field(value, "name"),
                version: scalar_field(value, "version"),
            };
            let raw: RawEntry =
                serde_yaml_ng::from_value(value.clone()).map_err(|e| IndexError::MalformedEntry {
                    location: location.clone(),
                    reason: e.to_string(),
                })?;
            let entry = raw
                .validate()
                .map_err(|reason| IndexError::MalformedEntry { location, reason })?;
            entries.push(entry);
        }
    }

    Ok(DecodedIndex {
        api_version: raw.api_version,
        generated: raw.generated.as_deref().and_then(|s| parse_timestamp(s).ok()),
        entries,
    })
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(rename = "apiVersion", default, deserialize_with = "lenient_string")]
    api_version: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    generated: Option<String>,
    entries: Option<Mapping>,
}

/// An entry as found on the wire. Unknown keys (`home`, `sources`,
/// `maintainers`, ...) are ignored.
#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "apiVersion", default, deserialize_with = "lenient_string")]
    api_version: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    version: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    digest: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    urls: Vec<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    created: Option<String>,
    #[serde(rename = "appVersion", default, deserialize_with = "lenient_string")]
    app_version: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    description: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    icon: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    keywords: Vec<String>,
}

impl RawEntry {
    fn validate(self) -> Result<IndexEntry, String> {
        let name = required(self.name, "name")?;
        let version = required(self.version, "version")?;
        let digest = Sha256Digest::new(required(self.digest, "digest")?)
            .map_err(|e| e.to_string())?;

        let urls: Vec<String> = self
            .urls
            .into_iter()
            .filter(|u| !u.is_empty())
            .collect();
        if urls.is_empty() {
            return Err("missing required field 'urls' (at least one download URL)".to_string());
        }

        let created = match non_empty(self.created.as_deref()) {
            Some(s) => Some(parse_timestamp(&s).map_err(|e| format!("invalid 'created': {e}"))?),
            None => None,
        };

        Ok(IndexEntry {
            api_version: self.api_version.unwrap_or_else(|| API_VERSION.to_string()),
            app_version: non_empty(self.app_version.as_deref()),
            created,
            description: non_empty(self.description.as_deref()),
            digest,
            icon: non_empty(self.icon.as_deref()),
            keywords: self.keywords,
            name,
            urls,
            version,
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, String> {
    non_empty(value.as_deref()).ok_or_else(|| format!("missing required field '{field}'"))
}

/// Best-effort read of a scalar field for error context.
fn scalar_field(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accept strings, numbers and booleans. `version: 1.0` and `appVersion: 2`
/// are common in hand-written indexes.
pub fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None => Ok(None),
        Some(value) => scalar_string(value).map_err(D::Error::custom),
    }
}

/// A list of scalars, each read like [`lenient_string`]. A null or missing
/// list is empty and null items are dropped, so `keywords: [web, 2048]` and a
/// bare `keywords:` both decode.
pub fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if let Some(s) = scalar_string(item).map_err(D::Error::custom)? {
                    out.push(s);
                }
            }
            Ok(out)
        }
        Some(other) => Err(D::Error::custom(format!(
            "expected a list, found {other:?}"
        ))),
    }
}

fn scalar_string(value: Value) -> Result<Option<String>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        other => Err(format!("expected a scalar value, found {other:?}")),
    }
}

/// Parse an ISO-8601 timestamp. Offsetless timestamps are taken as UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(e) => NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| e),
    }
}

/// Format a timestamp as RFC 3339 with a `Z` suffix.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_timestamp(ts))
}

#[allow(clippy::ref_option)] // signature dictated by serde
fn serialize_created<S: Serializer>(
    ts: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match ts {
        Some(ts) => serialize_timestamp(ts, serializer),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DIGEST_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const DIGEST_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn sample_index() -> String {
        format!(
            r"apiVersion: v1
generated: 2024-03-01T10:00:00Z
entries:
  app:
    - apiVersion: v1
      name: app
      version: 1.1.0
      digest: {DIGEST_B}
      urls:
        - charts/app-1.1.0.tgz
      created: 2024-02-01T00:00:00Z
      appVersion: 2
      keywords: [web, proxy]
      home: https://example.com
    - name: app
      version: 1.0.0
      digest: {DIGEST_A}
      urls: [https://mirror.example.com/app-1.0.0.tgz]
      description: first release
"
        )
    }

    #[test]
    fn decodes_entries_in_document_order() {
        let doc = decode_document(sample_index().as_bytes()).unwrap();
        assert_eq!(doc.api_version.as_deref(), Some("v1"));
        assert!(doc.generated.is_some());

        let entries = doc.entries;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].version, "1.1.0");
        assert_eq!(entries[0].app_version.as_deref(), Some("2"));
        assert_eq!(entries[0].keywords, vec!["web", "proxy"]);
        assert_eq!(entries[1].version, "1.0.0");
        assert_eq!(entries[1].created, None);
        assert!(entries[1].keywords.is_empty());
        assert_eq!(
            entries[1].source_url(),
            Some("https://mirror.example.com/app-1.0.0.tgz")
        );
    }

    #[test]
    fn missing_entries_key_is_malformed() {
        let err = decode(b"apiVersion: v1\ngenerated: 2024-01-01T00:00:00Z\n").unwrap_err();
        assert!(matches!(err, IndexError::MissingEntries));
        assert!(err.is_malformed());
    }

    #[test]
    fn missing_digest_rejects_document_with_context() {
        let yaml = format!(
            r"entries:
  app:
    - name: app
      version: 1.0.0
      digest: {DIGEST_A}
      urls: [a.tgz]
    - name: app
      version: 1.1.0
      urls: [b.tgz]
"
        );
        let err = decode(yaml.as_bytes()).unwrap_err();
        let IndexError::MalformedEntry { location, reason } = err else {
            panic!("expected MalformedEntry, got {err:?}");
        };
        assert_eq!(location.package, "app");
        assert_eq!(location.position, 1);
        assert_eq!(location.version.as_deref(), Some("1.1.0"));
        assert!(reason.contains("digest"), "{reason}");
    }

    #[test]
    fn entry_without_urls_is_malformed() {
        let yaml = format!("entries:\n  app:\n    - name: app\n      version: '1'\n      digest: {DIGEST_A}\n      urls: []\n");
        let err = decode(yaml.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("urls"), "{err}");
    }

    #[test]
    fn list_items_are_read_leniently() {
        let yaml = format!(
            "entries:\n  app:\n    - name: app\n      version: 1.0.0\n      digest: {DIGEST_A}\n      urls: [app-1.0.0.tgz]\n      keywords: [web, 2048, true]\n    - name: app\n      version: 0.9.0\n      digest: {DIGEST_A}\n      urls: [app-0.9.0.tgz]\n      keywords:\n"
        );
        let entries = decode(yaml.as_bytes()).unwrap();
        assert_eq!(entries[0].keywords, ["web", "2048", "true"]);
        assert!(entries[1].keywords.is_empty());
    }

    #[test]
    fn null_urls_is_malformed() {
        let yaml = format!(
            "entries:\n  app:\n    - name: app\n      version: 1.0.0\n      digest: {DIGEST_A}\n      urls:\n"
        );
        let err = decode(yaml.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("urls"), "{err}");
    }

    #[test]
    fn empty_entries_mapping_decodes_to_nothing() {
        assert!(decode(b"apiVersion: v1\nentries: {}\n").unwrap().is_empty());
    }

    #[test]
    fn encode_omits_absent_fields() {
        let mut doc = IndexDocument::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        doc.push(IndexEntry {
            api_version: API_VERSION.to_string(),
            app_version: None,
            created: None,
            description: None,
            digest: Sha256Digest::new(DIGEST_A).unwrap(),
            icon: None,
            keywords: Vec::new(),
            name: "app".to_string(),
            urls: vec!["app-1.0.0.tgz".to_string()],
            version: "1.0.0".to_string(),
        });

        let text = String::from_utf8(doc.encode().unwrap()).unwrap();
        for absent in ["icon", "keywords", "description", "appVersion", "created", "null", "[]"] {
            assert!(!text.contains(absent), "{absent} leaked into:\n{text}");
        }
        assert!(text.contains("generated: 2024-01-01T00:00:00Z"));
    }

    #[test]
    fn encode_orders_groups_by_name_and_versions_newest_first() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let entry = |name: &str, version: &str, created| IndexEntry {
            api_version: API_VERSION.to_string(),
            app_version: None,
            created: Some(created),
            description: None,
            digest: Sha256Digest::new(DIGEST_A).unwrap(),
            icon: None,
            keywords: Vec::new(),
            name: name.to_string(),
            urls: vec![format!("{name}-{version}.tgz")],
            version: version.to_string(),
        };

        let mut doc = IndexDocument::new(t2);
        doc.push(entry("zeta", "1.0.0", t1));
        doc.push(entry("foo", "1.0.0", t1));
        doc.push(entry("foo", "2.0.0", t2));

        let bytes = doc.encode().unwrap();
        assert_eq!(bytes, doc.encode().unwrap(), "encoding is byte-stable");

        let decoded = decode(&bytes).unwrap();
        let order: Vec<_> = decoded
            .iter()
            .map(|e| format!("{}-{}", e.name, e.version))
            .collect();
        assert_eq!(order, vec!["foo-2.0.0", "foo-1.0.0", "zeta-1.0.0"]);
    }

    #[test]
    fn empty_document_encodes_empty_entries() {
        let doc = IndexDocument::new(Utc::now());
        let text = String::from_utf8(doc.encode().unwrap()).unwrap();
        assert!(text.contains("entries: {}"), "{text}");
        assert!(decode(text.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn parses_offsetless_timestamps_as_utc() {
        let ts = parse_timestamp("2019-10-23T15:22:10.123456").unwrap();
        assert_eq!(format_timestamp(&ts), "2019-10-23T15:22:10.123456Z");
    }
}

//! Index and artifact URL derivation.

use chart_schema::INDEX_FILENAME;
use url::Url;

/// URL of the index document for a remote located at `remote_url`.
///
/// A URL that already points at `index.yaml` is used as-is; anything else is
/// treated as the repository base and gets `/index.yaml` appended.
pub fn index_url(remote_url: &str) -> Result<Url, url::ParseError> {
    let trimmed = remote_url.trim();
    if trimmed.ends_with(&format!("/{INDEX_FILENAME}")) {
        return Url::parse(trimmed);
    }
    Url::parse(&format!("{}/{INDEX_FILENAME}", trimmed.trim_end_matches('/')))
}

/// Resolve an entry's download URL against the index it came from.
///
/// Absolute URLs pass through; relative ones are resolved the way a browser
/// would resolve a link found in the index document.
pub fn resolve_artifact_url(index: &Url, entry_url: &str) -> Result<Url, url::ParseError> {
    index.join(entry_url)
}

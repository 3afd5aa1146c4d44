//! Shared types and wire format for chart repositories.
//!
//! This crate is I/O free: it knows how to validate digests, how a chart
//! content unit looks, and how to turn `index.yaml` bytes into typed entries
//! and back.

pub mod hash;
pub mod index;
pub mod types;

// Re-exports
pub use hash::{DigestError, Sha256Digest};
pub use index::{IndexDocument, IndexEntry, IndexError};
pub use types::{ChartContent, ContentKey};

/// API version tag written to, and expected in, index documents and entries.
pub const API_VERSION: &str = "v1";

/// Well-known filename of a repository's index document.
pub const INDEX_FILENAME: &str = "index.yaml";

/// Well-known filename of the metadata file embedded in a chart archive.
pub const CHART_METADATA_FILENAME: &str = "Chart.yaml";

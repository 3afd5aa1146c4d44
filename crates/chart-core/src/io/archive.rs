//! Chart archive inspection.
//!
//! Charts ship as gzip-compressed tarballs with a single top-level directory
//! holding `Chart.yaml`. Plain tarballs are accepted too.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path};

use chart_schema::CHART_METADATA_FILENAME;
use flate2::read::GzDecoder;
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Failures inspecting a chart archive.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Reading or decompressing the archive failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// No `<dir>/Chart.yaml` entry exists.
    #[error("Unable to find Chart.yaml one directory deep in the archive")]
    MissingMetadata,

    /// More than one `<dir>/Chart.yaml` entry exists.
    #[error("Found {0} Chart.yaml files one directory deep; expected exactly one")]
    AmbiguousMetadata(usize),
}

/// Read the raw bytes of the chart's `Chart.yaml` from the archive at `path`.
pub fn read_chart_metadata(path: &Path) -> Result<Vec<u8>, ArchiveError> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let is_gzip = file.read(&mut magic)? == 2 && magic == GZIP_MAGIC;

    let file = File::open(path)?;
    let reader = BufReader::new(file);
    if is_gzip {
        find_metadata(GzDecoder::new(reader))
    } else {
        find_metadata(reader)
    }
}

fn find_metadata<R: Read>(reader: R) -> Result<Vec<u8>, ArchiveError> {
    let mut archive = tar::Archive::new(reader);
    let mut found = None;
    let mut matches = 0usize;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_dir() {
            continue;
        }
        if !is_chart_metadata(&entry.path()?) {
            continue;
        }

        matches += 1;
        if found.is_none() {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            found = Some(buf);
        }
    }

    match (found, matches) {
        (Some(bytes), 1) => Ok(bytes),
        (None, _) => Err(ArchiveError::MissingMetadata),
        (Some(_), n) => Err(ArchiveError::AmbiguousMetadata(n)),
    }
}

/// `<dir>/Chart.yaml`, nothing shallower or deeper.
fn is_chart_metadata(path: &Path) -> bool {
    let components: Vec<_> = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    matches!(
        components.as_slice(),
        [Component::Normal(_), Component::Normal(name)] if *name == CHART_METADATA_FILENAME
    )
}

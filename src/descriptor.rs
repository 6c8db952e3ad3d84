//! File descriptors and upstream metadata records.
//!
//! The upstream lookup service describes a release as a record:
//!
//! ```json
//! {
//!   "title": "Some Release",
//!   "status": "complete",
//!   "num_files": 2,
//!   "files": [
//!     { "filename": "a.mkv", "md5": "…", "links": { "GoFile": "https://gofile.io/d/x" } },
//!     { "filename": "b.mkv", "md5": "…", "links": { "direct": ["https://…/b.001", "https://…/b.002"] } }
//!   ]
//! }
//! ```
//!
//! Every file becomes one [`FileDescriptor`]. A link value may be a single URL
//! or an ordered list of piece URLs; both are canonicalized to a list.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// Record statuses that carry downloadable files.
const READY_STATUSES: [&str; 2] = ["complete", "complete_partial"];

/// Errors that can occur while reading metadata records.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Input is not a record or a list of records.
    #[error("invalid metadata record: {0}")]
    Json(#[from] serde_json::Error),
}

/// One logical output file and where its pieces can be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Grouping directory when several files belong to one release.
    pub bundle_name: Option<String>,
    /// Final relative output path.
    pub filename: String,
    /// Hex content hash the reassembled file must match.
    pub expected_fingerprint: String,
    /// Source name to ordered piece URLs.
    pub sources: BTreeMap<String, Vec<String>>,
}

impl FileDescriptor {
    /// Creates a descriptor without a bundle and without sources.
    pub fn new(filename: impl Into<String>, expected_fingerprint: impl Into<String>) -> Self {
        Self {
            bundle_name: None,
            filename: filename.into(),
            expected_fingerprint: expected_fingerprint.into(),
            sources: BTreeMap::new(),
        }
    }

    /// Sets the bundle directory.
    #[must_use]
    pub fn in_bundle(mut self, bundle_name: impl Into<String>) -> Self {
        self.bundle_name = Some(bundle_name.into());
        self
    }

    /// Adds a source with its ordered piece URLs.
    #[must_use]
    pub fn with_source<I, S>(mut self, name: impl Into<String>, pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources
            .insert(name.into(), pieces.into_iter().map(Into::into).collect());
        self
    }

    /// Ordered piece URLs for `source`.
    #[must_use]
    pub fn pieces_for(&self, source: &str) -> Option<&[String]> {
        self.sources.get(source).map(Vec::as_slice)
    }
}

impl fmt::Display for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bundle_name {
            Some(bundle) => write!(f, "{bundle}/{}", self.filename),
            None => f.write_str(&self.filename),
        }
    }
}

/// One piece of a file on one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    /// 1-based position in the join order.
    pub index: u32,
    /// Source-specific URL handed to the adapter.
    pub source_url: String,
    /// Temporary file the piece is streamed into.
    pub working_path: PathBuf,
}

/// Upstream description of one release.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataRecord {
    /// Release title; the bundle directory for multi-file releases.
    pub title: String,
    /// Processing status; only `complete` and `complete_partial` are ready.
    #[serde(default)]
    pub status: Option<String>,
    /// Declared file count.
    #[serde(default)]
    pub num_files: Option<usize>,
    /// Files in the release.
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

/// Upstream description of one file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileRecord {
    /// Output filename.
    pub filename: String,
    /// Published content hash.
    #[serde(alias = "fingerprint")]
    pub md5: String,
    /// Source name to one URL or a list of piece URLs. Missing until pieces
    /// have been uploaded somewhere.
    #[serde(default)]
    pub links: BTreeMap<String, Links>,
}

/// A link value: a single URL or an ordered list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Links {
    /// One URL.
    One(String),
    /// Ordered piece URLs.
    Many(Vec<String>),
}

impl Links {
    /// Canonical list form.
    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(url) => vec![url],
            Self::Many(urls) => urls,
        }
    }
}

impl MetadataRecord {
    /// Returns true when the record's files can be downloaded.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        match &self.status {
            None => true,
            Some(status) => READY_STATUSES.contains(&status.as_str()),
        }
    }

    /// Builds one descriptor per file. Records that are not ready yield none.
    #[must_use]
    pub fn descriptors(&self) -> Vec<FileDescriptor> {
        if !self.is_ready() {
            info!(
                title = %self.title,
                status = self.status.as_deref().unwrap_or_default(),
                "record is not complete yet, skipping"
            );
            return Vec::new();
        }

        let file_count = self.num_files.unwrap_or(self.files.len());
        let bundle = (file_count > 1).then(|| self.title.clone());

        self.files
            .iter()
            .map(|file| {
                let sources: BTreeMap<String, Vec<String>> = file
                    .links
                    .iter()
                    .map(|(name, links)| (name.clone(), links.clone().into_vec()))
                    .filter(|(_, urls)| !urls.is_empty())
                    .collect();
                debug!(filename = %file.filename, sources = sources.len(), "descriptor");
                FileDescriptor {
                    bundle_name: bundle.clone(),
                    filename: file.filename.clone(),
                    expected_fingerprint: file.md5.clone(),
                    sources,
                }
            })
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(Box<MetadataRecord>),
    Many(Vec<MetadataRecord>),
}

/// Parses a single record or a JSON array of records.
///
/// # Errors
///
/// Returns [`MetadataError::Json`] when the input matches neither shape.
pub fn parse_records(input: &str) -> Result<Vec<MetadataRecord>, MetadataError> {
    Ok(match serde_json::from_str::<OneOrMany>(input)? {
        OneOrMany::One(record) => vec![*record],
        OneOrMany::Many(records) => records,
    })
}

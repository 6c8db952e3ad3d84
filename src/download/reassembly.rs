//! Joining pieces into the final artifact and verifying its fingerprint.
//!
//! The fingerprint is computed while the bytes stream past, never by reading
//! the output again afterwards. A mismatching output is moved aside to
//! `badsum-<name>` so it can be inspected but is never mistaken for a good
//! file.

use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use super::constants::COPY_CHUNK_SIZE;
use super::layout::quarantine_path;

/// Errors that can occur while reassembling a file.
#[derive(Debug, Error)]
pub enum ReassemblyError {
    /// The output's fingerprint differs from the published one. The output
    /// has been moved to `quarantined`.
    #[error("fingerprint mismatch: expected {expected}, got {actual} (moved to {})", .quarantined.display())]
    Mismatch {
        /// Published fingerprint.
        expected: String,
        /// Fingerprint of the bytes written.
        actual: String,
        /// Where the output was moved.
        quarantined: PathBuf,
    },

    /// File system error.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Nothing to join.
    #[error("no pieces to reassemble into {}", .path.display())]
    NoPieces {
        /// The intended output path.
        path: PathBuf,
    },
}

impl ReassemblyError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Running content hash. The algorithm follows the published digest: 64 hex
/// characters select SHA-256, anything else MD5.
#[derive(Clone)]
pub enum Fingerprinter {
    /// MD5, as published by the upstream metadata service.
    Md5(md5::Context),
    /// SHA-256.
    Sha256(Sha256),
}

impl fmt::Debug for Fingerprinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5(_) => f.write_str("Fingerprinter::Md5"),
            Self::Sha256(_) => f.write_str("Fingerprinter::Sha256"),
        }
    }
}

impl Fingerprinter {
    /// Picks the algorithm matching `expected`.
    #[must_use]
    pub fn for_expected(expected: &str) -> Self {
        if expected.len() == 64 {
            Self::Sha256(Sha256::new())
        } else {
            Self::Md5(md5::Context::new())
        }
    }

    /// Feeds bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Md5(context) => context.consume(bytes),
            Self::Sha256(hasher) => hasher.update(bytes),
        }
    }

    /// Lowercase hex digest.
    #[must_use]
    pub fn finalize(self) -> String {
        match self {
            Self::Md5(context) => hex::encode(context.compute().0),
            Self::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Case-insensitive hex comparison.
#[must_use]
pub fn fingerprints_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// Joins `pieces` (in order) into `final_path` and verifies the result.
///
/// A single piece is hashed and then renamed into place (copied and deleted
/// when rename crosses file systems). Several pieces are concatenated chunk
/// by chunk, each piece deleted once fully consumed. Returns the lowercase
/// hex fingerprint.
///
/// # Errors
///
/// - [`ReassemblyError::Mismatch`] when the fingerprint differs; the output
///   has already been quarantined.
/// - [`ReassemblyError::Io`] on file system failures; a partial output is
///   removed.
/// - [`ReassemblyError::NoPieces`] when `pieces` is empty.
#[instrument(skip(pieces), fields(pieces = pieces.len(), path = %final_path.display()))]
pub async fn reassemble(
    pieces: &[PathBuf],
    final_path: &Path,
    expected_fingerprint: &str,
) -> Result<String, ReassemblyError> {
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ReassemblyError::io(parent, e))?;
    }

    let mut hasher = Fingerprinter::for_expected(expected_fingerprint);
    match pieces {
        [] => {
            return Err(ReassemblyError::NoPieces {
                path: final_path.to_path_buf(),
            });
        }
        [single] => {
            hash_file(single, &mut hasher).await?;
            move_file(single, final_path).await?;
        }
        many => {
            if let Err(error) = concatenate(many, final_path, &mut hasher).await {
                if let Err(cleanup) = remove_partial_output(final_path).await {
                    warn!(
                        path = %final_path.display(),
                        error = %cleanup,
                        "could not remove partial output"
                    );
                }
                return Err(error);
            }
        }
    }

    let actual = hasher.finalize();
    if fingerprints_match(expected_fingerprint, &actual) {
        info!(fingerprint = %actual, "fingerprint verified");
        return Ok(actual);
    }

    let quarantined = quarantine(final_path).await?;
    Err(ReassemblyError::Mismatch {
        expected: expected_fingerprint.to_string(),
        actual,
        quarantined,
    })
}

/// Moves `final_path` to its `badsum-` name, replacing an older quarantined
/// file of the same name.
///
/// # Errors
///
/// [`ReassemblyError::Io`] when the rename fails.
pub async fn quarantine(final_path: &Path) -> Result<PathBuf, ReassemblyError> {
    let target = quarantine_path(final_path);
    fs::rename(final_path, &target)
        .await
        .map_err(|e| ReassemblyError::io(final_path, e))?;
    warn!(path = %target.display(), "output quarantined");
    Ok(target)
}

async fn hash_file(path: &Path, hasher: &mut Fingerprinter) -> Result<u64, ReassemblyError> {
    let mut file = File::open(path)
        .await
        .map_err(|e| ReassemblyError::io(path, e))?;
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| ReassemblyError::io(path, e))?;
        if read == 0 {
            return Ok(total);
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
}

async fn move_file(from: &Path, to: &Path) -> Result<(), ReassemblyError> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    debug!(from = %from.display(), to = %to.display(), "rename failed, copying");
    fs::copy(from, to)
        .await
        .map_err(|e| ReassemblyError::io(to, e))?;
    fs::remove_file(from)
        .await
        .map_err(|e| ReassemblyError::io(from, e))
}

async fn concatenate(
    pieces: &[PathBuf],
    final_path: &Path,
    hasher: &mut Fingerprinter,
) -> Result<(), ReassemblyError> {
    let output = File::create(final_path)
        .await
        .map_err(|e| ReassemblyError::io(final_path, e))?;
    let mut writer = BufWriter::new(output);
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];

    for piece in pieces {
        let mut input = File::open(piece)
            .await
            .map_err(|e| ReassemblyError::io(piece, e))?;
        loop {
            let read = input
                .read(&mut buffer)
                .await
                .map_err(|e| ReassemblyError::io(piece, e))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            writer
                .write_all(&buffer[..read])
                .await
                .map_err(|e| ReassemblyError::io(final_path, e))?;
        }
        drop(input);
        fs::remove_file(piece)
            .await
            .map_err(|e| ReassemblyError::io(piece, e))?;
        debug!(piece = %piece.display(), "piece consumed");
    }

    writer
        .flush()
        .await
        .map_err(|e| ReassemblyError::io(final_path, e))
}

/// Removes a partially written output. A missing file is not an error.
async fn remove_partial_output(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

//! Output, working and quarantine path derivation.
//!
//! ```text
//! <output_dir>/<bundle?>/<filename>           final artifact
//! <working_dir>/<bundle?>/<filename>.<NNN>    piece NNN (1-based, 3 digits)
//! <dir>/badsum-<basename>                     fingerprint mismatch
//! ```
//!
//! Names from metadata are untrusted. Each segment is sanitized so that a
//! descriptor can never place a file outside the two roots.

use std::path::{Component, Path, PathBuf};

use super::constants::QUARANTINE_PREFIX;
use crate::descriptor::{FileDescriptor, Piece};

/// Root directories for outputs and in-progress pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    output_dir: PathBuf,
    working_dir: PathBuf,
}

impl Layout {
    /// Creates a layout from the two roots.
    pub fn new(output_dir: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            working_dir: working_dir.into(),
        }
    }

    /// Root of final artifacts.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Root of working pieces.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Final output path of `descriptor`.
    #[must_use]
    pub fn final_path(&self, descriptor: &FileDescriptor) -> PathBuf {
        self.output_dir.join(relative_path(descriptor))
    }

    /// Working path of piece `index` (1-based).
    #[must_use]
    pub fn working_path(&self, descriptor: &FileDescriptor, index: u32) -> PathBuf {
        let mut path = self.working_dir.join(relative_path(descriptor));
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{index:03}"));
        path.set_file_name(name);
        path
    }

    /// Builds the ordered pieces for one source's URLs.
    #[must_use]
    pub fn pieces(&self, descriptor: &FileDescriptor, urls: &[String]) -> Vec<Piece> {
        (1..)
            .zip(urls)
            .map(|(index, url)| Piece {
                index,
                source_url: url.clone(),
                working_path: self.working_path(descriptor, index),
            })
            .collect()
    }
}

/// Quarantine path for a final output: `badsum-` prefixed basename in the
/// same directory.
#[must_use]
pub fn quarantine_path(final_path: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(QUARANTINE_PREFIX);
    name.push(final_path.file_name().unwrap_or_default());
    final_path.with_file_name(name)
}

/// Relative `<bundle?>/<filename>` with every segment sanitized.
fn relative_path(descriptor: &FileDescriptor) -> PathBuf {
    let mut relative = PathBuf::new();
    if let Some(bundle) = &descriptor.bundle_name {
        relative.push(sanitize_filename(bundle));
    }

    let mut pushed = false;
    for component in Path::new(&descriptor.filename).components() {
        if let Component::Normal(segment) = component {
            relative.push(sanitize_filename(&segment.to_string_lossy()));
            pushed = true;
        }
    }
    if !pushed {
        relative.push("_");
    }
    relative
}

/// Sanitizes one path segment.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

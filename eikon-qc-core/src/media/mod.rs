//! Media discovery under a crawl root.

pub mod sequence;

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::Result;

pub use sequence::{FrameSummary, SequenceGroups, SequenceKey, group_sequences, summarize_frames};

/// Extensions (lowercase, no dot) treated as media.
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mxf", "wav", "aif", "aiff", "mov", "mp4", "exr", "dpx", "tif", "tiff", "jpg", "png",
];

/// Subset of [`MEDIA_EXTENSIONS`] that may form frame sequences.
pub const SEQUENCE_EXTENSIONS: &[&str] = &["exr", "dpx", "tif", "tiff", "jpg", "png"];

pub(crate) fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

pub fn is_media(path: &Path) -> bool {
    lowercase_extension(path).is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_sequence_candidate(path: &Path) -> bool {
    lowercase_extension(path).is_some_and(|ext| SEQUENCE_EXTENSIONS.contains(&ext.as_str()))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_str().is_some_and(|name| name.starts_with('.'))
}

/// Recursively list media files under `root`, skipping hidden entries.
///
/// The root itself is never filtered, so crawling a dot-directory works.
/// A root that cannot be walked at all is an error; unreadable entries
/// below it are logged and skipped. Output is sorted.
pub fn iter_media(root: &Path) -> Result<Vec<PathBuf>> {
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));

    let mut found = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && is_media(entry.path()) {
                    found.push(entry.into_path());
                }
            }
            Err(err) if err.depth() == 0 => return Err(err.into()),
            Err(err) => warn!("Error walking {}: {}", root.display(), err),
        }
    }
    found.sort();
    debug!("{} media files under {}", found.len(), root.display());
    Ok(found)
}

//! Removal of every QC artifact under a root.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::sidecar::{SIDECAR_SUBDIR, SidecarStore};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Artifact {
    File(PathBuf),
    /// A `.qc/` directory, removed with its contents.
    Dir(PathBuf),
}

impl Artifact {
    pub fn path(&self) -> &Path {
        match self {
            Artifact::File(path) | Artifact::Dir(path) => path,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanReport {
    /// Removed (or, on a dry run, would-be-removed) artifacts.
    pub removed: Vec<Artifact>,
    pub failed: Vec<PathBuf>,
}

/// Sidecars, sequence sidecars, hash caches and `.qc/` directories under
/// `root`. Nothing inside a `.qc/` directory is listed separately.
pub fn find_artifacts(store: &SidecarStore, hash_cache_name: &str, root: &Path) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    let mut walker = WalkDir::new(root).into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Error walking {}: {}", root.display(), err);
                continue;
            }
        };
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };

        if entry.file_type().is_dir() {
            if entry.depth() > 0 && name == SIDECAR_SUBDIR {
                artifacts.push(Artifact::Dir(entry.path().to_path_buf()));
                walker.skip_current_dir();
            }
            continue;
        }

        if store.is_sidecar_name(name) || name == hash_cache_name {
            artifacts.push(Artifact::File(entry.path().to_path_buf()));
        }
    }
    artifacts
}

pub fn clean(
    store: &SidecarStore,
    hash_cache_name: &str,
    root: &Path,
    dry_run: bool,
) -> CleanReport {
    let mut report = CleanReport::default();

    for artifact in find_artifacts(store, hash_cache_name, root) {
        if dry_run {
            debug!("[DRY-RUN] Would remove: {}", artifact.path().display());
            report.removed.push(artifact);
            continue;
        }

        let result = match &artifact {
            Artifact::File(path) => fs::remove_file(path),
            Artifact::Dir(path) => fs::remove_dir_all(path),
        };
        match result {
            Ok(()) => {
                info!("Removed: {}", artifact.path().display());
                report.removed.push(artifact);
            }
            Err(err) => {
                warn!("Failed to remove {}: {}", artifact.path().display(), err);
                report.failed.push(artifact.path().to_path_buf());
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QcSettings, SidecarMode};
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, b"{}").expect("touch");
    }

    #[test]
    fn removes_every_artifact_kind_and_keeps_media() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        touch(root, "a/clip.mov");
        touch(root, "a/clip.mov.qc.json");
        touch(root, "a/.clip.mov.qc.json");
        touch(root, "a/.qc/clip.mov.qc.json");
        touch(root, "seq/qc.sequence.json");
        touch(root, "seq/.qc.sequence.json");
        touch(root, "seq/.qc.hashcache.json");
        touch(root, "seq/shot.0001.exr");

        let settings = QcSettings::default();
        let store = SidecarStore::new(&settings, SidecarMode::Subdir);

        let preview = clean(&store, &settings.hash_cache_name, root, true);
        assert_eq!(preview.removed.len(), 6);
        assert!(root.join("a/.qc").exists(), "dry run must not delete");

        let report = clean(&store, &settings.hash_cache_name, root, false);
        assert_eq!(report.removed.len(), 6);
        assert!(report.failed.is_empty());
        assert!(!root.join("a/.qc").exists());
        assert!(!root.join("seq/.qc.hashcache.json").exists());
        assert!(root.join("a/clip.mov").exists());
        assert!(root.join("seq/shot.0001.exr").exists());
    }
}

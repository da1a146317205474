//! Fan-out over a crawl root and the post-run missing-content sweep.

use std::{
    collections::BTreeSet,
    fs,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::{
    config::RunConfig,
    error::{QcError, Result},
    media::{self, SequenceKey, group_sequences, iter_media},
    reconcile::{Outcome, ProcessedUnit, Reconciler},
    sidecar::{ContentState, SidecarRecord, SidecarStore},
    tracker::AssetTracker,
};

/// Tally for one crawl root.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub root: PathBuf,
    pub media_files: usize,
    pub sequences: usize,
    pub singles: usize,
    pub marked: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub missing_marked: usize,
    /// Units that failed with a per-asset error.
    pub worker_errors: usize,
}

#[derive(Clone, Debug)]
pub struct RunCoordinator {
    config: Arc<RunConfig>,
    reconciler: Reconciler,
}

impl RunCoordinator {
    pub fn new(config: Arc<RunConfig>, tracker: Arc<dyn AssetTracker>) -> Self {
        let reconciler = Reconciler::new(Arc::clone(&config), tracker);
        Self { config, reconciler }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Crawl every root. `asset_ids` is either empty, a single id shared by
    /// all roots, or one id per root; any other length is rejected before
    /// any work starts.
    pub async fn run_many(
        &self,
        roots: &[PathBuf],
        asset_ids: &[String],
    ) -> Result<Vec<RunSummary>> {
        let pairing = pair_asset_ids(roots.len(), asset_ids)?;

        let mut summaries = Vec::with_capacity(roots.len());
        for (root, asset_id) in roots.iter().zip(pairing) {
            summaries.push(self.run(root, asset_id).await?);
        }
        Ok(summaries)
    }

    /// Reconcile every sequence and loose file under `root`, then sweep for
    /// sidecars whose media disappeared.
    pub async fn run(&self, root: &Path, asset_id: Option<String>) -> Result<RunSummary> {
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let min_seq = self.config.min_sequence_len;

        let scan_root = root.clone();
        let (files, groups) = tokio::task::spawn_blocking(move || {
            let files = iter_media(&scan_root)?;
            let groups = group_sequences(&files, min_seq);
            Ok::<_, QcError>((files, groups))
        })
        .await??;

        info!(
            target: "qc::run",
            "QC crawl starting for {}: {} media files ({} sequences, {} singles)",
            root.display(),
            files.len(),
            groups.sequences.len(),
            groups.singles.len()
        );

        let mut summary = RunSummary {
            root: root.clone(),
            media_files: files.len(),
            sequences: groups.sequences.len(),
            singles: groups.singles.len(),
            ..RunSummary::default()
        };

        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks: JoinSet<Result<ProcessedUnit>> = JoinSet::new();
        let shared_dirs = shared_sequence_dirs(groups.sequences.keys());

        for (key, frames) in groups.sequences {
            let reconciler = self.reconciler.clone();
            let permits = Arc::clone(&permits);
            let asset_id = asset_id.clone();
            let shared_dir = shared_dirs.contains(&key.dir);
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| QcError::Internal(e.to_string()))?;
                reconciler.process_sequence(key, frames, asset_id, shared_dir).await
            });
        }
        for path in groups.singles {
            let reconciler = self.reconciler.clone();
            let permits = Arc::clone(&permits);
            let asset_id = asset_id.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| QcError::Internal(e.to_string()))?;
                reconciler.process_single_file(path, asset_id).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(QcError::from).and_then(|result| result) {
                Ok(unit) => match unit.outcome {
                    Outcome::Marked => summary.marked.push(unit.path),
                    Outcome::Skip => summary.skipped.push(unit.path),
                },
                Err(err) => {
                    summary.worker_errors += 1;
                    error!(target: "qc::run", "Worker error: {}", err);
                }
            }
        }
        summary.marked.sort();
        summary.skipped.sort();

        info!(
            target: "qc::run",
            "Marked: {}, Skipped: {}",
            summary.marked.len(),
            summary.skipped.len()
        );

        let sweeper = self.reconciler.store().clone();
        let sweep_root = root.clone();
        summary.missing_marked =
            tokio::task::spawn_blocking(move || mark_missing_content(&sweeper, &sweep_root))
                .await?;
        if summary.missing_marked > 0 {
            info!(target: "qc::run", "Marked missing: {}", summary.missing_marked);
        }

        info!(
            target: "qc::run",
            root = %root.display(),
            sequences = summary.sequences,
            singles = summary.singles,
            marked = summary.marked.len(),
            skipped = summary.skipped.len(),
            missing_marked = summary.missing_marked,
            worker_errors = summary.worker_errors,
            "QC crawl summary"
        );
        Ok(summary)
    }
}

/// Directories holding more than one sequence.
fn shared_sequence_dirs<'a>(keys: impl Iterator<Item = &'a SequenceKey>) -> BTreeSet<PathBuf> {
    let mut seen = BTreeSet::new();
    let mut shared = BTreeSet::new();
    for key in keys {
        if !seen.insert(&key.dir) {
            shared.insert(key.dir.clone());
        }
    }
    shared
}

/// Explicit asset id per root.
pub fn pair_asset_ids(roots: usize, asset_ids: &[String]) -> Result<Vec<Option<String>>> {
    match asset_ids.len() {
        0 => Ok(vec![None; roots]),
        1 => Ok(vec![Some(asset_ids[0].clone()); roots]),
        n if n == roots => Ok(asset_ids.iter().cloned().map(Some).collect()),
        n => Err(QcError::Config(format!(
            "got {n} asset ids for {roots} roots; pass one id, or exactly one per root"
        ))),
    }
}

/// Every sidecar file under `root`, hidden directories included.
pub fn find_sidecars(store: &SidecarStore, root: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!("skipping unreadable entry under {}: {}", root.display(), err);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| store.is_sidecar_name(name))
        })
        .map(|entry| entry.into_path())
        .collect();
    found.sort();
    found
}

/// Flag sidecars whose media is gone as `content_state = missing`.
///
/// Only `content_state` changes; the QC event fields are left alone.
/// Records already marked missing are not rewritten. Returns how many
/// sidecars were updated.
pub fn mark_missing_content(store: &SidecarStore, root: &Path) -> usize {
    let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let mut marked = 0;

    for sidecar_path in find_sidecars(store, &root) {
        let Some(mut record) = store.read(&sidecar_path) else {
            continue;
        };
        let Some(asset_path) = record.asset_path.as_deref().filter(|p| !p.is_empty()) else {
            continue;
        };

        let asset_path = resolve_under(&root, Path::new(asset_path));
        if !asset_path.starts_with(&root) {
            continue;
        }
        if media_exists(&record, &asset_path) {
            continue;
        }
        if record.content_state == Some(ContentState::Missing) {
            continue;
        }

        record.content_state = Some(ContentState::Missing);
        match store.write(&sidecar_path, &record) {
            Ok(()) => {
                marked += 1;
                info!(
                    target: "qc::run",
                    "media gone for {}; marked missing",
                    asset_path.display()
                );
            }
            Err(err) => error!(
                target: "qc::run",
                "could not mark {} missing: {}",
                sidecar_path.display(),
                err
            ),
        }
    }
    marked
}

/// Absolute, lexically normalized form of `path` (relative paths are taken
/// against `root`). Symlinks are resolved when the target still exists.
fn resolve_under(root: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    if let Ok(real) = fs::canonicalize(&joined) {
        return real;
    }

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn media_exists(record: &SidecarRecord, asset_path: &Path) -> bool {
    match &record.sequence {
        Some(seq) => {
            let dir = if asset_path.is_dir() {
                asset_path
            } else {
                asset_path.parent().unwrap_or(asset_path)
            };
            sequence_frames_remain(dir, seq.base.trim(), &seq.ext)
        }
        None => asset_path.exists(),
    }
}

/// Any file in `dir` with the sequence's extension whose name starts with
/// `base`.
fn sequence_frames_remain(dir: &Path, base: &str, ext: &str) -> bool {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };

    entries.filter_map(|entry| entry.ok()).any(|entry| {
        let path = entry.path();
        if !path.is_file() {
            return false;
        }
        if !ext.is_empty() && media::lowercase_extension(&path).as_deref() != Some(ext.as_str()) {
            return false;
        }
        base.is_empty()
            || entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(base))
    })
}

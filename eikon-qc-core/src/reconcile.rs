//! Per-asset reconciliation.
//!
//! One call handles one single file or one frame sequence: fingerprint it,
//! compare with the stored sidecar, decide whether a re-QC event is needed,
//! and if so write a new record, tag the asset and notify the tracker.
//!
//! Automated runs (no operator verdict) only ever flag assets as `pending`
//! and keep the existing `qc_id`. Operator runs always rewrite the sidecar
//! with a fresh `qc_id`, and a non-pending operator verdict becomes the new
//! "last valid" QC event.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::RunConfig,
    error::Result,
    fingerprint::{self, CheapFingerprint, HashCache},
    media::{SequenceKey, summarize_frames},
    mutation::{MutationReport, detect_sequence_mutation, summarize_frame_spans},
    sidecar::{
        ContentState, SCHEMA_VERSION, SequenceInfo, SidecarRecord, SidecarStore, TrackerStatus,
    },
    tagging,
    tracker::{AssetTracker, TrackerLookup},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// A new sidecar record was written.
    Marked,
    /// Stored state is still valid.
    Skip,
}

/// What happened to one unit of work, and the path naming it
/// (`dir/base*.ext` for sequences).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessedUnit {
    pub outcome: Outcome,
    pub path: PathBuf,
}

impl ProcessedUnit {
    fn new(outcome: Outcome, path: PathBuf) -> Self {
        Self { outcome, path }
    }
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Shared, immutable per-run reconciliation engine.
#[derive(Clone, Debug)]
pub struct Reconciler {
    config: Arc<RunConfig>,
    store: Arc<SidecarStore>,
    tracker: Arc<dyn AssetTracker>,
}

impl Reconciler {
    pub fn new(config: Arc<RunConfig>, tracker: Arc<dyn AssetTracker>) -> Self {
        let store = SidecarStore::new(&config.settings, config.sidecar_mode);
        Self::with_store(config, store, tracker)
    }

    pub fn with_store(
        config: Arc<RunConfig>,
        store: SidecarStore,
        tracker: Arc<dyn AssetTracker>,
    ) -> Self {
        Self {
            config,
            store: Arc::new(store),
            tracker,
        }
    }

    pub fn store(&self) -> &SidecarStore {
        &self.store
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn forced(&self) -> bool {
        self.config.operator_forced()
    }

    fn policy_matches(&self, existing: &SidecarRecord) -> bool {
        existing.policy_version.as_deref() == Some(self.store.policy_version())
    }

    /// Reconcile one loose media file.
    pub async fn process_single_file(
        &self,
        path: PathBuf,
        asset_id: Option<String>,
    ) -> Result<ProcessedUnit> {
        let sidecar_path = self.store.path_for_file(&path);

        let (existing, hash) = {
            let store = Arc::clone(&self.store);
            let (path, sidecar_path) = (path.clone(), sidecar_path.clone());
            blocking(move || {
                let existing = store.read(&sidecar_path);
                let hash = fingerprint::content_hash(&path)?;
                Ok((existing, hash))
            })
            .await?
        };

        if !self.forced() && !self.store.needs_reqc(existing.as_ref(), &hash) {
            if let Some(existing) = existing
                && existing.content_state == Some(ContentState::Missing)
            {
                let mut restored = existing;
                restored.content_state = Some(ContentState::Unchanged);
                self.write_in_background(sidecar_path, restored).await?;
            }
            debug!(target: "qc::reconcile", "skip {}: unchanged", path.display());
            return Ok(ProcessedUnit::new(Outcome::Skip, path));
        }

        let (asset_id, lookup) = match asset_id {
            Some(id) => (Some(id), None),
            None => {
                let lookup = self.tracker.lookup_by_path(&path).await;
                (lookup.asset_id.clone(), Some(lookup))
            }
        };
        let asset_id = asset_id.or_else(|| existing.as_ref().and_then(|e| e.asset_id.clone()));

        let record = self.build_record(existing.as_ref(), &path, hash, asset_id, lookup.as_ref());
        self.commit(&path, sidecar_path, &record).await?;

        info!(
            target: "qc::reconcile",
            path = %path.display(),
            state = %record.content_state.as_ref().map_or("-", ContentState::as_str),
            result = %record.qc_result,
            "marked"
        );
        Ok(ProcessedUnit::new(Outcome::Marked, path))
    }

    /// Reconcile one frame sequence. `frames` must be sorted; `shared_dir`
    /// says whether other sequences live in the same directory.
    pub async fn process_sequence(
        &self,
        key: SequenceKey,
        frames: Vec<PathBuf>,
        asset_id: Option<String>,
        shared_dir: bool,
    ) -> Result<ProcessedUnit> {
        let display_path = key.representative_path();
        let sidecar_path = self.store.path_for_sequence_key(&key, shared_dir);

        let analysis = {
            let this = self.clone();
            let (key, frames, sidecar_path) = (key.clone(), frames.clone(), sidecar_path.clone());
            blocking(move || this.analyze_sequence(&key, &frames, &sidecar_path, shared_dir))
                .await?
        };

        let SequenceAnalysis::Proceed {
            existing,
            hash,
            cheap_fp,
            adopted_from,
        } = analysis
        else {
            debug!(target: "qc::reconcile", "skip {}: unchanged", display_path.display());
            return Ok(ProcessedUnit::new(Outcome::Skip, display_path));
        };

        let (asset_id, lookup) = match asset_id {
            Some(id) => (Some(id), None),
            None => self.lookup_sequence(&key.dir, frames.first()).await,
        };
        let asset_id = asset_id.or_else(|| existing.as_ref().and_then(|e| e.asset_id.clone()));

        let mut record =
            self.build_record(existing.as_ref(), &key.dir, hash, asset_id, lookup.as_ref());
        record.sequence = Some(sequence_info(
            &key,
            &frames,
            cheap_fp,
            record.content_hash.clone(),
            existing.as_ref().and_then(|e| e.sequence.as_ref()),
        ));

        self.commit(&key.dir, sidecar_path, &record).await?;
        if let Some(old) = adopted_from {
            blocking(move || {
                retire_sidecar(&old);
                Ok(())
            })
            .await?;
        }

        info!(
            target: "qc::reconcile",
            path = %display_path.display(),
            frames = frames.len(),
            state = %record.content_state.as_ref().map_or("-", ContentState::as_str),
            result = %record.qc_result,
            "marked"
        );
        Ok(ProcessedUnit::new(Outcome::Marked, display_path))
    }

    /// Blocking part of sequence processing: fingerprints, hashing, the
    /// re-QC decision and skip-path bookkeeping.
    fn analyze_sequence(
        &self,
        key: &SequenceKey,
        frames: &[PathBuf],
        sidecar_path: &Path,
        shared_dir: bool,
    ) -> Result<SequenceAnalysis> {
        let (existing, adopted_from) = self.read_sequence_record(key, sidecar_path, shared_dir);
        let cheap_fp = fingerprint::cheap_fingerprint(frames)?;
        let forced = self.forced();

        if !forced
            && let Some(existing) = &existing
            && self.policy_matches(existing)
            && existing.stored_cheap_fp() == Some(&cheap_fp)
            && existing.content_state != Some(ContentState::Missing)
        {
            if let Some(old) = &adopted_from {
                self.store.write(sidecar_path, existing)?;
                retire_sidecar(old);
            }
            return Ok(SequenceAnalysis::Skip);
        }

        let reusable_hash = existing
            .as_ref()
            .filter(|e| forced && self.policy_matches(e) && e.stored_cheap_fp() == Some(&cheap_fp))
            .and_then(|e| e.content_hash.clone());

        let settings = &self.config.settings;
        let mutation_config = self.config.mutation.as_ref();
        let mut report: Option<MutationReport> = None;

        let hash = match reusable_hash {
            Some(hash) => hash,
            None => {
                let mut cache = HashCache::load(&key.dir, &settings.hash_cache_name);
                let previous = mutation_config.map(|_| frame_hashes(&cache, key, None));

                let hash = fingerprint::manifest_hash(frames, &mut cache)?;

                let on_disk: BTreeSet<String> =
                    frames.iter().filter_map(|p| file_name(p)).collect();
                let pruned = cache.prune(|name| key.matches(name) && !on_disk.contains(name));
                if pruned > 0 {
                    debug!("pruned {} stale hash cache entries in {}", pruned, key.dir.display());
                }
                cache.save(&key.dir, &settings.hash_cache_name);

                if let (Some(config), Some(previous)) = (mutation_config, previous) {
                    let current = frame_hashes(&cache, key, Some(&on_disk));
                    let previous = (!previous.is_empty()).then_some(&previous);
                    report = Some(detect_sequence_mutation(previous, &current, config));
                }
                hash
            }
        };

        if let (Some(report), Some(_)) = (&report, &existing)
            && self.config.show_mutation_diff
        {
            log_mutation_diff(&key.representative_path(), report, self.count_removed());
        }

        let Some(existing) = existing else {
            return Ok(SequenceAnalysis::Proceed {
                existing: None,
                hash,
                cheap_fp,
                adopted_from,
            });
        };
        if forced {
            return Ok(SequenceAnalysis::Proceed {
                existing: Some(existing),
                hash,
                cheap_fp,
                adopted_from,
            });
        }

        let needs_qc = match &report {
            Some(report) => {
                let hash_changed = existing.content_hash.as_deref() != Some(hash.as_str());
                !self.policy_matches(&existing) || (hash_changed && report.mutated)
            }
            None => self.store.needs_reqc(Some(&existing), &hash),
        };

        if needs_qc {
            return Ok(SequenceAnalysis::Proceed {
                existing: Some(existing),
                hash,
                cheap_fp,
                adopted_from,
            });
        }

        // Keep the fast path valid for the next run.
        let mut updated = existing.clone();
        let seq = updated.sequence.get_or_insert_with(SequenceInfo::default);
        seq.cheap_fp = Some(cheap_fp);
        if updated.content_state == Some(ContentState::Missing) {
            updated.content_state = Some(ContentState::Unchanged);
        }
        if updated != existing || adopted_from.is_some() {
            self.store.write(sidecar_path, &updated)?;
        }
        if let Some(old) = &adopted_from {
            retire_sidecar(old);
        }
        Ok(SequenceAnalysis::Skip)
    }

    /// Prior record for `key`, and the path it was read from when that is
    /// the other naming scheme (the directory gained or lost a sequence
    /// since the record was written).
    fn read_sequence_record(
        &self,
        key: &SequenceKey,
        sidecar_path: &Path,
        shared_dir: bool,
    ) -> (Option<SidecarRecord>, Option<PathBuf>) {
        let describes_key = |record: &SidecarRecord| {
            record.sequence.as_ref().is_some_and(|seq| {
                seq.base == key.normalized_base() && seq.ext == key.normalized_ext()
            })
        };

        if let Some(record) = self.store.read(sidecar_path)
            && (shared_dir || record.sequence.is_none() || describes_key(&record))
        {
            return (Some(record), None);
        }

        let alternate = self.store.path_for_sequence_key(key, !shared_dir);
        match self.store.read(&alternate) {
            Some(record) if describes_key(&record) => {
                debug!(
                    target: "qc::reconcile",
                    "adopting {} for {}",
                    alternate.display(),
                    key.representative_path().display()
                );
                (Some(record), Some(alternate))
            }
            _ => (None, None),
        }
    }

    fn count_removed(&self) -> bool {
        self.config
            .mutation
            .as_ref()
            .is_some_and(|m| m.count_removed_frames)
    }

    /// Directory lookup first, then the first frame.
    async fn lookup_sequence(
        &self,
        dir: &Path,
        first_frame: Option<&PathBuf>,
    ) -> (Option<String>, Option<TrackerLookup>) {
        let by_dir = self.tracker.lookup_by_path(dir).await;
        if by_dir.asset_id.is_some() {
            return (by_dir.asset_id.clone(), Some(by_dir));
        }
        match first_frame {
            Some(frame) => {
                let by_frame = self.tracker.lookup_by_path(frame).await;
                (by_frame.asset_id.clone(), Some(by_frame))
            }
            None => (None, Some(by_dir)),
        }
    }

    /// Assemble the replacement record from prior state and this run's
    /// inputs. `asset_id` must already be resolved.
    pub fn build_record(
        &self,
        existing: Option<&SidecarRecord>,
        asset_path: &Path,
        content_hash: String,
        asset_id: Option<String>,
        lookup: Option<&TrackerLookup>,
    ) -> SidecarRecord {
        let forced = self.forced();
        let result = self.config.forced_result.clone().unwrap_or_default();
        let qc_time = now_rfc3339();

        let qc_id = existing
            .filter(|_| !forced)
            .and_then(|e| e.qc_id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let previous_hash = existing.and_then(|e| e.content_hash.clone());
        let content_changed = previous_hash.as_deref() != Some(content_hash.as_str());
        let (content_state, prev_content_hash) = match (existing, content_changed) {
            (None, _) => (ContentState::New, None),
            (Some(_), true) => (ContentState::Modified, previous_hash),
            (Some(e), false) => (ContentState::Unchanged, e.prev_content_hash.clone()),
        };

        let (last_valid_qc_id, last_valid_qc_time) = if forced && !result.is_pending() {
            (Some(qc_id.clone()), Some(qc_time.clone()))
        } else {
            (
                existing.and_then(|e| e.last_valid_qc_id.clone()),
                existing.and_then(|e| e.last_valid_qc_time.clone()),
            )
        };

        let tracker_status = result.is_pending().then(|| TrackerStatus {
            status: lookup.and_then(|l| l.status.clone()),
            http_code: lookup.and_then(|l| l.http_code),
        });

        // A record from a newer schema keeps its label.
        let settings = &self.config.settings;
        let newer = existing.filter(|e| e.schema_version > SCHEMA_VERSION);
        SidecarRecord {
            schema_name: newer
                .and_then(|e| e.schema_name.clone())
                .or_else(|| Some(settings.schema_name.clone())),
            schema_version: newer.map_or(SCHEMA_VERSION, |e| e.schema_version),
            qc_id: Some(qc_id),
            qc_time: Some(qc_time),
            operator: Some(self.config.operator.clone()),
            tool_version: Some(settings.tool_version.clone()),
            policy_version: Some(settings.policy_version.clone()),
            asset_path: Some(path_string(asset_path)),
            asset_id,
            content_hash: Some(content_hash),
            prev_content_hash,
            content_state: Some(content_state),
            qc_result: result,
            notes: self.config.note.clone().unwrap_or_default(),
            last_valid_qc_id,
            last_valid_qc_time,
            tracker_status,
            sequence: None,
            extra: existing.map(|e| e.extra.clone()).unwrap_or_default(),
        }
    }

    /// Write, tag, notify.
    async fn commit(
        &self,
        asset: &Path,
        sidecar_path: PathBuf,
        record: &SidecarRecord,
    ) -> Result<()> {
        {
            let store = Arc::clone(&self.store);
            let asset = asset.to_path_buf();
            let record = record.clone();
            let xattr_key = self.config.settings.xattr_key.clone();
            blocking(move || {
                store.write(&sidecar_path, &record)?;
                if let Some(qc_id) = &record.qc_id {
                    tagging::tag_qc_id(&asset, &xattr_key, qc_id);
                }
                Ok(())
            })
            .await?;
        }

        if !record.qc_result.is_pending()
            && let Some(asset_id) = record.asset_id.as_deref()
        {
            let posted = self.tracker.set_qc(Some(asset_id), record).await;
            debug!(
                target: "qc::reconcile",
                "tracker set_qc {} for {}: {}",
                asset_id,
                asset.display(),
                if posted { "accepted" } else { "not accepted" }
            );
        }
        Ok(())
    }

    async fn write_in_background(&self, path: PathBuf, record: SidecarRecord) -> Result<()> {
        let store = Arc::clone(&self.store);
        blocking(move || store.write(&path, &record)).await
    }
}

enum SequenceAnalysis {
    Skip,
    Proceed {
        existing: Option<SidecarRecord>,
        hash: String,
        cheap_fp: CheapFingerprint,
        adopted_from: Option<PathBuf>,
    },
}

fn retire_sidecar(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        debug!(target: "qc::reconcile", "could not remove {}: {}", path.display(), err);
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Cached per-frame hashes keyed by frame number, optionally restricted to
/// names in `only`.
fn frame_hashes(
    cache: &HashCache,
    key: &SequenceKey,
    only: Option<&BTreeSet<String>>,
) -> BTreeMap<String, String> {
    cache
        .hashes_where(|name| key.matches(name) && only.is_none_or(|names| names.contains(name)))
        .into_iter()
        .map(|(name, hash)| (key.frame_id(&name).unwrap_or(name), hash))
        .collect()
}

fn log_mutation_diff(sequence: &Path, report: &MutationReport, count_removed: bool) {
    let spans = [
        ("changed", &report.changed_frames, true),
        ("added", &report.added_frames, true),
        ("removed", &report.removed_frames, count_removed),
    ];
    for (label, frames, enabled) in spans {
        if enabled && !frames.is_empty() {
            info!(
                target: "qc::mutation",
                "Sequence {}: {} frames: {}",
                sequence.display(),
                label,
                summarize_frame_spans(frames)
            );
        }
    }
}

fn sequence_info(
    key: &SequenceKey,
    frames: &[PathBuf],
    cheap_fp: CheapFingerprint,
    content_hash: Option<String>,
    previous: Option<&SequenceInfo>,
) -> SequenceInfo {
    let names: Vec<String> = frames.iter().filter_map(|p| file_name(p)).collect();
    let summary = summarize_frames(&names);

    SequenceInfo {
        base: key.normalized_base().to_string(),
        ext: key.normalized_ext().to_string(),
        first: names.first().cloned(),
        last: names.last().cloned(),
        frame_count: summary.map_or(names.len(), |s| s.frame_count),
        frame_min: summary.map(|s| s.frame_min),
        frame_max: summary.map(|s| s.frame_max),
        pad: summary.map(|s| s.pad),
        range_count: summary.map(|s| s.range_count),
        holes: summary.map(|s| s.holes),
        cheap_fp: Some(cheap_fp),
        fingerprint: content_hash,
        extra: previous.map(|p| p.extra.clone()).unwrap_or_default(),
    }
}

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use eikon_qc_core::{
    QcError,
    config::{QcSettings, RunConfig, SidecarMode},
    fingerprint,
    media::SequenceKey,
    mutation::MutationConfig,
    run::RunCoordinator,
    sidecar::{ContentState, QcResult, SidecarRecord, SidecarStore},
    tracker::{AssetTracker, STATUS_OK, TrackerLookup},
};
use tempfile::TempDir;

/// Tracker double that records every call.
#[derive(Debug, Default)]
struct RecordingTracker {
    asset_id: Mutex<Option<String>>,
    lookups: Mutex<Vec<PathBuf>>,
    posted: Mutex<Vec<(String, QcResult)>>,
}

impl RecordingTracker {
    fn with_id(id: &str) -> Arc<Self> {
        let tracker = Self::default();
        *tracker.asset_id.lock().unwrap() = Some(id.to_string());
        Arc::new(tracker)
    }

    fn forget_id(&self) {
        *self.asset_id.lock().unwrap() = None;
    }

    fn lookup_count(&self) -> usize {
        self.lookups.lock().unwrap().len()
    }

    fn posted(&self) -> Vec<(String, QcResult)> {
        self.posted.lock().unwrap().clone()
    }
}

#[async_trait]
impl AssetTracker for RecordingTracker {
    async fn lookup_by_path(&self, path: &Path) -> TrackerLookup {
        self.lookups.lock().unwrap().push(path.to_path_buf());
        let asset_id = self.asset_id.lock().unwrap().clone();
        TrackerLookup {
            status: Some(STATUS_OK.to_string()),
            http_code: Some(200),
            asset_id,
        }
    }

    async fn set_qc(&self, asset_id: Option<&str>, record: &SidecarRecord) -> bool {
        let Some(asset_id) = asset_id else {
            return false;
        };
        self.posted
            .lock()
            .unwrap()
            .push((asset_id.to_string(), record.qc_result.clone()));
        true
    }
}

fn root_of(dir: &TempDir) -> PathBuf {
    fs::canonicalize(dir.path()).expect("canonical root")
}

fn config(settings: QcSettings) -> RunConfig {
    let mut config = RunConfig::new(settings, "tester");
    config.workers = 2;
    config.sidecar_mode = SidecarMode::Subdir;
    config
}

fn coordinator(config: RunConfig, tracker: &Arc<RecordingTracker>) -> RunCoordinator {
    let tracker: Arc<dyn AssetTracker> = tracker.clone();
    RunCoordinator::new(Arc::new(config), tracker)
}

fn store() -> SidecarStore {
    SidecarStore::new(&QcSettings::default(), SidecarMode::Subdir)
}

fn read(path: &Path) -> SidecarRecord {
    store()
        .read(path)
        .unwrap_or_else(|| panic!("sidecar {} should load", path.display()))
}

fn write_frames(dir: &Path, range: std::ops::RangeInclusive<u32>, payload: &str) {
    write_named_frames(dir, "shot", range, payload);
}

fn write_named_frames(
    dir: &Path,
    base: &str,
    range: std::ops::RangeInclusive<u32>,
    payload: &str,
) {
    fs::create_dir_all(dir).expect("mkdir");
    for frame in range {
        fs::write(dir.join(format!("{base}.{frame:04}.exr")), payload).expect("frame");
    }
}

fn write_sidecar(path: &Path, body: &serde_json::Value) {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, serde_json::to_string_pretty(body).expect("json")).expect("sidecar");
}

fn raw_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json")
}

#[tokio::test]
async fn rerun_without_changes_is_a_no_op() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let clip = root.join("clip.mov");
    fs::write(&clip, b"picture").expect("clip");
    let tracker = Arc::new(RecordingTracker::default());

    let first = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("first run");
    assert_eq!(first.marked, vec![clip.clone()]);

    let sidecar = store().path_for_file(&clip);
    let before = fs::read_to_string(&sidecar).expect("sidecar");
    let record = read(&sidecar);
    assert_eq!(record.qc_result, QcResult::Pending);
    assert_eq!(record.content_state, Some(ContentState::New));
    assert!(record.qc_id.is_some());
    assert_eq!(record.last_valid_qc_id, None);
    assert_eq!(record.operator.as_deref(), Some("tester"));

    let second = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("second run");
    assert!(second.marked.is_empty());
    assert_eq!(second.skipped, vec![clip]);
    assert_eq!(fs::read_to_string(&sidecar).expect("sidecar"), before);
    assert!(tracker.posted().is_empty());
}

#[tokio::test]
async fn content_change_keeps_qc_id_and_asset_id() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let clip = root.join("clip.mxf");
    fs::write(&clip, b"take one").expect("clip");
    let tracker = RecordingTracker::with_id("A-9");

    coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("first run");
    let sidecar = store().path_for_file(&clip);
    let first = read(&sidecar);
    assert_eq!(first.asset_id.as_deref(), Some("A-9"));
    assert_eq!(
        first.tracker_status.as_ref().and_then(|s| s.http_code),
        Some(200)
    );

    tracker.forget_id();
    fs::write(&clip, b"take two, longer").expect("rewrite");

    let summary = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("second run");
    assert_eq!(summary.marked.len(), 1);

    let second = read(&sidecar);
    assert_eq!(second.asset_id.as_deref(), Some("A-9"));
    assert_eq!(second.qc_id, first.qc_id);
    assert_eq!(second.content_state, Some(ContentState::Modified));
    assert_eq!(second.prev_content_hash, first.content_hash);
    assert_ne!(second.content_hash, first.content_hash);
    assert_eq!(second.qc_result, QcResult::Pending);
}

#[tokio::test]
async fn policy_bump_forces_requalification() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let clip = root.join("clip.wav");
    fs::write(&clip, b"tone").expect("clip");
    let tracker = Arc::new(RecordingTracker::default());

    coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("first run");
    let original = read(&store().path_for_file(&clip));

    let bumped = QcSettings {
        policy_version: "2099.1.0".to_string(),
        ..QcSettings::default()
    };
    let summary = coordinator(config(bumped), &tracker)
        .run(&root, None)
        .await
        .expect("bumped run");
    assert_eq!(summary.marked, vec![clip.clone()]);

    let record = read(&store().path_for_file(&clip));
    assert_eq!(record.policy_version.as_deref(), Some("2099.1.0"));
    assert_eq!(record.content_state, Some(ContentState::Unchanged));
    assert_eq!(record.qc_id, original.qc_id);
}

#[tokio::test]
async fn operator_verdict_starts_a_new_qc_event() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let clip = root.join("clip.mov");
    fs::write(&clip, b"picture").expect("clip");
    let tracker = RecordingTracker::with_id("A-1");

    coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("automated run");
    let automated = read(&store().path_for_file(&clip));

    let mut forced = config(QcSettings::default());
    forced.forced_result = Some(QcResult::Fail);
    forced.note = Some("dropout at 01:02:03".to_string());
    let summary = coordinator(forced, &tracker)
        .run(&root, None)
        .await
        .expect("operator run");
    assert_eq!(summary.marked, vec![clip.clone()]);

    let record = read(&store().path_for_file(&clip));
    assert_eq!(record.qc_result, QcResult::Fail);
    assert_ne!(record.qc_id, automated.qc_id);
    assert_eq!(record.last_valid_qc_id, record.qc_id);
    assert_eq!(record.last_valid_qc_time, record.qc_time);
    assert_eq!(record.notes, "dropout at 01:02:03");
    assert_eq!(record.content_state, Some(ContentState::Unchanged));
    assert!(record.tracker_status.is_none());
    assert_eq!(tracker.posted(), vec![("A-1".to_string(), QcResult::Fail)]);
}

#[tokio::test]
async fn explicit_asset_id_skips_the_lookup() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let clip = root.join("clip.mp4");
    fs::write(&clip, b"picture").expect("clip");
    let tracker = RecordingTracker::with_id("FROM-LOOKUP");

    coordinator(config(QcSettings::default()), &tracker)
        .run(&root, Some("EXPLICIT".to_string()))
        .await
        .expect("run");

    let record = read(&store().path_for_file(&clip));
    assert_eq!(record.asset_id.as_deref(), Some("EXPLICIT"));
    assert_eq!(tracker.lookup_count(), 0);
}

#[tokio::test]
async fn unchanged_sequence_takes_the_fast_path() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let seq = root.join("shot");
    write_frames(&seq, 1..=4, "frame");
    let tracker = Arc::new(RecordingTracker::default());

    let first = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("first run");
    assert_eq!(first.sequences, 1);
    assert_eq!(first.marked.len(), 1);
    let lookups = tracker.lookup_count();
    assert!(lookups > 0);

    let record = read(&store().path_for_sequence(&seq));
    let info = record.sequence.as_ref().expect("sequence info");
    assert_eq!(info.frame_count, 4);
    assert_eq!(info.frame_min, Some(1));
    assert_eq!(info.frame_max, Some(4));
    assert_eq!(info.pad, Some(4));
    assert!(info.cheap_fp.is_some());
    assert_eq!(info.fingerprint, record.content_hash);

    // Any hashing would load this cache and save it back as valid JSON.
    let cache = seq.join(".qc.hashcache.json");
    assert!(cache.exists());
    fs::write(&cache, "untouched").expect("overwrite cache");
    let sidecar_before = fs::read_to_string(store().path_for_sequence(&seq)).expect("sidecar");

    let second = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("second run");
    assert!(second.marked.is_empty());
    assert_eq!(second.skipped.len(), 1);
    assert_eq!(tracker.lookup_count(), lookups);
    assert_eq!(fs::read_to_string(&cache).expect("cache"), "untouched");
    assert_eq!(
        fs::read_to_string(store().path_for_sequence(&seq)).expect("sidecar"),
        sidecar_before
    );
}

#[tokio::test]
async fn sequences_sharing_a_directory_settle_independently() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let plates = root.join("plates");
    write_named_frames(&plates, "shot", 1..=4, "beauty");
    write_named_frames(&plates, "matte", 1..=4, "alpha");
    let tracker = Arc::new(RecordingTracker::default());

    let first = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("first run");
    assert_eq!(first.sequences, 2);
    assert_eq!(first.marked.len(), 2);

    let shot_key = SequenceKey::new(&plates, "shot.", "exr");
    let matte_key = SequenceKey::new(&plates, "matte.", "exr");
    let shot_sidecar = store().path_for_sequence_key(&shot_key, true);
    let matte_sidecar = store().path_for_sequence_key(&matte_key, true);
    assert!(shot_sidecar.ends_with(".qc/qc.sequence.shot.exr.json"));
    assert!(!store().path_for_sequence(&plates).exists());

    let shot = read(&shot_sidecar);
    let matte = read(&matte_sidecar);
    assert_eq!(shot.sequence.as_ref().map(|s| s.base.as_str()), Some("shot"));
    assert_eq!(matte.sequence.as_ref().map(|s| s.base.as_str()), Some("matte"));
    assert_ne!(shot.qc_id, matte.qc_id);

    let second = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("second run");
    assert!(second.marked.is_empty());
    assert_eq!(second.skipped.len(), 2);
    assert_eq!(read(&shot_sidecar).qc_id, shot.qc_id);
    assert_eq!(read(&matte_sidecar).qc_id, matte.qc_id);

    for frame in 1..=4 {
        fs::remove_file(plates.join(format!("matte.{frame:04}.exr"))).expect("delete");
    }
    let alone = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("third run");
    assert!(alone.marked.is_empty());
    assert_eq!(alone.missing_marked, 1);

    let plain = store().path_for_sequence(&plates);
    assert_eq!(read(&plain).qc_id, shot.qc_id);
    assert!(!shot_sidecar.exists());
    assert_eq!(read(&matte_sidecar).content_state, Some(ContentState::Missing));
}

#[tokio::test]
async fn deleted_frames_are_swept_and_restored() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let seq = root.join("plate");
    write_frames(&seq, 10..=12, "px");
    let tracker = Arc::new(RecordingTracker::default());

    coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("first run");
    let sidecar = store().path_for_sequence(&seq);
    let original = read(&sidecar);

    for frame in 10..=12 {
        fs::remove_file(seq.join(format!("shot.{frame:04}.exr"))).expect("delete");
    }
    let swept = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("sweep run");
    assert_eq!(swept.missing_marked, 1);

    let missing = read(&sidecar);
    assert_eq!(missing.content_state, Some(ContentState::Missing));
    assert_eq!(missing.qc_id, original.qc_id);
    assert_eq!(missing.qc_result, original.qc_result);
    assert_eq!(missing.qc_time, original.qc_time);

    let again = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("second sweep");
    assert_eq!(again.missing_marked, 0);

    write_frames(&seq, 10..=12, "px");
    let restored = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("restore run");
    assert_eq!(restored.skipped.len(), 1);
    let record = read(&sidecar);
    assert_eq!(record.content_state, Some(ContentState::Unchanged));
    assert_eq!(record.qc_id, original.qc_id);
}

#[tokio::test]
async fn small_frame_changes_stay_below_mutation_threshold() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let seq = root.join("comp");
    write_frames(&seq, 1..=10, "clean");
    let tracker = Arc::new(RecordingTracker::default());

    let mutation_config = || {
        let mut config = config(QcSettings::default());
        config.mutation = Some(MutationConfig {
            threshold_frames: Some(3),
            ..MutationConfig::default()
        });
        config
    };

    coordinator(mutation_config(), &tracker)
        .run(&root, None)
        .await
        .expect("first run");
    let sidecar = store().path_for_sequence(&seq);
    let original = read(&sidecar);

    fs::write(seq.join("shot.0004.exr"), "retouched").expect("touch one frame");
    let below = coordinator(mutation_config(), &tracker)
        .run(&root, None)
        .await
        .expect("below threshold");
    assert!(below.marked.is_empty());
    let after_small = read(&sidecar);
    assert_eq!(after_small.content_hash, original.content_hash);
    assert_ne!(after_small.stored_cheap_fp(), original.stored_cheap_fp());

    for frame in [1, 2, 3] {
        fs::write(seq.join(format!("shot.{frame:04}.exr")), "regraded").expect("regrade");
    }
    let above = coordinator(mutation_config(), &tracker)
        .run(&root, None)
        .await
        .expect("above threshold");
    assert_eq!(above.marked.len(), 1);
    let record = read(&sidecar);
    assert_eq!(record.content_state, Some(ContentState::Modified));
    assert_eq!(record.qc_id, original.qc_id);
}

#[tokio::test]
async fn mismatched_asset_ids_are_rejected_before_work() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let roots: Vec<PathBuf> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            let path = root.join(name);
            fs::create_dir_all(&path).expect("mkdir");
            fs::write(path.join("clip.mov"), b"x").expect("clip");
            path
        })
        .collect();
    let tracker = Arc::new(RecordingTracker::default());

    let result = coordinator(config(QcSettings::default()), &tracker)
        .run_many(&roots, &["A".to_string(), "B".to_string()])
        .await;
    assert!(matches!(result, Err(QcError::Config(_))));
    assert!(!roots[0].join(".qc").exists());
    assert_eq!(tracker.lookup_count(), 0);
}

#[tokio::test]
async fn legacy_sidecar_is_read_through_migration() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let clip = root.join("clip.mov");
    fs::write(&clip, b"picture").expect("clip");
    let hash = fingerprint::content_hash(&clip).expect("hash");

    let sidecar = store().path_for_file(&clip);
    fs::create_dir_all(sidecar.parent().expect("parent")).expect("mkdir");
    let legacy = serde_json::json!({
        "schema_version": 1,
        "qc_id": "legacy-id",
        "qc_result": "pass",
        "policy_version": QcSettings::default().policy_version,
        "asset_path": clip.display().to_string(),
        "asset_hash": hash,
        "note": "approved on the old tool",
        "custom_field": {"kept": true}
    });
    fs::write(&sidecar, serde_json::to_string(&legacy).expect("json")).expect("legacy");

    let tracker = Arc::new(RecordingTracker::default());
    let summary = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("run");
    assert_eq!(summary.skipped, vec![clip.clone()]);

    let record = read(&sidecar);
    assert_eq!(record.schema_version, 2);
    assert_eq!(record.content_hash.as_deref(), Some(hash.as_str()));
    assert_eq!(record.notes, "approved on the old tool");
    assert_eq!(record.qc_result, QcResult::Pass);
    assert!(record.extra.contains_key("custom_field"));

    fs::write(&clip, b"new picture").expect("rewrite");
    coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("modified run");
    let rewritten: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&sidecar).expect("read")).expect("json");
    assert_eq!(rewritten["schema_version"], 2);
    assert_eq!(rewritten["qc_id"], "legacy-id");
    assert_eq!(rewritten["qc_result"], "pending");
    assert_eq!(rewritten["custom_field"]["kept"], true);
    assert!(rewritten.get("asset_hash").is_none());
}

#[tokio::test]
async fn newer_schema_record_survives_requalification() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let clip = root.join("clip.mov");
    fs::write(&clip, b"regraded picture").expect("clip");

    let sidecar = store().path_for_file(&clip);
    write_sidecar(
        &sidecar,
        &serde_json::json!({
            "schema_name": "vendor.qc.sidecar",
            "schema_version": 9,
            "qc_id": "human-1",
            "qc_result": "waived",
            "policy_version": QcSettings::default().policy_version,
            "asset_path": clip.display().to_string(),
            "asset_id": "A-7",
            "content_hash": "blake3:0000",
            "last_valid_qc_id": "human-1",
            "last_valid_qc_time": "2026-01-05T10:00:00.000000+00:00",
            "review": {"by": "kim"}
        }),
    );

    let tracker = Arc::new(RecordingTracker::default());
    let summary = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("run");
    assert_eq!(summary.marked, vec![clip.clone()]);

    let rewritten = raw_json(&sidecar);
    assert_eq!(rewritten["schema_version"], 9);
    assert_eq!(rewritten["schema_name"], "vendor.qc.sidecar");
    assert_eq!(rewritten["qc_id"], "human-1");
    assert_eq!(rewritten["asset_id"], "A-7");
    assert_eq!(rewritten["last_valid_qc_id"], "human-1");
    assert_eq!(rewritten["content_state"], "modified");
    assert_eq!(rewritten["prev_content_hash"], "blake3:0000");
    assert_eq!(rewritten["qc_result"], "pending");
    assert_eq!(rewritten["review"]["by"], "kim");
}

#[tokio::test]
async fn stored_verdict_spelling_does_not_force_requalification() {
    for (stored, expected) in [
        (serde_json::json!("PASS"), QcResult::Pass),
        (serde_json::Value::Null, QcResult::Pending),
    ] {
        let dir = TempDir::new().expect("tempdir");
        let root = root_of(&dir);
        let clip = root.join("clip.mov");
        fs::write(&clip, b"picture").expect("clip");
        let hash = fingerprint::content_hash(&clip).expect("hash");

        let sidecar = store().path_for_file(&clip);
        write_sidecar(
            &sidecar,
            &serde_json::json!({
                "schema_version": 2,
                "qc_id": "op-1",
                "qc_result": stored,
                "policy_version": QcSettings::default().policy_version,
                "asset_path": clip.display().to_string(),
                "asset_id": "A-3",
                "content_hash": hash
            }),
        );
        let before = fs::read_to_string(&sidecar).expect("sidecar");

        let tracker = Arc::new(RecordingTracker::default());
        let summary = coordinator(config(QcSettings::default()), &tracker)
            .run(&root, None)
            .await
            .expect("run");
        assert!(summary.marked.is_empty(), "{stored} was requalified");
        assert_eq!(summary.skipped, vec![clip.clone()]);
        assert_eq!(fs::read_to_string(&sidecar).expect("sidecar"), before);

        let record = read(&sidecar);
        assert_eq!(record.qc_result, expected);
        assert_eq!(record.asset_id.as_deref(), Some("A-3"));
        assert_eq!(tracker.lookup_count(), 0);
    }
}

#[tokio::test]
async fn failing_unit_does_not_stop_the_run() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let good = root.join("good.mov");
    fs::write(&good, b"picture").expect("good clip");

    // A plain file where the sidecar directory belongs makes the write fail.
    let bad_dir = root.join("bad");
    fs::create_dir_all(&bad_dir).expect("mkdir");
    fs::write(bad_dir.join("clip.mov"), b"picture").expect("bad clip");
    fs::write(bad_dir.join(".qc"), b"not a directory").expect("blocker");

    let tracker = Arc::new(RecordingTracker::default());
    let summary = coordinator(config(QcSettings::default()), &tracker)
        .run(&root, None)
        .await
        .expect("run completes");

    assert_eq!(summary.media_files, 2);
    assert_eq!(summary.worker_errors, 1);
    assert_eq!(summary.marked, vec![good.clone()]);
    assert!(summary.skipped.is_empty());
    assert_eq!(read(&store().path_for_file(&good)).content_state, Some(ContentState::New));
}

#[tokio::test]
async fn missing_root_fails_the_run() {
    let dir = TempDir::new().expect("tempdir");
    let tracker = Arc::new(RecordingTracker::default());

    let result = coordinator(config(QcSettings::default()), &tracker)
        .run(&dir.path().join("absent"), None)
        .await;
    assert!(matches!(result, Err(QcError::Walk(_))));
}

#[tokio::test]
async fn unreadable_file_is_a_per_asset_error() {
    let dir = TempDir::new().expect("tempdir");
    let root = root_of(&dir);
    let tracker = Arc::new(RecordingTracker::default());
    let coordinator = coordinator(config(QcSettings::default()), &tracker);

    let result = coordinator
        .reconciler()
        .process_single_file(root.join("gone.mov"), None)
        .await;
    assert!(matches!(result, Err(QcError::Io { .. })));
}

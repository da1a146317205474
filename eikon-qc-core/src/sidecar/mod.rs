//! Sidecar placement, persistence and the re-QC predicate.

mod record;
pub mod schema;

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    config::{QcSettings, SidecarMode},
    error::{QcError, Result},
    fingerprint::hash_cache::tmp_sibling,
    media::SequenceKey,
    tagging,
};

pub use record::{ContentState, QcResult, SequenceInfo, SidecarRecord, TrackerStatus};
pub use schema::{MigrationOutcome, SCHEMA_VERSION, SchemaMigrator};

/// Hidden directory used by [`SidecarMode::Subdir`].
pub const SIDECAR_SUBDIR: &str = ".qc";

/// Reads and writes sidecar records under one storage mode.
#[derive(Clone, Debug)]
pub struct SidecarStore {
    mode: SidecarMode,
    file_suffix: String,
    sequence_name: String,
    schema_name: String,
    policy_version: String,
    migrator: SchemaMigrator,
}

impl SidecarStore {
    pub fn new(settings: &QcSettings, mode: SidecarMode) -> Self {
        Self::with_migrator(settings, mode, SchemaMigrator::default())
    }

    pub fn with_migrator(
        settings: &QcSettings,
        mode: SidecarMode,
        migrator: SchemaMigrator,
    ) -> Self {
        Self {
            mode,
            file_suffix: settings.sidecar_file_suffix.clone(),
            sequence_name: settings.sequence_sidecar_name.clone(),
            schema_name: settings.schema_name.clone(),
            policy_version: settings.policy_version.clone(),
            migrator,
        }
    }

    pub fn mode(&self) -> SidecarMode {
        self.mode
    }

    pub fn path_for_file(&self, file: &Path) -> PathBuf {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = file.parent().unwrap_or_else(|| Path::new(""));
        self.place(dir, &format!("{name}{}", self.file_suffix))
    }

    pub fn path_for_sequence(&self, dir: &Path) -> PathBuf {
        self.place(dir, &self.sequence_name)
    }

    /// Sidecar for one sequence. A directory holding a single sequence uses
    /// the plain sequence name; when `shared_dir` is set each sequence gets
    /// `qc.sequence.<base>.<ext>.json` instead.
    pub fn path_for_sequence_key(&self, key: &SequenceKey, shared_dir: bool) -> PathBuf {
        if !shared_dir {
            return self.path_for_sequence(&key.dir);
        }
        let (stem, suffix) = self.sequence_name_parts();
        let mut name = stem.to_string();
        for part in [key.normalized_base(), key.normalized_ext(), suffix] {
            if !part.is_empty() {
                name.push('.');
                name.push_str(part);
            }
        }
        self.place(&key.dir, &name)
    }

    /// `("qc.sequence", "json")` for the default name.
    fn sequence_name_parts(&self) -> (&str, &str) {
        self.sequence_name
            .rsplit_once('.')
            .unwrap_or((self.sequence_name.as_str(), ""))
    }

    fn place(&self, dir: &Path, name: &str) -> PathBuf {
        match self.mode {
            SidecarMode::Inline => dir.join(name),
            SidecarMode::Dot => dir.join(format!(".{name}")),
            SidecarMode::Subdir => dir.join(SIDECAR_SUBDIR).join(name),
        }
    }

    /// Whether `name` looks like a sidecar written in any mode.
    pub fn is_sidecar_name(&self, name: &str) -> bool {
        name.ends_with(&self.file_suffix) || self.is_sequence_sidecar_name(name)
    }

    /// Plain or per-sequence sequence sidecar name, dotted or not.
    pub fn is_sequence_sidecar_name(&self, name: &str) -> bool {
        let name = name.strip_prefix('.').unwrap_or(name);
        if name == self.sequence_name {
            return true;
        }
        let (stem, suffix) = self.sequence_name_parts();
        let Some(rest) = name.strip_prefix(stem).and_then(|rest| rest.strip_prefix('.')) else {
            return false;
        };
        let middle = match suffix {
            "" => Some(rest),
            suffix => rest.strip_suffix(suffix).and_then(|rest| rest.strip_suffix('.')),
        };
        middle.is_some_and(|middle| !middle.is_empty())
    }

    /// Load, migrate and stamp a record. Missing, unparsable and non-object
    /// files read as `None`, which callers treat as "never seen before". Any
    /// JSON object yields a record, including ones from newer schemas.
    pub fn read(&self, path: &Path) -> Option<SidecarRecord> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!("sidecar {:?} unreadable: {}", path, err);
                }
                return None;
            }
        };

        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                debug!("sidecar {:?} is not valid JSON: {}", path, err);
                return None;
            }
        };

        let (value, outcome) = match self.migrator.migrate(value) {
            Ok(migrated) => migrated,
            Err(err) => {
                debug!("sidecar {:?} could not be migrated: {}", path, err);
                return None;
            }
        };

        let Some(mut record) = SidecarRecord::from_stored(value) else {
            debug!("sidecar {:?} is not a JSON object", path);
            return None;
        };

        match outcome {
            MigrationOutcome::Current => self.stamp(&mut record),
            MigrationOutcome::Migrated { from, to } => {
                debug!("sidecar {:?} migrated v{} -> v{}", path, from, to);
                self.stamp(&mut record);
            }
            MigrationOutcome::Gap { stuck_at } => {
                warn!(
                    "sidecar {:?} has no migration from v{}; leaving it as-is",
                    path, stuck_at
                );
            }
            MigrationOutcome::Newer { version } => {
                warn!(
                    "sidecar {:?} is schema v{} (newer than v{}); leaving it as-is",
                    path,
                    version,
                    self.migrator.target()
                );
            }
        }

        Some(record)
    }

    /// Records from a newer schema keep their own name and version.
    fn stamp(&self, record: &mut SidecarRecord) {
        let target = self.migrator.target();
        if record.schema_version <= target || record.schema_name.is_none() {
            record.schema_name = Some(self.schema_name.clone());
        }
        record.schema_version = record.schema_version.max(target);
    }

    /// Serialize with sorted keys and atomically replace `path`.
    pub fn write(&self, path: &Path, record: &SidecarRecord) -> Result<()> {
        let mut record = record.clone();
        self.stamp(&mut record);

        let body = render(&record)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| QcError::io(parent, e))?;
        }

        let tmp = tmp_sibling(path);
        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(body.as_bytes())?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp, path)
        })();
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp);
            return Err(QcError::io(path, err));
        }

        if self.mode.hides_sidecars() {
            tagging::set_hidden(path);
        }
        Ok(())
    }

    /// Policy-driven re-QC predicate: absent record, policy drift or a
    /// different content hash all require a new look.
    pub fn needs_reqc(&self, existing: Option<&SidecarRecord>, new_hash: &str) -> bool {
        let Some(existing) = existing else {
            return true;
        };
        existing.policy_version.as_deref() != Some(self.policy_version.as_str())
            || existing.content_hash.as_deref() != Some(new_hash)
    }

    pub fn policy_version(&self) -> &str {
        &self.policy_version
    }
}

/// Pretty JSON (two-space indent) with keys sorted at every level. Typed
/// fields win over `extra` entries of the same name.
pub fn render(record: &SidecarRecord) -> Result<String> {
    let mut fields = record.clone();
    let extra = std::mem::take(&mut fields.extra);
    let mut value = serde_json::to_value(&fields)?;
    if let Value::Object(map) = &mut value {
        for (key, raw) in extra {
            map.entry(key).or_insert(raw);
        }
    }

    let value = sort_keys(value);
    let mut body = serde_json::to_string_pretty(&value)?;
    body.push('\n');
    Ok(body)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

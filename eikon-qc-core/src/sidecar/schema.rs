//! Sidecar schema versions and the forward-only migration chain.
//!
//! Records are upgraded one step at a time (`v1 -> v2 -> ...`) before they
//! are deserialized into [`SidecarRecord`](super::SidecarRecord). A record
//! whose chain has a gap, or that was written by a newer tool, keeps its
//! declared version.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{QcError, Result};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 2;

/// Version assumed for records that do not declare one.
const IMPLICIT_VERSION: u32 = 1;

/// Upgrade function from `N` to `N + 1`.
pub type MigrationFn = fn(Value) -> Result<Value>;

#[derive(Clone, Copy, Debug)]
pub struct MigrationStep {
    pub from: u32,
    pub upgrade: MigrationFn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationOutcome {
    Current,
    Migrated { from: u32, to: u32 },
    /// No step registered for `stuck_at`; the record stays at that version.
    Gap { stuck_at: u32 },
    /// Written by a newer tool; left untouched.
    Newer { version: u32 },
}

#[derive(Clone, Debug)]
pub struct SchemaMigrator {
    target: u32,
    steps: Vec<MigrationStep>,
}

impl Default for SchemaMigrator {
    fn default() -> Self {
        Self::new(
            SCHEMA_VERSION,
            vec![MigrationStep {
                from: 1,
                upgrade: migrate_v1_to_v2,
            }],
        )
    }
}

impl SchemaMigrator {
    pub fn new(target: u32, steps: Vec<MigrationStep>) -> Self {
        Self { target, steps }
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Bring `raw` up to the target version. The returned value always
    /// carries an integer `schema_version`.
    pub fn migrate(&self, raw: Value) -> Result<(Value, MigrationOutcome)> {
        let start = coerce_schema_version(raw.get("schema_version"));
        let mut value = with_version(raw, start)?;

        if start > self.target {
            return Ok((value, MigrationOutcome::Newer { version: start }));
        }
        if start == self.target {
            return Ok((value, MigrationOutcome::Current));
        }

        let mut version = start;
        while version < self.target {
            let Some(step) = self.steps.iter().find(|s| s.from == version) else {
                return Ok((value, MigrationOutcome::Gap { stuck_at: version }));
            };
            value = with_version((step.upgrade)(value)?, version + 1)?;
            version += 1;
        }

        Ok((
            value,
            MigrationOutcome::Migrated {
                from: start,
                to: version,
            },
        ))
    }
}

fn with_version(value: Value, version: u32) -> Result<Value> {
    match value {
        Value::Object(mut map) => {
            map.insert("schema_version".to_string(), Value::from(version));
            Ok(Value::Object(map))
        }
        other => Err(QcError::Internal(format!(
            "sidecar is not a JSON object: {other}"
        ))),
    }
}

/// Integer schema version from whatever a writer left behind.
///
/// Accepts integers, numeric strings, `"v2"`-style tags and dotted versions
/// (the leading major wins). Anything else counts as version 1.
pub fn coerce_schema_version(raw: Option<&Value>) -> u32 {
    let parsed = match raw {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            let trimmed = trimmed
                .strip_prefix('v')
                .or_else(|| trimmed.strip_prefix('V'))
                .unwrap_or(trimmed);
            let major = trimmed.split('.').next().unwrap_or_default();
            major.parse::<u32>().ok()
        }
        _ => None,
    };
    parsed.unwrap_or(IMPLICIT_VERSION)
}

/// Version 1 layout. Hashes lived under `asset_hash`, the free-text field
/// was `note`, and sequences carried no `fingerprint` alias.
#[derive(Debug, Deserialize)]
struct SidecarV1 {
    #[serde(default)]
    asset_hash: Option<String>,
    #[serde(default)]
    content_hash: Option<String>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    sequence: Option<Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

fn migrate_v1_to_v2(raw: Value) -> Result<Value> {
    let v1: SidecarV1 = serde_json::from_value(raw)?;
    let mut out = v1.rest;

    let content_hash = v1.content_hash.or(v1.asset_hash);
    out.insert(
        "content_hash".to_string(),
        content_hash.clone().map_or(Value::Null, Value::String),
    );
    out.insert(
        "notes".to_string(),
        Value::String(v1.notes.or(v1.note).unwrap_or_default()),
    );

    match v1.sequence {
        Some(Value::Object(mut seq)) => {
            if !seq.contains_key("fingerprint")
                && let Some(hash) = content_hash
            {
                seq.insert("fingerprint".to_string(), Value::String(hash));
            }
            out.insert("sequence".to_string(), Value::Object(seq));
        }
        Some(other) => {
            out.insert("sequence".to_string(), other);
        }
        None => {}
    }

    Ok(Value::Object(out))
}

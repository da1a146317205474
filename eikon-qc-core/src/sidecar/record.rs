use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::debug;

use crate::fingerprint::CheapFingerprint;

/// QC verdict for one asset.
///
/// Stored verdicts are read leniently: case is ignored, `null` reads as
/// [`QcResult::Pending`] and values this build does not know survive as
/// [`QcResult::Other`], so records written by newer tools are never lost.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum QcResult {
    Pass,
    Fail,
    #[default]
    Pending,
    /// Verdict written by another tool, lowercased.
    Other(String),
}

impl QcResult {
    pub fn as_str(&self) -> &str {
        match self {
            QcResult::Pass => "pass",
            QcResult::Fail => "fail",
            QcResult::Pending => "pending",
            QcResult::Other(raw) => raw,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, QcResult::Pending)
    }

    fn from_stored(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "pass" => QcResult::Pass,
            "fail" => QcResult::Fail,
            "pending" | "" => QcResult::Pending,
            _ => QcResult::Other(lowered),
        }
    }
}

impl fmt::Display for QcResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strict parse for operator input: only the three known verdicts.
impl FromStr for QcResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match QcResult::from_stored(s) {
            QcResult::Other(other) => Err(format!("unknown QC result '{other}'")),
            _ if s.trim().is_empty() => Err("empty QC result".to_string()),
            known => Ok(known),
        }
    }
}

impl Serialize for QcResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for QcResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => QcResult::Pending,
            Some(Value::String(raw)) => QcResult::from_stored(&raw),
            Some(other) => QcResult::Other(other.to_string()),
        })
    }
}

/// How the asset's bytes relate to the previously recorded state.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContentState {
    /// No prior record existed.
    New,
    Modified,
    Unchanged,
    /// Media disappeared from disk; only set by the post-run sweep.
    Missing,
    Other(String),
}

impl ContentState {
    pub fn as_str(&self) -> &str {
        match self {
            ContentState::New => "new",
            ContentState::Modified => "modified",
            ContentState::Unchanged => "unchanged",
            ContentState::Missing => "missing",
            ContentState::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ContentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContentState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContentState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = match Value::deserialize(deserializer)? {
            Value::String(raw) => raw.trim().to_ascii_lowercase(),
            other => other.to_string(),
        };
        Ok(match raw.as_str() {
            "new" => ContentState::New,
            "modified" => ContentState::Modified,
            "unchanged" => ContentState::Unchanged,
            "missing" => ContentState::Missing,
            _ => ContentState::Other(raw),
        })
    }
}

/// Tracker lookup outcome recorded alongside pending verdicts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStatus {
    pub status: Option<String>,
    pub http_code: Option<u16>,
}

/// Sequence summary stored in sequence sidecars.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceInfo {
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
    #[serde(default)]
    pub frame_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_max: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pad: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cheap_fp: Option<CheapFingerprint>,
    /// Alias of the record's `content_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// QC state for one file or one sequence directory, at the current schema
/// version. Keys match the on-disk JSON exactly; unknown keys survive a
/// read/write cycle through `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SidecarRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub schema_version: u32,

    /// Identity of the QC event, time-ordered (UUIDv7).
    #[serde(default)]
    pub qc_id: Option<String>,
    #[serde(default)]
    pub qc_time: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub tool_version: Option<String>,
    #[serde(default)]
    pub policy_version: Option<String>,

    #[serde(default)]
    pub asset_path: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub asset_id: Option<String>,

    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_state: Option<ContentState>,

    #[serde(default)]
    pub qc_result: QcResult,
    #[serde(default)]
    pub notes: String,

    /// Most recent operator-confirmed, non-pending QC event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_valid_qc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_valid_qc_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_status: Option<TrackerStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceInfo>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SidecarRecord {
    pub fn is_sequence(&self) -> bool {
        self.sequence.is_some()
    }

    pub fn stored_cheap_fp(&self) -> Option<&CheapFingerprint> {
        self.sequence.as_ref().and_then(|seq| seq.cheap_fp.as_ref())
    }

    /// Typed view of a stored JSON object. Only a non-object is refused: a
    /// key whose value does not fit its field is kept verbatim in `extra`
    /// and the field is left at its default.
    pub fn from_stored(value: Value) -> Option<Self> {
        let Value::Object(map) = value else {
            return None;
        };
        match serde_json::from_value(Value::Object(map.clone())) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!("salvaging sidecar fields after: {}", err);
                Some(Self::salvage(map))
            }
        }
    }

    fn salvage(map: Map<String, Value>) -> Self {
        let mut fitting = Map::new();
        let mut rejected = BTreeMap::new();
        for (key, value) in map {
            let single = Value::Object(Map::from_iter([(key.clone(), value.clone())]));
            if serde_json::from_value::<SidecarRecord>(single).is_ok() {
                fitting.insert(key, value);
            } else {
                rejected.insert(key, value);
            }
        }

        let mut record: SidecarRecord =
            serde_json::from_value(Value::Object(fitting)).unwrap_or_default();
        record.extra.extend(rejected);
        record
    }
}

/// Tracker ids show up as strings or numbers depending on who wrote them.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enums_use_lowercase_wire_names() {
        assert_eq!(json!(QcResult::Pending), json!("pending"));
        assert_eq!(json!(ContentState::Unchanged), json!("unchanged"));
        assert_eq!("FAIL".parse::<QcResult>(), Ok(QcResult::Fail));
        assert!("waived".parse::<QcResult>().is_err());
        assert!("".parse::<QcResult>().is_err());
    }

    #[test]
    fn stored_verdicts_are_read_leniently() {
        let read = |value: Value| -> QcResult {
            serde_json::from_value::<SidecarRecord>(json!({ "qc_result": value }))
                .expect("deserialize")
                .qc_result
        };
        assert_eq!(read(json!("PASS")), QcResult::Pass);
        assert_eq!(read(json!(" Fail ")), QcResult::Fail);
        assert_eq!(read(Value::Null), QcResult::Pending);
        assert_eq!(read(json!("Waived")), QcResult::Other("waived".into()));

        let missing: SidecarRecord = serde_json::from_value(json!({})).expect("deserialize");
        assert_eq!(missing.qc_result, QcResult::Pending);
    }

    #[test]
    fn unknown_states_survive_a_round_trip() {
        let record: SidecarRecord = serde_json::from_value(json!({
            "qc_result": "waived",
            "content_state": "archived"
        }))
        .expect("deserialize");
        assert_eq!(record.content_state, Some(ContentState::Other("archived".into())));

        let back = serde_json::to_value(&record).expect("serialize");
        assert_eq!(back["qc_result"], json!("waived"));
        assert_eq!(back["content_state"], json!("archived"));
    }

    #[test]
    fn ill_fitting_fields_are_kept_aside() {
        let record = SidecarRecord::from_stored(json!({
            "schema_version": 9,
            "qc_id": "human-1",
            "asset_id": "A-7",
            "sequence": {"base": "shot", "frame_count": "twelve"},
            "notes": ["a", "b"]
        }))
        .expect("record");

        assert_eq!(record.schema_version, 9);
        assert_eq!(record.qc_id.as_deref(), Some("human-1"));
        assert_eq!(record.asset_id.as_deref(), Some("A-7"));
        assert!(record.sequence.is_none());
        assert!(record.notes.is_empty());
        assert_eq!(record.extra.get("notes"), Some(&json!(["a", "b"])));
        assert_eq!(record.extra["sequence"]["frame_count"], json!("twelve"));

        assert!(SidecarRecord::from_stored(json!([1, 2])).is_none());
    }

    #[test]
    fn numeric_asset_id_is_read_as_string() {
        let record: SidecarRecord = serde_json::from_value(json!({
            "schema_version": 2,
            "asset_id": 12345,
            "qc_result": "pass"
        }))
        .expect("deserialize");
        assert_eq!(record.asset_id.as_deref(), Some("12345"));
        assert_eq!(record.qc_result, QcResult::Pass);
    }

    #[test]
    fn unknown_keys_round_trip_through_extra() {
        let record: SidecarRecord = serde_json::from_value(json!({
            "schema_version": 2,
            "custom_field": "hello",
            "sequence": null
        }))
        .expect("deserialize");
        assert_eq!(record.extra.get("custom_field"), Some(&json!("hello")));
        assert!(record.sequence.is_none());

        let back = serde_json::to_value(&record).expect("serialize");
        assert_eq!(back["custom_field"], json!("hello"));
        assert_eq!(back["asset_id"], Value::Null);
        assert!(back.get("prev_content_hash").is_none());
    }
}

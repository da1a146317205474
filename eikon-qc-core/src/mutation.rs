//! Frame-level change classification for sequences.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{QcError, Result};

/// Thresholds deciding whether a sequence changed enough to need re-QC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationConfig {
    /// Minimum number of qualifying frame changes. `None` disables the check.
    pub threshold_frames: Option<u64>,
    /// Minimum percentage (0-100) of the baseline. `None` disables the check.
    pub threshold_percent: Option<f64>,
    /// Whether removed frames count toward the thresholds.
    pub count_removed_frames: bool,
    /// Any added frame is a mutation regardless of thresholds.
    pub treat_added_frames_as_mutation: bool,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            threshold_frames: None,
            threshold_percent: None,
            count_removed_frames: false,
            treat_added_frames_as_mutation: true,
        }
    }
}

impl MutationConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(percent) = self.threshold_percent
            && !(0.0..=100.0).contains(&percent)
        {
            return Err(QcError::Config(format!(
                "mutation threshold percent must be within 0-100, got {percent}"
            )));
        }
        Ok(())
    }
}

/// Outcome of comparing two per-frame hash maps.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutationReport {
    pub changed_frames: Vec<String>,
    pub added_frames: Vec<String>,
    pub removed_frames: Vec<String>,
    pub total_before: usize,
    pub total_after: usize,
    /// Changes counted against the thresholds.
    pub threshold_changes: usize,
    pub mutated: bool,
}

impl MutationReport {
    pub fn total_changes(&self) -> usize {
        self.changed_frames.len()
            + self.added_frames.len()
            + self.removed_frames.len()
    }
}

/// Partition frames into changed/added/removed and apply the thresholds.
///
/// A missing `previous` map treats every current frame as added.
pub fn detect_sequence_mutation(
    previous: Option<&BTreeMap<String, String>>,
    current: &BTreeMap<String, String>,
    config: &MutationConfig,
) -> MutationReport {
    let empty = BTreeMap::new();
    let previous = previous.unwrap_or(&empty);

    let prev_keys: BTreeSet<&String> = previous.keys().collect();
    let curr_keys: BTreeSet<&String> = current.keys().collect();

    let added: Vec<String> = curr_keys.difference(&prev_keys).map(|k| (*k).clone()).collect();
    let removed: Vec<String> = prev_keys.difference(&curr_keys).map(|k| (*k).clone()).collect();
    let changed: Vec<String> = prev_keys
        .intersection(&curr_keys)
        .filter(|k| previous.get(**k) != current.get(**k))
        .map(|k| (*k).clone())
        .collect();

    let mut threshold_changes = changed.len() + added.len();
    if config.count_removed_frames {
        threshold_changes += removed.len();
    }
    let baseline = previous.len().max(current.len());

    let added_trigger = config.treat_added_frames_as_mutation && !added.is_empty();
    let count_trigger = config
        .threshold_frames
        .is_some_and(|min| threshold_changes as u64 >= min);
    let percent_trigger = config.threshold_percent.is_some_and(|min| {
        baseline > 0 && (threshold_changes as f64 / baseline as f64) * 100.0 >= min
    });

    MutationReport {
        changed_frames: changed,
        added_frames: added,
        removed_frames: removed,
        total_before: previous.len(),
        total_after: current.len(),
        threshold_changes,
        mutated: added_trigger || count_trigger || percent_trigger,
    }
}

/// Compact span notation for sorted frame identifiers.
///
/// Numeric identifiers merge while their integer values are consecutive
/// (`"0001", "0002", "0003"` becomes `"0001–0003"`); non-numeric ones are
/// always singletons.
pub fn summarize_frame_spans<S: AsRef<str>>(frame_ids: &[S]) -> String {
    let mut spans: Vec<String> = Vec::new();
    let mut run: Option<(&str, &str, u64)> = None;

    for id in frame_ids {
        let label = id.as_ref();
        match parse_frame_number(label) {
            None => {
                flush(run.take(), &mut spans);
                spans.push(label.to_string());
            }
            Some(n) => match run {
                Some((start, _, last)) if last.checked_add(1) == Some(n) => {
                    run = Some((start, label, n));
                }
                _ => {
                    flush(run.take(), &mut spans);
                    run = Some((label, label, n));
                }
            },
        }
    }
    flush(run, &mut spans);

    spans.join(", ")
}

fn flush(run: Option<(&str, &str, u64)>, spans: &mut Vec<String>) {
    if let Some((start, end, _)) = run {
        if start == end {
            spans.push(start.to_string());
        } else {
            spans.push(format!("{start}–{end}"));
        }
    }
}

fn parse_frame_number(label: &str) -> Option<u64> {
    if label.is_empty() || !label.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    label.parse().ok()
}
